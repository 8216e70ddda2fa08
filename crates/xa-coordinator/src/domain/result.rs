//! Caller-visible result of a transaction.
//!
//! The sink side lives inside the [`Transaction`](super::Transaction) and
//! accepts exactly one value; later deliveries are ignored.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use shared_types::Xid;
use tokio::sync::oneshot;

use crate::error::TransactionError;

/// `Ok(true)` committed, `Ok(false)` rolled back.
pub type TransactionResult = Result<bool, TransactionError>;

pub(crate) fn result_channel(xid: Xid) -> (ResultSink, TransactionFuture) {
    let (sender, receiver) = oneshot::channel();
    (
        ResultSink {
            sender: Mutex::new(Some(sender)),
        },
        TransactionFuture { xid, receiver },
    )
}

/// Write-once result slot.
pub(crate) struct ResultSink {
    sender: Mutex<Option<oneshot::Sender<TransactionResult>>>,
}

impl ResultSink {
    /// Deliver `result`; false if something was already delivered.
    pub(crate) fn deliver(&self, result: TransactionResult) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };
        // caller may have dropped the future; the outcome still counts as delivered
        let _ = sender.send(result);
        true
    }

    pub(crate) fn is_delivered(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Handle on the terminal outcome of one transaction.
///
/// Await it directly, call [`get`](Self::get), or use
/// [`blocking_get`](Self::blocking_get) outside the runtime.
#[derive(Debug)]
pub struct TransactionFuture {
    xid: Xid,
    receiver: oneshot::Receiver<TransactionResult>,
}

impl TransactionFuture {
    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    /// Wait for the outcome.
    pub async fn get(self) -> TransactionResult {
        self.await
    }

    /// Block the current thread until the outcome arrives.
    ///
    /// Panics if called from within an async runtime thread.
    pub fn blocking_get(self) -> TransactionResult {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(TransactionError::ResultDropped))
    }

    /// Outcome if already delivered.
    pub fn try_get(&mut self) -> Option<TransactionResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TransactionError::ResultDropped)),
        }
    }
}

impl Future for TransactionFuture {
    type Output = TransactionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TransactionError::ResultDropped)))
    }
}

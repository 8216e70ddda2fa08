//! Scriptable XA resource manager.
//!
//! Keeps a call log and an in-doubt list: a successful `prepare` puts the
//! branch in doubt, `commit`/`rollback`/`forget` take it out, and a recovery
//! scan started with `TMSTARTRSCAN` returns whatever is still in doubt.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{Vote, XaException, Xid, TMSTARTRSCAN};

use crate::ports::outbound::XaResource;

/// XA verbs, for scripting failures and reading the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaVerb {
    Start,
    End,
    Prepare,
    Commit,
    Rollback,
    Forget,
    Recover,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XaCall {
    pub verb: XaVerb,
    pub xid: Option<Xid>,
    pub flags: i32,
}

#[derive(Default)]
struct MockState {
    calls: Vec<XaCall>,
    failures: HashMap<XaVerb, XaException>,
    read_only: bool,
    in_doubt: BTreeSet<Xid>,
}

pub struct MockXaResource {
    name: String,
    state: Mutex<MockState>,
}

impl MockXaResource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make every call of `verb` fail with `error` until cleared.
    pub fn fail_on(&self, verb: XaVerb, error: XaException) {
        self.state.lock().failures.insert(verb, error);
    }

    pub fn clear_failure(&self, verb: XaVerb) {
        self.state.lock().failures.remove(&verb);
    }

    /// Vote `XA_RDONLY` on prepare.
    pub fn vote_read_only(&self) {
        self.state.lock().read_only = true;
    }

    /// Pretend `xid` was prepared before a crash.
    pub fn add_in_doubt(&self, xid: Xid) {
        self.state.lock().in_doubt.insert(xid);
    }

    pub fn in_doubt(&self) -> Vec<Xid> {
        self.state.lock().in_doubt.iter().cloned().collect()
    }

    pub fn calls(&self) -> Vec<XaCall> {
        self.state.lock().calls.clone()
    }

    /// Xids passed to `verb`, in call order.
    pub fn xids_for(&self, verb: XaVerb) -> Vec<Xid> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.verb == verb)
            .filter_map(|c| c.xid.clone())
            .collect()
    }

    pub fn count(&self, verb: XaVerb) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.verb == verb)
            .count()
    }

    fn record(&self, verb: XaVerb, xid: Option<&Xid>, flags: i32) -> Result<(), XaException> {
        let mut state = self.state.lock();
        state.calls.push(XaCall {
            verb,
            xid: xid.cloned(),
            flags,
        });
        match state.failures.get(&verb) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl XaResource for MockXaResource {
    async fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaException> {
        self.record(XaVerb::Start, Some(xid), flags)
    }

    async fn end(&self, xid: &Xid, flags: i32) -> Result<(), XaException> {
        self.record(XaVerb::End, Some(xid), flags)
    }

    async fn prepare(&self, xid: &Xid) -> Result<Vote, XaException> {
        self.record(XaVerb::Prepare, Some(xid), 0)?;
        let mut state = self.state.lock();
        if state.read_only {
            return Ok(Vote::ReadOnly);
        }
        state.in_doubt.insert(xid.clone());
        Ok(Vote::Prepared)
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaException> {
        let flags = if one_phase { shared_types::TMONEPHASE } else { 0 };
        self.record(XaVerb::Commit, Some(xid), flags)?;
        self.state.lock().in_doubt.remove(xid);
        Ok(())
    }

    async fn rollback(&self, xid: &Xid) -> Result<(), XaException> {
        self.record(XaVerb::Rollback, Some(xid), 0)?;
        self.state.lock().in_doubt.remove(xid);
        Ok(())
    }

    async fn forget(&self, xid: &Xid) -> Result<(), XaException> {
        self.record(XaVerb::Forget, Some(xid), 0)?;
        self.state.lock().in_doubt.remove(xid);
        Ok(())
    }

    async fn recover(&self, flags: i32) -> Result<Vec<Xid>, XaException> {
        self.record(XaVerb::Recover, None, flags)?;
        if flags & TMSTARTRSCAN != 0 {
            Ok(self.in_doubt())
        } else {
            Ok(Vec::new())
        }
    }
}

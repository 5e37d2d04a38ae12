// Copyright 2020 Joyent, Inc.

//! Connection lifecycle and the pending-operation counter.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::StateError;

/// Work collected while session state is locked and run once the lock is
/// released, so user callbacks are free to call back into the session.
pub type Deferred = Box<dyn FnOnce() + Send>;

pub type OnConnect = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Retry,
    Ready,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            State::Closed => "closed",
            State::Retry => "retry",
            State::Ready => "ready",
        };
        f.write_str(s)
    }
}

pub struct ConnectionState {
    state: State,
    pending: usize,
    on_connect: BTreeMap<String, OnConnect>,
    state_tx: watch::Sender<State>,
    synced_tx: watch::Sender<bool>,
}

impl Default for ConnectionState {
    fn default() -> ConnectionState {
        ConnectionState::new()
    }
}

impl ConnectionState {
    pub fn new() -> ConnectionState {
        let (state_tx, _) = watch::channel(State::Closed);
        let (synced_tx, _) = watch::channel(true);
        ConnectionState {
            state: State::Closed,
            pending: 0,
            on_connect: BTreeMap::new(),
            state_tx,
            synced_tx,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Registers `func` to run each time the connection becomes ready.
    /// Callbacks run in ascending `priority` order.
    pub fn on_connect<F>(&mut self, priority: &str, func: F) -> Result<(), StateError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.on_connect.contains_key(priority) {
            return Err(StateError::PriorityTaken(priority.to_string()));
        }
        self.on_connect.insert(priority.to_string(), Arc::new(func));
        Ok(())
    }

    pub fn stop_on_connect(&mut self, priority: &str) {
        self.on_connect.remove(priority);
    }

    /// Enters `ready` and returns the on-connect callbacks in the order they
    /// must be run. The caller runs them after releasing any lock on `self`.
    pub fn connected(&mut self) -> Vec<OnConnect> {
        self.set_state(State::Ready);
        self.on_connect.values().cloned().collect()
    }

    /// The connection dropped and will be retried.
    pub fn retry(&mut self) {
        self.set_state(State::Retry);
    }

    /// Explicit stop.
    pub fn close(&mut self) {
        self.set_state(State::Closed);
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn inc_pending(&mut self) {
        self.pending += 1;
        if self.pending == 1 {
            self.synced_tx.send_replace(false);
        }
    }

    /// Fails when nothing is outstanding; the counter stays at zero.
    pub fn dec_pending(&mut self) -> Result<(), StateError> {
        if self.pending == 0 {
            return Err(StateError::PendingUnderflow);
        }
        self.pending -= 1;
        if self.pending == 0 {
            self.synced_tx.send_replace(true);
        }
        Ok(())
    }

    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    /// Yields `true` whenever the pending count returns to zero and `false`
    /// when it leaves zero.
    pub fn watch_synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Mutex;

    #[test]
    fn on_connect_runs_in_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut state = ConnectionState::new();
        for p in &["20-rpc", "10-subscribe", "05-first"] {
            let order = Arc::clone(&order);
            let name = p.to_string();
            state
                .on_connect(p, move || order.lock().unwrap().push(name.clone()))
                .unwrap();
        }
        assert_eq!(
            state.on_connect("20-rpc", || ()),
            Err(StateError::PriorityTaken("20-rpc".to_string()))
        );

        assert!(!state.is_ready());
        for cb in state.connected() {
            cb();
        }
        assert!(state.is_ready());
        assert_eq!(
            *order.lock().unwrap(),
            vec!["05-first", "10-subscribe", "20-rpc"]
        );

        state.stop_on_connect("05-first");
        assert_eq!(state.connected().len(), 2);
    }

    #[test]
    fn transitions() {
        let mut state = ConnectionState::new();
        let rx = state.watch_state();
        assert_eq!(state.state(), State::Closed);
        state.connected();
        state.retry();
        assert_eq!(*rx.borrow(), State::Retry);
        state.connected();
        state.close();
        assert!(state.is_closed());
        assert_eq!(*rx.borrow(), State::Closed);
    }

    #[test]
    fn pending_counter_converges_and_clamps() {
        let mut state = ConnectionState::new();
        let synced = state.watch_synced();
        state.inc_pending();
        state.inc_pending();
        assert!(!*synced.borrow());
        state.dec_pending().unwrap();
        assert!(!*synced.borrow());
        state.dec_pending().unwrap();
        assert!(*synced.borrow());
        assert_eq!(state.pending(), 0);

        assert_eq!(state.dec_pending(), Err(StateError::PendingUnderflow));
        assert_eq!(state.pending(), 0);
        state.inc_pending();
        assert_eq!(state.pending(), 1);
    }
}

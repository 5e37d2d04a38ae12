// Copyright 2020 Joyent, Inc.

//! Client side of subscriptions.
//!
//! A subscription is announced with `P [id, name, args, lastSubscribed]` and
//! stopped with `P [id]`. The server answers with `[id, 200, millis]` (or a
//! bare `[id]`), `[id, code, reason]` on failure or `[id, false]` when it
//! stops the subscription itself.
//!
//! Each publication also runs locally to register the match predicates that
//! decide which documents the client keeps. Documents of a kind that no
//! longer matches anything are pruned from the store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use slog::{debug, error, warn, Logger};

use crate::error::{RpcError, StateError};
use crate::matcher::{MatchHandle, MatchRegistry};
use crate::protocol::SeqId;
use crate::state::{ConnectionState, Deferred};
use crate::store::{Doc, DocStore};
use crate::value::Value;

pub type SubCallback = Box<dyn FnOnce(Result<(), RpcError>) + Send>;

pub type ClientPublishFn =
    Arc<dyn Fn(&mut SubScope, &[Value]) -> Result<(), RpcError> + Send + Sync>;

/// What a client publication sees while it registers its matches.
pub struct SubScope<'a> {
    id: &'a str,
    matches: &'a MatchRegistry,
    installed: Vec<MatchHandle>,
    user_id: Option<&'a str>,
    resubscribe: bool,
}

impl<'a> SubScope<'a> {
    pub fn id(&self) -> &str {
        self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id
    }

    /// True when rerun for a reconnect or identity change.
    pub fn is_resubscribe(&self) -> bool {
        self.resubscribe
    }

    pub fn match_kind<F>(&mut self, kind: &str, func: F)
    where
        F: Fn(&Doc) -> bool + Send + Sync + 'static,
    {
        self.installed.push(self.matches.register(kind, func));
    }
}

struct ClientSub {
    name: String,
    args: Vec<Value>,
    waiting: bool,
    callback: Option<SubCallback>,
    last_subscribed: f64,
    matches: Vec<MatchHandle>,
}

pub struct SubscriptionManager {
    next_id: u64,
    publications: HashMap<String, ClientPublishFn>,
    subs: BTreeMap<SeqId, ClientSub>,
    matches: MatchRegistry,
    user_id: Option<String>,
    store: Arc<dyn DocStore>,
    log: Logger,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn DocStore>, log: Logger) -> SubscriptionManager {
        SubscriptionManager {
            next_id: 0,
            publications: HashMap::new(),
            subs: BTreeMap::new(),
            matches: MatchRegistry::new(),
            user_id: None,
            store,
            log,
        }
    }

    pub fn register_publication<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&mut SubScope, &[Value]) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.publications.insert(name.to_string(), Arc::new(func));
    }

    pub fn matches(&self) -> &MatchRegistry {
        &self.matches
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subs.contains_key(&SeqId::new(id))
    }

    pub fn is_waiting(&self, id: &str) -> bool {
        self.subs
            .get(&SeqId::new(id))
            .map(|s| s.waiting)
            .unwrap_or(false)
    }

    pub fn last_subscribed(&self, id: &str) -> Option<f64> {
        self.subs.get(&SeqId::new(id)).map(|s| s.last_subscribed)
    }

    /// Starts a subscription. Returns its id and, when the connection is
    /// ready, the `P` payload to send; otherwise it is sent on connect.
    pub fn subscribe(
        &mut self,
        state: &mut ConnectionState,
        name: &str,
        args: Vec<Value>,
        callback: Option<SubCallback>,
    ) -> Result<(SeqId, Option<Vec<Value>>), StateError> {
        let publish = self
            .publications
            .get(name)
            .cloned()
            .ok_or_else(|| StateError::UnknownPublication(name.to_string()))?;

        self.next_id += 1;
        let id = SeqId::from_seq(self.next_id, "");
        let mut sub = ClientSub {
            name: name.to_string(),
            args,
            waiting: false,
            callback,
            last_subscribed: 0.0,
            matches: Vec::new(),
        };
        wait(&mut sub, state);
        sub.matches = self.run_publish(&publish, &id, &sub.args, false);
        debug!(self.log, "subscribe"; "id" => id.as_str(), "name" => name);

        let payload = if state.is_ready() {
            Some(subscribe_payload(&id, &sub))
        } else {
            None
        };
        self.subs.insert(id.clone(), sub);
        Ok((id, payload))
    }

    /// Stops a subscription locally. Returns the `P [id]` payload to send
    /// when the connection is ready.
    pub fn stop(
        &mut self,
        state: &mut ConnectionState,
        id: &str,
        deferred: &mut Vec<Deferred>,
    ) -> Option<Vec<Value>> {
        let sub = self.teardown(id, deferred)?;
        debug!(self.log, "stop subscription"; "id" => id, "name" => &sub.name);
        if sub.waiting {
            self.dec_pending(state);
        }
        if state.is_ready() {
            Some(vec![id.into()])
        } else {
            None
        }
    }

    /// Handles a `P` frame from the server.
    pub fn received(
        &mut self,
        state: &mut ConnectionState,
        data: &[Value],
        deferred: &mut Vec<Deferred>,
    ) {
        let id = match data.get(0).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                warn!(self.log, "malformed subscription response");
                return;
            }
        };
        if !self.contains(&id) {
            return;
        }

        let outcome = match data.get(1) {
            None => Ok(None),
            Some(Value::Number(code)) if *code == 200.0 => {
                Ok(data.get(2).and_then(Value::as_f64))
            }
            Some(Value::Bool(false)) => Err(RpcError::Closed),
            Some(code) => {
                let code = code.as_f64().unwrap_or(500.0) as u32;
                Err(RpcError::new(code, data.get(2).cloned().unwrap_or_default()))
            }
        };

        let (waiting, callback) = match outcome {
            Ok(last) => {
                let sub = match self.subs.get_mut(&SeqId::new(id.as_str())) {
                    Some(sub) => sub,
                    None => return,
                };
                if let Some(last) = last {
                    sub.last_subscribed = last;
                }
                let waiting = sub.waiting;
                sub.waiting = false;
                let callback = if waiting { sub.callback.take() } else { None };
                (waiting, callback.map(|cb| (cb, Ok(()))))
            }
            Err(err) => {
                debug!(self.log, "subscription ended"; "id" => &id, "reason" => %err);
                let mut sub = match self.teardown(&id, deferred) {
                    Some(sub) => sub,
                    None => return,
                };
                let callback = if sub.waiting { sub.callback.take() } else { None };
                (sub.waiting, callback.map(|cb| (cb, Err(err))))
            }
        };

        if waiting {
            self.dec_pending(state);
        }
        if let Some((cb, result)) = callback {
            deferred.push(Box::new(move || cb(result)));
        }
    }

    /// Marks every subscription waiting again and returns the `P` payloads
    /// to resend, in id order.
    pub fn on_connect(&mut self, state: &mut ConnectionState) -> Vec<Vec<Value>> {
        let mut payloads = Vec::with_capacity(self.subs.len());
        for (id, sub) in self.subs.iter_mut() {
            wait(sub, state);
            payloads.push(subscribe_payload(id, sub));
        }
        payloads
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Reruns every publication when the identity changes. New matches are
    /// installed before the old ones are stopped; documents of affected
    /// kinds that no longer match are then pruned.
    pub fn set_user_id(
        &mut self,
        user_id: Option<String>,
        deferred: &mut Vec<Deferred>,
    ) -> bool {
        if self.user_id == user_id {
            return false;
        }
        self.user_id = user_id;

        let ids: Vec<SeqId> = self.subs.keys().cloned().collect();
        let mut kinds = BTreeSet::new();
        for id in ids {
            let (publish, args) = match self.subs.get(&id) {
                Some(sub) => match self.publications.get(&sub.name) {
                    Some(p) => (Arc::clone(p), sub.args.clone()),
                    None => continue,
                },
                None => continue,
            };
            let fresh = self.run_publish(&publish, &id, &args, true);
            if let Some(sub) = self.subs.get_mut(&id) {
                let old = std::mem::replace(&mut sub.matches, fresh);
                for m in old {
                    kinds.insert(m.kind().to_string());
                    m.stop();
                }
            }
        }
        self.defer_prune(kinds, deferred);
        true
    }

    fn run_publish(
        &self,
        publish: &ClientPublishFn,
        id: &SeqId,
        args: &[Value],
        resubscribe: bool,
    ) -> Vec<MatchHandle> {
        let mut scope = SubScope {
            id: id.as_str(),
            matches: &self.matches,
            installed: Vec::new(),
            user_id: self.user_id.as_deref(),
            resubscribe,
        };
        if let Err(err) = publish(&mut scope, args) {
            error!(self.log, "client publication failed"; "id" => id.as_str(),
                "error" => %err);
        }
        scope.installed
    }

    fn teardown(&mut self, id: &str, deferred: &mut Vec<Deferred>) -> Option<ClientSub> {
        let mut sub = self.subs.remove(&SeqId::new(id))?;
        let mut kinds = BTreeSet::new();
        for m in sub.matches.drain(..) {
            kinds.insert(m.kind().to_string());
            m.stop();
        }
        self.defer_prune(kinds, deferred);
        Some(sub)
    }

    fn defer_prune(&self, kinds: BTreeSet<String>, deferred: &mut Vec<Deferred>) {
        if kinds.is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        let matches = self.matches.clone();
        deferred.push(Box::new(move || prune(store.as_ref(), &matches, &kinds)));
    }

    fn dec_pending(&self, state: &mut ConnectionState) {
        if let Err(err) = state.dec_pending() {
            error!(self.log, "pending count"; "error" => %err);
        }
    }
}

fn wait(sub: &mut ClientSub, state: &mut ConnectionState) {
    if sub.waiting {
        return;
    }
    sub.waiting = true;
    state.inc_pending();
}

fn subscribe_payload(id: &SeqId, sub: &ClientSub) -> Vec<Value> {
    vec![
        id.clone().into(),
        sub.name.as_str().into(),
        Value::Array(sub.args.clone()),
        Value::Number(sub.last_subscribed),
    ]
}

/// Removes documents of `kinds` that no remaining match accepts.
pub fn prune(store: &dyn DocStore, matches: &MatchRegistry, kinds: &BTreeSet<String>) {
    for kind in kinds {
        for doc in store.docs(kind) {
            if !matches.has(&doc) {
                store.remove(&doc.kind, &doc.id);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Mutex;

    use slog::{o, Discard};

    use crate::store::MemoryStore;
    use crate::value::Map;

    fn setup() -> (SubscriptionManager, ConnectionState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut mgr = SubscriptionManager::new(
            Arc::clone(&store) as Arc<dyn DocStore>,
            Logger::root(Discard, o!()),
        );
        mgr.register_publication("Library", |scope, args| {
            let shelf = args.get(0).and_then(Value::as_str).unwrap_or("").to_string();
            let owner = scope.user_id().map(str::to_string);
            scope.match_kind("Book", move |doc| {
                doc.get("shelf").and_then(Value::as_str) == Some(shelf.as_str())
                    || (owner.is_some()
                        && doc.get("owner").and_then(Value::as_str) == owner.as_deref())
            });
            Ok(())
        });
        (mgr, ConnectionState::new(), store)
    }

    fn book(id: &str, shelf: &str, owner: &str) -> Doc {
        let mut attrs = Map::new();
        attrs.insert("shelf".into(), shelf.into());
        attrs.insert("owner".into(), owner.into());
        Doc::new("Book", id, attrs)
    }

    fn run(deferred: Vec<Deferred>) {
        for d in deferred {
            d();
        }
    }

    #[test]
    fn unknown_publication() {
        let (mut mgr, mut state, _) = setup();
        let err = mgr.subscribe(&mut state, "Nope", vec![], None).err();
        assert_eq!(err, Some(StateError::UnknownPublication("Nope".into())));
        assert_eq!(state.pending(), 0);
    }

    #[test]
    fn subscribe_waits_until_acknowledged() {
        let (mut mgr, mut state, _) = setup();
        let result = Arc::new(Mutex::new(None));
        let r2 = Arc::clone(&result);
        let cb: SubCallback = Box::new(move |res: Result<(), RpcError>| {
            *r2.lock().unwrap() = Some(res)
        });

        let (id, payload) = mgr
            .subscribe(&mut state, "Library", vec!["sf".into()], Some(cb))
            .unwrap();
        assert_eq!(id.as_str(), "1");
        assert!(payload.is_none());
        assert_eq!(state.pending(), 1);

        state.connected();
        let payloads = mgr.on_connect(&mut state);
        assert_eq!(state.pending(), 1);
        assert_eq!(
            payloads,
            vec![vec![
                "1".into(),
                "Library".into(),
                Value::Array(vec!["sf".into()]),
                Value::Number(0.0),
            ]]
        );

        let mut deferred = Vec::new();
        let ack: Vec<Value> = vec!["1".into(), 200.into(), 1234.into()];
        mgr.received(&mut state, &ack, &mut deferred);
        run(deferred);
        assert_eq!(state.pending(), 0);
        assert!(!mgr.is_waiting("1"));
        assert_eq!(mgr.last_subscribed("1"), Some(1234.0));
        assert_eq!(*result.lock().unwrap(), Some(Ok(())));
    }

    #[test]
    fn error_response_tears_down_and_prunes() {
        let (mut mgr, mut state, store) = setup();
        state.connected();
        let (_, payload) = mgr
            .subscribe(&mut state, "Library", vec!["sf".into()], None)
            .unwrap();
        assert!(payload.is_some());
        store.insert(book("b1", "sf", "x"));
        assert!(mgr.matches().has(&book("b1", "sf", "x")));

        let mut deferred = Vec::new();
        let denied: Vec<Value> = vec!["1".into(), 403.into(), "denied".into()];
        mgr.received(&mut state, &denied, &mut deferred);
        run(deferred);
        assert!(mgr.is_empty());
        assert_eq!(state.pending(), 0);
        assert!(!mgr.matches().has_kind("Book"));
        assert!(store.find("Book", "b1").is_none());
    }

    #[test]
    fn stop_releases_pending_without_ack() {
        let (mut mgr, mut state, _) = setup();
        state.connected();
        let (id, _) = mgr.subscribe(&mut state, "Library", vec![], None).unwrap();
        let mut deferred = Vec::new();
        let payload = mgr.stop(&mut state, id.as_str(), &mut deferred);
        assert_eq!(payload, Some(vec!["1".into()]));
        assert_eq!(state.pending(), 0);
        assert!(mgr.stop(&mut state, id.as_str(), &mut deferred).is_none());
    }

    #[test]
    fn identity_change_swaps_matches_and_prunes() {
        let (mut mgr, mut state, store) = setup();
        mgr.set_user_id(Some("u1".into()), &mut Vec::new());
        mgr.subscribe(&mut state, "Library", vec!["sf".into()], None)
            .unwrap();
        store.insert(book("b1", "sf", "u2"));
        store.insert(book("b2", "crime", "u1"));

        let mut deferred = Vec::new();
        assert!(mgr.set_user_id(Some("u2".into()), &mut deferred));
        run(deferred);
        assert!(store.find("Book", "b1").is_some());
        assert!(store.find("Book", "b2").is_none());

        assert!(!mgr.set_user_id(Some("u2".into()), &mut Vec::new()));
    }
}

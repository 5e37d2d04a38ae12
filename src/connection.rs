// Copyright 2020 Joyent, Inc.

//! Server side state for one accepted socket.
//!
//! Outbound frames go through an unbounded channel drained by the socket
//! writer task. Inbound frames are processed one at a time in arrival
//! order: a frame that arrives while another is being handled is appended
//! to the inbox and picked up by the same drain loop. Heartbeats are
//! answered immediately and never queued.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{debug, error, info, o, Logger};
use tokio::sync::{mpsc, watch};

use crate::batch::BatchLedger;
use crate::dict::GlobalDict;
use crate::error::RpcError;
use crate::matcher::MatchRegistry;
use crate::protocol::{Command, Frame};
use crate::publish::Subscription;
use crate::reverse_rpc::ReverseRpcSender;
use crate::store::{Doc, DocChange};
use crate::value::{Map, Value};

/// Handles one inbound frame for a connection.
pub trait Dispatch: Send + Sync {
    fn dispatch(
        &self,
        conn: Arc<ServerConnection>,
        frame: Frame,
    ) -> BoxFuture<'static, Result<(), RpcError>>;
}

type OnClose = Box<dyn FnOnce(&ServerConnection) + Send>;

#[derive(Default)]
struct Inbox {
    frames: VecDeque<Frame>,
    busy: bool,
}

pub struct ServerConnection {
    sess_id: String,
    remote: Option<SocketAddr>,
    dict: Arc<GlobalDict>,
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    closed_tx: watch::Sender<bool>,
    inbox: Mutex<Inbox>,
    subs: Mutex<Option<HashMap<String, Arc<Subscription>>>>,
    matches: MatchRegistry,
    filters: Mutex<HashMap<String, BTreeSet<String>>>,
    user_id: Mutex<Option<String>>,
    on_close: Mutex<Vec<OnClose>>,
    reverse_rpc: Mutex<Option<Arc<ReverseRpcSender>>>,
    log: Logger,
}

impl ServerConnection {
    pub fn new(
        sess_id: String,
        remote: Option<SocketAddr>,
        dict: Arc<GlobalDict>,
        tx: mpsc::UnboundedSender<Frame>,
        log: &Logger,
    ) -> ServerConnection {
        let (closed_tx, _) = watch::channel(false);
        let log = log.new(o!("sess_id" => sess_id.clone()));
        ServerConnection {
            sess_id,
            remote,
            dict,
            tx: Mutex::new(Some(tx)),
            closed_tx,
            inbox: Mutex::new(Inbox::default()),
            subs: Mutex::new(Some(HashMap::new())),
            matches: MatchRegistry::new(),
            filters: Mutex::new(HashMap::new()),
            user_id: Mutex::new(None),
            on_close: Mutex::new(Vec::new()),
            reverse_rpc: Mutex::new(None),
            log,
        }
    }

    pub fn sess_id(&self) -> &str {
        &self.sess_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn dict(&self) -> &Arc<GlobalDict> {
        &self.dict
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn matches(&self) -> &MatchRegistry {
        &self.matches
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_none()).unwrap_or(true)
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Queues a frame for the socket writer.
    pub fn send_frame(&self, frame: Frame) -> Result<(), Error> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| Error::new(ErrorKind::Other, "connection lock poisoned"))?;
        match tx.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| Error::new(ErrorKind::BrokenPipe, "socket writer gone")),
            None => Err(Error::new(ErrorKind::NotConnected, "connection closed")),
        }
    }

    /// Sends a frame, closing the connection if the write fails.
    pub fn send_encoded(&self, frame: Frame) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.send_frame(frame) {
            info!(self.log, "send exception"; "error" => %err);
            self.close();
        }
    }

    pub fn send(&self, cmd: Command, text: &str) {
        self.send_encoded(Frame::text(cmd, text));
    }

    pub fn send_binary(&self, cmd: Command, args: &[Value]) {
        match Frame::binary(cmd, args, &self.dict) {
            Ok(frame) => self.send_encoded(frame),
            Err(err) => error!(self.log, "encode failed"; "cmd" => %cmd, "error" => %err),
        }
    }

    fn push(
        self: &Arc<Self>,
        ledger: Option<&BatchLedger>,
        cmd: Command,
        args: Vec<Value>,
    ) {
        match ledger {
            Some(ledger) => ledger.batch(self, cmd, args, None),
            None => self.send_binary(cmd, &args),
        }
    }

    /// Fields of `kind` never sent to this connection.
    pub fn hide_fields(&self, kind: &str, fields: &[&str]) {
        if let Ok(mut filters) = self.filters.lock() {
            let set = filters.entry(kind.to_string()).or_default();
            set.extend(fields.iter().map(|f| f.to_string()));
        }
    }

    pub fn filter_attrs(&self, kind: &str, attrs: &Map) -> Map {
        let filters = match self.filters.lock() {
            Ok(filters) => filters,
            Err(_) => return attrs.clone(),
        };
        match filters.get(kind) {
            Some(hidden) => attrs
                .iter()
                .filter(|(k, _)| !hidden.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => attrs.clone(),
        }
    }

    pub fn added(self: &Arc<Self>, ledger: Option<&BatchLedger>, doc: &Doc) {
        let attrs = self.filter_attrs(&doc.kind, &doc.attrs);
        self.push(
            ledger,
            Command::Added,
            vec![doc.kind.as_str().into(), doc.id.as_str().into(), attrs.into()],
        );
    }

    /// Sends the visible part of `changes`; nothing is sent when every
    /// changed field is hidden.
    pub fn changed(
        self: &Arc<Self>,
        ledger: Option<&BatchLedger>,
        kind: &str,
        id: &str,
        changes: &Map,
    ) -> bool {
        let visible = self.filter_attrs(kind, changes);
        if visible.is_empty() {
            return false;
        }
        self.push(
            ledger,
            Command::Changed,
            vec![kind.into(), id.into(), visible.into()],
        );
        true
    }

    pub fn removed(self: &Arc<Self>, ledger: Option<&BatchLedger>, kind: &str, id: &str) {
        self.push(ledger, Command::Removed, vec![kind.into(), id.into()]);
    }

    /// Forwards a document change according to this connection's matches.
    /// Returns the command sent, if any.
    pub fn match_update(
        self: &Arc<Self>,
        change: &DocChange,
        ledger: Option<&BatchLedger>,
    ) -> Option<Command> {
        if self.is_closed() {
            return None;
        }
        match change {
            DocChange::Added(doc) => {
                if self.matches.has(doc) {
                    self.added(ledger, doc);
                    return Some(Command::Added);
                }
            }
            DocChange::Changed { doc, was, changes } => {
                match (self.matches.has(was), self.matches.has(doc)) {
                    (false, true) => {
                        self.added(ledger, doc);
                        return Some(Command::Added);
                    }
                    (true, true) => {
                        if self.changed(ledger, &doc.kind, &doc.id, changes) {
                            return Some(Command::Changed);
                        }
                    }
                    (true, false) => {
                        self.removed(ledger, &doc.kind, &doc.id);
                        return Some(Command::Removed);
                    }
                    (false, false) => (),
                }
            }
            DocChange::Removed(doc) => {
                if self.matches.has(doc) {
                    self.removed(ledger, &doc.kind, &doc.id);
                    return Some(Command::Removed);
                }
            }
        }
        None
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.lock().ok().and_then(|u| u.clone())
    }

    pub(crate) fn set_user_id(&self, user_id: Option<String>) {
        if let Ok(mut u) = self.user_id.lock() {
            *u = user_id;
        }
    }

    /// Adds a subscription, returning any it replaced. Fails once closed.
    pub(crate) fn insert_sub(
        &self,
        sub: Arc<Subscription>,
    ) -> Result<Option<Arc<Subscription>>, ()> {
        let mut subs = self.subs.lock().map_err(|_| ())?;
        match subs.as_mut() {
            Some(subs) => Ok(subs.insert(sub.id().to_string(), sub)),
            None => Err(()),
        }
    }

    pub fn sub(&self, id: &str) -> Option<Arc<Subscription>> {
        self.subs.lock().ok()?.as_ref()?.get(id).cloned()
    }

    /// Removes `sub` if it is still the one registered under its id.
    pub(crate) fn remove_sub(&self, sub: &Subscription) {
        if let Ok(mut subs) = self.subs.lock() {
            if let Some(subs) = subs.as_mut() {
                let current = subs.get(sub.id()).map(|s| std::ptr::eq(s.as_ref(), sub));
                if current == Some(true) {
                    subs.remove(sub.id());
                }
            }
        }
    }

    pub fn subs(&self) -> Vec<Arc<Subscription>> {
        let mut subs: Vec<Arc<Subscription>> = match self.subs.lock() {
            Ok(subs) => subs
                .as_ref()
                .map(|s| s.values().cloned().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        subs.sort_by(|a, b| a.id().cmp(b.id()));
        subs
    }

    pub fn set_reverse_rpc(&self, sender: Option<Arc<ReverseRpcSender>>) {
        if let Ok(mut r) = self.reverse_rpc.lock() {
            *r = sender;
        }
    }

    pub fn reverse_rpc(&self) -> Option<Arc<ReverseRpcSender>> {
        self.reverse_rpc.lock().ok().and_then(|r| r.clone())
    }

    pub fn on_close<F>(&self, func: F)
    where
        F: FnOnce(&ServerConnection) + Send + 'static,
    {
        if let Ok(mut on_close) = self.on_close.lock() {
            on_close.push(Box::new(func));
        }
    }

    /// Stops every subscription, drops the writer and runs the close
    /// callbacks. Calling it again does nothing.
    pub fn close(&self) {
        let tx = self.tx.lock().ok().and_then(|mut tx| tx.take());
        if tx.is_none() {
            return;
        }
        drop(tx);
        self.closed_tx.send_replace(true);
        debug!(self.log, "closing connection");

        let subs = self.subs.lock().ok().and_then(|mut subs| subs.take());
        if let Some(subs) = subs {
            for sub in subs.values() {
                sub.stopped();
            }
        }
        if let Ok(mut r) = self.reverse_rpc.lock() {
            r.take();
        }
        let callbacks: Vec<OnClose> = match self.on_close.lock() {
            Ok(mut on_close) => on_close.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for cb in callbacks {
            cb(self);
        }
    }

    /// Accepts an inbound frame. Frames are dispatched strictly one after
    /// another; if one is already in progress this one waits its turn.
    pub fn on_message(self: &Arc<Self>, frame: Frame, dispatch: Arc<dyn Dispatch>) {
        if frame.command() == Command::Heartbeat {
            let now = chrono::Utc::now().timestamp_millis();
            self.send(Command::HeartbeatAck, &now.to_string());
            return;
        }

        {
            let mut inbox = match self.inbox.lock() {
                Ok(inbox) => inbox,
                Err(_) => return,
            };
            inbox.frames.push_back(frame);
            if inbox.busy {
                return;
            }
            inbox.busy = true;
        }

        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.drain(dispatch).await });
    }

    async fn drain(self: Arc<Self>, dispatch: Arc<dyn Dispatch>) {
        let mut guard = Draining {
            conn: &self,
            armed: true,
        };
        loop {
            let next = match self.inbox.lock() {
                Ok(mut inbox) => match inbox.frames.pop_front() {
                    Some(frame) => frame,
                    None => {
                        inbox.busy = false;
                        guard.armed = false;
                        return;
                    }
                },
                Err(_) => return,
            };
            let cmd = next.command();
            let prefix: Vec<u8> = next.as_bytes().iter().take(20).cloned().collect();
            let result = AssertUnwindSafe(dispatch.dispatch(Arc::clone(&self), next))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(RpcError::from_panic(panic)));
            if let Err(err) = result {
                error!(self.log, "unexpected error on message";
                    "cmd" => %cmd, "error" => %err,
                    "frame" => format!("{:02x?}", prefix));
            }
        }
    }
}

/// Clears the inbox's busy flag if a drain loop ends without reaching the
/// empty inbox, so later frames start a new one.
struct Draining<'a> {
    conn: &'a ServerConnection,
    armed: bool,
}

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut inbox) = self.conn.inbox.lock() {
            inbox.busy = false;
        }
    }
}

// Copyright 2020 Joyent, Inc.

//! Unit-of-work output batching.
//!
//! While a request is handled its outbound messages are recorded in a
//! `BatchLedger` rather than written straight away. An entry identical to
//! the previous one (same command, arguments and transform) only gains a
//! destination. On release:
//!
//! * a run of more than one entry for the same single connection is sent as
//!   one `W` frame holding `[[cmd, args], ...]`
//! * any other single-destination entry is sent on its own
//! * a multi-destination entry is encoded once and the same bytes are
//!   written to every destination
//!
//! A failed write closes that one connection; the rest still get their
//! messages. Abort drops everything.

use std::future::Future;
use std::sync::{Arc, Mutex};

use slog::{error, info, Logger};

use crate::connection::ServerConnection;
use crate::dict::GlobalDict;
use crate::protocol::{Command, Frame};
use crate::server::Server;
use crate::store::{Doc, DocChange, DocStore};
use crate::value::{Map, Value};

/// Rewrites an entry's arguments just before it is encoded. Entries only
/// fold together when their transforms share a key.
#[derive(Clone, Copy)]
pub struct Transform {
    pub key: &'static str,
    pub func: fn(&[Value]) -> Vec<Value>,
}

struct Entry {
    cmd: Command,
    args: Vec<Value>,
    transform: Option<Transform>,
    conns: Vec<Arc<ServerConnection>>,
}

impl Entry {
    fn same_message(
        &self,
        cmd: Command,
        args: &[Value],
        transform: &Option<Transform>,
    ) -> bool {
        let same_transform = match (&self.transform, transform) {
            (None, None) => true,
            (Some(a), Some(b)) => a.key == b.key,
            _ => false,
        };
        self.cmd == cmd
            && same_transform
            && self.args.len() == args.len()
            && self.args.iter().zip(args).all(|(a, b)| a.identical(b))
    }

    fn payload(&self) -> Vec<Value> {
        match &self.transform {
            Some(t) => (t.func)(&self.args),
            None => self.args.clone(),
        }
    }

    fn single(&self) -> Option<&Arc<ServerConnection>> {
        if self.conns.len() == 1 {
            self.conns.first()
        } else {
            None
        }
    }
}

pub struct BatchLedger {
    dict: Arc<GlobalDict>,
    entries: Mutex<Vec<Entry>>,
    log: Logger,
}

impl BatchLedger {
    pub fn new(dict: Arc<GlobalDict>, log: &Logger) -> BatchLedger {
        BatchLedger {
            dict,
            entries: Mutex::new(Vec::new()),
            log: log.clone(),
        }
    }

    pub fn batch(
        &self,
        conn: &Arc<ServerConnection>,
        cmd: Command,
        args: Vec<Value>,
        transform: Option<Transform>,
    ) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return,
        };
        if let Some(last) = entries.last_mut() {
            if last.same_message(cmd, &args, &transform) {
                if !last.conns.iter().any(|c| Arc::ptr_eq(c, conn)) {
                    last.conns.push(Arc::clone(conn));
                }
                return;
            }
        }
        entries.push(Entry {
            cmd,
            args,
            transform,
            conns: vec![Arc::clone(conn)],
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards every recorded message.
    pub fn abort(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Writes every recorded message and empties the ledger. Returns the
    /// number of frames written.
    pub fn release(&self) -> usize {
        let entries: Vec<Entry> = match self.entries.lock() {
            Ok(mut entries) => entries.drain(..).collect(),
            Err(_) => return 0,
        };

        let mut written = 0;
        let mut i = 0;
        while i < entries.len() {
            if let Some(conn) = entries[i].single() {
                let mut end = i + 1;
                while end < entries.len()
                    && entries[end].single().map(|c| Arc::ptr_eq(c, conn)) == Some(true)
                {
                    end += 1;
                }
                let frame = if end - i > 1 {
                    let items: Vec<Value> = entries[i..end]
                        .iter()
                        .map(|e| {
                            Value::Array(vec![
                                e.cmd.as_char().to_string().into(),
                                Value::Array(e.payload()),
                            ])
                        })
                        .collect();
                    self.encode(Command::Batch, &items)
                } else {
                    self.encode(entries[i].cmd, &entries[i].payload())
                };
                if let Some(frame) = frame {
                    written += self.send(conn, frame);
                }
                i = end;
                continue;
            }

            let entry = &entries[i];
            if let Some(frame) = self.encode(entry.cmd, &entry.payload()) {
                for conn in &entry.conns {
                    written += self.send(conn, frame.clone());
                }
            }
            i += 1;
        }
        written
    }

    fn encode(&self, cmd: Command, args: &[Value]) -> Option<Frame> {
        match Frame::binary(cmd, args, &self.dict) {
            Ok(frame) => Some(frame),
            Err(err) => {
                error!(self.log, "batch encode failed"; "cmd" => %cmd, "error" => %err);
                None
            }
        }
    }

    fn send(&self, conn: &ServerConnection, frame: Frame) -> usize {
        if conn.is_closed() {
            return 0;
        }
        match conn.send_frame(frame) {
            Ok(()) => 1,
            Err(err) => {
                conn.close();
                info!(self.log, "batch send exception";
                    "sess_id" => conn.sess_id(), "error" => %err);
                0
            }
        }
    }
}

tokio::task_local! {
    static UNIT_LEDGER: Arc<BatchLedger>;
}

/// Ledger of the unit of work being run on this task, if any. Document
/// changes reported by the store while it is set are collected there
/// instead of being written at once.
pub(crate) fn current_ledger() -> Option<Arc<BatchLedger>> {
    UNIT_LEDGER.try_with(Arc::clone).ok()
}

/// Execution context of one unit of work on the server: the connection it
/// runs for and the ledger its output is collected in.
#[derive(Clone)]
pub struct Context {
    server: Server,
    conn: Arc<ServerConnection>,
    ledger: Arc<BatchLedger>,
}

impl Context {
    pub fn new(server: &Server, conn: &Arc<ServerConnection>) -> Context {
        Context {
            server: server.clone(),
            conn: Arc::clone(conn),
            ledger: Arc::new(BatchLedger::new(Arc::clone(server.dict()), conn.log())),
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn conn(&self) -> &Arc<ServerConnection> {
        &self.conn
    }

    pub fn ledger(&self) -> &BatchLedger {
        &self.ledger
    }

    pub fn log(&self) -> &Logger {
        self.conn.log()
    }

    pub fn user_id(&self) -> Option<String> {
        self.conn.user_id()
    }

    pub fn send_binary(&self, cmd: Command, args: Vec<Value>) {
        self.ledger.batch(&self.conn, cmd, args, None);
    }

    /// Records a message for another connection in this unit of work.
    pub fn send_to(&self, conn: &Arc<ServerConnection>, cmd: Command, args: Vec<Value>) {
        self.ledger.batch(conn, cmd, args, None);
    }

    pub fn added(&self, doc: &Doc) {
        self.conn.added(Some(&self.ledger), doc);
    }

    pub fn changed(&self, kind: &str, id: &str, changes: &Map) {
        self.conn.changed(Some(&self.ledger), kind, id, changes);
    }

    pub fn removed(&self, kind: &str, id: &str) {
        self.conn.removed(Some(&self.ledger), kind, id);
    }

    /// Runs `fut` as this unit of work. Store changes made while it is
    /// polled reach subscribers through this context's ledger.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        UNIT_LEDGER.scope(Arc::clone(&self.ledger), fut).await
    }

    pub(crate) fn scope_sync<T, F: FnOnce() -> T>(&self, func: F) -> T {
        UNIT_LEDGER.sync_scope(Arc::clone(&self.ledger), func)
    }

    /// Stores `doc`; the server pushes the change to every connection it
    /// matches as part of this unit of work.
    pub fn insert(&self, doc: Doc) -> Option<DocChange> {
        self.scope_sync(|| self.server.store().insert(doc))
    }

    pub fn update(&self, kind: &str, id: &str, changes: &Map) -> Option<DocChange> {
        self.scope_sync(|| self.server.store().update(kind, id, changes))
    }

    pub fn remove(&self, kind: &str, id: &str) -> Option<DocChange> {
        self.scope_sync(|| self.server.store().remove(kind, id))
    }

    /// Changes the connection's identity and reruns each of its
    /// publications. A publication that fails is stopped on its own; the
    /// others still run.
    pub fn set_user_id(&self, user_id: Option<String>) {
        if self.conn.user_id() == user_id {
            return;
        }
        self.conn.set_user_id(user_id);
        for sub in self.conn.subs() {
            if let Err(err) = sub.run(self) {
                sub.fail(err);
            }
        }
    }

    pub fn release(&self) -> usize {
        self.ledger.release()
    }

    pub fn abort(&self) {
        self.ledger.abort();
    }
}

// Copyright 2020 Joyent, Inc.

//! Server side of subscriptions.
//!
//! `P [id, name, args, lastSubscribed]` starts (or restarts) subscription
//! `id` on the connection by running the named publication, which
//! registers match predicates and usually sends the documents that
//! currently match. `P [id]` stops it. A publication that fails is torn
//! down and reported to the client as `[id, code, reason]`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use slog::{debug, error, info, warn};

use crate::batch::Context;
use crate::connection::ServerConnection;
use crate::error::{RpcError, INTERNAL_ERROR};
use crate::matcher::MatchHandle;
use crate::protocol::Command;
use crate::store::Doc;
use crate::value::Value;

pub type PublishFn =
    Arc<dyn Fn(&Context, &Subscription) -> Result<(), RpcError> + Send + Sync>;

type OnStop = Box<dyn FnOnce() + Send>;

pub struct Subscription {
    id: String,
    name: String,
    args: Vec<Value>,
    last_subscribed: Mutex<f64>,
    conn: Weak<ServerConnection>,
    publish: PublishFn,
    matches: Mutex<Vec<MatchHandle>>,
    on_stop: Mutex<Option<OnStop>>,
    called: AtomicBool,
    resubscribe: AtomicBool,
    stopped: AtomicBool,
}

impl Subscription {
    pub fn new(
        conn: &Arc<ServerConnection>,
        id: &str,
        name: &str,
        args: Vec<Value>,
        last_subscribed: f64,
        publish: PublishFn,
    ) -> Subscription {
        Subscription {
            id: id.to_string(),
            name: name.to_string(),
            args,
            last_subscribed: Mutex::new(last_subscribed),
            conn: Arc::downgrade(conn),
            publish,
            matches: Mutex::new(Vec::new()),
            on_stop: Mutex::new(None),
            called: AtomicBool::new(false),
            resubscribe: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// When the client last completed this subscription, in milliseconds;
    /// zero if never.
    pub fn last_subscribed(&self) -> f64 {
        self.last_subscribed.lock().map(|l| *l).unwrap_or(0.0)
    }

    pub fn conn(&self) -> Option<Arc<ServerConnection>> {
        self.conn.upgrade()
    }

    pub fn user_id(&self) -> Option<String> {
        self.conn().and_then(|c| c.user_id())
    }

    /// True while the publication is being rerun after an identity change.
    pub fn is_resubscribe(&self) -> bool {
        self.resubscribe.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Makes documents of `kind` accepted by `func` visible to the
    /// connection.
    pub fn match_kind<F>(&self, kind: &str, func: F)
    where
        F: Fn(&Doc) -> bool + Send + Sync + 'static,
    {
        let conn = match self.conn() {
            Some(conn) => conn,
            None => return,
        };
        let handle = conn.matches().register(kind, func);
        if self.is_stopped() {
            handle.stop();
            return;
        }
        if let Ok(mut matches) = self.matches.lock() {
            matches.push(handle);
        }
    }

    pub fn hide_fields(&self, kind: &str, fields: &[&str]) {
        if let Some(conn) = self.conn() {
            conn.hide_fields(kind, fields);
        }
    }

    /// Runs `func` when the subscription stops or before it is rerun.
    pub fn on_stop<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Ok(mut on_stop) = self.on_stop.lock() {
            *on_stop = Some(Box::new(func));
        }
    }

    /// Ends the subscription from the server side and tells the client.
    pub fn stop(&self) {
        if self.is_stopped() {
            return;
        }
        if let Some(conn) = self.conn() {
            let nosub: Vec<Value> = vec![self.id.as_str().into(), false.into()];
            conn.send_binary(Command::Subscription, &nosub);
        }
        self.stopped();
    }

    /// Local teardown: unregisters the subscription and its matches.
    pub(crate) fn stopped(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(conn) = self.conn() {
            conn.remove_sub(self);
        }
        self.run_on_stop();
        let matches: Vec<MatchHandle> = match self.matches.lock() {
            Ok(mut m) => m.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for m in matches {
            m.stop();
        }
    }

    fn run_on_stop(&self) {
        let on_stop = self.on_stop.lock().ok().and_then(|mut s| s.take());
        if let Some(func) = on_stop {
            func();
        }
    }

    /// Runs the publication. Matches it registers replace the previous set
    /// only after it returns, so there is no moment with nothing matched.
    pub(crate) fn run(&self, ctx: &Context) -> Result<(), RpcError> {
        if self.is_stopped() {
            return Ok(());
        }
        let called = self.called.swap(true, Ordering::SeqCst);
        self.resubscribe.store(called, Ordering::SeqCst);
        self.run_on_stop();

        let old: Vec<MatchHandle> = match self.matches.lock() {
            Ok(mut m) => m.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.publish)(ctx, self)))
            .unwrap_or_else(|panic| Err(RpcError::from_panic(panic)));
        for m in old {
            m.stop();
        }
        self.resubscribe.store(false, Ordering::SeqCst);
        result
    }

    /// Reports `err` to the client and tears the subscription down.
    /// Unstructured faults are logged and replaced with a generic reason.
    pub(crate) fn fail(&self, err: RpcError) {
        if let Some(conn) = self.conn() {
            let reply: Vec<Value> = match err {
                RpcError::Remote(err) => {
                    vec![self.id.as_str().into(), err.code.into(), err.reason]
                }
                other => {
                    error!(conn.log(), "publication failed"; "sub" => &self.id,
                        "name" => &self.name, "error" => %other);
                    vec![self.id.as_str().into(), 500.into(), INTERNAL_ERROR.into()]
                }
            };
            conn.send_binary(Command::Subscription, &reply);
        }
        self.stopped();
    }
}

/// Handles a `P` frame. Output goes through the context's ledger; the
/// caller releases it.
pub(crate) fn handle_subscribe(ctx: &Context, data: Vec<Value>) {
    let conn = ctx.conn();
    let sub_id = match data.get(0).and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            warn!(conn.log(), "subscribe without id");
            return;
        }
    };
    if conn.is_closed() {
        return;
    }

    let name = match data.get(1).and_then(Value::as_str) {
        Some(name) => name,
        None => {
            if let Some(sub) = conn.sub(&sub_id) {
                debug!(conn.log(), "client stopped subscription"; "sub" => &sub_id);
                sub.stopped();
            }
            return;
        }
    };

    let publish = match ctx.server().publication(name) {
        Some(publish) => publish,
        None => {
            let msg = format!("unknown publication: {}", name);
            info!(conn.log(), "{}", msg);
            conn.send_binary(
                Command::Subscription,
                &[sub_id.as_str().into(), 404.into(), msg.into()],
            );
            return;
        }
    };

    let args = data
        .get(2)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let last = data.get(3).and_then(Value::as_f64).unwrap_or(0.0);
    let sub = Arc::new(Subscription::new(conn, &sub_id, name, args, last, publish));
    match conn.insert_sub(Arc::clone(&sub)) {
        Ok(Some(old)) => old.stopped(),
        Ok(None) => (),
        Err(()) => return,
    }

    if let Err(err) = sub.run(ctx) {
        ctx.abort();
        sub.fail(err);
        return;
    }
    if sub.is_stopped() {
        return;
    }
    let now = chrono::Utc::now().timestamp_millis() as f64;
    if let Ok(mut last) = sub.last_subscribed.lock() {
        *last = now;
    }
    ctx.send_binary(
        Command::Subscription,
        vec![sub_id.into(), 200.into(), now.into()],
    );
}

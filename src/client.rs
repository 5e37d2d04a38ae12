// Copyright 2020 Joyent, Inc.

//! Client session.
//!
//! A `Client` owns one logical session that outlives individual sockets. The
//! driver task connects, performs the `X` handshake, then pumps frames until
//! the socket fails or the heartbeat gives up, and reconnects after a
//! backoff. Calls and subscriptions made while disconnected are kept and
//! replayed, subscriptions first, once the next handshake completes.
//!
//! Callbacks into user code (RPC completions, subscription results, store
//! listeners, broadcasts, hooks) never run while the session lock is held.

use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::codec::Framed;

use crate::config::ClientConfig;
use crate::dict::GlobalDict;
use crate::error::{RpcError, StateError, WireError};
use crate::protocol::{Command, Frame, FrameCodec, SeqId, PROTOCOL_VERSION};
use crate::reverse_rpc::ReverseRpcReceiver;
use crate::rpc::{random_base_id, RpcCallback, RpcChannel};
use crate::state::{ConnectionState, Deferred, State};
use crate::store::{Doc, DocStore, MemoryStore};
use crate::subscribe::{SubCallback, SubScope, SubscriptionManager};
use crate::value::{Map, Value};

/// What to do when the heartbeat deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send `H` and wait half an interval for any traffic.
    Probe,
    /// The probe went unanswered.
    Fail,
}

/// Idle tracking for one socket.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    deadline: Instant,
    probing: bool,
}

impl Heartbeat {
    pub fn new(interval: Duration, now: Instant) -> Heartbeat {
        Heartbeat {
            interval,
            deadline: now + interval,
            probing: false,
        }
    }

    /// Any inbound frame counts as traffic.
    pub fn received(&mut self, now: Instant) {
        self.deadline = now + self.interval;
        self.probing = false;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn expired(&mut self, now: Instant) -> Beat {
        if self.probing {
            return Beat::Fail;
        }
        self.probing = true;
        self.deadline = now + self.interval / 2;
        Beat::Probe
    }
}

/// Reconnect delay: grows by `base` per consecutive failure up to
/// `ceiling × base`.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    ceiling: u32,
    count: u32,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: u32) -> Backoff {
        Backoff {
            base,
            ceiling,
            count: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.count = std::cmp::min(self.ceiling, self.count + 1);
        self.base * self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

pub type BroadcastFn = Arc<dyn Fn(&[Value]) + Send + Sync>;

pub type LocalMethod =
    Arc<dyn Fn(&Simulation, &[Value]) -> Result<Value, RpcError> + Send + Sync>;

type Hook = Arc<dyn Fn(&str) + Send + Sync>;

/// Optimistic local run of an RPC. Nested calls made through `rpc` run
/// their local implementation only; nothing is sent and no id is used.
pub struct Simulation<'a> {
    client: &'a Client,
}

impl<'a> Simulation<'a> {
    pub fn client(&self) -> &Client {
        self.client
    }

    pub fn store(&self) -> &Arc<dyn DocStore> {
        self.client.store()
    }

    pub fn user_id(&self) -> Option<String> {
        self.client.user_id()
    }

    pub fn rpc(&self, name: &str, args: &[Value]) -> Result<Value, RpcError> {
        match self.client.inner.local(name) {
            Some(func) => func(self, args),
            None => Ok(Value::Undefined),
        }
    }
}

enum Outbound {
    Text(Command, String),
    Binary(Command, Vec<Value>),
}

struct Core {
    state: ConnectionState,
    rpc: RpcChannel,
    subs: SubscriptionManager,
    out: Option<mpsc::UnboundedSender<Frame>>,
    dict: Arc<GlobalDict>,
    dict_hash: Option<String>,
    version_hash: Option<String>,
    wait_sends: Vec<Outbound>,
    backoff: Backoff,
    running: bool,
    stopped: bool,
}

struct ClientInner {
    config: ClientConfig,
    log: Logger,
    core: Mutex<Core>,
    store: Arc<dyn DocStore>,
    locals: Mutex<HashMap<String, LocalMethod>>,
    broadcasts: Mutex<HashMap<String, BroadcastFn>>,
    reverse: ReverseRpcReceiver,
    on_new_version: Mutex<Option<Hook>>,
    on_unload: Mutex<Option<Hook>>,
    stop: Notify,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig, log: Option<&Logger>) -> Client {
        Client::with_store(config, Arc::new(MemoryStore::new()), log)
    }

    pub fn with_store(
        config: ClientConfig,
        store: Arc<dyn DocStore>,
        log: Option<&Logger>,
    ) -> Client {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let core = Core {
            state: ConnectionState::new(),
            rpc: RpcChannel::new(Command::Rpc, random_base_id()),
            subs: SubscriptionManager::new(Arc::clone(&store), log.clone()),
            out: None,
            dict: Arc::new(GlobalDict::empty()),
            dict_hash: None,
            version_hash: None,
            wait_sends: Vec::new(),
            backoff: Backoff::new(config.retry_base(), config.retry_ceiling),
            running: false,
            stopped: false,
        };
        let inner = Arc::new(ClientInner {
            reverse: ReverseRpcReceiver::new(Command::ReverseRpc, Some(&log)),
            config,
            log,
            core: Mutex::new(core),
            store,
            locals: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(HashMap::new()),
            on_new_version: Mutex::new(None),
            on_unload: Mutex::new(None),
            stop: Notify::new(),
        });

        let subs = Arc::downgrade(&inner);
        let rpcs = Arc::downgrade(&inner);
        {
            let mut core = inner.core();
            let registered = core
                .state
                .on_connect("10-subscribe", move || {
                    if let Some(inner) = subs.upgrade() {
                        inner.replay_subscriptions();
                    }
                })
                .and_then(|_| {
                    core.state.on_connect("20-rpc", move || {
                        if let Some(inner) = rpcs.upgrade() {
                            inner.replay_rpcs();
                        }
                    })
                });
            if let Err(err) = registered {
                error!(inner.log, "on connect registration"; "error" => %err);
            }
        }
        Client { inner }
    }

    pub fn log(&self) -> &Logger {
        &self.inner.log
    }

    pub fn store(&self) -> &Arc<dyn DocStore> {
        &self.inner.store
    }

    pub fn state(&self) -> State {
        self.inner.core().state.state()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.core().state.is_ready()
    }

    /// Outstanding calls and unacknowledged subscriptions.
    pub fn pending(&self) -> usize {
        self.inner.core().state.pending()
    }

    pub fn version_hash(&self) -> Option<String> {
        self.inner.core().version_hash.clone()
    }

    pub fn dict_hash(&self) -> Option<String> {
        self.inner.core().dict_hash.clone()
    }

    /// Starts the connection driver. A driver that is still winding down
    /// after `stop` keeps running instead.
    pub fn start(&self) {
        {
            let mut core = self.inner.core();
            core.stopped = false;
            if core.running {
                return;
            }
            core.running = true;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run().await });
    }

    /// Closes the socket and stops reconnecting. Pending calls and
    /// subscriptions are kept for a later `start`.
    pub fn stop(&self) {
        let running = {
            let mut core = self.inner.core();
            core.stopped = true;
            core.out = None;
            core.state.close();
            core.running
        };
        if running {
            self.inner.stop.notify_one();
        }
        info!(self.inner.log, "client stopped");
    }

    pub async fn wait_ready(&self) {
        let mut rx = {
            let core = self.inner.core();
            core.state.watch_state()
        };
        loop {
            if *rx.borrow() == State::Ready {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once nothing is outstanding.
    pub async fn wait_synced(&self) {
        let mut rx = {
            let core = self.inner.core();
            core.state.watch_synced()
        };
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Registers the local implementation run optimistically by `rpc`.
    pub fn define_local<F>(&self, name: &str, func: F)
    where
        F: Fn(&Simulation, &[Value]) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        if let Ok(mut locals) = self.inner.locals.lock() {
            locals.insert(name.to_string(), Arc::new(func));
        }
    }

    /// Issues a call. It is sent now if the connection is ready and
    /// otherwise on the next connect; a local implementation, if defined,
    /// runs straight after. Arguments that cannot be encoded fail here and
    /// the call is never queued.
    pub fn rpc(
        &self,
        name: &str,
        args: Vec<Value>,
        callback: Option<RpcCallback>,
    ) -> Result<SeqId, RpcError> {
        let (id, data) = {
            let mut guard = self.inner.core();
            let core = &mut *guard;
            let (id, data) = core.rpc.enqueue(name, args, callback);
            let frame = match Frame::binary(Command::Rpc, &data, &core.dict) {
                Ok(frame) => frame,
                Err(err) => {
                    core.rpc.cancel(id.as_str());
                    debug!(self.inner.log, "rpc not encodable";
                        "method" => name, "error" => %err);
                    return Err(err.into());
                }
            };
            core.state.inc_pending();
            if core.state.is_ready() {
                self.inner.write(core, frame);
            }
            (id, data)
        };
        debug!(self.inner.log, "rpc"; "id" => id.as_str(), "method" => name);

        if let Some(func) = self.inner.local(name) {
            let sim = Simulation { client: self };
            if let Err(err) = func(&sim, &data[2..]) {
                debug!(self.inner.log, "simulation failed";
                    "method" => name, "error" => %err);
            }
        }
        Ok(id)
    }

    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.rpc(
            name,
            args,
            Some(Box::new(move |result: Result<Value, RpcError>| {
                let _ = tx.send(result);
            })),
        )?;
        rx.await.unwrap_or(Err(RpcError::Closed))
    }

    /// Forgets a call; its callback is never run. Returns false if the call
    /// was not pending.
    pub fn cancel_rpc(&self, id: &str) -> bool {
        let entry = {
            let mut guard = self.inner.core();
            let core = &mut *guard;
            let entry = core.rpc.cancel(id);
            if entry.is_some() {
                self.inner.dec_pending(&mut core.state);
            }
            entry
        };
        entry.is_some()
    }

    pub fn last_msg_id(&self) -> Option<String> {
        self.inner
            .core()
            .rpc
            .last_msg_id()
            .map(|id| id.as_str().to_string())
    }

    pub fn check_msg_id(&self, msg_id: &str) {
        self.inner.core().rpc.check_msg_id(msg_id);
    }

    pub fn register_publication<F>(&self, name: &str, func: F)
    where
        F: Fn(&mut SubScope, &[Value]) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.inner.core().subs.register_publication(name, func);
    }

    /// Subscribes to publication `name`. The local publication runs at once
    /// (it must not call back into the client). Fails without subscribing
    /// when the publication is unknown or `args` cannot be encoded.
    pub fn subscribe(
        &self,
        name: &str,
        args: Vec<Value>,
        callback: Option<SubCallback>,
    ) -> Result<SeqId, RpcError> {
        let mut guard = self.inner.core();
        let core = &mut *guard;
        let request: Vec<Value> = vec![
            Value::Null,
            name.into(),
            Value::Array(args),
            Value::from(0),
        ];
        Frame::binary(Command::Subscription, &request, &core.dict)?;
        let args = match request.into_iter().nth(2) {
            Some(Value::Array(args)) => args,
            _ => Vec::new(),
        };
        let (id, payload) = core.subs.subscribe(&mut core.state, name, args, callback)?;
        if let Some(payload) = payload {
            self.inner.write_binary(core, Command::Subscription, &payload);
        }
        Ok(id)
    }

    pub fn unsubscribe(&self, id: &str) {
        let mut deferred = Vec::new();
        {
            let mut guard = self.inner.core();
            let core = &mut *guard;
            if let Some(payload) = core.subs.stop(&mut core.state, id, &mut deferred) {
                self.inner.write_binary(core, Command::Subscription, &payload);
            }
        }
        run_deferred(deferred);
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.core().subs.user_id().map(str::to_string)
    }

    /// Reruns every local publication for the new identity.
    pub fn set_user_id(&self, user_id: Option<String>) -> bool {
        let mut deferred = Vec::new();
        let changed = self.inner.core().subs.set_user_id(user_id, &mut deferred);
        run_deferred(deferred);
        changed
    }

    pub fn register_broadcast<F>(&self, name: &str, func: F) -> Result<(), StateError>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let mut broadcasts = self
            .inner
            .broadcasts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if broadcasts.contains_key(name) {
            return Err(StateError::BroadcastTaken(name.to_string()));
        }
        broadcasts.insert(name.to_string(), Arc::new(func));
        Ok(())
    }

    pub fn deregister_broadcast(&self, name: &str) {
        if let Ok(mut broadcasts) = self.inner.broadcasts.lock() {
            broadcasts.remove(name);
        }
    }

    /// Defines a method the server may call with `F` frames.
    pub fn define_reverse<F>(&self, name: &str, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.inner.reverse.define(name, func);
    }

    /// Called with the new hash when the server's version changes between
    /// connections.
    pub fn on_new_version<F>(&self, func: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if let Ok(mut hook) = self.inner.on_new_version.lock() {
            *hook = Some(Arc::new(func));
        }
    }

    /// Called with the module id of each `U` notice.
    pub fn on_unload<F>(&self, func: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if let Ok(mut hook) = self.inner.on_unload.lock() {
            *hook = Some(Arc::new(func));
        }
    }

    /// Sends a text frame, or holds it until the connection is ready.
    pub fn send(&self, cmd: Command, text: &str) {
        let mut core = self.inner.core();
        self.inner
            .send_or_wait(&mut core, Outbound::Text(cmd, text.to_string()));
    }

    /// Like `send` for data frames. Values that cannot be encoded with the
    /// current dictionary are refused; held values are encoded again when
    /// sent, against the dictionary of the connection that carries them.
    pub fn send_binary(&self, cmd: Command, args: Vec<Value>) -> Result<(), WireError> {
        let mut core = self.inner.core();
        Frame::binary(cmd, &args, &core.dict)?;
        self.inner.send_or_wait(&mut core, Outbound::Binary(cmd, args));
        Ok(())
    }
}

fn run_deferred(deferred: Vec<Deferred>) {
    for func in deferred {
        func();
    }
}

fn field<'a>(data: &'a [Value], index: usize) -> Option<&'a str> {
    data.get(index).and_then(Value::as_str)
}

impl ClientInner {
    fn core(&self) -> MutexGuard<Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn local(&self, name: &str) -> Option<LocalMethod> {
        self.locals.lock().ok()?.get(name).cloned()
    }

    fn dec_pending(&self, state: &mut ConnectionState) {
        if let Err(err) = state.dec_pending() {
            error!(self.log, "pending count"; "error" => %err);
        }
    }

    fn write(&self, core: &Core, frame: Frame) -> bool {
        match &core.out {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn write_binary(&self, core: &Core, cmd: Command, args: &[Value]) -> bool {
        match Frame::binary(cmd, args, &core.dict) {
            Ok(frame) => self.write(core, frame),
            Err(err) => {
                error!(self.log, "encode failed"; "cmd" => %cmd, "error" => %err);
                false
            }
        }
    }

    fn write_outbound(&self, core: &Core, msg: Outbound) {
        match msg {
            Outbound::Text(cmd, text) => {
                self.write(core, Frame::text(cmd, &text));
            }
            Outbound::Binary(cmd, args) => {
                self.write_binary(core, cmd, &args);
            }
        }
    }

    fn send_or_wait(&self, core: &mut Core, msg: Outbound) {
        if core.state.is_ready() && core.out.is_some() {
            self.write_outbound(core, msg);
        } else {
            core.wait_sends.push(msg);
        }
    }

    fn replay_subscriptions(&self) {
        let mut guard = self.core();
        let core = &mut *guard;
        for payload in core.subs.on_connect(&mut core.state) {
            self.write_binary(core, Command::Subscription, &payload);
        }
    }

    /// Resends every pending call in issue order. A call that no longer
    /// encodes against the new dictionary is failed instead.
    fn replay_rpcs(&self) {
        let mut failed = Vec::new();
        {
            let mut guard = self.core();
            let core = &mut *guard;
            for data in core.rpc.queue().pending_requests() {
                match Frame::binary(Command::Rpc, &data, &core.dict) {
                    Ok(frame) => {
                        self.write(core, frame);
                    }
                    Err(err) => {
                        let id = field(&data, 0).unwrap_or("").to_string();
                        error!(self.log, "dropping call"; "id" => &id, "error" => %err);
                        if let Some(entry) = core.rpc.cancel(&id) {
                            self.dec_pending(&mut core.state);
                            failed.push((entry, err));
                        }
                    }
                }
            }
        }
        for (entry, err) in failed {
            if let Some(callback) = entry.callback {
                callback(Err(err.into()));
            }
        }
    }

    /// True once the client has been stopped. Also clears `running` then,
    /// under the same lock, so a concurrent `start` spawns a new driver.
    fn finished(&self) -> bool {
        let mut core = self.core();
        if core.stopped {
            core.running = false;
        }
        core.stopped
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.finished() {
                return;
            }
            match TcpStream::connect(&self.config.address).await {
                Ok(socket) => {
                    if let Err(err) = self.session(socket).await {
                        info!(self.log, "connection lost"; "error" => %err);
                    }
                }
                Err(err) => {
                    info!(self.log, "connect failed";
                        "address" => &self.config.address, "error" => %err);
                }
            }

            let delay = {
                let mut core = self.core();
                core.out = None;
                if core.stopped {
                    core.running = false;
                    return;
                }
                core.state.retry();
                core.backoff.next_delay()
            };
            debug!(self.log, "reconnecting"; "delay_ms" => delay.as_millis() as u64);
            // a wakeup left over from an earlier stop only cuts the wait short
            tokio::select! {
                _ = sleep(delay) => (),
                _ = self.stop.notified() => (),
            }
        }
    }

    async fn session<S>(&self, socket: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(socket, FrameCodec::new(self.config.max_frame));
        let known = self.core().dict_hash.clone();
        let hello: Vec<Value> = vec![PROTOCOL_VERSION.into(), known.into()];
        framed
            .send(Frame::binary(Command::Handshake, &hello, &GlobalDict::empty())?)
            .await?;

        let (mut sink, mut stream) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut core = self.core();
            if core.stopped {
                return Ok(());
            }
            core.out = Some(tx);
        }

        let mut heartbeat =
            Heartbeat::new(self.config.heartbeat_interval(), Instant::now());
        let result = loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    if self.core().stopped {
                        break Ok(());
                    }
                }
                out = rx.recv() => match out {
                    Some(frame) => {
                        if let Err(err) = sink.send(frame).await {
                            break Err(err);
                        }
                    }
                    None => break Ok(()),
                },
                next = stream.next() => match next {
                    Some(Ok(frame)) => {
                        heartbeat.received(Instant::now());
                        self.on_frame(frame);
                    }
                    Some(Err(err)) => break Err(err),
                    None => break Ok(()),
                },
                _ = sleep_until(heartbeat.deadline()) => {
                    match heartbeat.expired(Instant::now()) {
                        Beat::Probe => {
                            let ping = Frame::text(Command::Heartbeat, "");
                            if let Err(err) = sink.send(ping).await {
                                break Err(err);
                            }
                        }
                        Beat::Fail => {
                            break Err(Error::new(ErrorKind::TimedOut, "Heartbeat fail"));
                        }
                    }
                }
            }
        };

        self.core().out = None;
        let _ = sink.close().await;
        result
    }

    fn on_frame(&self, frame: Frame) {
        let cmd = frame.command();
        if !cmd.is_binary() {
            match frame.text_payload() {
                Ok(text) => self.on_text(cmd, text),
                Err(err) => {
                    warn!(self.log, "bad text frame"; "cmd" => %cmd, "error" => %err)
                }
            }
            return;
        }
        let decoded = if cmd == Command::Handshake {
            frame.decode(&GlobalDict::empty())
        } else {
            let dict = Arc::clone(&self.core().dict);
            frame.decode(&dict)
        };
        match decoded {
            Ok(data) => self.on_data(cmd, data),
            Err(err) => {
                warn!(self.log, "undecodable frame"; "cmd" => %cmd, "error" => %err)
            }
        }
    }

    fn on_text(&self, cmd: Command, text: &str) {
        match cmd {
            Command::HeartbeatAck => {
                debug!(self.log, "heartbeat ack"; "server_time" => text)
            }
            Command::Unload => {
                let (hash, id) = match text.find(':') {
                    Some(i) => (&text[..i], &text[i + 1..]),
                    None => (text, ""),
                };
                self.core().version_hash = Some(hash.to_string());
                info!(self.log, "unload"; "id" => id, "version_hash" => hash);
                let hook = self.on_unload.lock().ok().and_then(|h| h.clone());
                if let Some(hook) = hook {
                    hook(id);
                }
            }
            Command::Error => error!(self.log, "server error"; "text" => text),
            Command::Log => info!(self.log, "server log"; "text" => text),
            other => warn!(self.log, "unexpected command"; "cmd" => %other),
        }
    }

    fn on_data(&self, cmd: Command, data: Vec<Value>) {
        match cmd {
            Command::Handshake => self.handshake(data),
            Command::Rpc => self.rpc_response(data),
            Command::ReverseRpc => {
                if let Some(reply) = self.reverse.respond(&data) {
                    let core = self.core();
                    self.write_binary(&core, Command::ReverseRpc, &reply);
                }
            }
            Command::Subscription => {
                let mut deferred = Vec::new();
                {
                    let mut guard = self.core();
                    let core = &mut *guard;
                    core.subs.received(&mut core.state, &data, &mut deferred);
                }
                run_deferred(deferred);
            }
            Command::Added => match (field(&data, 0), field(&data, 1)) {
                (Some(kind), Some(id)) => {
                    let attrs = data
                        .get(2)
                        .and_then(Value::as_map)
                        .cloned()
                        .unwrap_or_default();
                    self.store.insert(Doc::new(kind, id, attrs));
                }
                _ => warn!(self.log, "malformed added"),
            },
            Command::Changed => match (field(&data, 0), field(&data, 1)) {
                (Some(kind), Some(id)) => {
                    let empty = Map::new();
                    let changes = data.get(2).and_then(Value::as_map).unwrap_or(&empty);
                    if self.store.find(kind, id).is_none() {
                        warn!(self.log, "change for unknown document";
                            "kind" => kind, "id" => id);
                    }
                    self.store.update(kind, id, changes);
                }
                _ => warn!(self.log, "malformed changed"),
            },
            Command::Removed => match (field(&data, 0), field(&data, 1)) {
                (Some(kind), Some(id)) => {
                    self.store.remove(kind, id);
                }
                _ => warn!(self.log, "malformed removed"),
            },
            Command::Batch => {
                for item in data {
                    self.batch_item(item);
                }
            }
            Command::Broadcast => {
                let name = match field(&data, 0) {
                    Some(name) => name,
                    None => {
                        warn!(self.log, "malformed broadcast");
                        return;
                    }
                };
                let func = self.broadcasts.lock().ok().and_then(|b| b.get(name).cloned());
                match func {
                    Some(func) => func(&data[1..]),
                    None => error!(self.log, "unknown broadcast"; "name" => name),
                }
            }
            other => warn!(self.log, "unexpected command"; "cmd" => %other),
        }
    }

    fn batch_item(&self, item: Value) {
        let mut pair = match item {
            Value::Array(pair) if pair.len() == 2 => pair,
            _ => {
                warn!(self.log, "malformed batch item");
                return;
            }
        };
        let args = pair.pop();
        let cmd = pair
            .pop()
            .as_ref()
            .and_then(Value::as_str)
            .map(Command::from_name);
        match (cmd, args) {
            (Some(Ok(cmd)), Some(Value::Array(args)))
                if cmd.is_binary() && cmd != Command::Batch =>
            {
                self.on_data(cmd, args)
            }
            _ => warn!(self.log, "bad batch item"),
        }
    }

    fn handshake(&self, data: Vec<Value>) {
        let version_hash = field(&data, 1).map(str::to_string);
        let dict_hash = field(&data, 3).map(str::to_string);

        let (callbacks, new_version) = {
            let mut core = self.core();
            match data.get(2) {
                Some(Value::Binary(bytes)) => match GlobalDict::decode(bytes) {
                    Ok(dict) => {
                        core.dict = Arc::new(dict);
                        core.dict_hash = dict_hash;
                    }
                    Err(err) => {
                        error!(self.log, "bad global dictionary"; "error" => %err);
                        return;
                    }
                },
                _ => {
                    if core.dict_hash != dict_hash {
                        warn!(self.log, "server did not send its dictionary");
                    }
                }
            }
            let new_version = match (&core.version_hash, &version_hash) {
                (Some(old), Some(new)) if old != new => Some(new.clone()),
                _ => None,
            };
            core.version_hash = version_hash.clone();
            core.backoff.reset();
            (core.state.connected(), new_version)
        };
        info!(self.log, "connected";
            "version_hash" => version_hash.as_deref().unwrap_or(""));

        if let Some(hash) = new_version {
            info!(self.log, "server version changed"; "version_hash" => &hash);
            let hook = self.on_new_version.lock().ok().and_then(|h| h.clone());
            if let Some(hook) = hook {
                hook(&hash);
            }
        }
        for func in callbacks {
            func();
        }

        let mut core = self.core();
        let waiting = std::mem::take(&mut core.wait_sends);
        for msg in waiting {
            self.write_outbound(&core, msg);
        }
    }

    fn rpc_response(&self, data: Vec<Value>) {
        let found = {
            let mut guard = self.core();
            let core = &mut *guard;
            let found = core.rpc.receive(&data);
            if found.is_some() {
                self.dec_pending(&mut core.state);
            }
            found
        };
        match found {
            Some((entry, result)) => {
                if let Some(callback) = entry.callback {
                    callback(result);
                }
            }
            None => debug!(self.log, "response for unknown call";
                "id" => field(&data, 0).unwrap_or("")),
        }
    }
}

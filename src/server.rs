// Copyright 2020 Joyent, Inc.

//! Accept loop, handshake and per-command dispatch for server connections.
//!
//! A socket starts with the `X` exchange: the client sends its protocol
//! version and the hash of the dictionary it already holds, the server
//! answers with its version hash, the dictionary (unless the client's copy
//! is current) and the dictionary hash. After that every frame is handed to
//! the connection, which dispatches them one at a time.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::Error;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::batch::{current_ledger, BatchLedger, Context};
use crate::config::ServerConfig;
use crate::connection::{Dispatch, ServerConnection};
use crate::dict::{GlobalDict, GlobalDictBuilder};
use crate::error::{RpcError, WireError};
use crate::protocol::{to_base36, Command, Frame, FrameCodec, SeqId, PROTOCOL_VERSION};
use crate::publish::{handle_subscribe, PublishFn, Subscription};
use crate::rpc::response_payload;
use crate::store::{Doc, DocChange, DocStore, MemoryStore};
use crate::value::{Map, Value};

pub type RpcHandler = Arc<
    dyn Fn(Context, Vec<Value>) -> BoxFuture<'static, Result<Value, RpcError>>
        + Send
        + Sync,
>;

pub type ConnectionHook = Arc<dyn Fn(&Arc<ServerConnection>) + Send + Sync>;

fn new_version_hash() -> String {
    to_base36(chrono::Utc::now().timestamp_millis() as u64)
}

pub struct ServerBuilder {
    config: ServerConfig,
    log: Logger,
    methods: HashMap<String, RpcHandler>,
    pubs: HashMap<String, PublishFn>,
    words: Vec<String>,
    store: Option<Arc<dyn DocStore>>,
    on_connection: Option<ConnectionHook>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig, log: Option<&Logger>) -> ServerBuilder {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        ServerBuilder {
            config,
            log,
            methods: HashMap::new(),
            pubs: HashMap::new(),
            words: Vec::new(),
            store: None,
            on_connection: None,
        }
    }

    /// Registers an RPC method.
    pub fn rpc<F, Fut>(mut self, name: &str, func: F) -> ServerBuilder
    where
        F: Fn(Context, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: RpcHandler = Arc::new(move |ctx, args| func(ctx, args).boxed());
        self.methods.insert(name.to_string(), handler);
        self
    }

    /// Registers a publication clients can subscribe to.
    pub fn publish<F>(mut self, name: &str, func: F) -> ServerBuilder
    where
        F: Fn(&Context, &Subscription) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.pubs.insert(name.to_string(), Arc::new(func));
        self
    }

    pub fn add_to_dict(mut self, word: &str) -> ServerBuilder {
        self.words.push(word.to_string());
        self
    }

    pub fn store(mut self, store: Arc<dyn DocStore>) -> ServerBuilder {
        self.store = Some(store);
        self
    }

    /// Called for each connection once its handshake completes. Use
    /// `ServerConnection::on_close` from here to hear about the close.
    pub fn on_connection<F>(mut self, func: F) -> ServerBuilder
    where
        F: Fn(&Arc<ServerConnection>) + Send + Sync + 'static,
    {
        self.on_connection = Some(Arc::new(func));
        self
    }

    /// Finalizes the global dictionary from every method and publication
    /// name plus the extra words.
    pub fn build(self) -> Result<Server, WireError> {
        let mut words: Vec<String> = self
            .methods
            .keys()
            .chain(self.pubs.keys())
            .chain(self.config.dict_words.iter())
            .chain(self.words.iter())
            .cloned()
            .collect();
        words.sort();
        words.dedup();

        let mut builder = GlobalDictBuilder::new();
        for word in &words {
            builder.add(word)?;
        }
        let dict = builder.finalize();
        debug!(self.log, "global dictionary";
            "words" => dict.len(), "hash" => dict.hash());

        let ServerBuilder {
            config,
            log,
            methods,
            pubs,
            store,
            on_connection,
            ..
        } = self;
        let version_hash = config
            .version_hash
            .clone()
            .unwrap_or_else(new_version_hash);
        let store = match store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()) as Arc<dyn DocStore>,
        };

        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner>| {
            let weak = weak.clone();
            let listener = store.on_change(Arc::new(move |change: &DocChange| {
                if let Some(inner) = weak.upgrade() {
                    let ledger = current_ledger();
                    Server { inner }.notify_change(change, ledger.as_deref());
                }
            }));
            ServerInner {
                config,
                log,
                dict: Arc::new(dict),
                methods,
                pubs,
                store,
                listener,
                version_hash: Mutex::new(version_hash),
                conns: Mutex::new(BTreeMap::new()),
                next_sess: AtomicU64::new(0),
                on_connection,
            }
        });
        Ok(Server { inner })
    }
}

struct ServerInner {
    config: ServerConfig,
    log: Logger,
    dict: Arc<GlobalDict>,
    methods: HashMap<String, RpcHandler>,
    pubs: HashMap<String, PublishFn>,
    store: Arc<dyn DocStore>,
    /// Our change listener on `store`.
    listener: u64,
    version_hash: Mutex<String>,
    conns: Mutex<BTreeMap<SeqId, Arc<ServerConnection>>>,
    next_sess: AtomicU64,
    on_connection: Option<ConnectionHook>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.store.stop_on_change(self.listener);
    }
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn log(&self) -> &Logger {
        &self.inner.log
    }

    pub fn dict(&self) -> &Arc<GlobalDict> {
        &self.inner.dict
    }

    pub fn store(&self) -> &Arc<dyn DocStore> {
        &self.inner.store
    }

    pub fn version_hash(&self) -> String {
        self.inner
            .version_hash
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub(crate) fn publication(&self, name: &str) -> Option<PublishFn> {
        self.inner.pubs.get(name).cloned()
    }

    /// Binds the configured address and serves until the listener fails.
    pub async fn listen(&self) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.inner.config.address).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        info!(self.inner.log, "listening for sync requests";
            "address" => %listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_socket(socket, Some(addr)).await {
                            info!(server.inner.log, "connection ended";
                                "remote" => %addr, "error" => %err);
                        }
                    });
                }
                Err(err) => {
                    error!(self.inner.log, "failed to accept socket"; "err" => %err);
                }
            }
        }
    }

    /// Runs one connection to completion: handshake, then frames until the
    /// socket closes or the connection is closed locally.
    pub async fn handle_socket<S>(
        &self,
        socket: S,
        remote: Option<SocketAddr>,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let codec = FrameCodec::new(self.inner.config.max_frame);
        let mut framed = Framed::new(socket, codec);
        let hello = match framed.next().await {
            Some(frame) => frame?,
            None => return Ok(()),
        };
        if hello.command() != Command::Handshake {
            warn!(self.inner.log, "expected handshake"; "cmd" => %hello.command());
            return Ok(());
        }
        let empty = GlobalDict::empty();
        let args = hello.decode(&empty)?;
        let version = args.get(0).and_then(Value::as_f64);
        if version != Some(f64::from(PROTOCOL_VERSION)) {
            let text = format!("Unsupported protocol version: {:?}", version);
            warn!(self.inner.log, "{}", text);
            framed.send(Frame::text(Command::Error, &text)).await?;
            return Ok(());
        }

        let dict = Arc::clone(&self.inner.dict);
        let known = args.get(1).and_then(Value::as_str);
        let dict_bytes = if known == Some(dict.hash()) {
            Value::Null
        } else {
            Value::Binary(dict.encoded().to_vec())
        };
        let reply: Vec<Value> = vec![
            PROTOCOL_VERSION.into(),
            self.version_hash().into(),
            dict_bytes,
            dict.hash().into(),
        ];
        framed.send(Frame::binary(Command::Handshake, &reply, &empty)?).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let seq = self.inner.next_sess.fetch_add(1, Ordering::SeqCst) + 1;
        let sess_id = to_base36(seq);
        let conn = Arc::new(ServerConnection::new(
            sess_id.clone(),
            remote,
            dict,
            tx,
            &self.inner.log,
        ));
        self.register(&conn);
        info!(conn.log(), "connection opened";
            "remote" => remote.map(|a| a.to_string()).unwrap_or_default(),
            "connections" => self.connection_count());
        if let Some(hook) = &self.inner.on_connection {
            hook(&conn);
        }

        let (mut sink, mut stream) = framed.split();
        let writer_conn = Arc::clone(&conn);
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    info!(writer_conn.log(), "write failed"; "error" => %err);
                    writer_conn.close();
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let dispatch: Arc<dyn Dispatch> = Arc::new(self.clone());
        let result = loop {
            tokio::select! {
                _ = conn.closed() => break Ok(()),
                next = stream.next() => match next {
                    Some(Ok(frame)) => conn.on_message(frame, Arc::clone(&dispatch)),
                    Some(Err(err)) => break Err(err),
                    None => break Ok(()),
                },
            }
        };
        conn.close();
        let _ = writer.await;
        info!(conn.log(), "connection closed"; "connections" => self.connection_count());
        result
    }

    fn register(&self, conn: &Arc<ServerConnection>) {
        let key = SeqId::new(conn.sess_id());
        if let Ok(mut conns) = self.inner.conns.lock() {
            conns.insert(key.clone(), Arc::clone(conn));
        }
        let server = Arc::downgrade(&self.inner);
        conn.on_close(move |_| {
            if let Some(inner) = server.upgrade() {
                if let Ok(mut conns) = inner.conns.lock() {
                    conns.remove(&key);
                }
            }
        });
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conns.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Open connections in the order they were accepted.
    pub fn connections(&self) -> Vec<Arc<ServerConnection>> {
        self.inner
            .conns
            .lock()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection(&self, sess_id: &str) -> Option<Arc<ServerConnection>> {
        self.inner.conns.lock().ok()?.get(&SeqId::new(sess_id)).cloned()
    }

    /// Sends a text frame to every connection.
    pub fn send_all(&self, cmd: Command, text: &str) {
        let frame = Frame::text(cmd, text);
        for conn in self.connections() {
            conn.send_encoded(frame.clone());
        }
    }

    /// Calls broadcast function `name` on every client.
    pub fn broadcast(&self, name: &str, args: Vec<Value>) -> Result<(), WireError> {
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(name.into());
        data.extend(args);
        let frame = Frame::binary(Command::Broadcast, &data, &self.inner.dict)?;
        for conn in self.connections() {
            conn.send_encoded(frame.clone());
        }
        Ok(())
    }

    pub fn load(&self, id: &str) {
        self.send_all(Command::Log, id);
    }

    /// Announces that module `id` changed; clients see a new version hash.
    pub fn unload(&self, id: &str) {
        let hash = match self.inner.version_hash.lock() {
            Ok(mut current) => {
                let mut next = new_version_hash();
                if next == *current {
                    next.push('1');
                }
                *current = next.clone();
                next
            }
            Err(_) => return,
        };
        info!(self.inner.log, "unload"; "id" => id, "version_hash" => &hash);
        self.send_all(Command::Unload, &format!("{}:{}", hash, id));
    }

    /// Stores `doc`. The store's change hook pushes the change to every
    /// connection it matches.
    pub fn insert(&self, doc: Doc) -> Option<DocChange> {
        self.inner.store.insert(doc)
    }

    pub fn update(&self, kind: &str, id: &str, changes: &Map) -> Option<DocChange> {
        self.inner.store.update(kind, id, changes)
    }

    pub fn remove(&self, kind: &str, id: &str) -> Option<DocChange> {
        self.inner.store.remove(kind, id)
    }

    /// Forwards a document change to each connection whose matches it
    /// concerns. Returns how many connections were sent something.
    fn notify_change(&self, change: &DocChange, ledger: Option<&BatchLedger>) -> usize {
        self.connections()
            .iter()
            .filter(|conn| conn.match_update(change, ledger).is_some())
            .count()
    }

    async fn handle_rpc(&self, conn: Arc<ServerConnection>, data: Vec<Value>) {
        let mut data = data.into_iter();
        let id = data.next().unwrap_or_default();
        let name = match data.next() {
            Some(Value::String(name)) => name,
            _ => {
                warn!(conn.log(), "malformed rpc"; "id" => format!("{:?}", id));
                return;
            }
        };
        let args: Vec<Value> = data.collect();

        let handler = match self.inner.methods.get(&name) {
            Some(handler) => Arc::clone(handler),
            None => {
                let reason = format!("unknown method: {}", name);
                conn.send_binary(
                    Command::Rpc,
                    &[id, "e".into(), 404.into(), reason.into()],
                );
                return;
            }
        };

        debug!(conn.log(), "rpc"; "method" => &name);
        let ctx = Context::new(self, &conn);
        let result = ctx
            .scope(AssertUnwindSafe(handler(ctx.clone(), args)).catch_unwind())
            .await
            .unwrap_or_else(|panic| Err(RpcError::from_panic(panic)));
        if result.is_ok() {
            ctx.release();
        } else {
            ctx.abort();
        }
        conn.send_binary(Command::Rpc, &response_payload(id, result, conn.log()));
    }

    async fn dispatch_frame(
        &self,
        conn: Arc<ServerConnection>,
        frame: Frame,
    ) -> Result<(), RpcError> {
        match frame.command() {
            Command::Rpc => {
                let data = frame.decode(conn.dict())?;
                self.handle_rpc(conn, data).await;
            }
            Command::Subscription => {
                let data = frame.decode(conn.dict())?;
                let ctx = Context::new(self, &conn);
                ctx.scope_sync(|| handle_subscribe(&ctx, data));
                ctx.release();
            }
            Command::ReverseRpc => {
                let data = frame.decode(conn.dict())?;
                let handled = conn
                    .reverse_rpc()
                    .map(|sender| sender.receive(&data))
                    .unwrap_or(false);
                if !handled {
                    warn!(conn.log(), "unexpected reverse rpc response");
                }
            }
            Command::Error => {
                warn!(conn.log(), "client error"; "text" => frame.text_payload()?);
            }
            Command::Log => {
                info!(conn.log(), "client log"; "text" => frame.text_payload()?);
            }
            other => {
                warn!(conn.log(), "unexpected command"; "cmd" => %other);
            }
        }
        Ok(())
    }
}

impl Dispatch for Server {
    fn dispatch(
        &self,
        conn: Arc<ServerConnection>,
        frame: Frame,
    ) -> BoxFuture<'static, Result<(), RpcError>> {
        let server = self.clone();
        async move { server.dispatch_frame(conn, frame).await }.boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use slog::Discard;

    use crate::error::INTERNAL_ERROR;
    use tokio::io::DuplexStream;

    type Peer = Framed<DuplexStream, FrameCodec>;

    async fn echo(_ctx: Context, args: Vec<Value>) -> Result<Value, RpcError> {
        Ok(Value::Array(args))
    }

    async fn add_book(ctx: Context, args: Vec<Value>) -> Result<Value, RpcError> {
        let id = args.get(0).and_then(Value::as_str).unwrap_or("b1");
        let mut attrs = Map::new();
        attrs.insert("shelf".into(), "sf".into());
        ctx.insert(Doc::new("Book", id, attrs));
        Ok(Value::Null)
    }

    async fn fail(ctx: Context, _args: Vec<Value>) -> Result<Value, RpcError> {
        ctx.send_binary(Command::Broadcast, vec!["never sent".into()]);
        Err(RpcError::new(409, "conflict"))
    }

    async fn login(ctx: Context, args: Vec<Value>) -> Result<Value, RpcError> {
        let user = args.get(0).and_then(Value::as_str).map(String::from);
        ctx.set_user_id(user);
        Ok(Value::Null)
    }

    async fn boom(_ctx: Context, args: Vec<Value>) -> Result<Value, RpcError> {
        let empty: Vec<Value> = Vec::new();
        Ok(empty[args.len()].clone())
    }

    fn build() -> Server {
        let config = ServerConfig {
            version_hash: Some("v1".to_string()),
            ..ServerConfig::default()
        };
        ServerBuilder::new(config, Some(&Logger::root(Discard, o!())))
            .rpc("echo", echo)
            .rpc("addBook", add_book)
            .rpc("fail", fail)
            .rpc("boom", boom)
            .rpc("login", login)
            .publish("Owned", |ctx, sub| {
                let owner = ctx.user_id().unwrap_or_default();
                if owner == "banned" {
                    return Err(RpcError::message("no books for banned users"));
                }
                sub.match_kind("Book", move |doc| {
                    doc.get("owner").and_then(Value::as_str) == Some(owner.as_str())
                });
                Ok(())
            })
            .publish("Shelf", |ctx, sub| {
                let shelf = sub
                    .args()
                    .get(0)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if shelf == "forbidden" {
                    return Err(RpcError::new(403, "access denied"));
                }
                if shelf == "haunted" {
                    panic!("shelf is haunted");
                }
                sub.match_kind("Book", move |doc| {
                    doc.get("shelf").and_then(Value::as_str) == Some(shelf.as_str())
                });
                for doc in ctx.server().store().docs("Book") {
                    if ctx.conn().matches().has(&doc) {
                        ctx.added(&doc);
                    }
                }
                Ok(())
            })
            .build()
            .unwrap()
    }

    async fn connect(server: &Server) -> (Peer, GlobalDict) {
        let (client, socket) = tokio::io::duplex(64 * 1024);
        let s = server.clone();
        tokio::spawn(async move { s.handle_socket(socket, None).await });

        let mut peer = Framed::new(client, FrameCodec::default());
        let empty = GlobalDict::empty();
        let hello: Vec<Value> = vec![PROTOCOL_VERSION.into(), Value::Null];
        peer.send(Frame::binary(Command::Handshake, &hello, &empty).unwrap())
            .await
            .unwrap();
        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.command(), Command::Handshake);
        let args = reply.decode(&empty).unwrap();
        assert_eq!(args[1], Value::from("v1"));
        let dict = GlobalDict::decode(args[2].as_binary().unwrap()).unwrap();
        assert_eq!(args[3], Value::from(dict.hash()));
        (peer, dict)
    }

    async fn call(
        peer: &mut Peer,
        dict: &GlobalDict,
        cmd: Command,
        args: Vec<Value>,
    ) -> Vec<Value> {
        peer.send(Frame::binary(cmd, &args, dict).unwrap()).await.unwrap();
        let frame = peer.next().await.unwrap().unwrap();
        frame.decode(dict).unwrap()
    }

    async fn rpc(peer: &mut Peer, dict: &GlobalDict, args: Vec<Value>) -> Vec<Value> {
        call(peer, dict, Command::Rpc, args).await
    }

    #[tokio::test]
    async fn handshake_and_rpc() {
        let server = build();
        let (mut peer, dict) = connect(&server).await;
        assert!(dict.code("echo").is_some());
        assert!(dict.code("Shelf").is_some());

        let reply = rpc(&mut peer, &dict, vec!["1a".into(), "echo".into(), 7.into()]).await;
        assert_eq!(
            reply,
            vec![Value::from("1a"), "r".into(), Value::Array(vec![7.into()])]
        );

        let reply = rpc(&mut peer, &dict, vec!["2a".into(), "nope".into()]).await;
        assert_eq!(
            reply,
            vec![
                Value::from("2a"),
                "e".into(),
                404.into(),
                "unknown method: nope".into()
            ]
        );

        // output of a failed call is discarded
        let reply = rpc(&mut peer, &dict, vec!["3a".into(), "fail".into()]).await;
        assert_eq!(
            reply,
            vec![Value::from("3a"), "e".into(), 409.into(), "conflict".into()]
        );
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let server = build();
        let (mut peer, dict) = connect(&server).await;

        let reply = rpc(&mut peer, &dict, vec!["1a".into(), "boom".into()]).await;
        assert_eq!(
            reply,
            vec![Value::from("1a"), "e".into(), INTERNAL_ERROR.into()]
        );

        let sub: Vec<Value> = vec![
            "2".into(),
            "Shelf".into(),
            Value::Array(vec!["haunted".into()]),
        ];
        let reply = call(&mut peer, &dict, Command::Subscription, sub).await;
        assert_eq!(
            reply,
            vec![Value::from("2"), 500.into(), INTERNAL_ERROR.into()]
        );
        assert!(server.connections()[0].subs().is_empty());

        // the connection keeps serving
        let reply = rpc(&mut peer, &dict, vec!["3a".into(), "echo".into(), 1.into()]).await;
        assert_eq!(
            reply,
            vec![Value::from("3a"), "r".into(), Value::Array(vec![1.into()])]
        );
    }

    #[tokio::test]
    async fn connection_hooks_see_open_and_close() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let e2 = Arc::clone(&events);
        let config = ServerConfig {
            version_hash: Some("v1".to_string()),
            ..ServerConfig::default()
        };
        let server = ServerBuilder::new(config, Some(&Logger::root(Discard, o!())))
            .on_connection(move |conn| {
                e2.lock().unwrap().push(format!("open {}", conn.sess_id()));
                let e3 = Arc::clone(&e2);
                conn.on_close(move |conn| {
                    e3.lock().unwrap().push(format!("close {}", conn.sess_id()))
                });
            })
            .build()
            .unwrap();

        let (peer, _) = connect(&server).await;
        assert_eq!(server.connection_count(), 1);
        drop(peer);
        for _ in 0..50 {
            if server.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.connection_count(), 0);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["open 1".to_string(), "close 1".to_string()]
        );
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged() {
        let server = build();
        let (mut peer, _) = connect(&server).await;
        peer.send(Frame::text(Command::Heartbeat, "")).await.unwrap();
        let ack = peer.next().await.unwrap().unwrap();
        assert_eq!(ack.command(), Command::HeartbeatAck);
        assert!(ack.text_payload().unwrap().parse::<i64>().is_ok());
    }

    #[tokio::test]
    async fn bad_version_is_refused() {
        let server = build();
        let (client, socket) = tokio::io::duplex(1024);
        let handle = tokio::spawn({
            let s = server.clone();
            async move { s.handle_socket(socket, None).await }
        });
        let mut peer = Framed::new(client, FrameCodec::default());
        let hello: Vec<Value> = vec![1.into(), Value::Null];
        let frame = Frame::binary(Command::Handshake, &hello, &GlobalDict::empty()).unwrap();
        peer.send(frame).await.unwrap();
        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.command(), Command::Error);
        assert!(handle.await.unwrap().is_ok());
        assert!(peer.next().await.is_none());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn subscriptions() {
        let server = build();
        let mut attrs = Map::new();
        attrs.insert("shelf".into(), "sf".into());
        server.insert(Doc::new("Book", "b0", attrs));
        let (mut peer, dict) = connect(&server).await;

        let nope: Vec<Value> = vec!["1".into(), "Nope".into()];
        let reply = call(&mut peer, &dict, Command::Subscription, nope).await;
        assert_eq!(reply[1], Value::from(404));
        assert_eq!(reply[2], Value::from("unknown publication: Nope"));

        let reply = call(
            &mut peer,
            &dict,
            Command::Subscription,
            vec!["2".into(), "Shelf".into(), Value::Array(vec!["forbidden".into()])],
        )
        .await;
        assert_eq!(
            reply,
            vec![Value::from("2"), 403.into(), "access denied".into()]
        );

        // existing match and ack arrive together
        let sub: Vec<Value> = vec![
            "3".into(),
            "Shelf".into(),
            Value::Array(vec!["sf".into()]),
            0.into(),
        ];
        peer.send(Frame::binary(Command::Subscription, &sub, &dict).unwrap())
            .await
            .unwrap();
        let batch = peer.next().await.unwrap().unwrap();
        assert_eq!(batch.command(), Command::Batch);
        let items = batch.decode(&dict).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_array().unwrap()[0], Value::from("A"));
        let ack = items[1].as_array().unwrap()[1].as_array().unwrap().clone();
        assert_eq!(ack[0], Value::from("3"));
        assert_eq!(ack[1], Value::from(200));

        // a mutation made by an rpc reaches the subscriber before the reply
        let add: Vec<Value> = vec!["4a".into(), "addBook".into(), "b9".into()];
        peer.send(Frame::binary(Command::Rpc, &add, &dict).unwrap())
            .await
            .unwrap();
        let added = peer.next().await.unwrap().unwrap();
        assert_eq!(added.command(), Command::Added);
        assert_eq!(added.decode(&dict).unwrap()[1], Value::from("b9"));
        let reply = peer.next().await.unwrap().unwrap().decode(&dict).unwrap();
        assert_eq!(reply[1], Value::from("r"));

        // client stop needs no ack; later changes are not sent
        let stop: Vec<Value> = vec!["3".into()];
        peer.send(Frame::binary(Command::Subscription, &stop, &dict).unwrap())
            .await
            .unwrap();
        let conn = server.connections().pop().unwrap();
        for _ in 0..100 {
            if conn.subs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(conn.subs().is_empty());
        assert!(!conn.matches().has_kind("Book"));
        let removed = server.remove("Book", "b9").map(|c| c.kind().to_string());
        assert_eq!(removed, Some("Book".into()));
        peer.send(Frame::text(Command::Heartbeat, "")).await.unwrap();
        assert_eq!(peer.next().await.unwrap().unwrap().command(), Command::HeartbeatAck);
    }

    #[tokio::test]
    async fn unload_announces_new_version() {
        let server = build();
        let (mut peer, _) = connect(&server).await;
        server.unload("app/books");
        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(frame.command(), Command::Unload);
        let text = frame.text_payload().unwrap().to_string();
        assert_eq!(text, format!("{}:app/books", server.version_hash()));
        assert_ne!(server.version_hash(), "v1");
    }

    fn sf_book(id: &str) -> Doc {
        let mut attrs = Map::new();
        attrs.insert("shelf".into(), "sf".into());
        Doc::new("Book", id, attrs)
    }

    fn subscribe_sf(id: &str) -> Vec<Value> {
        vec![
            id.into(),
            "Shelf".into(),
            Value::Array(vec!["sf".into()]),
            0.into(),
        ]
    }

    async fn next_data(peer: &mut Peer, dict: &GlobalDict) -> (Command, Vec<Value>) {
        let frame = peer.next().await.unwrap().unwrap();
        (frame.command(), frame.decode(dict).unwrap())
    }

    #[tokio::test]
    async fn store_writes_reach_subscribers() {
        let server = build();
        let (mut peer, dict) = connect(&server).await;
        let ack = call(&mut peer, &dict, Command::Subscription, subscribe_sf("1")).await;
        assert_eq!(ack[1], Value::from(200));

        server.store().insert(sf_book("b1"));
        let (cmd, args) = next_data(&mut peer, &dict).await;
        assert_eq!(cmd, Command::Added);
        assert_eq!(args[1], Value::from("b1"));

        server.store().remove("Book", "b1");
        let (cmd, args) = next_data(&mut peer, &dict).await;
        assert_eq!(cmd, Command::Removed);
        assert_eq!(args, vec![Value::from("Book"), "b1".into()]);
    }

    #[tokio::test]
    async fn identity_change_isolates_failing_publications() {
        let server = build();
        let (mut peer, dict) = connect(&server).await;
        let ack = call(&mut peer, &dict, Command::Subscription, subscribe_sf("1")).await;
        assert_eq!(ack[1], Value::from(200));
        let owned: Vec<Value> = vec!["2".into(), "Owned".into(), Value::Array(vec![])];
        let ack = call(&mut peer, &dict, Command::Subscription, owned).await;
        assert_eq!(ack[1], Value::from(200));

        let login: Vec<Value> = vec!["1a".into(), "login".into(), "banned".into()];
        peer.send(Frame::binary(Command::Rpc, &login, &dict).unwrap())
            .await
            .unwrap();
        let (cmd, args) = next_data(&mut peer, &dict).await;
        assert_eq!(cmd, Command::Subscription);
        assert_eq!(args, vec![Value::from("2"), 500.into(), INTERNAL_ERROR.into()]);
        let (cmd, args) = next_data(&mut peer, &dict).await;
        assert_eq!(cmd, Command::Rpc);
        assert_eq!(args[1], Value::from("r"));

        let conn = server.connections().pop().unwrap();
        assert_eq!(conn.user_id(), Some("banned".to_string()));
        let live: Vec<String> = conn.subs().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(live, vec!["1".to_string()]);

        server.insert(sf_book("b1"));
        let (cmd, args) = next_data(&mut peer, &dict).await;
        assert_eq!(cmd, Command::Added);
        assert_eq!(args[1], Value::from("b1"));
    }

    #[tokio::test]
    async fn stopping_one_connection_leaves_the_other_matching() {
        let server = build();
        let (mut first, dict) = connect(&server).await;
        let (mut second, _) = connect(&server).await;
        let sub = subscribe_sf("1");
        let ack = call(&mut first, &dict, Command::Subscription, sub.clone()).await;
        assert_eq!(ack[1], Value::from(200));
        let ack = call(&mut second, &dict, Command::Subscription, sub).await;
        assert_eq!(ack[1], Value::from(200));

        let stop: Vec<Value> = vec!["1".into()];
        first
            .send(Frame::binary(Command::Subscription, &stop, &dict).unwrap())
            .await
            .unwrap();
        for _ in 0..100 {
            if server.connections().iter().filter(|c| c.subs().is_empty()).count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        server.insert(sf_book("b1"));
        let (cmd, args) = next_data(&mut second, &dict).await;
        assert_eq!(cmd, Command::Added);
        assert_eq!(args[1], Value::from("b1"));

        first.send(Frame::text(Command::Heartbeat, "")).await.unwrap();
        let next = first.next().await.unwrap().unwrap();
        assert_eq!(next.command(), Command::HeartbeatAck);
    }
}

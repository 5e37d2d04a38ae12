// Copyright 2020 Joyent, Inc.

//! RPC in the server → client direction over `F` frames.
//!
//! `ReverseRpcSender` keeps its calls queued until they are answered, so it
//! can be detached from one connection and attached to the next; attaching
//! resends everything still outstanding. `ReverseRpcReceiver` is the
//! dispatch table on the answering side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use slog::{debug, o, warn, Drain, Logger};
use tokio::sync::oneshot;

use crate::connection::ServerConnection;
use crate::error::RpcError;
use crate::protocol::{to_base36, Command, SeqId};
use crate::rpc::{response_payload, RpcCallback, RpcChannel};
use crate::value::Value;

struct SenderInner {
    channel: RpcChannel,
    conn: Option<Weak<ServerConnection>>,
}

pub struct ReverseRpcSender {
    cmd: Command,
    inner: Mutex<SenderInner>,
}

impl ReverseRpcSender {
    pub fn new(cmd: Command) -> Arc<ReverseRpcSender> {
        let base_id = to_base36(chrono::Utc::now().timestamp_millis() as u64);
        Arc::new(ReverseRpcSender {
            cmd,
            inner: Mutex::new(SenderInner {
                channel: RpcChannel::new(cmd, base_id),
                conn: None,
            }),
        })
    }

    fn conn(&self) -> Option<Arc<ServerConnection>> {
        let inner = self.inner.lock().ok()?;
        inner.conn.as_ref()?.upgrade()
    }

    /// Attaches to `conn`, or detaches with `None`. Outstanding calls are
    /// resent in id order on attach.
    pub fn set_conn(self: &Arc<Self>, conn: Option<&Arc<ServerConnection>>) {
        let requests = match self.inner.lock() {
            Ok(mut inner) => {
                inner.conn = conn.map(Arc::downgrade);
                inner.channel.queue().pending_requests()
            }
            Err(_) => return,
        };
        if let Some(conn) = conn {
            conn.set_reverse_rpc(Some(Arc::clone(self)));
            for data in requests {
                conn.send_binary(self.cmd, &data);
            }
        }
    }

    /// Queues a call and sends it if a connection is attached.
    pub fn rpc(
        &self,
        name: &str,
        args: Vec<Value>,
        callback: Option<RpcCallback>,
    ) -> SeqId {
        let (id, data) = match self.inner.lock() {
            Ok(mut inner) => inner.channel.enqueue(name, args, callback),
            Err(_) => return SeqId::new(""),
        };
        if let Some(conn) = self.conn() {
            conn.send_binary(self.cmd, &data);
        }
        id
    }

    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.rpc(
            name,
            args,
            Some(Box::new(move |result: Result<Value, RpcError>| {
                let _ = tx.send(result);
            })),
        );
        rx.await.unwrap_or(Err(RpcError::Closed))
    }

    /// Resolves the call a response belongs to. Returns false when no call
    /// was waiting for it.
    pub fn receive(&self, data: &[Value]) -> bool {
        let found = match self.inner.lock() {
            Ok(mut inner) => inner.channel.receive(data),
            Err(_) => return false,
        };
        match found {
            Some((entry, result)) => {
                if let Some(cb) = entry.callback {
                    cb(result);
                }
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().map(|i| i.channel.queue().len()).unwrap_or(0)
    }
}

pub type ReverseHandler =
    Arc<dyn Fn(&[Value]) -> Result<Value, RpcError> + Send + Sync>;

pub struct ReverseRpcReceiver {
    cmd: Command,
    methods: Mutex<HashMap<String, ReverseHandler>>,
    log: Logger,
}

impl ReverseRpcReceiver {
    pub fn new(cmd: Command, log: Option<&Logger>) -> ReverseRpcReceiver {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        ReverseRpcReceiver {
            cmd,
            methods: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn cmd(&self) -> Command {
        self.cmd
    }

    pub fn define<F>(&self, name: &str, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        if let Ok(mut methods) = self.methods.lock() {
            methods.insert(name.to_string(), Arc::new(func));
        }
    }

    /// Runs the requested method and returns the response payload.
    pub fn respond(&self, data: &[Value]) -> Option<Vec<Value>> {
        let id = data.get(0)?.clone();
        let name = match data.get(1).and_then(Value::as_str) {
            Some(name) => name,
            None => {
                warn!(self.log, "reverse rpc without method name");
                return None;
            }
        };
        let handler = self
            .methods
            .lock()
            .ok()
            .and_then(|m| m.get(name).cloned());
        debug!(self.log, "reverse rpc"; "method" => name);
        let result = match handler {
            Some(func) => func(&data[2..]),
            None => Err(RpcError::new(404, format!("unknown method: {}", name))),
        };
        Some(response_payload(id, result, &self.log))
    }
}

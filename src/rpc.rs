// Copyright 2020 Joyent, Inc.

//! Outbound RPC calls: id allocation, the pending-call queue and response
//! payloads.
//!
//! A request is `[id, name, ...args]`. A response is one of
//!
//! ```text
//! [id, 'r', result]          success
//! [id, 'e', code, reason]    structured fault
//! [id, 'e', text]            unstructured fault
//! ```
//!
//! Ids are `base36(seq) + base_id`. Calls without a response stay queued and
//! are replayed in ascending id order once a connection is ready again.

use std::collections::BTreeMap;

use rand::Rng;
use slog::{error, Logger};

use crate::error::{RpcError, INTERNAL_ERROR};
use crate::protocol::{from_base36, Command, SeqId};
use crate::value::Value;

pub type RpcCallback = Box<dyn FnOnce(Result<Value, RpcError>) + Send>;

const BASE_ID_LEN: usize = 17;

/// Random base36 suffix used to make message ids unique to this session.
pub fn random_base_id() -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..BASE_ID_LEN)
        .map(|_| char::from(DIGITS[rng.gen_range(0..DIGITS.len())]))
        .collect()
}

pub struct RpcEntry {
    pub data: Vec<Value>,
    pub callback: Option<RpcCallback>,
}

/// Calls still waiting for a response, ordered by id.
pub struct RpcQueue {
    cmd: Command,
    entries: BTreeMap<SeqId, RpcEntry>,
}

impl RpcQueue {
    pub fn new(cmd: Command) -> RpcQueue {
        RpcQueue {
            cmd,
            entries: BTreeMap::new(),
        }
    }

    pub fn cmd(&self) -> Command {
        self.cmd
    }

    pub fn push(&mut self, id: SeqId, data: Vec<Value>, callback: Option<RpcCallback>) {
        self.entries.insert(id, RpcEntry { data, callback });
    }

    pub fn get(&self, id: &str) -> Option<&RpcEntry> {
        self.entries.get(&SeqId::new(id))
    }

    pub fn take(&mut self, id: &str) -> Option<RpcEntry> {
        self.entries.remove(&SeqId::new(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Request payloads in the order they were issued.
    pub fn pending_requests(&self) -> Vec<Vec<Value>> {
        self.entries.values().map(|e| e.data.clone()).collect()
    }
}

/// Parses a response payload into the call id and its outcome.
pub fn parse_response(data: &[Value]) -> Option<(&str, Result<Value, RpcError>)> {
    let id = data.get(0)?.as_str()?;
    let result = match data.get(1).and_then(Value::as_str) {
        Some("r") => Ok(data.get(2).cloned().unwrap_or_default()),
        Some("e") => {
            if data.len() <= 3 {
                let text = match data.get(2) {
                    Some(Value::String(s)) => s.clone(),
                    _ => INTERNAL_ERROR.to_string(),
                };
                Err(RpcError::Message(text))
            } else {
                let code = data[2].as_f64().unwrap_or(500.0) as u32;
                Err(RpcError::new(code, data[3].clone()))
            }
        }
        _ => return None,
    };
    Some((id, result))
}

/// Builds the response payload for a handled request. Unstructured faults
/// are logged here in full and only the generic text is sent.
pub fn response_payload(
    id: Value,
    result: Result<Value, RpcError>,
    log: &Logger,
) -> Vec<Value> {
    match result {
        Ok(v) => vec![id, "r".into(), v],
        Err(RpcError::Remote(err)) => {
            vec![id, "e".into(), Value::from(err.code), err.reason]
        }
        Err(err) => {
            error!(log, "unhandled rpc fault"; "id" => format!("{:?}", id),
                "error" => %err);
            vec![id, "e".into(), INTERNAL_ERROR.into()]
        }
    }
}

/// Client side of the RPC protocol.
pub struct RpcChannel {
    base_id: String,
    next_seq: u64,
    last_msg_id: Option<SeqId>,
    queue: RpcQueue,
}

impl RpcChannel {
    pub fn new(cmd: Command, base_id: String) -> RpcChannel {
        RpcChannel {
            base_id,
            next_seq: 1,
            last_msg_id: None,
            queue: RpcQueue::new(cmd),
        }
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    pub fn last_msg_id(&self) -> Option<&SeqId> {
        self.last_msg_id.as_ref()
    }

    /// Allocates an id and queues the request. Returns the id and the
    /// payload to put on the wire.
    pub fn enqueue(
        &mut self,
        name: &str,
        args: Vec<Value>,
        callback: Option<RpcCallback>,
    ) -> (SeqId, Vec<Value>) {
        let id = SeqId::from_seq(self.next_seq, &self.base_id);
        self.next_seq += 1;
        let mut data = Vec::with_capacity(args.len() + 2);
        data.push(Value::from(id.clone()));
        data.push(name.into());
        data.extend(args);
        self.queue.push(id.clone(), data.clone(), callback);
        self.last_msg_id = Some(id.clone());
        (id, data)
    }

    /// Moves the sequence past `msg_id` so ids restored from elsewhere are
    /// never reissued.
    pub fn check_msg_id(&mut self, msg_id: &str) {
        if msg_id.len() <= self.base_id.len() {
            return;
        }
        let seq = &msg_id[..msg_id.len() - self.base_id.len()];
        if let Some(n) = from_base36(seq) {
            if n >= self.next_seq {
                self.next_seq = n + 1;
            }
        }
    }

    pub fn cancel(&mut self, msg_id: &str) -> Option<RpcEntry> {
        self.queue.take(msg_id)
    }

    /// Matches a response with its request. Responses with no queued
    /// request are ignored.
    pub fn receive(
        &mut self,
        data: &[Value],
    ) -> Option<(RpcEntry, Result<Value, RpcError>)> {
        let (id, result) = parse_response(data)?;
        let entry = self.queue.take(id)?;
        Some((entry, result))
    }

    pub fn is_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn queue(&self) -> &RpcQueue {
        &self.queue
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use slog::{o, Discard};

    #[test]
    fn ids_and_replay_order() {
        let mut rpc = RpcChannel::new(Command::Rpc, "xyz".to_string());
        let mut ids = Vec::new();
        for i in 0..40 {
            let (id, data) = rpc.enqueue("foo", vec![i.into()], None);
            assert_eq!(data[0], Value::from(id.clone()));
            assert_eq!(data[1], Value::from("foo"));
            ids.push(id);
        }
        assert_eq!(ids[0].as_str(), "1xyz");
        assert_eq!(ids[35].as_str(), "10xyz");
        assert_eq!(rpc.last_msg_id(), Some(&ids[39]));

        let order: Vec<Value> = rpc
            .queue()
            .pending_requests()
            .into_iter()
            .map(|d| d[2].clone())
            .collect();
        let expected: Vec<Value> = (0..40).map(Value::from).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn responses_resolve_once() {
        let mut rpc = RpcChannel::new(Command::Rpc, "b".to_string());
        let (id, _) = rpc.enqueue("foo", vec![], None);
        let resp = vec![Value::from(id.clone()), "r".into(), 42.into()];

        let (_, result) = rpc.receive(&resp).unwrap();
        assert_eq!(result, Ok(Value::from(42)));
        assert!(rpc.receive(&resp).is_none());
        assert!(!rpc.is_pending());
    }

    #[test]
    fn error_shapes() {
        let structured: Vec<Value> =
            vec!["1b".into(), "e".into(), 404.into(), "not found".into()];
        let (_, result) = parse_response(&structured).unwrap();
        assert_eq!(result, Err(RpcError::new(404, "not found")));

        let plain: Vec<Value> = vec!["1b".into(), "e".into(), "boom".into()];
        let (_, result) = parse_response(&plain).unwrap();
        assert_eq!(result, Err(RpcError::message("boom")));

        let bad: Vec<Value> = vec!["1b".into(), "x".into()];
        assert!(parse_response(&bad).is_none());
    }

    #[test]
    fn unstructured_faults_are_degraded() {
        let log = Logger::root(Discard, o!());
        let payload = response_payload(
            "1".into(),
            Err(RpcError::message("secret detail")),
            &log,
        );
        assert_eq!(
            payload,
            vec![Value::from("1"), "e".into(), INTERNAL_ERROR.into()]
        );

        let payload =
            response_payload("1".into(), Err(RpcError::new(400, "bad")), &log);
        assert_eq!(
            payload,
            vec![Value::from("1"), "e".into(), 400.into(), "bad".into()]
        );
    }

    #[test]
    fn check_msg_id_advances_sequence() {
        let mut rpc = RpcChannel::new(Command::Rpc, "abc".to_string());
        rpc.check_msg_id("zabc");
        let (id, _) = rpc.enqueue("foo", vec![], None);
        assert_eq!(id.as_str(), "10abc");
        rpc.check_msg_id("5abc");
        let (id, _) = rpc.enqueue("foo", vec![], None);
        assert_eq!(id.as_str(), "11abc");
    }

    #[test]
    fn base_id_shape() {
        let id = random_base_id();
        assert_eq!(id.len(), BASE_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}

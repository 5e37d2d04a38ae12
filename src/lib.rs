// Copyright 2020 Joyent, Inc.

//! sync-rpc: live-query synchronization over a single TCP connection
//!
//! A client keeps a local document store in step with the subset of the
//! server's documents that its subscriptions match, and calls methods on the
//! server. Calls and subscriptions survive reconnects: anything outstanding
//! is replayed after each handshake.
//!
//! Frame format
//!
//! Every frame is a 4-byte big-endian length `N` followed by `N` bytes: a
//! one byte command then the payload.
//!
//! * Text commands carry a UTF-8 string.
//!
//! * Data commands carry a sequence of values in the compact binary codec
//!   (see `codec`), sharing a global dictionary negotiated in the handshake
//!   and a per-message local dictionary.
//!
//! Commands
//!
//! * `X`  handshake. Client: `[version, dictHash]`. Server:
//!        `[version, versionHash, dictBytes, dictHash]`.
//!
//! * `H`  heartbeat (text). Answered with `K` and the server time.
//!
//! * `M`  RPC. Request `[id, name, args...]`, response `[id, "r", result]`
//!        or `[id, "e", code, reason]` or `[id, "e", text]`.
//!
//! * `F`  RPC from server to client, same payloads as `M`.
//!
//! * `P`  subscription start `[id, name, args, lastSubscribed]`, stop `[id]`,
//!        and results `[id, 200, time]`, `[id, code, reason]`, `[id, false]`.
//!
//! * `A` `C` `R`  document added, changed, removed: `[kind, id, attrs]`.
//!
//! * `W`  batch of `[[command, args], ...]`.
//!
//! * `B`  broadcast `[name, args...]`.
//!
//! * `U`  unload notice (text) `versionHash:moduleId`.
//!
//! * `L` `E`  log and error text.
//!
//! RPC ids are a base-36 sequence number followed by a per-session base id,
//! so newer ids are longer or lexically greater.

#![allow(missing_docs)]

pub mod batch;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dict;
pub mod error;
pub mod matcher;
pub mod protocol;
pub mod publish;
pub mod reverse_rpc;
pub mod rpc;
pub mod server;
pub mod state;
pub mod store;
pub mod subscribe;
pub mod value;

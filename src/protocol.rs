// Copyright 2020 Joyent, Inc.

//! Frames, command bytes and the length-prefixed stream codec.

use std::cmp::Ordering;
use std::fmt;
use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec;
use crate::dict::GlobalDict;
use crate::error::WireError;
use crate::value::Value;

/// Version carried in the `X` handshake.
pub const PROTOCOL_VERSION: u32 = 2;

const FP_OFF_DATA: usize = 0x4;
const FP_HEADER_SZ: usize = FP_OFF_DATA;

pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Single byte command at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum Command {
    /// `X`: version check and global dictionary
    Handshake = 0x58,
    /// `H`
    Heartbeat = 0x48,
    /// `K`
    HeartbeatAck = 0x4b,
    /// `M`
    Rpc = 0x4d,
    /// `F`
    ReverseRpc = 0x46,
    /// `P`
    Subscription = 0x50,
    /// `A`
    Added = 0x41,
    /// `C`
    Changed = 0x43,
    /// `R`
    Removed = 0x52,
    /// `W`
    Batch = 0x57,
    /// `U`
    Unload = 0x55,
    /// `B`
    Broadcast = 0x42,
    /// `E`
    Error = 0x45,
    /// `L`
    Log = 0x4c,
}

impl Command {
    pub fn from_byte(byte: u8) -> Result<Command, WireError> {
        FromPrimitive::from_u8(byte).ok_or(WireError::UnknownCommand(byte))
    }

    pub fn byte(self) -> u8 {
        ToPrimitive::to_u8(&self).unwrap_or(0)
    }

    pub fn as_char(self) -> char {
        char::from(self.byte())
    }

    /// Parses the one letter form used inside `W` batches.
    pub fn from_name(name: &str) -> Result<Command, WireError> {
        match name.as_bytes() {
            [b] => Command::from_byte(*b),
            _ => Err(WireError::UnknownCommand(
                name.as_bytes().first().copied().unwrap_or(0),
            )),
        }
    }

    /// Data commands carry codec-encoded payloads; the rest carry text.
    pub fn is_binary(self) -> bool {
        !matches!(
            self,
            Command::Heartbeat
                | Command::HeartbeatAck
                | Command::Unload
                | Command::Error
                | Command::Log
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One wire frame: command byte followed by its payload. Frames are
/// immutable once built, so cloning one for many destinations is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    cmd: Command,
    bytes: Bytes,
}

impl Frame {
    pub fn from_bytes(bytes: Bytes) -> Result<Frame, WireError> {
        let first = *bytes.first().ok_or(WireError::Truncated { offset: 0 })?;
        let cmd = Command::from_byte(first)?;
        Ok(Frame { cmd, bytes })
    }

    pub fn text(cmd: Command, text: &str) -> Frame {
        let mut buf = BytesMut::with_capacity(1 + text.len());
        buf.put_u8(cmd.byte());
        buf.put_slice(text.as_bytes());
        Frame {
            cmd,
            bytes: buf.freeze(),
        }
    }

    pub fn binary(
        cmd: Command,
        args: &[Value],
        dict: &GlobalDict,
    ) -> Result<Frame, WireError> {
        codec::encode_message(cmd, args, dict)
    }

    pub fn command(&self) -> Command {
        self.cmd
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[1..]
    }

    pub fn text_payload(&self) -> Result<&str, WireError> {
        std::str::from_utf8(self.payload())
            .map_err(|_| WireError::InvalidUtf8 { offset: 1 })
    }

    pub fn decode(&self, dict: &GlobalDict) -> Result<Vec<Value>, WireError> {
        codec::decode_message(self.payload(), dict)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Stream codec: `[u32 length][command][payload]`, `length` covering the
/// command byte and payload.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> FrameCodec {
        FrameCodec { max_frame }
    }
}

impl Default for FrameCodec {
    fn default() -> FrameCodec {
        FrameCodec::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if buf.len() < FP_HEADER_SZ {
            return Ok(None);
        }
        let data_len = BigEndian::read_u32(&buf[..FP_OFF_DATA]) as usize;
        if data_len == 0 {
            return Err(WireError::Truncated { offset: 0 }.into());
        }
        if data_len > self.max_frame {
            return Err(WireError::FrameTooLarge(data_len).into());
        }
        if buf.len() < FP_HEADER_SZ + data_len {
            buf.reserve(FP_HEADER_SZ + data_len - buf.len());
            return Ok(None);
        }
        buf.advance(FP_HEADER_SZ);
        let bytes = buf.split_to(data_len).freeze();
        Frame::from_bytes(bytes).map(Some).map_err(io::Error::from)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, buf: &mut BytesMut) -> Result<(), io::Error> {
        let data_len = item.len();
        if data_len > self.max_frame {
            return Err(WireError::FrameTooLarge(data_len).into());
        }
        buf.reserve(FP_HEADER_SZ + data_len);
        buf.put_u32(data_len as u32);
        buf.put_slice(item.as_bytes());
        Ok(())
    }
}

pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

pub fn from_base36(s: &str) -> Option<u64> {
    u64::from_str_radix(s, 36).ok()
}

/// Sequence-derived id such as an RPC or subscription id: a base36
/// counter, optionally followed by a fixed-length suffix. Ordered by length
/// first and then lexically, which agrees with the numeric order of the
/// counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeqId(String);

impl SeqId {
    pub fn new<S: Into<String>>(id: S) -> SeqId {
        SeqId(id.into())
    }

    pub fn from_seq(seq: u64, suffix: &str) -> SeqId {
        SeqId(format!("{}{}", to_base36(seq), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for SeqId {
    fn cmp(&self, other: &SeqId) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SeqId {
    fn partial_cmp(&self, other: &SeqId) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SeqId> for Value {
    fn from(id: SeqId) -> Value {
        Value::String(id.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::quickcheck;

    #[test]
    fn command_bytes() {
        assert_eq!(Command::Rpc.as_char(), 'M');
        assert_eq!(Command::from_byte(b'W'), Ok(Command::Batch));
        assert_eq!(Command::from_name("A"), Ok(Command::Added));
        assert_eq!(
            Command::from_byte(b'Q'),
            Err(WireError::UnknownCommand(b'Q'))
        );
        assert!(Command::Subscription.is_binary());
        assert!(!Command::Heartbeat.is_binary());
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut codec = FrameCodec::default();
        let frame = Frame::text(Command::Log, "hello");
        let mut full = BytesMut::new();
        codec.encode(frame.clone(), &mut full).unwrap();
        assert_eq!(&full[..4], &[0, 0, 0, 6]);

        let mut buf = BytesMut::from(&full[..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[7..]);
        buf.extend_from_slice(&full);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame.clone()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_and_unknown_frames_fail() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 9][..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, b'Q'][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn text_payload() {
        let frame = Frame::text(Command::Unload, "v123:app/foo");
        assert_eq!(frame.command(), Command::Unload);
        assert_eq!(frame.text_payload().unwrap(), "v123:app/foo");
    }

    #[test]
    fn base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(from_base36("10"), Some(36));
    }

    #[test]
    fn seq_ids_sort_numerically() {
        let mut ids: Vec<SeqId> = vec![10, 2, 36, 1, 35]
            .into_iter()
            .map(|n| SeqId::from_seq(n, "abc"))
            .collect();
        ids.sort();
        let order: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        assert_eq!(order, vec!["1abc", "2abc", "aabc", "zabc", "10abc"]);
    }

    quickcheck! {
        fn prop_seq_id_order_matches_counter(a: u64, b: u64) -> bool {
            let x = SeqId::from_seq(a, "k3x9");
            let y = SeqId::from_seq(b, "k3x9");
            x.cmp(&y) == a.cmp(&b)
        }
    }
}

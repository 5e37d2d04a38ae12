// Copyright 2020 Joyent, Inc.

//! Compact binary value codec.
//!
//! Every value starts with a one byte tag:
//!
//! | Tag | Meaning |
//! |---|---|
//! | 0 | terminator for arrays, maps and dictionaries |
//! | 1..4 | undefined, null, true, false |
//! | 5 | empty string |
//! | 6 | array: values, then terminator |
//! | 7 | map: (u16 key code, value) pairs, then terminator |
//! | 8 | inline dictionary followed by one value |
//! | 9 | long string: UTF-8 bytes, then `0xff` |
//! | 10, 11, 12 | signed 8/16/32-bit integer |
//! | 13 | float64 |
//! | 14 | int32 holding the number times 10000 |
//! | 15 | date: float64 milliseconds |
//! | 16 | binary: u32 length, then bytes |
//! | 17 | dictionary string: u16 code |
//! | `0x40 \| n` | small integer `0 <= n < 64` |
//! | `0x80 \| n` | short string of `n < 128` UTF-8 bytes |
//!
//! All multi-byte quantities are big-endian.
//!
//! A message is the command byte, the local dictionary words, a `0`
//! terminator and then the encoded values back to back.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::dict::{read_terminated, GlobalDict, LocalDict, DICT_TERM, WORD_END};
use crate::error::WireError;
use crate::protocol::{Command, Frame};
use crate::value::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive)]
pub enum Tag {
    Term = 0,
    Undef = 1,
    Null = 2,
    True = 3,
    False = 4,
    EmptyString = 5,
    Array = 6,
    Map = 7,
    Dict = 8,
    String = 9,
    Int8 = 10,
    Int16 = 11,
    Int32 = 12,
    Float64 = 13,
    Dec4 = 14,
    Date = 15,
    Binary = 16,
    DictString = 17,
}

pub const SMALL_STRING: u8 = 0x80;
pub const SMALL_NUMBER: u8 = 0x40;

/// Strings this long or longer are never interned.
pub const INTERN_MAX_CHARS: usize = 100;
/// No more interning once a message's local dictionary holds this many
/// words.
pub const INTERN_LOCAL_MAX: usize = 0xa000;

const DEC4_SCALE: f64 = 10000.0;

fn take(buf: &[u8], index: usize, len: usize) -> Result<&[u8], WireError> {
    buf.get(index..index + len)
        .ok_or(WireError::Truncated { offset: index })
}

/// Appends the encoding of `value` to `buf`, interning strings into `dict`.
pub fn encode_value(
    buf: &mut BytesMut,
    value: &Value,
    dict: &mut LocalDict,
) -> Result<(), WireError> {
    match value {
        Value::Undefined => buf.put_u8(Tag::Undef as u8),
        Value::Null => buf.put_u8(Tag::Null as u8),
        Value::Bool(true) => buf.put_u8(Tag::True as u8),
        Value::Bool(false) => buf.put_u8(Tag::False as u8),
        Value::Number(n) => encode_number(buf, *n),
        Value::String(s) => encode_string(buf, s, dict),
        Value::Date(ms) => {
            buf.put_u8(Tag::Date as u8);
            buf.put_f64(*ms);
        }
        Value::Binary(b) => {
            buf.put_u8(Tag::Binary as u8);
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        Value::Array(items) => {
            buf.put_u8(Tag::Array as u8);
            for item in items {
                encode_value(buf, item, dict)?;
            }
            buf.put_u8(Tag::Term as u8);
        }
        Value::Map(map) => {
            buf.put_u8(Tag::Map as u8);
            for (key, item) in map {
                // keys have no literal form
                let code = dict.add(key)?;
                buf.put_u16(code);
                encode_value(buf, item, dict)?;
            }
            buf.put_u8(Tag::Term as u8);
        }
    }
    Ok(())
}

fn encode_number(buf: &mut BytesMut, n: f64) {
    let bits = n.to_bits();
    let exact = |m: f64| m.to_bits() == bits;

    if n >= 0.0 && n < f64::from(SMALL_NUMBER) && exact(f64::from(n as u8)) {
        buf.put_u8(SMALL_NUMBER | n as u8);
    } else if exact(f64::from(n as i8)) {
        buf.put_u8(Tag::Int8 as u8);
        buf.put_i8(n as i8);
    } else if exact(f64::from(n as i16)) {
        buf.put_u8(Tag::Int16 as u8);
        buf.put_i16(n as i16);
    } else if exact(f64::from(n as i32)) {
        buf.put_u8(Tag::Int32 as u8);
        buf.put_i32(n as i32);
    } else {
        let scaled = (n * DEC4_SCALE).round() as i32;
        if exact(f64::from(scaled) / DEC4_SCALE) {
            buf.put_u8(Tag::Dec4 as u8);
            buf.put_i32(scaled);
        } else {
            buf.put_u8(Tag::Float64 as u8);
            buf.put_f64(n);
        }
    }
}

fn encode_string(buf: &mut BytesMut, s: &str, dict: &mut LocalDict) {
    if s.is_empty() {
        buf.put_u8(Tag::EmptyString as u8);
        return;
    }

    let mut chars = s.chars();
    let single = chars.next().is_some() && chars.next().is_none();
    if !single {
        let internable = dict.len() < INTERN_LOCAL_MAX
            && s.chars().nth(INTERN_MAX_CHARS - 1).is_none()
            && !s.starts_with('{')
            && !s.starts_with('\0');
        // a full dictionary falls back to the literal form
        let code = if internable {
            dict.add(s).ok()
        } else {
            dict.code(s)
        };
        if let Some(code) = code {
            buf.put_u8(Tag::DictString as u8);
            buf.put_u16(code);
            return;
        }
    }

    let bytes = s.as_bytes();
    if bytes.len() < 128 {
        buf.put_u8(SMALL_STRING | bytes.len() as u8);
        buf.put_slice(bytes);
    } else {
        buf.put_u8(Tag::String as u8);
        buf.put_slice(bytes);
        buf.put_u8(WORD_END);
    }
}

/// Decodes one value starting at `index`. Returns the value and the index
/// of the byte after it.
pub fn decode_value(
    buf: &[u8],
    index: usize,
    dict: &mut LocalDict,
) -> Result<(Value, usize), WireError> {
    let byte = *buf.get(index).ok_or(WireError::Truncated { offset: index })?;
    let start = index;
    let index = index + 1;

    let decoded = match Tag::from_u8(byte) {
        Some(Tag::Undef) => (Value::Undefined, index),
        Some(Tag::Null) => (Value::Null, index),
        Some(Tag::True) => (Value::Bool(true), index),
        Some(Tag::False) => (Value::Bool(false), index),
        Some(Tag::EmptyString) => (Value::String(String::new()), index),
        Some(Tag::Int8) => {
            let b = take(buf, index, 1)?;
            (Value::Number(f64::from(b[0] as i8)), index + 1)
        }
        Some(Tag::Int16) => {
            let n = BigEndian::read_i16(take(buf, index, 2)?);
            (Value::Number(f64::from(n)), index + 2)
        }
        Some(Tag::Int32) => {
            let n = BigEndian::read_i32(take(buf, index, 4)?);
            (Value::Number(f64::from(n)), index + 4)
        }
        Some(Tag::Dec4) => {
            let n = BigEndian::read_i32(take(buf, index, 4)?);
            (Value::Number(f64::from(n) / DEC4_SCALE), index + 4)
        }
        Some(Tag::Float64) => {
            let n = BigEndian::read_f64(take(buf, index, 8)?);
            (Value::Number(n), index + 8)
        }
        Some(Tag::Date) => {
            let n = BigEndian::read_f64(take(buf, index, 8)?);
            (Value::Date(n), index + 8)
        }
        Some(Tag::String) => {
            let (s, next) = read_terminated(buf, index)?;
            (Value::String(s), next)
        }
        Some(Tag::DictString) => {
            let code = BigEndian::read_u16(take(buf, index, 2)?);
            (Value::String(dict.word(code)?.to_string()), index + 2)
        }
        Some(Tag::Binary) => {
            let len = BigEndian::read_u32(take(buf, index, 4)?) as usize;
            let data = take(buf, index + 4, len)?;
            (Value::Binary(data.to_vec()), index + 4 + len)
        }
        Some(Tag::Array) => {
            let mut items = Vec::new();
            let mut i = index;
            loop {
                match buf.get(i) {
                    None => return Err(WireError::Truncated { offset: i }),
                    Some(&b) if b == Tag::Term as u8 => break,
                    Some(_) => {
                        let (item, next) = decode_value(buf, i, dict)?;
                        items.push(item);
                        i = next;
                    }
                }
            }
            (Value::Array(items), i + 1)
        }
        Some(Tag::Map) => {
            let mut map = Map::new();
            let mut i = index;
            loop {
                match buf.get(i) {
                    None => return Err(WireError::Truncated { offset: i }),
                    Some(&b) if b == Tag::Term as u8 => break,
                    Some(_) => {
                        let code = BigEndian::read_u16(take(buf, i, 2)?);
                        let key = dict.word(code)?.to_string();
                        let (item, next) = decode_value(buf, i + 2, dict)?;
                        map.insert(key, item);
                        i = next;
                    }
                }
            }
            (Value::Map(map), i + 1)
        }
        Some(Tag::Dict) => {
            let next = dict.decode_words(buf, index)?;
            return decode_value(buf, next, dict);
        }
        Some(Tag::Term) | None => {
            if byte & SMALL_STRING != 0 {
                let len = (byte - SMALL_STRING) as usize;
                let raw = take(buf, index, len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| WireError::InvalidUtf8 { offset: index })?;
                (Value::String(s.to_string()), index + len)
            } else if byte & SMALL_NUMBER != 0 {
                (Value::Number(f64::from(byte - SMALL_NUMBER)), index)
            } else {
                return Err(WireError::UnsupportedFormat {
                    tag: byte,
                    offset: start,
                });
            }
        }
    };

    Ok(decoded)
}

/// Encodes a full message: command byte, local dictionary, values.
pub fn encode_message(
    cmd: Command,
    args: &[Value],
    global: &GlobalDict,
) -> Result<Frame, WireError> {
    let mut dict = LocalDict::new(global);
    let mut payload = BytesMut::with_capacity(256);
    for arg in args {
        encode_value(&mut payload, arg, &mut dict)?;
    }

    let words = dict.encoded_words();
    let mut out = BytesMut::with_capacity(2 + words.len() + payload.len());
    out.put_u8(cmd.byte());
    out.put_slice(words);
    out.put_u8(DICT_TERM);
    out.put_slice(&payload);
    Frame::from_bytes(out.freeze())
}

/// Decodes the payload of a message (everything after the command byte).
pub fn decode_message(
    payload: &[u8],
    global: &GlobalDict,
) -> Result<Vec<Value>, WireError> {
    let mut dict = LocalDict::new(global);
    let mut index = dict.decode_words(payload, 0)?;
    let mut out = Vec::new();
    while index < payload.len() {
        let (value, next) = decode_value(payload, index, &mut dict)?;
        out.push(value);
        index = next;
    }
    Ok(out)
}

/// Encodes a single value with no dictionary prefix; any strings it needs
/// to intern are resolved against `dict`, which the caller must send.
pub fn encode(value: &Value, dict: &mut LocalDict) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::new();
    encode_value(&mut buf, value, dict)?;
    Ok(buf.freeze())
}

/// Decodes a single value from the start of `buf`, returning it with the
/// number of bytes consumed.
pub fn decode(buf: &[u8], dict: &mut LocalDict) -> Result<(Value, usize), WireError> {
    decode_value(buf, 0, dict)
}

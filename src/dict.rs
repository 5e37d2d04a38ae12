// Copyright 2020 Joyent, Inc.

//! String dictionaries for the wire codec.
//!
//! Two tiers share one 16-bit code space:
//!
//! * The *global* dictionary lives for a connection generation. It is
//!   populated through a `GlobalDictBuilder` and then frozen by
//!   `finalize`, which renumbers its words to the top of the code space:
//!   word `i` of `n` gets code `0xffff - n + i`. The lowest of those codes
//!   is the dictionary's `limit`.
//! * The *local* dictionary is rebuilt for every message. Its codes start
//!   at `0x100` and must stay below the global `limit`, so the two ranges
//!   never overlap. Starting at `0x100` also guarantees the high byte of a
//!   code is never zero, which is the map terminator.
//!
//! Encoded form of a dictionary: each word as UTF-8 followed by `0xff`,
//! then a single `0x00`.

use std::collections::HashMap;

use bytes::Bytes;
use crc16::{State, ARC};

use crate::error::WireError;

pub const LOCAL_CODE_BASE: u16 = 0x100;
/// Codes a builder may hand out before it is finalized.
pub const BUILDER_LIMIT: u16 = 0xfff0;
pub const DICT_TERM: u8 = 0x00;
pub const WORD_END: u8 = 0xff;

fn check_word(word: &str) -> Result<(), WireError> {
    if word.as_bytes().first() == Some(&0) {
        Err(WireError::NulLeadingKey)
    } else {
        Ok(())
    }
}

/// Reads a `0xff` terminated UTF-8 string starting at `index`. A missing
/// terminator means the string runs to the end of `buf`. Returns the string
/// and the index after the terminator.
pub(crate) fn read_terminated(
    buf: &[u8],
    index: usize,
) -> Result<(String, usize), WireError> {
    let end = buf[index..]
        .iter()
        .position(|b| *b == WORD_END)
        .map(|p| index + p)
        .unwrap_or_else(|| buf.len());
    let s = std::str::from_utf8(&buf[index..end])
        .map_err(|_| WireError::InvalidUtf8 { offset: index })?;
    Ok((s.to_string(), (end + 1).min(buf.len())))
}

/// Mutable phase of a global dictionary.
#[derive(Debug, Default)]
pub struct GlobalDictBuilder {
    k2c: HashMap<String, u16>,
    c2k: Vec<String>,
}

impl GlobalDictBuilder {
    pub fn new() -> GlobalDictBuilder {
        GlobalDictBuilder::default()
    }

    /// Adds `word` if not already present. Fails once the builder code
    /// space is exhausted.
    pub fn add(&mut self, word: &str) -> Result<u16, WireError> {
        if let Some(code) = self.k2c.get(word) {
            return Ok(*code);
        }
        check_word(word)?;
        let code = LOCAL_CODE_BASE as usize + self.c2k.len();
        if code >= BUILDER_LIMIT as usize {
            return Err(WireError::DictionaryOverflow);
        }
        let code = code as u16;
        self.k2c.insert(word.to_string(), code);
        self.c2k.push(word.to_string());
        Ok(code)
    }

    pub fn len(&self) -> usize {
        self.c2k.len()
    }

    pub fn is_empty(&self) -> bool {
        self.c2k.is_empty()
    }

    /// Freezes the dictionary and renumbers it to the high end of the code
    /// space.
    pub fn finalize(self) -> GlobalDict {
        let limit = (0xffff - self.c2k.len()) as u16;
        let mut k2c = HashMap::with_capacity(self.c2k.len());
        let mut encoded = Vec::new();
        for (i, word) in self.c2k.iter().enumerate() {
            k2c.insert(word.clone(), limit + i as u16);
            encoded.extend_from_slice(word.as_bytes());
            encoded.push(WORD_END);
        }
        encoded.push(DICT_TERM);
        let hash = format!("{:04x}", State::<ARC>::calculate(&encoded));

        GlobalDict {
            k2c,
            c2k: self.c2k,
            limit,
            encoded: Bytes::from(encoded),
            hash,
        }
    }
}

/// A finalized, read-only global dictionary.
#[derive(Debug, Clone)]
pub struct GlobalDict {
    k2c: HashMap<String, u16>,
    c2k: Vec<String>,
    limit: u16,
    encoded: Bytes,
    hash: String,
}

impl Default for GlobalDict {
    fn default() -> GlobalDict {
        GlobalDictBuilder::new().finalize()
    }
}

impl GlobalDict {
    /// An empty dictionary; used for handshake frames.
    pub fn empty() -> GlobalDict {
        GlobalDict::default()
    }

    /// Rebuilds a dictionary sent by the peer.
    pub fn decode(buf: &[u8]) -> Result<GlobalDict, WireError> {
        let mut builder = GlobalDictBuilder::new();
        let mut index = 0;
        while index < buf.len() && buf[index] != DICT_TERM {
            let (word, next) = read_terminated(buf, index)?;
            builder.add(&word)?;
            index = next;
        }
        Ok(builder.finalize())
    }

    pub fn code(&self, word: &str) -> Option<u16> {
        self.k2c.get(word).copied()
    }

    pub fn word(&self, code: u16) -> Option<&str> {
        if code < self.limit {
            return None;
        }
        self.c2k
            .get((code - self.limit) as usize)
            .map(|s| s.as_str())
    }

    /// Lowest global code; local codes must stay below it.
    pub fn limit(&self) -> u16 {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.c2k.len()
    }

    pub fn is_empty(&self) -> bool {
        self.c2k.is_empty()
    }

    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    /// CRC-16/ARC of the encoded form, as hex.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Per-message dictionary layered over a global one.
#[derive(Debug)]
pub struct LocalDict<'g> {
    global: &'g GlobalDict,
    k2c: HashMap<String, u16>,
    c2k: Vec<String>,
    encoded: Vec<u8>,
}

impl<'g> LocalDict<'g> {
    pub fn new(global: &'g GlobalDict) -> LocalDict<'g> {
        LocalDict {
            global,
            k2c: HashMap::new(),
            c2k: Vec::new(),
            encoded: Vec::new(),
        }
    }

    /// Code for `word`, adding it locally when neither tier has it.
    pub fn add(&mut self, word: &str) -> Result<u16, WireError> {
        if let Some(code) = self.code(word) {
            return Ok(code);
        }
        check_word(word)?;
        self.push_word(word.to_string())
    }

    /// Code for `word` if either tier already has it.
    pub fn code(&self, word: &str) -> Option<u16> {
        self.global
            .code(word)
            .or_else(|| self.k2c.get(word).copied())
    }

    pub fn word(&self, code: u16) -> Result<&str, WireError> {
        if code >= self.global.limit() {
            return self
                .global
                .word(code)
                .ok_or(WireError::UnknownDictCode(code));
        }
        code.checked_sub(LOCAL_CODE_BASE)
            .and_then(|i| self.c2k.get(i as usize))
            .map(|s| s.as_str())
            .ok_or(WireError::UnknownDictCode(code))
    }

    pub fn len(&self) -> usize {
        self.c2k.len()
    }

    pub fn is_empty(&self) -> bool {
        self.c2k.is_empty()
    }

    /// Encoded words without the terminator.
    pub fn encoded_words(&self) -> &[u8] {
        &self.encoded
    }

    /// Reads dictionary words from `buf` starting at `index` up to and
    /// including the terminator; returns the index after it.
    pub fn decode_words(
        &mut self,
        buf: &[u8],
        mut index: usize,
    ) -> Result<usize, WireError> {
        loop {
            match buf.get(index) {
                None => return Err(WireError::Truncated { offset: index }),
                Some(&DICT_TERM) => return Ok(index + 1),
                Some(_) => {
                    let (word, next) = read_terminated(buf, index)?;
                    self.push_word(word)?;
                    index = next;
                }
            }
        }
    }

    /// Local codes must stay below the global range, whether the word
    /// comes from our own encoder or from a peer's message.
    fn push_word(&mut self, word: String) -> Result<u16, WireError> {
        let code = LOCAL_CODE_BASE as usize + self.c2k.len();
        if code >= self.global.limit() as usize {
            return Err(WireError::DictionaryOverflow);
        }
        let code = code as u16;
        self.encoded.extend_from_slice(word.as_bytes());
        self.encoded.push(WORD_END);
        self.k2c.entry(word.clone()).or_insert(code);
        self.c2k.push(word);
        Ok(code)
    }
}

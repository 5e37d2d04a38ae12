// Copyright 2020 Joyent, Inc.

//! Fault taxonomy.
//!
//! * `WireError` covers local codec and framing failures. These are returned
//!   to the immediate caller and never forwarded to the peer on their own.
//! * `RemoteError` is a structured fault: a numeric code plus a
//!   machine-usable reason. It is forwarded to the remote caller verbatim.
//! * `RpcError` is what an RPC or subscription caller sees: either a
//!   structured fault, an unstructured message, a wire failure or a closed
//!   session.
//! * `StateError` covers programming errors against session state.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::value::Value;

/// Reason text sent in place of an unstructured fault.
pub const INTERNAL_ERROR: &str = "Internal server error";

#[derive(Debug, Clone, PartialEq)]
pub enum WireError {
    /// No dictionary codes left for an entry that had to be added.
    DictionaryOverflow,
    /// A type tag the decoder does not know.
    UnsupportedFormat { tag: u8, offset: usize },
    /// The input ended inside a value.
    Truncated { offset: usize },
    InvalidUtf8 { offset: usize },
    UnknownDictCode(u16),
    UnknownCommand(u8),
    FrameTooLarge(usize),
    /// Map keys and dictionary words may not start with a NUL character
    /// since a zero byte terminates the dictionary.
    NulLeadingKey,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::DictionaryOverflow => write!(f, "Dictionary overflow"),
            WireError::UnsupportedFormat { tag, offset } => {
                write!(f, "Unsupported format: {} at {}", tag, offset)
            }
            WireError::Truncated { offset } => {
                write!(f, "Unexpected end of message at {}", offset)
            }
            WireError::InvalidUtf8 { offset } => {
                write!(f, "Invalid UTF-8 string at {}", offset)
            }
            WireError::UnknownDictCode(code) => {
                write!(f, "Unknown dictionary code: {:#06x}", code)
            }
            WireError::UnknownCommand(cmd) => {
                write!(f, "Invalid command {:#04x}", cmd)
            }
            WireError::FrameTooLarge(len) => {
                write!(f, "Frame of {} bytes exceeds the maximum", len)
            }
            WireError::NulLeadingKey => {
                write!(f, "Dictionary words may not start with NUL")
            }
        }
    }
}

impl StdError for WireError {}

impl From<WireError> for io::Error {
    fn from(err: WireError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// A structured fault: numeric code and reason.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub code: u32,
    pub reason: Value,
}

impl RemoteError {
    pub fn new<R: Into<Value>>(code: u32, reason: R) -> RemoteError {
        RemoteError {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.reason {
            Value::String(s) => write!(f, "{} {}", self.code, s),
            other => write!(f, "{} {:?}", self.code, other),
        }
    }
}

impl StdError for RemoteError {}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcError {
    /// Structured fault raised by the peer (or to be sent to it).
    Remote(RemoteError),
    /// Unstructured fault. Only the generic text travels over the wire.
    Message(String),
    Wire(WireError),
    /// The call was refused by local session state.
    State(StateError),
    /// The session was stopped before a response arrived.
    Closed,
}

impl RpcError {
    pub fn new<R: Into<Value>>(code: u32, reason: R) -> RpcError {
        RpcError::Remote(RemoteError::new(code, reason))
    }

    pub fn message<S: Into<String>>(msg: S) -> RpcError {
        RpcError::Message(msg.into())
    }

    /// Unstructured fault for a panic caught in user code.
    pub fn from_panic(panic: Box<dyn Any + Send>) -> RpcError {
        let text = match panic.downcast::<String>() {
            Ok(s) => *s,
            Err(panic) => match panic.downcast::<&str>() {
                Ok(s) => s.to_string(),
                Err(_) => return RpcError::message("panic"),
            },
        };
        RpcError::Message(format!("panic: {}", text))
    }

    /// Numeric code when this is a structured fault.
    pub fn code(&self) -> Option<u32> {
        match self {
            RpcError::Remote(err) => Some(err.code),
            _ => None,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RpcError::Remote(err) => err.fmt(f),
            RpcError::Message(msg) => f.write_str(msg),
            RpcError::Wire(err) => err.fmt(f),
            RpcError::State(err) => err.fmt(f),
            RpcError::Closed => f.write_str("session closed"),
        }
    }
}

impl StdError for RpcError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RpcError::Remote(err) => Some(err),
            RpcError::Wire(err) => Some(err),
            RpcError::State(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> RpcError {
        RpcError::Remote(err)
    }
}

impl From<WireError> for RpcError {
    fn from(err: WireError) -> RpcError {
        RpcError::Wire(err)
    }
}

impl From<StateError> for RpcError {
    fn from(err: StateError) -> RpcError {
        RpcError::State(err)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateError {
    /// `dec_pending` was called with nothing outstanding.
    PendingUnderflow,
    PriorityTaken(String),
    BroadcastTaken(String),
    UnknownPublication(String),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StateError::PendingUnderflow => {
                write!(f, "Unexpected dec when no outstanding waits")
            }
            StateError::PriorityTaken(p) => {
                write!(f, "onConnect {} already taken for onConnect", p)
            }
            StateError::BroadcastTaken(name) => {
                write!(f, "Broadcast function '{}' already registered", name)
            }
            StateError::UnknownPublication(name) => {
                write!(f, "No client publish of {}", name)
            }
        }
    }
}

impl StdError for StateError {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_error_becomes_invalid_data() {
        let err: io::Error = WireError::DictionaryOverflow.into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "Dictionary overflow");
    }

    #[test]
    fn structured_code() {
        let err = RpcError::new(404, "unknown method: foo");
        assert_eq!(err.code(), Some(404));
        assert_eq!(err.to_string(), "404 unknown method: foo");
        assert_eq!(RpcError::message("boom").code(), None);
    }

    #[test]
    fn caught_panics_are_unstructured() {
        let err = std::panic::catch_unwind(|| panic!("index out of range"))
            .map_err(RpcError::from_panic)
            .unwrap_err();
        assert_eq!(err, RpcError::message("panic: index out of range"));
        assert_eq!(err.code(), None);
    }
}

//! Tunnel wire format
//!
//! Frames are length-delimited (4-byte big-endian prefix) and carry a
//! bincode-encoded [`Frame`]. Calls and replies are paired by `id`, so several
//! calls may be in flight on one connection and complete in any order.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::config::Network;
use crate::error::TunnelError;

/// The single call kind the server answers
pub const RESOLVE_METHOD: &str = "resolve";

/// Upper bound on one frame: a maximal DNS message plus envelope
pub const MAX_FRAME_LENGTH: usize = 128 * 1024;

/// Payload of a resolve call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCall {
    /// Raw DNS query in wire format, opaque to the transport
    pub msg: Vec<u8>,
    /// Network the server should use towards its own upstream
    pub network: Network,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Call {
        id: u64,
        method: String,
        call: TunnelCall,
    },
    /// Raw DNS answer, or the error text reported by the server
    Reply {
        id: u64,
        result: Result<Vec<u8>, String>,
    },
}

impl Frame {
    pub fn resolve(id: u64, call: TunnelCall) -> Self {
        Frame::Call {
            id,
            method: RESOLVE_METHOD.to_string(),
            call,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Frame::Call { id, .. } | Frame::Reply { id, .. } => *id,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, TunnelError> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| TunnelError::Protocol(format!("failed to encode frame: {}", e)))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TunnelError> {
        bincode::deserialize(data)
            .map_err(|e| TunnelError::Protocol(format!("failed to decode frame: {}", e)))
    }
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Wrap an established (already encrypted) stream in the frame codec
pub fn framed<S>(stream: S) -> Framed<S, LengthDelimitedCodec>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(stream, codec())
}

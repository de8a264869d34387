use thiserror::Error;
use crate::protocol::ApiMessage;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: bincode::Error,
    },
    #[error("malformed frame ({len} bytes): {source}")]
    Decode {
        len: usize,
        #[source]
        source: bincode::Error,
    },
}

/// Converts [`ApiMessage`] values to and from the binary frame payload.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, msg: &ApiMessage) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, frame: &[u8]) -> Result<ApiMessage, CodecError>;
}

/// Default codec: bincode over the serde derive of the envelope
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl MessageCodec for BincodeCodec {
    fn encode(&self, msg: &ApiMessage) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(msg).map_err(|source| CodecError::Encode {
            kind: msg.name(),
            source,
        })
    }

    fn decode(&self, frame: &[u8]) -> Result<ApiMessage, CodecError> {
        bincode::deserialize(frame).map_err(|source| CodecError::Decode {
            len: frame.len(),
            source,
        })
    }
}

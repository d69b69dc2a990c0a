use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::io::{Cursor, Read as _, Write as _};

use super::envelope::RpcEnvelope;

pub struct RpcCodec;

impl RpcCodec {
    const COMPRESSION_THRESHOLD: usize = 1024;

    /// Upper bound on the declared length of one frame
    pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

    const FLAG_PLAIN: u8 = 0;
    const FLAG_GZIP: u8 = 1;

    pub fn encode(envelope: &RpcEnvelope) -> Result<Vec<u8>, CodecError> {
        let json_data = serde_json::to_vec(envelope)
            .map_err(|e| CodecError::SerializationError(e.to_string()))?;

        // check if compression is needed
        let (flag, data) = if json_data.len() > Self::COMPRESSION_THRESHOLD {
            (Self::FLAG_GZIP, Self::compress(&json_data)?)
        } else {
            (Self::FLAG_PLAIN, json_data)
        };

        let data_len = data.len() + 1; // +1 for compression flag
        if data_len > Self::MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(data_len));
        }

        let mut frame = Vec::with_capacity(4 + data_len);
        frame
            .write_all(&(data_len as u32).to_be_bytes())
            .map_err(|e| CodecError::IoError(e.to_string()))?;
        frame.push(flag);
        frame
            .write_all(&data)
            .map_err(|e| CodecError::IoError(e.to_string()))?;

        Ok(frame)
    }

    /// decode byte stream to message
    ///
    /// return decoded message and consumed bytes, `None` while the frame is incomplete
    pub fn decode(buffer: &[u8]) -> Result<Option<(RpcEnvelope, usize)>, CodecError> {
        let Some(header) = buffer.first_chunk::<4>() else {
            return Ok(None);
        };
        let data_len = u32::from_be_bytes(*header) as usize;

        if data_len == 0 {
            return Err(CodecError::InvalidFrame);
        }
        if data_len > Self::MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(data_len));
        }
        if buffer.len() < 4 + data_len {
            return Ok(None);
        }

        let data = &buffer[5..4 + data_len];
        let json_data = match buffer[4] {
            Self::FLAG_PLAIN => data.to_vec(),
            Self::FLAG_GZIP => Self::decompress(data)?,
            _ => return Err(CodecError::InvalidFrame),
        };

        let envelope = serde_json::from_slice(&json_data)
            .map_err(|e| CodecError::DeserializationError(e.to_string()))?;

        Ok(Some((envelope, 4 + data_len)))
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| CodecError::CompressionError(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::CompressionError(e.to_string()))
    }

    /// Inflate a gzip payload, refusing output beyond [`Self::MAX_FRAME_LEN`]
    fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let limit = Self::MAX_FRAME_LEN as u64 + 1;
        let mut decoder = GzDecoder::new(Cursor::new(data)).take(limit);
        let mut result = Vec::new();
        decoder
            .read_to_end(&mut result)
            .map_err(|e| CodecError::CompressionError(e.to_string()))?;

        if result.len() > Self::MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(result.len()));
        }
        Ok(result)
    }
}

/// Error types for RPC codec operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("Invalid frame format")]
    InvalidFrame,
}

/// Frame buffer for handling incomplete messages
#[derive(Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode a complete message from the buffer
    ///
    /// Consumed bytes are removed from the buffer. Returns `None` when no complete frame is buffered yet.
    pub fn try_decode(&mut self) -> Result<Option<RpcEnvelope>, CodecError> {
        match RpcCodec::decode(&self.buffer)? {
            Some((envelope, consumed)) => {
                self.buffer.drain(0..consumed);
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{envelope::RpcKind, protocol::HelloMessage};

    fn hello_envelope(features: Vec<String>) -> RpcEnvelope {
        let mut hello_msg = HelloMessage::client("test_client");
        hello_msg.supported_features = features;
        RpcEnvelope::new(
            RpcKind::Hello,
            serde_json::to_value(&hello_msg).expect("Failed to serialize"),
        )
    }

    #[test]
    fn test_encode_decode_small_message() {
        let envelope = hello_envelope(vec!["basic".to_owned()]);

        let encoded = RpcCodec::encode(&envelope).expect("Failed to encode");
        assert_eq!(encoded[4], 0, "small frames are not compressed");

        let (decoded, consumed) = RpcCodec::decode(&encoded)
            .expect("Failed to decode")
            .expect("No message decoded");

        assert_eq!(consumed, encoded.len());
        assert_eq!(envelope.uuid, decoded.uuid);
    }

    #[test]
    fn test_encode_decode_large_message() {
        let large_features: Vec<String> = (0..1000).map(|i| format!("feature_{i}")).collect();
        let envelope = hello_envelope(large_features.clone());

        let encoded = RpcCodec::encode(&envelope).expect("Failed to encode");
        assert_eq!(encoded[4], 1, "large frames are gzip-compressed");

        let (decoded, consumed) = RpcCodec::decode(&encoded)
            .expect("Failed to decode")
            .expect("No message decoded");

        let received = serde_json::from_value::<HelloMessage>(decoded.msg)
            .expect("Failed to deserialize HelloMessage");

        assert_eq!(consumed, encoded.len());
        assert_eq!(large_features.len(), received.supported_features.len());
    }

    #[test]
    fn test_frame_buffer() {
        let envelope = hello_envelope(vec!["basic".to_owned()]);
        let encoded = RpcCodec::encode(&envelope).expect("Failed to encode");

        let mut buffer = FrameBuffer::new();

        // 分批添加数据
        let mid = encoded.len() / 2;
        buffer.push(&encoded[0..mid]);
        assert!(buffer.try_decode().expect("Decode failed").is_none());

        buffer.push(&encoded[mid..]);
        let decoded = buffer
            .try_decode()
            .expect("Decode failed")
            .expect("No message decoded");

        assert_eq!(envelope.uuid, decoded.uuid);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let envelope = hello_envelope(vec!["basic".to_owned()]);
        let encoded = RpcCodec::encode(&envelope).expect("Failed to encode");

        assert!(RpcCodec::decode(&encoded[0..2]).expect("Decode failed").is_none());
        assert!(RpcCodec::decode(&encoded[0..4]).expect("Decode failed").is_none());
    }

    #[test]
    fn test_rejects_bad_frames() {
        let oversized = ((RpcCodec::MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        assert!(matches!(
            RpcCodec::decode(&oversized),
            Err(CodecError::FrameTooLarge(_))
        ));

        assert_eq!(
            RpcCodec::decode(&[0, 0, 0, 0]).err(),
            Some(CodecError::InvalidFrame)
        );

        let bad_flag = [0, 0, 0, 2, 7, b'{'];
        assert_eq!(
            RpcCodec::decode(&bad_flag).err(),
            Some(CodecError::InvalidFrame)
        );
    }

    #[test]
    fn test_rejects_oversized_inflated_payload() {
        let envelope = RpcEnvelope::new(
            RpcKind::Response,
            serde_json::Value::String("a".repeat(RpcCodec::MAX_FRAME_LEN + 1)),
        );
        let json_data = serde_json::to_vec(&envelope).expect("Failed to serialize");
        let compressed = RpcCodec::compress(&json_data).expect("Failed to compress");

        let mut frame = ((compressed.len() + 1) as u32).to_be_bytes().to_vec();
        frame.push(RpcCodec::FLAG_GZIP);
        frame.extend_from_slice(&compressed);
        assert!(frame.len() < RpcCodec::MAX_FRAME_LEN / 100, "wire frame stays small");

        assert!(matches!(
            RpcCodec::decode(&frame),
            Err(CodecError::FrameTooLarge(len)) if len == RpcCodec::MAX_FRAME_LEN + 1
        ));
    }
}

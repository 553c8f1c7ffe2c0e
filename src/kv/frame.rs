//! Wire encoding of bucket values.
//!
//! Every value the cache writes to the bucket is framed as
//! `be_u64(time_ns) || flag || payload`, where flag 1 means "value set,
//! payload follows" and flag 0 is a delete marker with no payload. A 0-byte
//! bucket value is not a frame at all; it signals that the entry was purged
//! from the bucket entirely and is handled before decoding.

use thiserror::Error;

/// Length of the `time || flag` header.
pub const HEADER_LEN: usize = 9;

const FLAG_DELETE: u8 = 0;
const FLAG_SET: u8 = 1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short: {0} bytes, need at least {HEADER_LEN}")]
    TooShort(usize),

    #[error("unknown frame flag: {0:#x}")]
    UnknownFlag(u8),
}

/// The operation a frame carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOp {
    Set(Vec<u8>),
    Delete,
}

/// A decoded bucket value: mutation timestamp plus the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub time_ns: i64,
    pub op: FrameOp,
}

impl Frame {
    pub fn set(time_ns: i64, payload: Vec<u8>) -> Self {
        Self {
            time_ns,
            op: FrameOp::Set(payload),
        }
    }

    pub fn delete(time_ns: i64) -> Self {
        Self {
            time_ns,
            op: FrameOp::Delete,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match &self.op {
            FrameOp::Set(payload) => {
                let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
                out.extend_from_slice(&(self.time_ns as u64).to_be_bytes());
                out.push(FLAG_SET);
                out.extend_from_slice(payload);
                out
            }
            FrameOp::Delete => {
                let mut out = Vec::with_capacity(HEADER_LEN);
                out.extend_from_slice(&(self.time_ns as u64).to_be_bytes());
                out.push(FLAG_DELETE);
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(bytes.len()));
        }
        let mut time_bytes = [0u8; 8];
        time_bytes.copy_from_slice(&bytes[..8]);
        let time_ns = u64::from_be_bytes(time_bytes) as i64;

        match bytes[8] {
            FLAG_SET => Ok(Frame::set(time_ns, bytes[HEADER_LEN..].to_vec())),
            FLAG_DELETE => Ok(Frame::delete(time_ns)),
            other => Err(DecodeError::UnknownFlag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_round_trip() {
        let frame = Frame::set(1_000_000, b"hello".to_vec());
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_LEN + 5);
        assert_eq!(bytes[8], FLAG_SET);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_delete_marker() {
        let frame = Frame::delete(42);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_known_layout() {
        // be64(1000) || 0x01 || "hello"
        let bytes = Frame::set(1000, b"hello".to_vec()).encode();
        let mut expected = vec![0, 0, 0, 0, 0, 0, 0x03, 0xe8, 0x01];
        expected.extend_from_slice(b"hello");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_too_short_rejected() {
        assert_eq!(Frame::decode(&[1, 2, 3]), Err(DecodeError::TooShort(3)));
        assert_eq!(Frame::decode(&[]), Err(DecodeError::TooShort(0)));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let mut bytes = Frame::set(7, vec![]).encode();
        bytes[8] = 9;
        assert_eq!(Frame::decode(&bytes), Err(DecodeError::UnknownFlag(9)));
    }
}

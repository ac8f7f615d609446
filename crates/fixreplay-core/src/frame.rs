//! Binary frame layout for archived messages.
//!
//! Every archived message is a 32-byte header followed by the raw message
//! body. Frames start on an 8-byte boundary inside the archive, so the end
//! position of a frame is `begin + align_frame(frame_length)`.
//!
//! ```text
//! 0      4        6      8            16         20         24      28      32
//! ├──────┼────────┼──────┼────────────┼──────────┼──────────┼───────┼───────┤
//! │ len  │ version│ flags│ session id │ seq idx  │ seq num  │ crc32 │ rsvd  │ body…
//! ```
//!
//! `len` covers header and body. The checksum covers the body only.

use crate::error::{ReplayError, Result};
use crate::types::{SequenceKey, SessionId};

/// Size of the fixed frame header.
pub const FRAME_HEADER_LENGTH: usize = 32;

/// Alignment of frame start offsets inside an archive.
pub const FRAME_ALIGNMENT: usize = 8;

/// Current frame layout version.
pub const FRAME_VERSION: u16 = 1;

/// Largest body accepted by the encoder.
pub const MAX_BODY_LENGTH: usize = 16 * 1024 * 1024;

const LENGTH_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const FLAGS_OFFSET: usize = 6;
const SESSION_OFFSET: usize = 8;
const SEQ_INDEX_OFFSET: usize = 16;
const SEQ_NUMBER_OFFSET: usize = 20;
const CHECKSUM_OFFSET: usize = 24;

/// Round `length` up to the frame alignment.
#[must_use]
pub const fn align_frame(length: usize) -> usize {
    (length + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Header plus body length, unaligned.
    pub frame_length: u32,
    pub session_id: SessionId,
    pub key: SequenceKey,
    /// CRC-32 of the body.
    pub checksum: u32,
}

/// Why a byte range does not hold a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("{available} bytes cannot hold a frame header")]
    Truncated { available: usize },
    #[error("no frame written here")]
    Unwritten,
    #[error("unsupported frame version {0}")]
    Version(u16),
    #[error("frame length {0} is shorter than the header")]
    Length(u32),
}

impl FrameHeader {
    /// Decode the header at the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, FrameDecodeError> {
        if bytes.len() < FRAME_HEADER_LENGTH {
            return Err(FrameDecodeError::Truncated {
                available: bytes.len(),
            });
        }
        let frame_length = get_u32(bytes, LENGTH_OFFSET);
        let version = get_u16(bytes, VERSION_OFFSET);
        if frame_length == 0 && version == 0 {
            return Err(FrameDecodeError::Unwritten);
        }
        if version != FRAME_VERSION {
            return Err(FrameDecodeError::Version(version));
        }
        if (frame_length as usize) < FRAME_HEADER_LENGTH {
            return Err(FrameDecodeError::Length(frame_length));
        }
        Ok(Self {
            frame_length,
            session_id: get_u64(bytes, SESSION_OFFSET),
            key: SequenceKey::new(
                get_u32(bytes, SEQ_INDEX_OFFSET),
                get_u32(bytes, SEQ_NUMBER_OFFSET),
            ),
            checksum: get_u32(bytes, CHECKSUM_OFFSET),
        })
    }

    /// Write the header into the first `FRAME_HEADER_LENGTH` bytes of `out`.
    pub fn encode_into(&self, out: &mut [u8]) {
        put_u32(out, LENGTH_OFFSET, self.frame_length);
        put_u16(out, VERSION_OFFSET, FRAME_VERSION);
        put_u16(out, FLAGS_OFFSET, 0);
        put_u64(out, SESSION_OFFSET, self.session_id);
        put_u32(out, SEQ_INDEX_OFFSET, self.key.sequence_index);
        put_u32(out, SEQ_NUMBER_OFFSET, self.key.sequence_number);
        put_u32(out, CHECKSUM_OFFSET, self.checksum);
        put_u32(out, CHECKSUM_OFFSET + 4, 0);
    }

    #[must_use]
    pub fn frame_length(&self) -> usize {
        self.frame_length as usize
    }

    #[must_use]
    pub fn body_length(&self) -> usize {
        self.frame_length() - FRAME_HEADER_LENGTH
    }

    /// Bytes the frame occupies in the archive, padding included.
    #[must_use]
    pub fn aligned_length(&self) -> usize {
        align_frame(self.frame_length())
    }

    /// True when `body` matches the header's checksum.
    #[must_use]
    pub fn verify(&self, body: &[u8]) -> bool {
        body.len() == self.body_length() && crc32fast::hash(body) == self.checksum
    }
}

/// A complete frame borrowed from a buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub header: FrameHeader,
    pub body: &'a [u8],
}

impl<'a> FrameView<'a> {
    /// Parse and checksum-verify a whole frame.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let header = FrameHeader::decode(bytes).map_err(|err| ReplayError::malformed(err.to_string()))?;
        let body = bytes
            .get(FRAME_HEADER_LENGTH..header.frame_length())
            .ok_or_else(|| {
                ReplayError::malformed(format!(
                    "frame length {} exceeds the {} bytes available",
                    header.frame_length,
                    bytes.len()
                ))
            })?;
        if !header.verify(body) {
            return Err(ReplayError::malformed("body checksum mismatch"));
        }
        Ok(Self { header, body })
    }
}

/// Build the header for `body`, validating its size.
pub fn header_for(session_id: SessionId, key: SequenceKey, body: &[u8]) -> Result<FrameHeader> {
    if body.len() > MAX_BODY_LENGTH {
        return Err(ReplayError::FrameTooLarge {
            len: body.len(),
            max: MAX_BODY_LENGTH,
        });
    }
    Ok(FrameHeader {
        frame_length: (FRAME_HEADER_LENGTH + body.len()) as u32,
        session_id,
        key,
        checksum: crc32fast::hash(body),
    })
}

/// Encode a complete frame (header and body, no padding).
pub fn encode_frame(session_id: SessionId, key: SequenceKey, body: &[u8]) -> Result<Vec<u8>> {
    let header = header_for(session_id, key, body)?;
    let mut frame = vec![0u8; header.frame_length()];
    header.encode_into(&mut frame);
    frame[FRAME_HEADER_LENGTH..].copy_from_slice(body);
    Ok(frame)
}

// Little-endian field access. Callers check bounds before reaching here.

pub(crate) fn get_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

pub(crate) fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn put_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGON: &[u8] = b"8=FIX.4.4\x019=5\x0135=A\x0110=000\x01";

    #[test]
    fn align_frame_rounds_up_to_eight() {
        assert_eq!(align_frame(0), 0);
        assert_eq!(align_frame(1), 8);
        assert_eq!(align_frame(32), 32);
        assert_eq!(align_frame(33), 40);
        assert_eq!(align_frame(FRAME_HEADER_LENGTH + LOGON.len()) % FRAME_ALIGNMENT, 0);
    }

    #[test]
    fn encoded_frame_parses_back() {
        let key = SequenceKey::new(3, 17);
        let frame = encode_frame(42, key, LOGON).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LENGTH + LOGON.len());

        let view = FrameView::parse(&frame).unwrap();
        assert_eq!(view.header.session_id, 42);
        assert_eq!(view.header.key, key);
        assert_eq!(view.body, LOGON);
    }

    #[test]
    fn zeroed_bytes_decode_as_unwritten() {
        let zeros = [0u8; FRAME_HEADER_LENGTH];
        assert_eq!(FrameHeader::decode(&zeros), Err(FrameDecodeError::Unwritten));
    }

    #[test]
    fn short_buffer_is_truncated() {
        let frame = encode_frame(1, SequenceKey::new(1, 1), LOGON).unwrap();
        assert_eq!(
            FrameHeader::decode(&frame[..10]),
            Err(FrameDecodeError::Truncated { available: 10 })
        );
        assert!(FrameView::parse(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut frame = encode_frame(1, SequenceKey::new(1, 1), LOGON).unwrap();
        put_u16(&mut frame, VERSION_OFFSET, 9);
        assert_eq!(FrameHeader::decode(&frame), Err(FrameDecodeError::Version(9)));
    }

    #[test]
    fn flipped_body_byte_fails_checksum() {
        let mut frame = encode_frame(1, SequenceKey::new(1, 1), LOGON).unwrap();
        let last = frame.len() - 2;
        frame[last] ^= 0xff;
        let err = FrameView::parse(&frame).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn oversized_body_is_refused() {
        let body = vec![0u8; MAX_BODY_LENGTH + 1];
        let err = encode_frame(1, SequenceKey::new(1, 1), &body).unwrap_err();
        assert!(matches!(err, ReplayError::FrameTooLarge { .. }));
    }

    #[test]
    fn empty_body_is_a_valid_frame() {
        let frame = encode_frame(5, SequenceKey::new(0, 0), b"").unwrap();
        let view = FrameView::parse(&frame).unwrap();
        assert!(view.body.is_empty());
        assert_eq!(view.header.aligned_length(), FRAME_HEADER_LENGTH);
    }
}

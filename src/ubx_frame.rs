//! UBX frame codec
//!
//! A UBX frame on the wire:
//!
//! ```text
//! 0xB5 0x62 | class | id | len (u16 LE) | payload ... | ck_a ck_b
//! ```
//!
//! The checksum is an 8-bit Fletcher sum over class, id, length and payload.
//! The two sync bytes are not part of it.
//!
//! # Usage
//!
//! ```rust
//! use ubx_fusion::ubx_frame::{build_frame, decode, FrameParser};
//! let bytes = build_frame(0x06, 0x8A, &[0x00, 0x01, 0x00, 0x00]);
//! let frame = decode(&bytes).unwrap();
//! assert_eq!((frame.class, frame.id), (0x06, 0x8A));
//!
//! let mut parser = FrameParser::new();
//! parser.push(&bytes);
//! assert_eq!(parser.next_frame(), Some(frame));
//! ```

use crate::error::FrameError;
use log::debug;

pub const SYNC_1: u8 = 0xB5;
pub const SYNC_2: u8 = 0x62;

/// Sync (2) + class (1) + id (1) + length (2).
pub const HEADER_LEN: usize = 6;
/// Header plus the two checksum bytes.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + 2;
/// Largest payload the streaming parser accepts before treating the length
/// field as corrupt.
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// A decoded UBX frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message class
    pub class: u8,
    /// Message id within the class
    pub id: u8,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(class: u8, id: u8, payload: Vec<u8>) -> Self {
        Self { class, id, payload }
    }

    /// Serializes the frame, sync bytes and checksum included.
    pub fn to_bytes(&self) -> Vec<u8> {
        build_frame(self.class, self.id, &self.payload)
    }
}

/// Computes the UBX checksum over `data`.
///
/// `data` must start at the class byte; the sync marker is excluded.
pub fn checksum(data: &[u8]) -> (u8, u8) {
    let mut ck_a: u8 = 0;
    let mut ck_b: u8 = 0;
    for &byte in data {
        ck_a = ck_a.wrapping_add(byte);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    (ck_a, ck_b)
}

/// Builds a complete frame around `payload`.
///
/// Payloads longer than `u16::MAX` cannot be represented and are a caller bug.
pub fn build_frame(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u16::MAX as usize);
    let len = payload.len() as u16;
    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.extend_from_slice(&[SYNC_1, SYNC_2, class, id]);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    let (ck_a, ck_b) = checksum(&frame[2..]);
    frame.push(ck_a);
    frame.push(ck_b);
    frame
}

/// Decodes exactly one complete frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < 2 || bytes[0] != SYNC_1 || bytes[1] != SYNC_2 {
        return Err(FrameError::BadSync);
    }
    if bytes.len() < FRAME_OVERHEAD {
        return Err(FrameError::Truncated {
            needed: FRAME_OVERHEAD,
            available: bytes.len(),
        });
    }
    let payload_len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
    let total = FRAME_OVERHEAD + payload_len;
    if bytes.len() < total {
        return Err(FrameError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }
    if bytes.len() > total {
        return Err(FrameError::TrailingBytes(bytes.len() - total));
    }
    let expected = checksum(&bytes[2..total - 2]);
    let found = (bytes[total - 2], bytes[total - 1]);
    if expected != found {
        return Err(FrameError::ChecksumMismatch { expected, found });
    }
    Ok(Frame {
        class: bytes[2],
        id: bytes[3],
        payload: bytes[HEADER_LEN..total - 2].to_vec(),
    })
}

/// Streaming frame extractor for a noisy byte stream.
///
/// Bytes are appended with [`FrameParser::push`] and complete frames are
/// pulled with [`FrameParser::next_frame`]. Anything that is not a valid frame
/// (NMEA chatter, partial frames from before the port was opened, corrupt
/// frames) is skipped.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes read from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for more input.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Extracts the next valid frame, if a complete one is buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let start = self
                .buffer
                .windows(2)
                .position(|w| w[0] == SYNC_1 && w[1] == SYNC_2);
            let Some(start) = start else {
                // keep a trailing first sync byte, its partner may be next
                let keep = usize::from(self.buffer.last() == Some(&SYNC_1));
                self.buffer.drain(..self.buffer.len() - keep);
                return None;
            };
            self.buffer.drain(..start);

            if self.buffer.len() < HEADER_LEN {
                return None;
            }
            let payload_len = u16::from_le_bytes([self.buffer[4], self.buffer[5]]) as usize;
            if payload_len > MAX_PAYLOAD_LEN {
                debug!("dropping frame with oversized length {payload_len}");
                self.buffer.drain(..1);
                continue;
            }
            let total = FRAME_OVERHEAD + payload_len;
            if self.buffer.len() < total {
                return None;
            }
            match decode(&self.buffer[..total]) {
                Ok(frame) => {
                    self.buffer.drain(..total);
                    return Some(frame);
                }
                Err(err) => {
                    debug!("dropping frame: {err}");
                    self.buffer.drain(..1);
                }
            }
        }
    }
}

impl Iterator for FrameParser {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_frame_layout() {
        let frame = build_frame(0x06, 0x8A, &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&frame[..6], &[0xB5, 0x62, 0x06, 0x8A, 0x04, 0x00]);
        assert_eq!(&frame[6..10], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(frame.len(), 12);
    }

    #[test]
    fn test_known_checksum() {
        // UBX-MON-VER poll, a well known frame
        assert_eq!(build_frame(0x0A, 0x04, &[]), vec![0xB5, 0x62, 0x0A, 0x04, 0x00, 0x00, 0x0E, 0x34]);
        // UBX-ACK-ACK for CFG-VALSET
        assert_eq!(
            build_frame(0x05, 0x01, &[0x06, 0x8A]),
            vec![0xB5, 0x62, 0x05, 0x01, 0x02, 0x00, 0x06, 0x8A, 0x98, 0xC1]
        );
    }

    #[test]
    fn test_checksum_wraps() {
        let data = [0xFF; 300];
        let (a, b) = checksum(&data);
        let mut ea: u32 = 0;
        let mut eb: u32 = 0;
        for _ in 0..300 {
            ea = (ea + 0xFF) % 256;
            eb = (eb + ea) % 256;
        }
        assert_eq!((a as u32, b as u32), (ea, eb));
    }

    #[test]
    fn test_checksum_matches_frame_tail() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let frame = build_frame(0x01, 0x07, &payload);
        let n = frame.len();
        assert_eq!(checksum(&frame[2..n - 2]), (frame[n - 2], frame[n - 1]));
    }

    #[test]
    fn test_single_bit_flip_changes_checksum() {
        let frame = build_frame(0x01, 0x14, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let n = frame.len();
        let original = checksum(&frame[2..n - 2]);
        for byte in 2..n - 2 {
            for bit in 0..8 {
                let mut flipped = frame.clone();
                flipped[byte] ^= 1 << bit;
                assert_ne!(checksum(&flipped[2..n - 2]), original, "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn test_decode_round_trip() {
        for payload in [vec![], vec![0x42], vec![0xAB; 1000], (0..=255u8).cycle().take(65535).collect()] {
            let bytes = build_frame(0x01, 0x07, &payload);
            let frame = decode(&bytes).unwrap();
            assert_eq!(frame, Frame::new(0x01, 0x07, payload));
            assert_eq!(frame.to_bytes(), bytes);
        }
    }

    #[test]
    fn test_decode_errors() {
        let bytes = build_frame(0x05, 0x01, &[0x06, 0x8A]);
        assert_eq!(decode(&bytes[1..]), Err(FrameError::BadSync));
        assert!(matches!(decode(&bytes[..9]), Err(FrameError::Truncated { needed: 10, available: 9 })));

        let mut long = bytes.clone();
        long.push(0);
        assert_eq!(decode(&long), Err(FrameError::TrailingBytes(1)));

        let mut corrupt = bytes.clone();
        corrupt[7] ^= 0x01;
        assert!(matches!(decode(&corrupt), Err(FrameError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_parser_skips_noise_and_splits_frames() {
        let ack = build_frame(0x05, 0x01, &[0x06, 0x8A]);
        let nak = build_frame(0x05, 0x00, &[0x06, 0x8A]);
        let mut stream = b"$GNGGA,123519,4807.038,N*47\r\n".to_vec();
        stream.extend_from_slice(&ack);
        stream.extend_from_slice(&[0xB5, 0x00, 0x13]);
        stream.extend_from_slice(&nak);

        let mut parser = FrameParser::new();
        // feed in small chunks to exercise partial buffering
        for chunk in stream.chunks(3) {
            parser.push(chunk);
        }
        let frames: Vec<Frame> = parser.by_ref().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, 0x01);
        assert_eq!(frames[1].id, 0x00);
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_parser_waits_for_partial_frame() {
        let frame = build_frame(0x01, 0x21, &[0u8; 20]);
        let mut parser = FrameParser::new();
        parser.push(&frame[..10]);
        assert_eq!(parser.next_frame(), None);
        parser.push(&frame[10..]);
        assert_eq!(parser.next_frame().map(|f| f.id), Some(0x21));
    }

    #[test]
    fn test_parser_resyncs_after_corrupt_frame() {
        let mut corrupt = build_frame(0x05, 0x01, &[0x06, 0x8A]);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        let good = build_frame(0x05, 0x00, &[0x06, 0x8A]);

        let mut parser = FrameParser::new();
        parser.push(&corrupt);
        parser.push(&good);
        let frames: Vec<Frame> = parser.collect();
        assert_eq!(frames, vec![Frame::new(0x05, 0x00, vec![0x06, 0x8A])]);
    }

    #[test]
    fn test_parser_drops_oversized_length() {
        let mut parser = FrameParser::new();
        parser.push(&[0xB5, 0x62, 0x01, 0x07, 0xFF, 0xFF]);
        parser.push(&build_frame(0x05, 0x01, &[0x06, 0x8A]));
        assert_eq!(parser.next_frame().map(|f| (f.class, f.id)), Some((0x05, 0x01)));
    }
}

//! Frame codec for the depot wire protocol.
//!
//! A frame is the unit of exchange in both directions: a fixed 20-byte
//! section of five big-endian u32 fields, then an optional section present
//! whenever a path is set (dataLength, level count, and length-prefixed
//! UTF-16BE path levels). Encoding and decoding must stay byte-for-byte
//! stable - this is the compatibility-critical surface shared with every
//! peer implementation.

use std::fmt;

use crate::protocol::{
    option_bits, Action, Message, FIXED_SECTION_LEN, MAX_HEADER_SIZE, OPTIONAL_PROLOGUE_LEN,
};

const PREFIX_LEN: usize = 4;

/// Decode failure. Always fatal to the connection that produced the bytes;
/// a malformed header is never coerced into a usable frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the structure requires.
    Truncated,
    /// The length prefix is below the fixed section size or above [`MAX_HEADER_SIZE`].
    BadHeaderLength(u32),
    /// Declared total length does not match the byte span provided.
    LengthMismatch { declared: u32, actual: usize },
    /// Declared optional length does not match total - fixed.
    OptionalLengthMismatch { declared: u32, expected: u32 },
    /// Action ordinal out of range.
    BadAction(u32),
    /// Message ordinal out of range.
    BadMessage(u32),
    /// Path level is not valid UTF-16.
    BadString,
    /// Bytes left over after the last declared entry.
    TrailingBytes,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "frame truncated"),
            FrameError::BadHeaderLength(n) => write!(f, "header length {} out of range", n),
            FrameError::LengthMismatch { declared, actual } => {
                write!(f, "declared header length {} but {} bytes given", declared, actual)
            }
            FrameError::OptionalLengthMismatch { declared, expected } => {
                write!(f, "declared optional length {} but expected {}", declared, expected)
            }
            FrameError::BadAction(v) => write!(f, "action ordinal {} out of range", v),
            FrameError::BadMessage(v) => write!(f, "message ordinal {} out of range", v),
            FrameError::BadString => write!(f, "path level is not valid UTF-16"),
            FrameError::TrailingBytes => write!(f, "trailing bytes after last entry"),
        }
    }
}

impl std::error::Error for FrameError {}

/// One protocol message (request or response).
///
/// `data_length` and `option` are meaningful only when `path` is set; a
/// pathless frame encodes with zero optional length and carries no payload.
/// `path: Some(vec![])` addresses the sandbox root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub action: Action,
    pub message: Message,
    pub option: u32,
    pub data_length: u64,
    pub path: Option<Vec<String>>,
}

impl Default for Frame {
    fn default() -> Frame {
        Frame {
            action: Action::None,
            message: Message::None,
            option: 0,
            data_length: 0,
            path: None,
        }
    }
}

impl Frame {
    /// A request frame addressing `path`.
    pub fn request(action: Action, path: Vec<String>) -> Frame {
        Frame {
            action,
            path: Some(path),
            ..Frame::default()
        }
    }

    pub fn is_overwrite(&self) -> bool {
        self.option & option_bits::OVERWRITE != 0
    }

    pub fn set_overwrite(&mut self, overwrite: bool) {
        if overwrite {
            self.option |= option_bits::OVERWRITE;
        } else {
            self.option &= !option_bits::OVERWRITE;
        }
    }

    fn optional_len(&self) -> usize {
        match &self.path {
            None => 0,
            Some(levels) => {
                OPTIONAL_PROLOGUE_LEN
                    + levels
                        .iter()
                        .map(|l| PREFIX_LEN + 2 * utf16_units(l))
                        .sum::<usize>()
            }
        }
    }

    /// Total encoded length; always `20 + optional_len`.
    pub fn header_len(&self) -> usize {
        FIXED_SECTION_LEN + self.optional_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let optional = self.optional_len();
        let total = FIXED_SECTION_LEN + optional;
        let mut buf = Vec::with_capacity(total);
        put_u32(&mut buf, total as u32);
        put_u32(&mut buf, self.action.ordinal());
        put_u32(&mut buf, self.option);
        put_u32(&mut buf, self.message.ordinal());
        put_u32(&mut buf, optional as u32);
        if let Some(levels) = &self.path {
            put_u64(&mut buf, self.data_length);
            put_u32(&mut buf, levels.len() as u32);
            for level in levels {
                put_u32(&mut buf, utf16_units(level) as u32);
                put_utf16(&mut buf, level);
            }
        }
        buf
    }

    /// Decode a complete header span. The span must be exactly the declared
    /// total length; any structural inconsistency is an error.
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < FIXED_SECTION_LEN {
            return Err(FrameError::Truncated);
        }
        let total = get_u32(bytes, 0)?;
        if (total as usize) < FIXED_SECTION_LEN || total as usize > MAX_HEADER_SIZE {
            return Err(FrameError::BadHeaderLength(total));
        }
        if total as usize != bytes.len() {
            return Err(FrameError::LengthMismatch {
                declared: total,
                actual: bytes.len(),
            });
        }
        let action_ord = get_u32(bytes, 4)?;
        let action = Action::from_ordinal(action_ord).ok_or(FrameError::BadAction(action_ord))?;
        let option = get_u32(bytes, 8)?;
        let message_ord = get_u32(bytes, 12)?;
        let message =
            Message::from_ordinal(message_ord).ok_or(FrameError::BadMessage(message_ord))?;
        let optional = get_u32(bytes, 16)?;
        if optional != total - FIXED_SECTION_LEN as u32 {
            return Err(FrameError::OptionalLengthMismatch {
                declared: optional,
                expected: total - FIXED_SECTION_LEN as u32,
            });
        }

        let mut frame = Frame {
            action,
            message,
            option,
            data_length: 0,
            path: None,
        };
        if optional > 0 {
            frame.data_length = get_u64(bytes, FIXED_SECTION_LEN)?;
            let levels = get_u32(bytes, FIXED_SECTION_LEN + 8)? as usize;
            let mut offset = FIXED_SECTION_LEN + OPTIONAL_PROLOGUE_LEN;
            let mut path = Vec::with_capacity(levels.min(64));
            for _ in 0..levels {
                let units = get_u32(bytes, offset)? as usize;
                offset += PREFIX_LEN;
                path.push(get_utf16(bytes, offset, units)?);
                offset += 2 * units;
            }
            frame.path = Some(path);
        }
        Ok(frame)
    }
}

/// Incremental header accumulation across arbitrarily fragmented reads.
///
/// Bytes are appended at the current fill offset, never overwritten. Once the
/// 4-byte length prefix is buffered, the scratch buffer is grown in place to
/// the declared total; once the full span is buffered the frame is decoded
/// and the accumulator resets. Only header bytes are consumed - surplus input
/// belongs to the payload (or the next request) and stays with the caller.
pub struct HeaderAccumulator {
    buf: Vec<u8>,
    filled: usize,
    expected: usize,
}

impl Default for HeaderAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderAccumulator {
    pub fn new() -> HeaderAccumulator {
        HeaderAccumulator {
            buf: vec![0u8; crate::protocol::IO_CHUNK],
            filled: 0,
            expected: 0,
        }
    }

    /// No partially accumulated header.
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Absorb `input`; returns how many bytes were consumed and the decoded
    /// frame once one completes.
    pub fn feed(&mut self, input: &[u8]) -> Result<(usize, Option<Frame>), FrameError> {
        let mut consumed = 0usize;

        if self.expected == 0 {
            if self.filled < PREFIX_LEN {
                let take = (PREFIX_LEN - self.filled).min(input.len());
                self.buf[self.filled..self.filled + take].copy_from_slice(&input[..take]);
                self.filled += take;
                consumed += take;
                if self.filled < PREFIX_LEN {
                    return Ok((consumed, None));
                }
            }
            let declared =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if (declared as usize) < FIXED_SECTION_LEN || declared as usize > MAX_HEADER_SIZE {
                return Err(FrameError::BadHeaderLength(declared));
            }
            self.expected = declared as usize;
            if self.buf.len() < self.expected {
                // grow in place, preserving what is already accumulated
                self.buf.resize(self.expected, 0);
            }
        }

        let take = (self.expected - self.filled).min(input.len() - consumed);
        self.buf[self.filled..self.filled + take]
            .copy_from_slice(&input[consumed..consumed + take]);
        self.filled += take;
        consumed += take;
        if self.filled < self.expected {
            return Ok((consumed, None));
        }

        let frame = Frame::decode(&self.buf[..self.expected])?;
        self.filled = 0;
        self.expected = 0;
        Ok((consumed, Some(frame)))
    }
}

fn utf16_units(s: &str) -> usize {
    s.encode_utf16().count()
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_utf16(buf: &mut Vec<u8>, s: &str) {
    for unit in s.encode_utf16() {
        buf.extend_from_slice(&unit.to_be_bytes());
    }
}

pub(crate) fn get_u32(bytes: &[u8], offset: usize) -> Result<u32, FrameError> {
    let span = bytes
        .get(offset..offset + 4)
        .ok_or(FrameError::Truncated)?;
    Ok(u32::from_be_bytes(span.try_into().expect("4-byte span")))
}

pub(crate) fn get_u64(bytes: &[u8], offset: usize) -> Result<u64, FrameError> {
    let span = bytes
        .get(offset..offset + 8)
        .ok_or(FrameError::Truncated)?;
    Ok(u64::from_be_bytes(span.try_into().expect("8-byte span")))
}

pub(crate) fn get_utf16(bytes: &[u8], offset: usize, units: usize) -> Result<String, FrameError> {
    let span = bytes
        .get(offset..offset + 2 * units)
        .ok_or(FrameError::Truncated)?;
    let code_units: Vec<u16> = span
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&code_units).map_err(|_| FrameError::BadString)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::default(),
            Frame {
                action: Action::PutFin,
                message: Message::FileCreated,
                ..Frame::default()
            },
            Frame::request(Action::Lst, vec![]),
            Frame::request(Action::Get, vec!["a.txt".into()]),
            {
                let mut f = Frame::request(Action::Put, vec!["dir".into(), "b.bin".into()]);
                f.data_length = 123_456_789;
                f.set_overwrite(true);
                f
            },
            Frame::request(
                Action::Del,
                vec!["каталог".into(), "файл 😀.txt".into(), "日本語".into()],
            ),
        ]
    }

    #[test]
    fn round_trip() {
        for frame in sample_frames() {
            let bytes = frame.encode();
            let decoded = Frame::decode(&bytes).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn header_length_invariant() {
        for frame in sample_frames() {
            let bytes = frame.encode();
            assert_eq!(bytes.len(), frame.header_len());
            assert_eq!(get_u32(&bytes, 0).unwrap() as usize, bytes.len());
            let optional = get_u32(&bytes, 16).unwrap() as usize;
            assert_eq!(bytes.len(), FIXED_SECTION_LEN + optional);
        }
    }

    #[test]
    fn pathless_frame_has_no_optional_section() {
        let frame = Frame {
            action: Action::PutFin,
            message: Message::FileCreated,
            ..Frame::default()
        };
        assert_eq!(frame.encode().len(), FIXED_SECTION_LEN);
    }

    #[test]
    fn empty_path_still_carries_prologue() {
        let frame = Frame::request(Action::Lst, vec![]);
        assert_eq!(
            frame.encode().len(),
            FIXED_SECTION_LEN + OPTIONAL_PROLOGUE_LEN
        );
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.path, Some(vec![]));
    }

    #[test]
    fn surrogate_pair_counts_two_units() {
        // U+1F600 encodes as a surrogate pair: 4 + 2*2 bytes for the level
        let frame = Frame::request(Action::Get, vec!["😀".into()]);
        assert_eq!(
            frame.encode().len(),
            FIXED_SECTION_LEN + OPTIONAL_PROLOGUE_LEN + 4 + 4
        );
    }

    #[test]
    fn overwrite_bit() {
        let mut frame = Frame::request(Action::Put, vec!["x".into()]);
        assert!(!frame.is_overwrite());
        frame.set_overwrite(true);
        assert!(frame.is_overwrite());
        assert_eq!(frame.option, 1);
        frame.set_overwrite(false);
        assert!(!frame.is_overwrite());
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut bytes = Frame::request(Action::Get, vec!["a".into()]).encode();
        bytes.push(0);
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_inconsistent_optional_length() {
        let mut bytes = Frame::request(Action::Get, vec!["a".into()]).encode();
        // corrupt the optional length field
        bytes[16..20].copy_from_slice(&99u32.to_be_bytes());
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::OptionalLengthMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_out_of_range_ordinals() {
        let mut bytes = Frame::request(Action::Get, vec!["a".into()]).encode();
        bytes[4..8].copy_from_slice(&42u32.to_be_bytes());
        assert_eq!(Frame::decode(&bytes), Err(FrameError::BadAction(42)));

        let mut bytes = Frame::request(Action::Get, vec!["a".into()]).encode();
        bytes[12..16].copy_from_slice(&8u32.to_be_bytes());
        assert_eq!(Frame::decode(&bytes), Err(FrameError::BadMessage(8)));
    }

    #[test]
    fn decode_rejects_overrunning_level() {
        let mut bytes = Frame::request(Action::Get, vec!["abc".into()]).encode();
        // claim more code units than the span holds
        let off = FIXED_SECTION_LEN + OPTIONAL_PROLOGUE_LEN;
        bytes[off..off + 4].copy_from_slice(&1000u32.to_be_bytes());
        assert_eq!(Frame::decode(&bytes), Err(FrameError::Truncated));
    }

    #[test]
    fn decode_rejects_lone_surrogate() {
        let mut frame = Frame::request(Action::Get, vec!["ab".into()]);
        frame.data_length = 0;
        let mut bytes = frame.encode();
        let off = FIXED_SECTION_LEN + OPTIONAL_PROLOGUE_LEN + 4;
        bytes[off..off + 2].copy_from_slice(&0xD800u16.to_be_bytes());
        assert_eq!(Frame::decode(&bytes), Err(FrameError::BadString));
    }

    #[test]
    fn accumulator_single_feed_matches_decode() {
        let frame = Frame::request(Action::Put, vec!["dir".into(), "f.bin".into()]);
        let bytes = frame.encode();
        let mut acc = HeaderAccumulator::new();
        let (consumed, got) = acc.feed(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(got, Some(frame));
        assert!(acc.is_empty());
    }

    #[test]
    fn accumulator_byte_at_a_time() {
        let frame = Frame::request(
            Action::Put,
            vec!["каталог".into(), "file 😀.bin".into()],
        );
        let bytes = frame.encode();
        let mut acc = HeaderAccumulator::new();
        let mut got = None;
        for (i, b) in bytes.iter().enumerate() {
            let (consumed, out) = acc.feed(std::slice::from_ref(b)).unwrap();
            assert_eq!(consumed, 1);
            if i + 1 < bytes.len() {
                assert!(out.is_none());
            } else {
                got = out;
            }
        }
        assert_eq!(got, Some(frame));
    }

    #[test]
    fn accumulator_split_at_prefix_boundary() {
        let frame = Frame::request(Action::Del, vec!["x".into()]);
        let bytes = frame.encode();
        let mut acc = HeaderAccumulator::new();
        let (consumed, out) = acc.feed(&bytes[..4]).unwrap();
        assert_eq!((consumed, out), (4, None));
        assert!(!acc.is_empty());
        let (consumed, out) = acc.feed(&bytes[4..]).unwrap();
        assert_eq!(consumed, bytes.len() - 4);
        assert_eq!(out, Some(frame));
    }

    #[test]
    fn accumulator_leaves_surplus_unconsumed() {
        let frame = Frame::request(Action::Put, vec!["p".into()]);
        let mut bytes = frame.encode();
        let header_len = bytes.len();
        bytes.extend_from_slice(b"payload bytes that arrived early");
        let mut acc = HeaderAccumulator::new();
        let (consumed, out) = acc.feed(&bytes).unwrap();
        assert_eq!(consumed, header_len);
        assert_eq!(out, Some(frame));
    }

    #[test]
    fn accumulator_rejects_hostile_prefix() {
        let mut acc = HeaderAccumulator::new();
        let err = acc.feed(&3u32.to_be_bytes()).unwrap_err();
        assert_eq!(err, FrameError::BadHeaderLength(3));

        let mut acc = HeaderAccumulator::new();
        let err = acc.feed(&u32::MAX.to_be_bytes()).unwrap_err();
        assert_eq!(err, FrameError::BadHeaderLength(u32::MAX));
    }

    #[test]
    fn accumulator_grows_for_large_headers() {
        let long = "n".repeat(4096);
        let frame = Frame::request(Action::Get, vec![long]);
        let bytes = frame.encode();
        assert!(bytes.len() > crate::protocol::IO_CHUNK);
        let mut acc = HeaderAccumulator::new();
        let mid = bytes.len() / 2;
        assert_eq!(acc.feed(&bytes[..mid]).unwrap(), (mid, None));
        let (consumed, out) = acc.feed(&bytes[mid..]).unwrap();
        assert_eq!(consumed, bytes.len() - mid);
        assert_eq!(out, Some(frame));
    }
}

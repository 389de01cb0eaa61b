//! Packed listing blob - the LST payload format.
//!
//! `entryCount` (4 bytes BE), then per entry `levelCount` (4 bytes BE) and
//! per level a 4-byte code-unit count followed by UTF-16BE code units, the
//! same string encoding the frame header uses for path levels.

use crate::frame::{get_u32, get_utf16, put_u32, put_utf16, FrameError};

/// Pack root-relative paths (as level sequences) into the wire blob.
pub fn pack(paths: &[Vec<String>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 * paths.len() + 4);
    put_u32(&mut buf, paths.len() as u32);
    for levels in paths {
        put_u32(&mut buf, levels.len() as u32);
        for level in levels {
            put_u32(&mut buf, level.encode_utf16().count() as u32);
            put_utf16(&mut buf, level);
        }
    }
    buf
}

/// Unpack a listing blob. Structural inconsistencies (overrunning spans,
/// invalid UTF-16, trailing garbage) are errors, same policy as the header
/// decoder.
pub fn unpack(bytes: &[u8]) -> Result<Vec<Vec<String>>, FrameError> {
    let entries = get_u32(bytes, 0)? as usize;
    let mut offset = 4usize;
    let mut paths = Vec::with_capacity(entries.min(1024));
    for _ in 0..entries {
        let levels = get_u32(bytes, offset)? as usize;
        offset += 4;
        let mut path = Vec::with_capacity(levels.min(64));
        for _ in 0..levels {
            let units = get_u32(bytes, offset)? as usize;
            offset += 4;
            path.push(get_utf16(bytes, offset, units)?);
            offset += 2 * units;
        }
        paths.push(path);
    }
    if offset != bytes.len() {
        return Err(FrameError::TrailingBytes);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let paths = vec![
            vec!["a.txt".to_string()],
            vec!["dir".to_string(), "b.bin".to_string()],
            vec!["каталог".to_string(), "файл 😀.dat".to_string()],
        ];
        let blob = pack(&paths);
        assert_eq!(unpack(&blob).unwrap(), paths);
    }

    #[test]
    fn empty_listing_is_four_bytes() {
        let blob = pack(&[]);
        assert_eq!(blob, vec![0, 0, 0, 0]);
        assert_eq!(unpack(&blob).unwrap(), Vec::<Vec<String>>::new());
    }

    #[test]
    fn unpack_rejects_truncation() {
        let paths = vec![vec!["abcdef".to_string()]];
        let blob = pack(&paths);
        assert_eq!(unpack(&blob[..blob.len() - 2]), Err(FrameError::Truncated));
    }

    #[test]
    fn unpack_rejects_trailing_garbage() {
        let mut blob = pack(&[vec!["a".to_string()]]);
        blob.push(0xFF);
        assert_eq!(unpack(&blob), Err(FrameError::TrailingBytes));
    }
}

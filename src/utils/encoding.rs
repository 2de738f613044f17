//! LEB128 varints and delta coding for sorted id lists.

/// Encode a u32 as a variable-length integer
pub fn encode_varint(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        if value < 0x80 {
            buf.push(value as u8);
            break;
        }
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
}

/// Decode a variable-length integer from a slice
/// Returns (value, bytes_consumed), or `None` if the input ends early or overflows
pub fn decode_varint(buf: &[u8]) -> Option<(u32, usize)> {
    let mut result: u32 = 0;
    let mut shift = 0;

    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 32 {
            return None;
        }
        let bits = (byte & 0x7F) as u32;
        if shift == 28 && bits > 0x0F {
            return None;
        }

        result |= bits << shift;

        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }

        shift += 7;
    }

    None
}

/// True when `buf` is a varint prefix cut short by the end of input
/// (as opposed to an overlong encoding).
pub fn is_incomplete_varint(buf: &[u8]) -> bool {
    buf.len() < 5 && buf.iter().all(|&b| b & 0x80 != 0)
}

/// Delta-encode a strictly increasing list of u32s
pub fn delta_encode(values: &[u32], buf: &mut Vec<u8>) {
    let mut prev = 0u32;
    for (i, &value) in values.iter().enumerate() {
        let delta = if i == 0 { value } else { value - prev };
        encode_varint(delta, buf);
        prev = value;
    }
}

/// Delta-decode a list of u32s written by [`delta_encode`].
///
/// Returns `None` if the buffer is malformed or the sequence would overflow.
pub fn delta_decode(buf: &[u8]) -> Option<Vec<u32>> {
    let mut result = Vec::new();
    let mut prev = 0u32;
    let mut pos = 0;

    while pos < buf.len() {
        let (delta, consumed) = decode_varint(&buf[pos..])?;
        prev = if result.is_empty() {
            delta
        } else {
            if delta == 0 {
                return None;
            }
            prev.checked_add(delta)?
        };
        result.push(prev);
        pos += consumed;
    }

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0, 1, 127, 128, 16383, 16384, u32::MAX] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            assert_eq!(decode_varint(&buf), Some((value, buf.len())));
        }
    }

    #[test]
    fn test_varint_rejects_overlong() {
        // Six continuation groups cannot fit a u32.
        let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert_eq!(decode_varint(&buf), None);
        assert!(!is_incomplete_varint(&buf));
    }

    #[test]
    fn test_incomplete_varint() {
        assert_eq!(decode_varint(&[0x80, 0x80]), None);
        assert!(is_incomplete_varint(&[0x80, 0x80]));
        assert!(is_incomplete_varint(&[]));
        assert!(is_incomplete_varint(&[0x80; 4]));
    }

    #[test]
    fn test_five_continuation_bytes_are_overlong() {
        // A u32 never needs a sixth byte, so this is malformed, not short.
        let buf = [0x80; 5];
        assert_eq!(decode_varint(&buf), None);
        assert!(!is_incomplete_varint(&buf));

        let mut cursor = crate::format::RecordCursor::new(&buf);
        assert!(matches!(
            cursor.get_varint(),
            Err(crate::error::FormatError::Corrupt(_))
        ));
    }

    #[test]
    fn test_delta_encoding() {
        let values = vec![0, 5, 10, 15, 100, 1000];
        let mut buf = Vec::new();
        delta_encode(&values, &mut buf);
        assert_eq!(delta_decode(&buf), Some(values));
    }

    #[test]
    fn test_delta_decode_rejects_duplicates() {
        // 3, then a zero delta would repeat 3.
        assert_eq!(delta_decode(&[3, 0]), None);
    }
}

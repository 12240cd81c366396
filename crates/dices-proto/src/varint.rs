//! Unsigned LEB128 variable-length integers
//!
//! Message counters are unbounded in principle but almost always tiny, so
//! the wire format spends one byte per 7 bits instead of a fixed 8 bytes.

use bytes::BufMut;

use crate::errors::{ProtocolError, Result};

/// Maximum encoded length of a u64 varint (10 bytes)
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` to `dst` as an unsigned LEB128 varint.
pub fn put_varint(dst: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed. `field` names the
/// envelope field being read, for error context.
///
/// # Errors
///
/// - `Truncated` if the buffer ends mid-varint
/// - `VarIntOverflow` if the encoding exceeds 64 bits
pub fn get_varint(buf: &[u8], field: &'static str) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    for (index, &byte) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        let bits = u64::from(byte & 0x7F);

        // The tenth byte may only contribute the single remaining bit.
        if shift == 63 && bits > 1 {
            return Err(ProtocolError::VarIntOverflow { field });
        }
        value |= bits << shift;

        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
        shift += 7;
    }

    if buf.len() >= MAX_VARINT_LEN {
        return Err(ProtocolError::VarIntOverflow { field });
    }
    Err(ProtocolError::Truncated { field, needed: buf.len() + 1, available: buf.len() })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn roundtrip(value: u64) -> (u64, usize) {
        let mut buf = Vec::new();
        put_varint(&mut buf, value);
        get_varint(&buf, "test").unwrap()
    }

    #[test]
    fn small_values_take_one_byte() {
        for value in [0u64, 1, 42, 127] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), 1);
            assert_eq!(roundtrip(value), (value, 1));
        }
    }

    #[test]
    fn boundary_values_roundtrip() {
        for value in [127u64, 128, 16_383, 16_384, u64::from(u32::MAX), u64::MAX] {
            let (decoded, _) = roundtrip(value);
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn max_value_takes_ten_bytes() {
        let mut buf = Vec::new();
        put_varint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
    }

    #[test]
    fn empty_buffer_is_truncated() {
        assert!(matches!(get_varint(&[], "test"), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn unterminated_varint_is_truncated() {
        assert!(matches!(get_varint(&[0x80, 0x80], "test"), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn overlong_encoding_overflows() {
        let buf = [0xFFu8; 11];
        assert_eq!(get_varint(&buf, "test"), Err(ProtocolError::VarIntOverflow { field: "test" }));
    }

    #[test]
    fn sixty_fourth_bit_overflow_is_rejected() {
        // Ten bytes whose final byte claims more than one bit of payload.
        let buf = [0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x02];
        assert_eq!(get_varint(&buf, "test"), Err(ProtocolError::VarIntOverflow { field: "test" }));
    }

    proptest! {
        #[test]
        fn varint_round_trip(value in any::<u64>()) {
            let (decoded, consumed) = roundtrip(value);
            prop_assert_eq!(decoded, value);
            prop_assert!(consumed <= MAX_VARINT_LEN);
        }

        #[test]
        fn trailing_bytes_are_not_consumed(value in any::<u64>(), trailer in any::<Vec<u8>>()) {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            let encoded_len = buf.len();
            buf.extend_from_slice(&trailer);

            let (decoded, consumed) = get_varint(&buf, "test").unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, encoded_len);
        }
    }
}

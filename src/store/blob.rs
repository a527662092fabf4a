//! Embedding blob codec: fixed-width little-endian f32, independent of
//! host endianness so database files stay portable.

use crate::{MatchError, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

pub fn encode(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for &v in values {
        // Writing into a Vec cannot fail.
        out.write_f32::<LittleEndian>(v).expect("vec write");
    }
    out
}

pub fn decode(bytes: &[u8], expected_len: usize) -> Result<Vec<f32>> {
    if bytes.len() != expected_len * 4 {
        return Err(MatchError::InvalidDimension {
            expected: expected_len,
            actual: bytes.len() / 4,
        });
    }
    let mut out = vec![0f32; expected_len];
    LittleEndian::read_f32_into(bytes, &mut out);
    Ok(out)
}

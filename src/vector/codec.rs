//! Byte encodings for dense and bit vectors.
//!
//! # Formats
//! - Full: 4 bytes per dimension, big-endian IEEE-754 bit pattern, no header.
//! - Half: 2 bytes per dimension, the top 16 bits of the IEEE-754 pattern
//!   (sign, exponent and 7 mantissa bits). Lossy, roughly 1% relative error.
//! - Bits: `ceil(D/8)` bytes, dimension `d` at byte `d / 8`, bit `d % 8`.
//! - Record: an encoded vector followed by its big-endian f32 L2 norm.
//!
//! Encode and decode come in three strategies (plain shift loop, cursor
//! reader, four-lane unrolled). They are interchangeable and must produce
//! bit-identical output.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::vector::types::{VectorEncoding, VectorError};

/// Number of bytes per full-precision value.
pub const FULL_BYTES: usize = 4;

/// Number of bytes per half-precision value.
pub const HALF_BYTES: usize = 2;

/// Number of bytes of the trailing magnitude in a stored record.
pub const MAGNITUDE_BYTES: usize = 4;

fn check_len(bytes: &[u8], width: usize) -> Result<usize, VectorError> {
    if bytes.is_empty() {
        return Err(VectorError::MissingValue);
    }
    if bytes.len() % width != 0 {
        return Err(VectorError::MalformedLength {
            length: bytes.len(),
            width,
        });
    }
    Ok(bytes.len() / width)
}

/// Encodes a vector at full precision.
#[must_use]
pub fn encode_full(vector: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(vector.len() * FULL_BYTES);
    for value in vector {
        let bits = value.to_bits();
        buf.push((bits >> 24) as u8);
        buf.push((bits >> 16) as u8);
        buf.push((bits >> 8) as u8);
        buf.push(bits as u8);
    }
    buf
}

/// Encodes through a `byteorder` writer.
#[must_use]
pub fn encode_full_buffered(vector: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(vector.len() * FULL_BYTES);
    for &value in vector {
        // Writing into a Vec cannot fail.
        let _ = buf.write_f32::<BigEndian>(value);
    }
    buf
}

/// Encodes four dimensions per step into a preallocated buffer.
#[must_use]
pub fn encode_full_unrolled(vector: &[f32]) -> Vec<u8> {
    let mut buf = vec![0u8; vector.len() * FULL_BYTES];
    let chunks = vector.len() / 4;
    for chunk in 0..chunks {
        let dim = chunk * 4;
        let offset = dim * FULL_BYTES;
        buf[offset..offset + 4].copy_from_slice(&vector[dim].to_be_bytes());
        buf[offset + 4..offset + 8].copy_from_slice(&vector[dim + 1].to_be_bytes());
        buf[offset + 8..offset + 12].copy_from_slice(&vector[dim + 2].to_be_bytes());
        buf[offset + 12..offset + 16].copy_from_slice(&vector[dim + 3].to_be_bytes());
    }
    for dim in chunks * 4..vector.len() {
        let offset = dim * FULL_BYTES;
        buf[offset..offset + 4].copy_from_slice(&vector[dim].to_be_bytes());
    }
    buf
}

/// Decodes a full-precision vector. Exact inverse of [`encode_full`].
pub fn decode_full(bytes: &[u8]) -> Result<Vec<f32>, VectorError> {
    let dims = check_len(bytes, FULL_BYTES)?;
    let mut vector = Vec::with_capacity(dims);
    let mut offset = 0;
    for _ in 0..dims {
        let bits = (u32::from(bytes[offset]) << 24)
            | (u32::from(bytes[offset + 1]) << 16)
            | (u32::from(bytes[offset + 2]) << 8)
            | u32::from(bytes[offset + 3]);
        vector.push(f32::from_bits(bits));
        offset += FULL_BYTES;
    }
    Ok(vector)
}

/// Decodes through a cursor reader.
pub fn decode_full_buffered(bytes: &[u8]) -> Result<Vec<f32>, VectorError> {
    let dims = check_len(bytes, FULL_BYTES)?;
    let mut reader = Cursor::new(bytes);
    let mut vector = Vec::with_capacity(dims);
    for _ in 0..dims {
        let value = reader
            .read_f32::<BigEndian>()
            .map_err(|_| VectorError::MalformedLength {
                length: bytes.len(),
                width: FULL_BYTES,
            })?;
        vector.push(value);
    }
    Ok(vector)
}

/// Decodes four dimensions per step.
pub fn decode_full_unrolled(bytes: &[u8]) -> Result<Vec<f32>, VectorError> {
    let dims = check_len(bytes, FULL_BYTES)?;
    let mut vector = vec![0.0f32; dims];
    let chunks = dims / 4;
    for chunk in 0..chunks {
        let dim = chunk * 4;
        let offset = dim * FULL_BYTES;
        vector[dim] = read_be_f32(bytes, offset);
        vector[dim + 1] = read_be_f32(bytes, offset + 4);
        vector[dim + 2] = read_be_f32(bytes, offset + 8);
        vector[dim + 3] = read_be_f32(bytes, offset + 12);
    }
    for (dim, value) in vector.iter_mut().enumerate().skip(chunks * 4) {
        *value = read_be_f32(bytes, dim * FULL_BYTES);
    }
    Ok(vector)
}

/// Reads one big-endian f32 at `offset`. Caller guarantees bounds.
#[inline]
pub(crate) fn read_be_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_bits(u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ]))
}

/// Reads one half-precision value at `offset`. Caller guarantees bounds.
#[inline]
pub(crate) fn read_be_half(bytes: &[u8], offset: usize) -> f32 {
    let high = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
    f32::from_bits(u32::from(high) << 16)
}

/// Encodes a vector keeping only the top 16 bits of each value.
#[must_use]
pub fn encode_half(vector: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(vector.len() * HALF_BYTES);
    for value in vector {
        let high = (value.to_bits() >> 16) as u16;
        buf.extend_from_slice(&high.to_be_bytes());
    }
    buf
}

/// Decodes a half-precision vector, zero-filling the dropped mantissa bits.
pub fn decode_half(bytes: &[u8]) -> Result<Vec<f32>, VectorError> {
    let dims = check_len(bytes, HALF_BYTES)?;
    Ok((0..dims).map(|dim| read_be_half(bytes, dim * HALF_BYTES)).collect())
}

/// Encodes a vector with the given encoding.
#[must_use]
pub fn encode(vector: &[f32], encoding: VectorEncoding) -> Vec<u8> {
    match encoding {
        VectorEncoding::Float32 => encode_full(vector),
        VectorEncoding::Half => encode_half(vector),
    }
}

/// Decodes a vector with the given encoding.
pub fn decode(bytes: &[u8], encoding: VectorEncoding) -> Result<Vec<f32>, VectorError> {
    match encoding {
        VectorEncoding::Float32 => decode_full(bytes),
        VectorEncoding::Half => decode_half(bytes),
    }
}

/// Width in bytes of a stored record for `dims` dimensions.
#[must_use]
pub const fn record_width(dims: usize, encoding: VectorEncoding) -> usize {
    dims * encoding.bytes_per_dim() + MAGNITUDE_BYTES
}

/// Encodes a stored record: the vector followed by its L2 norm.
#[must_use]
pub fn encode_record(vector: &[f32], encoding: VectorEncoding) -> Vec<u8> {
    let mut buf = encode(vector, encoding);
    buf.extend_from_slice(&l2_norm(vector).to_be_bytes());
    buf
}

/// Decodes the vector part of a stored record.
pub fn decode_record(record: &[u8], encoding: VectorEncoding) -> Result<Vec<f32>, VectorError> {
    let body = record_body(record)?;
    decode(body, encoding)
}

/// Reads the trailing magnitude of a stored record.
pub fn decode_magnitude(record: &[u8]) -> Result<f32, VectorError> {
    if record.len() < MAGNITUDE_BYTES {
        return Err(VectorError::MalformedLength {
            length: record.len(),
            width: MAGNITUDE_BYTES,
        });
    }
    Ok(read_be_f32(record, record.len() - MAGNITUDE_BYTES))
}

fn record_body(record: &[u8]) -> Result<&[u8], VectorError> {
    if record.len() <= MAGNITUDE_BYTES {
        return Err(VectorError::MissingValue);
    }
    Ok(&record[..record.len() - MAGNITUDE_BYTES])
}

/// Packs booleans LSB-first into `ceil(D/8)` bytes.
#[must_use]
pub fn encode_bits(vector: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; vector.len().div_ceil(8)];
    for (dim, &value) in vector.iter().enumerate() {
        if value {
            bytes[dim / 8] |= 1 << (dim % 8);
        }
    }
    bytes
}

/// Unpacks `dims` booleans from a packed bit vector.
pub fn decode_bits(bytes: &[u8], dims: usize) -> Result<Vec<bool>, VectorError> {
    if bytes.is_empty() {
        return Err(VectorError::MissingValue);
    }
    if bytes.len() != dims.div_ceil(8) {
        return Err(VectorError::DimensionMismatch {
            expected: dims.div_ceil(8),
            actual: bytes.len(),
            field: None,
        });
    }
    Ok((0..dims)
        .map(|dim| bytes[dim / 8] & (1 << (dim % 8)) != 0)
        .collect())
}

/// Number of positions where a packed document vector and a query differ.
///
/// Only the first `query.len()` bits count; padding in the last byte is
/// ignored.
pub fn hamming_distance(encoded: &[u8], query: &[bool]) -> Result<u32, VectorError> {
    let query_bytes = encode_bits(query);
    if encoded.len() != query_bytes.len() {
        return Err(VectorError::DimensionMismatch {
            expected: encoded.len() * 8,
            actual: query.len(),
            field: None,
        });
    }
    let tail = query.len() % 8;
    let last = query_bytes.len().saturating_sub(1);
    Ok(encoded
        .iter()
        .zip(query_bytes.iter())
        .enumerate()
        .map(|(i, (a, b))| {
            let diff = a ^ b;
            if i == last && tail != 0 {
                (diff & ((1u8 << tail) - 1)).count_ones()
            } else {
                diff.count_ones()
            }
        })
        .sum())
}

/// Plain dot product.
#[must_use]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    let mut result = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        result += x * y;
    }
    result
}

/// Dot product with four independent accumulators.
#[must_use]
pub fn dot_product_unrolled(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    let (mut dot0, mut dot1, mut dot2, mut dot3) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
    let length = (a.len() / 4) * 4;
    let mut dim = 0;
    while dim < length {
        dot0 += a[dim] * b[dim];
        dot1 += a[dim + 1] * b[dim + 1];
        dot2 += a[dim + 2] * b[dim + 2];
        dot3 += a[dim + 3] * b[dim + 3];
        dim += 4;
    }
    for tail in length..a.len() {
        dot0 += a[tail] * b[tail];
    }
    dot0 + dot1 + dot2 + dot3
}

/// L2 norm of a vector.
#[must_use]
pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Squared Euclidean distance, accumulated in f64.
#[must_use]
pub fn squared_l2_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let diff = f64::from(x) - f64::from(y);
            diff * diff
        })
        .sum()
}

//! Kafka primitive codec
//!
//! Encoding helpers for the primitives used inside the consumer-protocol
//! membership blobs: big-endian integers, i16-length-prefixed strings,
//! i32-length-prefixed byte blocks and i32-counted arrays. The broker treats
//! the blobs as opaque, so this is the only piece of wire encoding the
//! client owns; everything else rides the external Kafka library.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{TransportError, TransportResult};

/// Encode an i16-length-prefixed string.
pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

/// Parse an i16-length-prefixed string.
pub fn get_string(buf: &mut Bytes) -> TransportResult<String> {
    if buf.remaining() < 2 {
        return Err(truncated("string length"));
    }
    let len = buf.get_i16();
    if len < 0 {
        return Err(TransportError::UnexpectedResponse(format!(
            "negative string length {len}"
        )));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(truncated("string body"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| TransportError::UnexpectedResponse("string is not UTF-8".into()))
}

/// Encode an i32-length-prefixed byte block. Empty encodes as -1 (null).
pub fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    if b.is_empty() {
        buf.put_i32(-1);
    } else {
        buf.put_i32(b.len() as i32);
        buf.put_slice(b);
    }
}

/// Parse an i32-length-prefixed byte block. Null (-1) parses as empty.
pub fn get_bytes(buf: &mut Bytes) -> TransportResult<Bytes> {
    if buf.remaining() < 4 {
        return Err(truncated("bytes length"));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(Bytes::new());
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(truncated("bytes body"));
    }
    Ok(buf.split_to(len))
}

/// Encode an i32 element count followed by each element.
pub fn put_array<T>(buf: &mut BytesMut, items: &[T], mut encode: impl FnMut(&mut BytesMut, &T)) {
    buf.put_i32(items.len() as i32);
    for item in items {
        encode(buf, item);
    }
}

/// Parse an i32-counted array.
pub fn get_array<T>(
    buf: &mut Bytes,
    mut parse: impl FnMut(&mut Bytes) -> TransportResult<T>,
) -> TransportResult<Vec<T>> {
    if buf.remaining() < 4 {
        return Err(truncated("array length"));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(Vec::new());
    }
    // A count that could not possibly fit in the remaining buffer is a
    // malformed frame, not a huge allocation request.
    if len as usize > buf.remaining() {
        return Err(TransportError::UnexpectedResponse(format!(
            "array of {len} elements in a {}-byte buffer",
            buf.remaining()
        )));
    }
    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(parse(buf)?);
    }
    Ok(items)
}

/// Parse an i32 from the buffer.
pub fn get_i32(buf: &mut Bytes) -> TransportResult<i32> {
    if buf.remaining() < 4 {
        return Err(truncated("i32"));
    }
    Ok(buf.get_i32())
}

/// Parse an i16 from the buffer.
pub fn get_i16(buf: &mut Bytes) -> TransportResult<i16> {
    if buf.remaining() < 2 {
        return Err(truncated("i16"));
    }
    Ok(buf.get_i16())
}

fn truncated(what: &str) -> TransportError {
    TransportError::UnexpectedResponse(format!("truncated buffer reading {what}"))
}

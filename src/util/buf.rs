use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Strings on the wire are a u16 length followed by UTF-8 bytes. Callers ensure that the string
///  fits, which holds for everything that goes through [crate::messaging::peer_id::PeerId].
pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len().prechecked_cast());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len: usize = buf.try_get_u16()?.safe_cast();
    if buf.remaining() < len {
        bail!("string of length {} exceeds the remaining {} bytes", len, buf.remaining());
    }

    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);

    let s = String::from_utf8(result)?;
    Ok(s)
}

use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        anyhow::bail!("string length {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }

    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);

    let s = String::from_utf8(result)?;
    Ok(s)
}

pub fn put_optional_string(buf: &mut impl BufMut, s: Option<&str>) {
    match s {
        None => buf.put_u8(0),
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
    }
}

pub fn try_get_optional_string(buf: &mut impl Buf) -> anyhow::Result<Option<String>> {
    match buf.try_get_u8()? {
        0 => Ok(None),
        1 => Ok(Some(try_get_string(buf)?)),
        flag => Err(anyhow::anyhow!("invalid option flag {}", flag)),
    }
}

pub fn put_string_list<'a>(buf: &mut impl BufMut, items: impl ExactSizeIterator<Item=&'a String>) {
    buf.put_usize_varint(items.len());
    for item in items {
        put_string(buf, item);
    }
}

pub fn try_get_string_list(buf: &mut impl Buf) -> anyhow::Result<Vec<String>> {
    let len = buf.try_get_usize_varint()?;
    let mut result = Vec::new();
    for _ in 0..len {
        result.push(try_get_string(buf)?);
    }
    Ok(result)
}

pub fn put_string_pairs<'a>(buf: &mut impl BufMut, pairs: impl ExactSizeIterator<Item=(&'a String, &'a String)>) {
    buf.put_usize_varint(pairs.len());
    for (key, value) in pairs {
        put_string(buf, key);
        put_string(buf, value);
    }
}

pub fn try_get_string_pairs(buf: &mut impl Buf) -> anyhow::Result<Vec<(String, String)>> {
    let len = buf.try_get_usize_varint()?;
    let mut result = Vec::new();
    for _ in 0..len {
        let key = try_get_string(buf)?;
        let value = try_get_string(buf)?;
        result.push((key, value));
    }
    Ok(result)
}

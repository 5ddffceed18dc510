//! Extended-attribute framing of feed values.
//!
//! Layout: a big-endian u32 total length, then for each attribute a
//! big-endian u32 pair length followed by `name\0value\0`, then the document
//! body. The pair length excludes its own header; the total covers every
//! pair including headers.

use crate::error::{CacheError, Result};

const LEN_SIZE: usize = 4;

/// A decoded xattr-framed value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XattrFrame<'a> {
    /// Declared length of the xattr section.
    pub total_len: u32,
    /// Declared length of each pair.
    pub pair_lens: Vec<u32>,
    /// (name, value) in framing order.
    pub xattrs: Vec<(&'a str, &'a [u8])>,
    pub body: &'a [u8],
}

impl<'a> XattrFrame<'a> {
    /// Value of the named attribute.
    pub fn get(&self, name: &str) -> Option<&'a [u8]> {
        self.xattrs
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, value)| *value)
    }
}

/// Body and selected attributes of a framed value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XattrValues<'a> {
    pub body: &'a [u8],
    pub sync: Option<&'a [u8]>,
    pub user: Option<&'a [u8]>,
}

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    let bytes = data
        .get(at..at + LEN_SIZE)
        .ok_or_else(|| CacheError::MalformedInput(format!("truncated length at offset {}", at)))?;
    let mut buf = [0u8; LEN_SIZE];
    buf.copy_from_slice(bytes);
    Ok(u32::from_be_bytes(buf))
}

/// Frame `xattrs` in front of `body`.
pub fn encode_xattrs(xattrs: &[(&str, &[u8])], body: &[u8]) -> Vec<u8> {
    let pair_len = |name: &str, value: &[u8]| name.len() + value.len() + 2;
    let total: usize = xattrs
        .iter()
        .map(|(name, value)| LEN_SIZE + pair_len(name, value))
        .sum();

    let mut out = Vec::with_capacity(LEN_SIZE + total + body.len());
    out.extend_from_slice(&(total as u32).to_be_bytes());
    for (name, value) in xattrs {
        out.extend_from_slice(&(pair_len(name, value) as u32).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(value);
        out.push(0);
    }
    out.extend_from_slice(body);
    out
}

/// Split a framed value into its attributes and body.
pub fn decode_xattrs(data: &[u8]) -> Result<XattrFrame<'_>> {
    let total_len = read_u32(data, 0)?;
    let section_end = LEN_SIZE
        .checked_add(total_len as usize)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            CacheError::MalformedInput(format!(
                "xattr length {} exceeds value length {}",
                total_len,
                data.len()
            ))
        })?;

    let mut pair_lens = Vec::new();
    let mut xattrs = Vec::new();
    let mut pos = LEN_SIZE;
    while pos < section_end {
        let pair_len = read_u32(data, pos)?;
        let start = pos + LEN_SIZE;
        let end = start + pair_len as usize;
        if end > section_end {
            return Err(CacheError::MalformedInput(format!(
                "xattr pair at offset {} overruns section",
                pos
            )));
        }
        let pair = &data[start..end];

        let name_end = pair
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| CacheError::MalformedInput("xattr name not terminated".into()))?;
        if pair.last() != Some(&0) || name_end + 1 > pair.len() - 1 {
            return Err(CacheError::MalformedInput("xattr value not terminated".into()));
        }
        let name = std::str::from_utf8(&pair[..name_end])
            .map_err(|e| CacheError::MalformedInput(format!("xattr name: {}", e)))?;
        let value = &pair[name_end + 1..pair.len() - 1];

        pair_lens.push(pair_len);
        xattrs.push((name, value));
        pos = end;
    }

    Ok(XattrFrame {
        total_len,
        pair_lens,
        xattrs,
        body: &data[section_end..],
    })
}

/// Body plus the sync and user attributes of a framed value. Empty names
/// are not looked up.
pub fn parse_xattr_stream_data<'a>(
    sync_name: &str,
    user_name: &str,
    data: &'a [u8],
) -> Result<XattrValues<'a>> {
    let frame = decode_xattrs(data)?;
    let lookup = |name: &str| {
        if name.is_empty() {
            None
        } else {
            frame.get(name)
        }
    };
    Ok(XattrValues {
        body: frame.body,
        sync: lookup(sync_name),
        user: lookup(user_name),
    })
}

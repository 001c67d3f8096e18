//! Record codec: compact format strings describing wire records.
//!
//! One character per field:
//!
//! | Char | Meaning          | Send value      | Unpacked value       |
//! |------|------------------|-----------------|----------------------|
//! | `I`  | unsigned 32-bit  | [`Value::U32`]  | [`Value::U32`]       |
//! | `L`  | unsigned 64-bit  | [`Value::U64`]  | [`Value::U64`]       |
//! | `x`  | 4 padding bytes  | (none)          | (none)               |
//! | `P`  | buffer           | [`Value::Bytes`]| [`Value::Bytes`]     |
//!
//! `P` is encoded as a 64-bit length followed by that many bytes inline.
//! 64-bit fields and `P` lengths should start on an 8-byte boundary; the
//! format author inserts `x` where needed. Unpacked `P` values borrow the
//! record buffer, so they are only valid until the owning slot is marked
//! done; callers who keep the data longer must copy it.

use crate::error::{Error, Result};

/// A field value moving through [`pack`] or out of [`unpack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    U32(u32),
    U64(u64),
    Bytes(&'a [u8]),
}

impl<'a> Value<'a> {
    /// The value as a u32, if it is one.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a u64, if it is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a byte slice, if it is one.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// Compute the exact byte size of a record, validating the format against
/// the arguments. The caller rounds the result up to the payload alignment
/// when allocating.
pub fn packed_size(fmt: &str, args: &[Value<'_>]) -> Result<usize> {
    let mut size = 0usize;
    let mut next = args.iter();
    for c in fmt.chars() {
        match c {
            'I' => {
                next.next()
                    .and_then(Value::as_u32)
                    .ok_or(Error::ArgMismatch('I'))?;
                size += 4;
            }
            'L' => {
                next.next()
                    .and_then(Value::as_u64)
                    .ok_or(Error::ArgMismatch('L'))?;
                size += 8;
            }
            'P' => {
                let b = next
                    .next()
                    .and_then(Value::as_bytes)
                    .ok_or(Error::ArgMismatch('P'))?;
                size += 8 + b.len();
            }
            'x' => size += 4,
            c => return Err(Error::BadFormat(c)),
        }
    }
    if next.next().is_some() {
        return Err(Error::ArgMismatch('\0'));
    }
    Ok(size)
}

/// Pack a record into `buf` and return the number of bytes written.
///
/// `buf` must be at least [`packed_size`] bytes; padding fields are
/// zeroed, so a zero-filled buffer stays fully initialized.
pub fn pack(buf: &mut [u8], fmt: &str, args: &[Value<'_>]) -> Result<usize> {
    let size = packed_size(fmt, args)?;
    if buf.len() < size {
        return Err(Error::ShortPayload);
    }

    let mut pos = 0usize;
    let mut next = args.iter();
    for c in fmt.chars() {
        match c {
            'I' => {
                let v = next.next().and_then(Value::as_u32).unwrap();
                buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
                pos += 4;
            }
            'L' => {
                let v = next.next().and_then(Value::as_u64).unwrap();
                buf[pos..pos + 8].copy_from_slice(&v.to_le_bytes());
                pos += 8;
            }
            'P' => {
                let b = next.next().and_then(Value::as_bytes).unwrap();
                buf[pos..pos + 8].copy_from_slice(&(b.len() as u64).to_le_bytes());
                pos += 8;
                buf[pos..pos + b.len()].copy_from_slice(b);
                pos += b.len();
            }
            'x' => {
                buf[pos..pos + 4].fill(0);
                pos += 4;
            }
            _ => unreachable!("validated by packed_size"),
        }
    }
    Ok(pos)
}

/// Unpack a record according to `fmt`.
///
/// `P` fields borrow `payload`. Fails with `ShortPayload` when the record
/// ends before the format string is consumed; trailing alignment padding
/// beyond the format is ignored.
pub fn unpack<'a>(payload: &'a [u8], fmt: &str) -> Result<Vec<Value<'a>>> {
    let mut out = Vec::new();
    let mut pos = 0usize;

    for c in fmt.chars() {
        match c {
            'I' => {
                let end = pos + 4;
                if end > payload.len() {
                    return Err(Error::ShortPayload);
                }
                let v = u32::from_le_bytes(payload[pos..end].try_into().unwrap());
                out.push(Value::U32(v));
                pos = end;
            }
            'L' => {
                let end = pos + 8;
                if end > payload.len() {
                    return Err(Error::ShortPayload);
                }
                let v = u64::from_le_bytes(payload[pos..end].try_into().unwrap());
                out.push(Value::U64(v));
                pos = end;
            }
            'P' => {
                let end = pos + 8;
                if end > payload.len() {
                    return Err(Error::ShortPayload);
                }
                let len = u64::from_le_bytes(payload[pos..end].try_into().unwrap()) as usize;
                pos = end;
                if pos + len > payload.len() {
                    return Err(Error::ShortPayload);
                }
                out.push(Value::Bytes(&payload[pos..pos + len]));
                pos += len;
            }
            'x' => {
                pos += 4;
                if pos > payload.len() {
                    return Err(Error::ShortPayload);
                }
            }
            c => return Err(Error::BadFormat(c)),
        }
    }
    Ok(out)
}

//! Record framing shared by the message log and the delivery tracker.
//!
//! Every record on disk is `[len: u32 BE][crc32: u32 BE][content]`.
//! A reader stops at the first frame that is short or fails its checksum;
//! everything before it is trusted, everything after it is a torn tail.

use bytes::{Buf, BufMut};
use crc32fast::Hasher;

use crate::error::StoreError;

const HEADER_LEN: usize = 8;

const TAG_INSERT: u8 = 1;
const TAG_DELETE: u8 = 2;

const TAG_SET: u8 = 1;
const TAG_REMOVE: u8 = 2;

fn checksum(content: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(content);
    hasher.finalize()
}

pub fn frame(content: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + content.len());
    buf.put_u32(content.len() as u32);
    buf.put_u32(checksum(content));
    buf.put_slice(content);
    buf
}

#[derive(Debug, Default)]
pub struct FrameScan<'a> {
    pub frames: Vec<&'a [u8]>,
    /// Bytes covered by intact frames.
    pub valid_len: u64,
    pub torn: bool,
}

pub fn scan_frames(data: &[u8]) -> FrameScan<'_> {
    let mut scan = FrameScan::default();
    let mut pos = 0usize;

    while pos < data.len() {
        let rest = &data[pos..];
        if rest.len() < HEADER_LEN {
            scan.torn = true;
            break;
        }
        let mut header = &rest[..HEADER_LEN];
        let len = header.get_u32() as usize;
        let stored_crc = header.get_u32();

        if rest.len() - HEADER_LEN < len {
            scan.torn = true;
            break;
        }
        let content = &rest[HEADER_LEN..HEADER_LEN + len];
        if checksum(content) != stored_crc {
            scan.torn = true;
            break;
        }

        scan.frames.push(content);
        pos += HEADER_LEN + len;
    }

    scan.valid_len = pos as u64;
    scan
}

// ---------- id helpers ----------

fn put_id(buf: &mut Vec<u8>, id: &str) {
    buf.put_u16(id.len() as u16);
    buf.put_slice(id.as_bytes());
}

fn take_id(buf: &mut &[u8]) -> Result<String, StoreError> {
    if buf.remaining() < 2 {
        return Err(StoreError::Corrupt("missing id length".into()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(StoreError::Corrupt("id truncated".into()));
    }
    let id = std::str::from_utf8(&buf[..len])
        .map_err(|_| StoreError::Corrupt("id is not valid utf-8".into()))?
        .to_string();
    buf.advance(len);
    Ok(id)
}

// ---------- Message log ----------

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Insert { id: String, payload: Vec<u8> },
    Delete { id: String },
}

impl LogRecord {
    pub fn id(&self) -> &str {
        match self {
            LogRecord::Insert { id, .. } | LogRecord::Delete { id } => id,
        }
    }

    /// Framed bytes ready to append.
    pub fn encode(&self) -> Vec<u8> {
        let mut content = Vec::new();
        match self {
            LogRecord::Insert { id, payload } => {
                content.put_u8(TAG_INSERT);
                put_id(&mut content, id);
                content.put_slice(payload);
            }
            LogRecord::Delete { id } => {
                content.put_u8(TAG_DELETE);
                put_id(&mut content, id);
            }
        }
        frame(&content)
    }

    pub fn decode(content: &[u8]) -> Result<Self, StoreError> {
        let mut buf = content;
        if !buf.has_remaining() {
            return Err(StoreError::Corrupt("empty record".into()));
        }
        match buf.get_u8() {
            TAG_INSERT => {
                let id = take_id(&mut buf)?;
                if buf.is_empty() {
                    return Err(StoreError::Corrupt(format!("insert of '{}' has no payload", id)));
                }
                Ok(LogRecord::Insert { id, payload: buf.to_vec() })
            }
            TAG_DELETE => Ok(LogRecord::Delete { id: take_id(&mut buf)? }),
            tag => Err(StoreError::Corrupt(format!("unknown log tag {}", tag))),
        }
    }
}

// ---------- Delivery tracker ----------

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryRecord {
    Set { id: String, count: u32 },
    Remove { id: String },
}

impl DeliveryRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut content = Vec::new();
        match self {
            DeliveryRecord::Set { id, count } => {
                content.put_u8(TAG_SET);
                put_id(&mut content, id);
                content.put_u32(*count);
            }
            DeliveryRecord::Remove { id } => {
                content.put_u8(TAG_REMOVE);
                put_id(&mut content, id);
            }
        }
        frame(&content)
    }

    pub fn decode(content: &[u8]) -> Result<Self, StoreError> {
        let mut buf = content;
        if !buf.has_remaining() {
            return Err(StoreError::Corrupt("empty record".into()));
        }
        match buf.get_u8() {
            TAG_SET => {
                let id = take_id(&mut buf)?;
                if buf.remaining() < 4 {
                    return Err(StoreError::Corrupt(format!("count of '{}' truncated", id)));
                }
                Ok(DeliveryRecord::Set { id, count: buf.get_u32() })
            }
            TAG_REMOVE => Ok(DeliveryRecord::Remove { id: take_id(&mut buf)? }),
            tag => Err(StoreError::Corrupt(format!("unknown delivery tag {}", tag))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_stops_at_torn_tail() {
        let mut data = LogRecord::Insert { id: "a".into(), payload: b"{}".to_vec() }.encode();
        let first_len = data.len() as u64;
        data.extend_from_slice(&LogRecord::Delete { id: "a".into() }.encode());
        let full_len = data.len();
        data.truncate(full_len - 2);

        let scan = scan_frames(&data);
        assert_eq!(scan.frames.len(), 1);
        assert!(scan.torn);
        assert_eq!(scan.valid_len, first_len);
    }

    #[test]
    fn test_scan_rejects_bad_checksum() {
        let mut data = LogRecord::Delete { id: "x".into() }.encode();
        let last = data.len() - 1;
        data[last] ^= 0xFF;

        let scan = scan_frames(&data);
        assert!(scan.frames.is_empty());
        assert!(scan.torn);
        assert_eq!(scan.valid_len, 0);
    }

    #[test]
    fn test_insert_requires_payload() {
        let mut content = Vec::new();
        content.put_u8(TAG_INSERT);
        put_id(&mut content, "m1");
        assert!(matches!(LogRecord::decode(&content), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_log_record_decodes_framed_content() {
        let record = LogRecord::Insert { id: "m1".into(), payload: b"{\"k\":1}".to_vec() };
        let bytes = record.encode();
        let scan = scan_frames(&bytes);
        assert!(!scan.torn);
        assert_eq!(LogRecord::decode(scan.frames[0]).unwrap(), record);
    }

    #[test]
    fn test_delivery_record_truncated_count() {
        let mut content = Vec::new();
        content.put_u8(TAG_SET);
        put_id(&mut content, "m1");
        content.put_u16(7);
        assert!(DeliveryRecord::decode(&content).is_err());
    }
}

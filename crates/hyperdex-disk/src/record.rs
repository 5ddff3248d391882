//! Segment log records.
//!
//! Each write (put or delete) appends one record to the active segment:
//!
//! ```text
//! [REC_START:u32][has_value:u8][version:u64][key_len:u32][key]
//!     [ncols:u32]([col_len:u32][col])*[REC_END:u32]
//! ```
//!
//! All integers little-endian. The end sentinel makes torn tail writes
//! detectable during replay: a record without its end marker is treated
//! as the end of the segment.

use bytes::Bytes;

use crate::{DiskError, DiskResult};

const REC_START: u32 = 0xD15C_0A11;
const REC_END: u32 = 0x0E0F_0E0F;

/// One logged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub has_value: bool,
    pub version: u64,
    pub key: Bytes,
    pub value: Vec<Bytes>,
}

impl LogRecord {
    /// Appends the serialized record to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&REC_START.to_le_bytes());
        buf.push(u8::from(self.has_value));
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        for col in &self.value {
            buf.extend_from_slice(&(col.len() as u32).to_le_bytes());
            buf.extend_from_slice(col);
        }
        buf.extend_from_slice(&REC_END.to_le_bytes());
    }

    /// Decodes one record off the front of `data`. Returns `None` at a
    /// clean end of segment (empty input or a torn tail record).
    pub fn decode(data: &[u8]) -> DiskResult<Option<(Self, &[u8])>> {
        if data.is_empty() {
            return Ok(None);
        }
        // Preallocated zero tail.
        if data.len() < 4 || data[..4] == [0, 0, 0, 0] {
            return Ok(None);
        }

        let mut r = Reader { data, pos: 0 };
        let start = match r.u32() {
            Some(s) => s,
            None => return Ok(None),
        };
        if start != REC_START {
            return Err(DiskError::Corrupt(format!("bad record start {start:#x}")));
        }

        let parse = |r: &mut Reader| -> Option<LogRecord> {
            let has_value = r.u8()? != 0;
            let version = r.u64()?;
            let key_len = r.u32()? as usize;
            let key = r.bytes(key_len)?;
            let ncols = r.u32()? as usize;
            let mut value = Vec::with_capacity(ncols);
            for _ in 0..ncols {
                let len = r.u32()? as usize;
                value.push(r.bytes(len)?);
            }
            if r.u32()? != REC_END {
                return None;
            }
            Some(LogRecord { has_value, version, key, value })
        };

        match parse(&mut r) {
            Some(rec) => Ok(Some((rec, &data[r.pos..]))),
            // A started-but-unfinished record is a torn tail write.
            None => Ok(None),
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u32(&mut self) -> Option<u32> {
        let slice = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes(slice.try_into().unwrap()))
    }

    fn u64(&mut self) -> Option<u64> {
        let slice = self.data.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_le_bytes(slice.try_into().unwrap()))
    }

    fn bytes(&mut self, len: usize) -> Option<Bytes> {
        let slice = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(Bytes::copy_from_slice(slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn records_decode_in_sequence() {
        let put = LogRecord {
            has_value: true,
            version: 7,
            key: b("alice"),
            value: vec![b("30"), b("")],
        };
        let del = LogRecord { has_value: false, version: 0, key: b("bob"), value: vec![] };

        let mut buf = Vec::new();
        put.encode_into(&mut buf);
        del.encode_into(&mut buf);

        let (first, rest) = LogRecord::decode(&buf).unwrap().unwrap();
        assert_eq!(first, put);
        let (second, rest) = LogRecord::decode(rest).unwrap().unwrap();
        assert_eq!(second, del);
        assert!(LogRecord::decode(rest).unwrap().is_none());
    }

    #[test]
    fn torn_tail_is_end_of_segment() {
        let rec = LogRecord { has_value: true, version: 1, key: b("k"), value: vec![b("v")] };
        let mut buf = Vec::new();
        rec.encode_into(&mut buf);
        buf.truncate(buf.len() - 3);
        assert!(LogRecord::decode(&buf).unwrap().is_none());
    }

    #[test]
    fn zero_fill_is_end_of_segment() {
        assert!(LogRecord::decode(&[0u8; 64]).unwrap().is_none());
    }

    #[test]
    fn garbage_start_is_corrupt() {
        assert!(LogRecord::decode(&[0xde, 0xad, 0xbe, 0xef, 1, 2, 3]).is_err());
    }
}

//! Length-prefixed, named-field record codec for on-disk state.
//!
//! Every state file the device writes (`settings`, `deviceid`,
//! `WiFiAccount`, the pending-barcode queue) uses the same self-describing
//! layout so the files survive schema drift and can be read from any
//! implementation language:
//!
//! ```text
//! record := field*
//! field  := nameLen:u16le name:bytes tag:u8 valLen:u32le value:bytes
//! tag    := 1 (UTF-8 string) | 2 (i64le) | 3 (u64le)
//! ```
//!
//! Decoders look fields up by name and ignore fields they do not know.
//! Timestamps are i64 nanoseconds since the Unix epoch.

use std::collections::HashMap;

use thiserror::Error;

const TAG_STR: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_U64: u8 = 3;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record truncated while reading {0}")]
    Truncated(&'static str),

    #[error("unknown field tag {0}")]
    UnknownTag(u8),

    #[error("field name is not valid UTF-8")]
    BadName,

    #[error("string field {0:?} is not valid UTF-8")]
    BadString(String),

    #[error("missing field {0:?}")]
    Missing(&'static str),

    #[error("field {0:?} has the wrong type")]
    WrongType(&'static str),

    #[error("field {0:?} has an invalid value")]
    InvalidValue(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    I64(i64),
    U64(u64),
}

/// Serializes a record field by field. Field order is preserved on disk but
/// is irrelevant to decoders.
#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_str(&mut self, name: &str, value: &str) -> &mut Self {
        self.header(name, TAG_STR, value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn put_i64(&mut self, name: &str, value: i64) -> &mut Self {
        self.header(name, TAG_I64, 8);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, name: &str, value: u64) -> &mut Self {
        self.header(name, TAG_U64, 8);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn header(&mut self, name: &str, tag: u8, len: u32) {
        debug_assert!(name.len() <= u16::MAX as usize);
        self.buf
            .extend_from_slice(&(name.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(tag);
        self.buf.extend_from_slice(&len.to_le_bytes());
    }
}

/// Parsed record, fields accessible by name.
#[derive(Debug)]
pub struct RecordReader {
    fields: HashMap<String, Value>,
}

impl RecordReader {
    pub fn parse(mut input: &[u8]) -> Result<Self, RecordError> {
        let mut fields = HashMap::new();

        while !input.is_empty() {
            let name_len = take(&mut input, 2, "field name length")?;
            let name_len = u16::from_le_bytes([name_len[0], name_len[1]]) as usize;
            let name = take(&mut input, name_len, "field name")?;
            let name = std::str::from_utf8(name)
                .map_err(|_| RecordError::BadName)?
                .to_owned();

            let tag = take(&mut input, 1, "field tag")?[0];
            let val_len = take(&mut input, 4, "value length")?;
            let val_len = u32::from_le_bytes([val_len[0], val_len[1], val_len[2], val_len[3]]);
            let raw = take(&mut input, val_len as usize, "field value")?;

            let value = match tag {
                TAG_STR => Value::Str(
                    std::str::from_utf8(raw)
                        .map_err(|_| RecordError::BadString(name.clone()))?
                        .to_owned(),
                ),
                TAG_I64 => {
                    if raw.len() != 8 {
                        return Err(RecordError::Truncated("i64 value"));
                    }
                    Value::I64(i64::from_le_bytes(raw.try_into().unwrap()))
                }
                TAG_U64 => {
                    if raw.len() != 8 {
                        return Err(RecordError::Truncated("u64 value"));
                    }
                    Value::U64(u64::from_le_bytes(raw.try_into().unwrap()))
                }
                other => return Err(RecordError::UnknownTag(other)),
            };

            fields.insert(name, value);
        }

        Ok(Self { fields })
    }

    pub fn str(&self, name: &'static str) -> Result<&str, RecordError> {
        match self.fields.get(name) {
            Some(Value::Str(s)) => Ok(s),
            Some(_) => Err(RecordError::WrongType(name)),
            None => Err(RecordError::Missing(name)),
        }
    }

    pub fn i64(&self, name: &'static str) -> Result<i64, RecordError> {
        match self.fields.get(name) {
            Some(Value::I64(v)) => Ok(*v),
            Some(_) => Err(RecordError::WrongType(name)),
            None => Err(RecordError::Missing(name)),
        }
    }

    pub fn u64(&self, name: &'static str) -> Result<u64, RecordError> {
        match self.fields.get(name) {
            Some(Value::U64(v)) => Ok(*v),
            Some(_) => Err(RecordError::WrongType(name)),
            None => Err(RecordError::Missing(name)),
        }
    }
}

fn take<'a>(input: &mut &'a [u8], n: usize, what: &'static str) -> Result<&'a [u8], RecordError> {
    if input.len() < n {
        return Err(RecordError::Truncated(what));
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

/// A struct with a stable on-disk record representation.
pub trait Record: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self, RecordError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_types() {
        let mut w = RecordWriter::new();
        w.put_str("SSID", "warehouse-ap")
            .put_i64("CreatedAt", -42)
            .put_u64("DeviceID", 7);
        let r = RecordReader::parse(&w.into_bytes()).unwrap();

        assert_eq!(r.str("SSID").unwrap(), "warehouse-ap");
        assert_eq!(r.i64("CreatedAt").unwrap(), -42);
        assert_eq!(r.u64("DeviceID").unwrap(), 7);
    }

    #[test]
    fn empty_record_parses() {
        let r = RecordReader::parse(&[]).unwrap();
        assert!(matches!(r.str("Anything"), Err(RecordError::Missing(_))));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut w = RecordWriter::new();
        w.put_str("Currier", "3").put_u64("FutureField", 99);
        let r = RecordReader::parse(&w.into_bytes()).unwrap();
        assert_eq!(r.str("Currier").unwrap(), "3");
    }

    #[test]
    fn field_order_is_irrelevant() {
        let mut a = RecordWriter::new();
        a.put_str("SSID", "x").put_str("PW", "y");
        let mut b = RecordWriter::new();
        b.put_str("PW", "y").put_str("SSID", "x");

        let ra = RecordReader::parse(&a.into_bytes()).unwrap();
        let rb = RecordReader::parse(&b.into_bytes()).unwrap();
        assert_eq!(ra.str("SSID").unwrap(), rb.str("SSID").unwrap());
        assert_eq!(ra.str("PW").unwrap(), rb.str("PW").unwrap());
    }

    #[test]
    fn truncated_input_errors() {
        let mut w = RecordWriter::new();
        w.put_str("Barcode", "4006381333931");
        let bytes = w.into_bytes();
        assert!(RecordReader::parse(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn wrong_type_is_reported() {
        let mut w = RecordWriter::new();
        w.put_u64("Direction", 1);
        let r = RecordReader::parse(&w.into_bytes()).unwrap();
        assert!(matches!(
            r.str("Direction"),
            Err(RecordError::WrongType("Direction"))
        ));
    }

    #[test]
    fn unknown_tag_errors() {
        // name "X", tag 9, zero-length value
        let bytes = [1u8, 0, b'X', 9, 0, 0, 0, 0];
        assert!(matches!(
            RecordReader::parse(&bytes),
            Err(RecordError::UnknownTag(9))
        ));
    }
}

//! NablaDB, the typed binary configuration container.
//!
//! A database is a 16-byte header followed by a flat sequence of records:
//!
//! ```text
//! header:   magic[8] = "_NABLADB", size: u32, crc: u32
//! record:   type: u8, name_len: u32, data_len_or_element_count: u32,
//!           name[name_len], data[data_len]
//! element:  type: u8 (0x40 | array type), data_len: u32, data[data_len]
//! end:      a record with type 0
//! ```
//!
//! `size` counts the payload bytes after the header, including the end
//! record. `crc` is CRC-32/IEEE over the whole file with the CRC field
//! zeroed. An array record carries an element count instead of a data
//! length; its elements follow as standalone element records. All integers
//! are little-endian.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

use alloc::vec::Vec;
use core::fmt;

pub const MAGIC: [u8; 8] = *b"_NABLADB";
pub const HEADER_LEN: usize = 16;
pub const RECORD_HEADER_LEN: usize = 9;
pub const ELEMENT_HEADER_LEN: usize = 5;

pub const ARRAY_FLAG: u8 = 0x80;
pub const ARRAY_ELEMENT_FLAG: u8 = 0xC0;

/// Base type codes. Array records use `ARRAY_FLAG | code`, array elements
/// `ARRAY_ELEMENT_FLAG | code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeCode {
    End = 0x00,
    Null = 0x01,
    Byte = 0x02,
    Word = 0x03,
    Dword = 0x04,
    Qword = 0x05,
    Bool = 0x06,
    Utf8 = 0x07,
    Timestamp = 0x08,
    Uuid = 0x09,
    Float = 0x0A,
    Double = 0x0B,
    Multi = 0x0C,
}

impl TypeCode {
    pub fn from_raw(raw: u8) -> Option<TypeCode> {
        match raw & !ARRAY_ELEMENT_FLAG {
            0x00 => Some(TypeCode::End),
            0x01 => Some(TypeCode::Null),
            0x02 => Some(TypeCode::Byte),
            0x03 => Some(TypeCode::Word),
            0x04 => Some(TypeCode::Dword),
            0x05 => Some(TypeCode::Qword),
            0x06 => Some(TypeCode::Bool),
            0x07 => Some(TypeCode::Utf8),
            0x08 => Some(TypeCode::Timestamp),
            0x09 => Some(TypeCode::Uuid),
            0x0A => Some(TypeCode::Float),
            0x0B => Some(TypeCode::Double),
            0x0C => Some(TypeCode::Multi),
            _ => None,
        }
    }

    /// Fixed payload length of the type, 0 for variable-length types.
    pub fn fixed_len(self) -> usize {
        match self {
            TypeCode::End | TypeCode::Null => 0,
            TypeCode::Byte | TypeCode::Bool => 1,
            TypeCode::Word => 2,
            TypeCode::Dword | TypeCode::Float => 4,
            TypeCode::Qword | TypeCode::Timestamp | TypeCode::Double => 8,
            TypeCode::Uuid => 16,
            TypeCode::Utf8 | TypeCode::Multi => 0,
        }
    }

    pub fn is_variable_length(self) -> bool {
        matches!(self, TypeCode::Utf8 | TypeCode::Multi)
    }
}

pub fn is_array_element(raw: u8) -> bool {
    raw & ARRAY_ELEMENT_FLAG == ARRAY_ELEMENT_FLAG
}

pub fn is_array(raw: u8) -> bool {
    raw & ARRAY_ELEMENT_FLAG == ARRAY_FLAG
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    TooShort,
    BadMagic,
    BadChecksum,
    Truncated,
    UnknownType(u8),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TooShort => write!(f, "file shorter than the header"),
            Error::BadMagic => write!(f, "bad magic"),
            Error::BadChecksum => write!(f, "checksum mismatch"),
            Error::Truncated => write!(f, "record extends past the payload"),
            Error::UnknownType(t) => write!(f, "unknown record type {t:#04x}"),
        }
    }
}

/// One record of a parsed database. `name` is empty for array elements.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub raw_type: u8,
    pub name: &'a [u8],
    pub data: &'a [u8],
    /// Element count for array records, 0 otherwise.
    pub element_count: u32,
    /// Payload offset of this record.
    offset: usize,
    /// Payload offset of the record following this one.
    next_offset: usize,
}

impl<'a> Record<'a> {
    pub fn type_code(&self) -> Option<TypeCode> {
        TypeCode::from_raw(self.raw_type)
    }

    /// Payload offset of this record, usable with [`Database::record_at`].
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Payload offset of the record following this one.
    pub fn next_offset(&self) -> usize {
        self.next_offset
    }

    pub fn is_array(&self) -> bool {
        is_array(self.raw_type)
    }

    pub fn is_array_element(&self) -> bool {
        is_array_element(self.raw_type)
    }

    pub fn name_str(&self) -> Option<&'a str> {
        core::str::from_utf8(self.name).ok()
    }

    /// String payload with the stored NUL terminator stripped.
    pub fn as_str(&self) -> Option<&'a str> {
        if self.type_code() != Some(TypeCode::Utf8) {
            return None;
        }
        let data = match self.data.split_last() {
            Some((0, rest)) => rest,
            _ => self.data,
        };
        core::str::from_utf8(data).ok()
    }

    pub fn as_bool(&self) -> Option<bool> {
        if self.type_code() == Some(TypeCode::Bool) {
            self.data.first().map(|b| *b != 0)
        } else {
            None
        }
    }

    pub fn as_dword(&self) -> Option<u32> {
        if self.type_code() == Some(TypeCode::Dword) {
            Some(u32::from_le_bytes(self.data.try_into().ok()?))
        } else {
            None
        }
    }

    pub fn as_qword(&self) -> Option<u64> {
        if self.type_code() == Some(TypeCode::Qword) {
            Some(u64::from_le_bytes(self.data.try_into().ok()?))
        } else {
            None
        }
    }
}

/// A verified, borrowed database image.
#[derive(Clone, Copy)]
pub struct Database<'a> {
    payload: &'a [u8],
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(
        bytes.get(offset..offset + 4)?.try_into().ok()?,
    ))
}

/// CRC-32/IEEE over the file with the CRC field treated as zero.
fn file_crc(bytes: &[u8], payload_end: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..12]);
    hasher.update(&[0, 0, 0, 0]);
    hasher.update(&bytes[HEADER_LEN..payload_end]);
    hasher.finalize()
}

impl<'a> Database<'a> {
    /// Parse and verify a database image. The image must hold the whole
    /// file; the checksum is recomputed with the CRC field zeroed.
    pub fn parse(bytes: &'a [u8]) -> Result<Database<'a>, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::TooShort);
        }
        if bytes[..8] != MAGIC {
            return Err(Error::BadMagic);
        }
        let size = read_u32(bytes, 8).ok_or(Error::TooShort)? as usize;
        let end = HEADER_LEN.checked_add(size).ok_or(Error::Truncated)?;
        if bytes.len() < end {
            return Err(Error::Truncated);
        }
        let crc = read_u32(bytes, 12).ok_or(Error::TooShort)?;
        if crc != file_crc(bytes, end) {
            return Err(Error::BadChecksum);
        }
        Ok(Database {
            payload: &bytes[HEADER_LEN..end],
        })
    }

    /// Checksum-only verification.
    pub fn verify(bytes: &[u8]) -> bool {
        Database::parse(bytes).is_ok()
    }

    /// Parse without checksum verification, for images already verified
    /// once and held in memory.
    pub fn parse_unchecked(bytes: &'a [u8]) -> Result<Database<'a>, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::TooShort);
        }
        if bytes[..8] != MAGIC {
            return Err(Error::BadMagic);
        }
        let size = read_u32(bytes, 8).ok_or(Error::TooShort)? as usize;
        let end = HEADER_LEN.checked_add(size).ok_or(Error::Truncated)?;
        if bytes.len() < end {
            return Err(Error::Truncated);
        }
        Ok(Database {
            payload: &bytes[HEADER_LEN..end],
        })
    }

    /// Decode the record starting at the given payload offset. Returns
    /// `Ok(None)` for the end record.
    pub fn record_at(&self, offset: usize) -> Result<Option<Record<'a>>, Error> {
        let raw_type = *self.payload.get(offset).ok_or(Error::Truncated)?;
        if raw_type == TypeCode::End as u8 {
            return Ok(None);
        }
        TypeCode::from_raw(raw_type).ok_or(Error::UnknownType(raw_type))?;

        if is_array_element(raw_type) {
            let data_len = read_u32(self.payload, offset + 1).ok_or(Error::Truncated)? as usize;
            let data_start = offset + ELEMENT_HEADER_LEN;
            let data = self
                .payload
                .get(data_start..data_start + data_len)
                .ok_or(Error::Truncated)?;
            return Ok(Some(Record {
                raw_type,
                name: &[],
                data,
                element_count: 0,
                offset,
                next_offset: data_start + data_len,
            }));
        }

        let name_len = read_u32(self.payload, offset + 1).ok_or(Error::Truncated)? as usize;
        let second = read_u32(self.payload, offset + 5).ok_or(Error::Truncated)?;
        let name_start = offset + RECORD_HEADER_LEN;
        let name = self
            .payload
            .get(name_start..name_start + name_len)
            .ok_or(Error::Truncated)?;

        if is_array(raw_type) {
            // Elements follow as separate records.
            Ok(Some(Record {
                raw_type,
                name,
                data: &[],
                element_count: second,
                offset,
                next_offset: name_start + name_len,
            }))
        } else {
            let data_len = second as usize;
            let data_start = name_start + name_len;
            let data = self
                .payload
                .get(data_start..data_start + data_len)
                .ok_or(Error::Truncated)?;
            Ok(Some(Record {
                raw_type,
                name,
                data,
                element_count: 0,
                offset,
                next_offset: data_start + data_len,
            }))
        }
    }

    /// First record of the payload.
    pub fn first(&self) -> Result<Option<Record<'a>>, Error> {
        self.record_at(0)
    }

    /// Record following `last`, or `None` once the end record is reached.
    pub fn next_after(&self, last: &Record<'a>) -> Result<Option<Record<'a>>, Error> {
        self.record_at(last.next_offset)
    }

    pub fn iter(&self) -> RecordIter<'a> {
        RecordIter {
            db: *self,
            offset: 0,
            failed: false,
        }
    }

    /// Find a named record. Array elements are skipped over; a match on an
    /// array record returns the array record itself.
    pub fn find(&self, name: &str) -> Option<Record<'a>> {
        self.iter()
            .find(|r| !r.is_array_element() && r.name == name.as_bytes())
    }
}

pub struct RecordIter<'a> {
    db: Database<'a>,
    offset: usize,
    failed: bool,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        if self.failed {
            return None;
        }
        match self.db.record_at(self.offset) {
            Ok(Some(record)) => {
                self.offset = record.next_offset;
                Some(record)
            }
            Ok(None) => None,
            Err(_) => {
                self.failed = true;
                None
            }
        }
    }
}

/// Serializer producing the bit-exact on-disk form.
#[derive(Default)]
pub struct Writer {
    payload: Vec<u8>,
}

impl Writer {
    pub fn new() -> Writer {
        Writer::default()
    }

    fn push_record_header(&mut self, raw_type: u8, name: &str, second: u32) {
        self.payload.push(raw_type);
        self.payload
            .extend_from_slice(&(name.len() as u32).to_le_bytes());
        self.payload.extend_from_slice(&second.to_le_bytes());
        self.payload.extend_from_slice(name.as_bytes());
    }

    fn push_value(&mut self, type_code: TypeCode, name: &str, data: &[u8]) -> &mut Writer {
        self.push_record_header(type_code as u8, name, data.len() as u32);
        self.payload.extend_from_slice(data);
        self
    }

    pub fn push_null(&mut self, name: &str) -> &mut Writer {
        self.push_value(TypeCode::Null, name, &[])
    }

    pub fn push_byte(&mut self, name: &str, value: u8) -> &mut Writer {
        self.push_value(TypeCode::Byte, name, &[value])
    }

    pub fn push_word(&mut self, name: &str, value: u16) -> &mut Writer {
        self.push_value(TypeCode::Word, name, &value.to_le_bytes())
    }

    pub fn push_dword(&mut self, name: &str, value: u32) -> &mut Writer {
        self.push_value(TypeCode::Dword, name, &value.to_le_bytes())
    }

    pub fn push_qword(&mut self, name: &str, value: u64) -> &mut Writer {
        self.push_value(TypeCode::Qword, name, &value.to_le_bytes())
    }

    pub fn push_bool(&mut self, name: &str, value: bool) -> &mut Writer {
        self.push_value(TypeCode::Bool, name, &[value as u8])
    }

    /// Strings are stored with a trailing NUL, which the readers strip.
    pub fn push_str(&mut self, name: &str, value: &str) -> &mut Writer {
        self.push_record_header(TypeCode::Utf8 as u8, name, value.len() as u32 + 1);
        self.payload.extend_from_slice(value.as_bytes());
        self.payload.push(0);
        self
    }

    pub fn push_timestamp(&mut self, name: &str, value: u64) -> &mut Writer {
        self.push_value(TypeCode::Timestamp, name, &value.to_le_bytes())
    }

    pub fn push_uuid(&mut self, name: &str, value: &[u8; 16]) -> &mut Writer {
        self.push_value(TypeCode::Uuid, name, value)
    }

    pub fn push_float(&mut self, name: &str, value: f32) -> &mut Writer {
        self.push_value(TypeCode::Float, name, &value.to_le_bytes())
    }

    pub fn push_double(&mut self, name: &str, value: f64) -> &mut Writer {
        self.push_value(TypeCode::Double, name, &value.to_le_bytes())
    }

    pub fn push_multi(&mut self, name: &str, value: &[u8]) -> &mut Writer {
        self.push_value(TypeCode::Multi, name, value)
    }

    /// String array: one array record followed by NUL-terminated elements.
    pub fn push_str_array<'s>(
        &mut self,
        name: &str,
        values: impl IntoIterator<Item = &'s str>,
    ) -> &mut Writer {
        let mut count = 0u32;
        let mut elements = Vec::new();
        for value in values {
            elements.push(ARRAY_ELEMENT_FLAG | TypeCode::Utf8 as u8);
            elements.extend_from_slice(&(value.len() as u32 + 1).to_le_bytes());
            elements.extend_from_slice(value.as_bytes());
            elements.push(0);
            count += 1;
        }
        self.push_record_header(ARRAY_FLAG | TypeCode::Utf8 as u8, name, count);
        self.payload.extend_from_slice(&elements);
        self
    }

    /// Append the end record, prepend the header, fill in the checksum.
    pub fn finish(mut self) -> Vec<u8> {
        self.payload
            .extend_from_slice(&[TypeCode::End as u8, 0, 0, 0, 0, 0, 0, 0, 0]);

        let mut file = Vec::with_capacity(HEADER_LEN + self.payload.len());
        file.extend_from_slice(&MAGIC);
        file.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        file.extend_from_slice(&[0, 0, 0, 0]);
        file.extend_from_slice(&self.payload);

        let crc = file_crc(&file, file.len());
        file[12..16].copy_from_slice(&crc.to_le_bytes());
        file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn sample() -> Vec<u8> {
        let mut w = Writer::new();
        w.push_str("DriverDatabasePath", "/initrd/drivers")
            .push_bool("DeviceDriver", true)
            .push_dword("Revision", 7)
            .push_qword("Stamp", 0x1122_3344_5566_7788)
            .push_str_array("DeviceId", ["PCI/8086/100E", "PCI/STORAGE/AHCI"]);
        w.finish()
    }

    #[test]
    fn header_layout() {
        let file = sample();
        assert_eq!(&file[..8], b"_NABLADB");
        let size = u32::from_le_bytes(file[8..12].try_into().unwrap()) as usize;
        assert_eq!(file.len(), HEADER_LEN + size);
    }

    #[test]
    fn parse_round_trip_is_bytewise_identical() {
        let file = sample();
        let db = Database::parse(&file).unwrap();

        // Rebuild the same logical content and compare the raw bytes.
        let mut w = Writer::new();
        for record in db.iter() {
            if record.is_array_element() {
                continue;
            }
            match record.type_code().unwrap() {
                TypeCode::Utf8 if record.is_array() => {
                    let mut values = vec![];
                    let mut cursor = Some(record);
                    while let Some(r) = db.next_after(&cursor.unwrap()).unwrap() {
                        if !r.is_array_element() {
                            break;
                        }
                        values.push(r.as_str().unwrap());
                        cursor = Some(r);
                    }
                    w.push_str_array(record.name_str().unwrap(), values);
                }
                TypeCode::Utf8 => {
                    w.push_str(record.name_str().unwrap(), record.as_str().unwrap());
                }
                TypeCode::Bool => {
                    w.push_bool(record.name_str().unwrap(), record.as_bool().unwrap());
                }
                TypeCode::Dword => {
                    w.push_dword(record.name_str().unwrap(), record.as_dword().unwrap());
                }
                TypeCode::Qword => {
                    w.push_qword(record.name_str().unwrap(), record.as_qword().unwrap());
                }
                other => panic!("unexpected type {other:?}"),
            }
        }
        assert_eq!(w.finish(), file);
    }

    #[test]
    fn every_single_byte_flip_breaks_verification() {
        let file = sample();
        assert!(Database::verify(&file));
        for i in 0..file.len() {
            let mut corrupted = file.clone();
            corrupted[i] ^= 0x5A;
            assert!(
                !Database::verify(&corrupted),
                "flip at byte {i} went undetected"
            );
        }
    }

    #[test]
    fn find_and_read_string() {
        // The scenario from the boot path: a single path entry.
        let mut w = Writer::new();
        w.push_str("path", "/bin");
        let file = w.finish();

        let db = Database::parse(&file).unwrap();
        let record = db.find("path").expect("entry should be found");
        assert_eq!(record.type_code(), Some(TypeCode::Utf8));
        assert_eq!(record.data, b"/bin\0");
        assert_eq!(record.as_str(), Some("/bin"));
        assert!(db.find("missing").is_none());
    }

    #[test]
    fn array_walk_visits_elements_in_order() {
        let file = sample();
        let db = Database::parse(&file).unwrap();

        let array = db.find("DeviceId").unwrap();
        assert!(array.is_array());
        assert_eq!(array.element_count, 2);

        let first = db.next_after(&array).unwrap().unwrap();
        assert!(first.is_array_element());
        assert_eq!(first.as_str(), Some("PCI/8086/100E"));

        let second = db.next_after(&first).unwrap().unwrap();
        assert_eq!(second.as_str(), Some("PCI/STORAGE/AHCI"));

        // The record after the last element is the end record.
        assert!(db.next_after(&second).unwrap().is_none());
    }

    #[test]
    fn fixed_lengths_match_the_format() {
        assert_eq!(TypeCode::Null.fixed_len(), 0);
        assert_eq!(TypeCode::Byte.fixed_len(), 1);
        assert_eq!(TypeCode::Word.fixed_len(), 2);
        assert_eq!(TypeCode::Dword.fixed_len(), 4);
        assert_eq!(TypeCode::Qword.fixed_len(), 8);
        assert_eq!(TypeCode::Uuid.fixed_len(), 16);
        assert!(TypeCode::Utf8.is_variable_length());
        assert!(TypeCode::Multi.is_variable_length());
        assert!(!TypeCode::Dword.is_variable_length());
    }

    #[test]
    fn truncated_and_mislabeled_files_are_rejected() {
        let file = sample();
        assert!(matches!(
            Database::parse(&file[..4]).err(),
            Some(Error::TooShort)
        ));

        let mut bad_magic = file.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            Database::parse(&bad_magic).err(),
            Some(Error::BadMagic)
        ));

        // Cutting the payload short must be caught before the CRC pass.
        let mut short = file.clone();
        short.truncate(file.len() - 1);
        assert!(matches!(
            Database::parse(&short).err(),
            Some(Error::Truncated)
        ));
    }
}

//! Cursor access to NablaDB configuration files.
//!
//! A handle owns a verified in-memory copy of the database and iterates
//! named entries statefully: repeated queries for the same name walk the
//! elements of an array entry one by one, and report "not found" once
//! exhausted. A scalar entry is delivered exactly once per cursor rewind.

use alloc::string::String;
use alloc::vec::Vec;

use nabladb::{Database, Record, TypeCode};

use crate::io::fs;
use crate::status::{Result, Status};

pub struct DbHandle {
    data: Vec<u8>,
    /// Offset of the last delivered record.
    last: Option<usize>,
    /// Offset of the array entry currently being walked.
    array: Option<usize>,
}

/// Owned snapshot of a record's framing, so the cursor can mutate itself
/// without holding a borrow of the payload.
struct RecordInfo {
    offset: usize,
    next_offset: usize,
    is_element: bool,
    is_array: bool,
    #[allow(dead_code)]
    name_len: usize,
    type_code: Option<TypeCode>,
}

/// Open and verify a database file through the boot filesystem.
pub fn open(path: &str) -> Result<DbHandle> {
    let data = fs::read_file(path)?;
    if Database::parse(&data).is_err() {
        return Err(Status::DatabaseBroken);
    }
    Ok(DbHandle {
        data,
        last: None,
        array: None,
    })
}

impl DbHandle {
    fn database(&self) -> Database<'_> {
        // Verified at open; the size header cannot have changed.
        Database::parse_unchecked(&self.data).expect("verified at open")
    }

    pub fn rewind(&mut self) {
        self.last = None;
        self.array = None;
    }

    fn record_at(&self, offset: usize) -> Option<Record<'_>> {
        self.database().record_at(offset).ok().flatten()
    }

    fn peek(&self, offset: usize) -> Option<RecordInfo> {
        let record = self.record_at(offset)?;
        Some(RecordInfo {
            offset: record.offset(),
            next_offset: record.next_offset(),
            is_element: record.is_array_element(),
            is_array: record.is_array(),
            name_len: record.name.len(),
            type_code: record.type_code(),
        })
    }

    fn name_at(&self, offset: usize, name: &str) -> bool {
        self.record_at(offset)
            .map(|r| r.name == name.as_bytes())
            .unwrap_or(false)
    }

    fn find_offset(&self, name: &str) -> Option<usize> {
        self.database().find(name).map(|r| r.offset())
    }

    fn reset(&mut self) {
        self.last = None;
        self.array = None;
    }

    /// Walk array elements starting at `offset` until one matches the
    /// wanted type.
    fn walk_elements(&mut self, mut offset: usize, wanted: TypeCode) -> Option<usize> {
        loop {
            let info = match self.peek(offset) {
                Some(info) if info.is_element => info,
                _ => {
                    self.reset();
                    return None;
                }
            };
            self.last = Some(info.offset);
            if info.type_code == Some(wanted) {
                return Some(info.offset);
            }
            offset = info.next_offset;
        }
    }

    /// Core cursor step shared by the typed getters.
    fn get_next(&mut self, name: &str, wanted: TypeCode) -> Option<usize> {
        let continuing_array = self
            .array
            .map(|offset| self.name_at(offset, name))
            .unwrap_or(false);

        if continuing_array {
            // Resume behind the previously delivered element.
            let resume_at = self.last.and_then(|offset| self.peek(offset));
            match resume_at {
                Some(last) => return self.walk_elements(last.next_offset, wanted),
                None => {
                    self.reset();
                    return None;
                }
            }
        }

        let already_delivered = match self.last.and_then(|offset| self.peek(offset)) {
            Some(last) => !last.is_element && self.name_at(last.offset, name),
            None => false,
        };
        if already_delivered {
            // Scalar entries are delivered once per rewind.
            self.reset();
            return None;
        }

        let entry = match self.find_offset(name).and_then(|o| self.peek(o)) {
            Some(entry) => entry,
            None => {
                self.reset();
                return None;
            }
        };

        if entry.is_array {
            self.array = Some(entry.offset);
            self.walk_elements(entry.next_offset, wanted)
        } else if entry.type_code == Some(wanted) {
            self.last = Some(entry.offset);
            self.array = None;
            Some(entry.offset)
        } else {
            self.reset();
            None
        }
    }

    /// Next string entry (or array element) named `name`.
    pub fn get_next_string(&mut self, name: &str) -> Result<String> {
        let offset = self
            .get_next(name, TypeCode::Utf8)
            .ok_or(Status::DatabaseEntryNotFound)?;
        let record = self.record_at(offset).ok_or(Status::DatabaseBroken)?;
        record
            .as_str()
            .map(String::from)
            .ok_or(Status::DatabaseBroken)
    }

    pub fn get_next_bool(&mut self, name: &str) -> Result<bool> {
        let offset = self
            .get_next(name, TypeCode::Bool)
            .ok_or(Status::DatabaseEntryNotFound)?;
        let record = self.record_at(offset).ok_or(Status::DatabaseBroken)?;
        record.as_bool().ok_or(Status::DatabaseBroken)
    }

    pub fn get_next_dword(&mut self, name: &str) -> Result<u32> {
        let offset = self
            .get_next(name, TypeCode::Dword)
            .ok_or(Status::DatabaseEntryNotFound)?;
        let record = self.record_at(offset).ok_or(Status::DatabaseBroken)?;
        record.as_dword().ok_or(Status::DatabaseBroken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nabladb::Writer;

    fn handle_from(writer: Writer) -> DbHandle {
        let data = writer.finish();
        assert!(Database::parse(&data).is_ok());
        DbHandle {
            data,
            last: None,
            array: None,
        }
    }

    fn sample() -> DbHandle {
        let mut writer = Writer::new();
        writer
            .push_str("ImageName", "ide.drv")
            .push_bool("DeviceDriver", true)
            .push_str_array("DeviceId", ["PCI/8086/7010", "PCI/STORAGE/IDE"])
            .push_str("Comment", "primary IDE controller");
        handle_from(writer)
    }

    #[test]
    fn scalar_is_delivered_once() {
        let mut db = sample();
        assert_eq!(db.get_next_string("ImageName").unwrap(), "ide.drv");
        assert_eq!(
            db.get_next_string("ImageName"),
            Err(Status::DatabaseEntryNotFound)
        );
        // A rewind starts over.
        db.rewind();
        assert_eq!(db.get_next_string("ImageName").unwrap(), "ide.drv");
    }

    #[test]
    fn array_elements_come_one_per_call() {
        let mut db = sample();
        assert_eq!(db.get_next_string("DeviceId").unwrap(), "PCI/8086/7010");
        assert_eq!(db.get_next_string("DeviceId").unwrap(), "PCI/STORAGE/IDE");
        assert_eq!(
            db.get_next_string("DeviceId"),
            Err(Status::DatabaseEntryNotFound)
        );
    }

    #[test]
    fn bool_and_missing_entries() {
        let mut db = sample();
        assert_eq!(db.get_next_bool("DeviceDriver"), Ok(true));
        assert_eq!(
            db.get_next_bool("FsDriver"),
            Err(Status::DatabaseEntryNotFound)
        );
    }

    #[test]
    fn interleaved_queries_reset_the_cursor() {
        let mut db = sample();
        assert_eq!(db.get_next_string("DeviceId").unwrap(), "PCI/8086/7010");
        // Asking for a different name abandons the array walk.
        assert_eq!(
            db.get_next_string("Comment").unwrap(),
            "primary IDE controller"
        );
        // And the next DeviceId query starts from the first element again.
        assert_eq!(db.get_next_string("DeviceId").unwrap(), "PCI/8086/7010");
    }

    #[test]
    fn type_mismatch_is_not_found() {
        let mut db = sample();
        assert_eq!(
            db.get_next_bool("ImageName"),
            Err(Status::DatabaseEntryNotFound)
        );
    }
}

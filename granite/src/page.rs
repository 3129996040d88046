//! The layout of a table page on disk.
//!
//! ```text
//! 0        8             12      16      20
//! +--------+-------------+-------+-------+-----------------+ ... +---------+
//! |page_lsn|next_page_id |lower  |upper  | slot directory ->     <- records |
//! +--------+-------------+-------+-------+-----------------+ ... +---------+
//! ```
//!
//! The slot directory grows forward from the header, one `{offset, size}`
//! entry per record; records grow backward from the end of the page.
//! All integers are big-endian.

use std::fmt;

use crate::record::{
    Column, Record, RecordHeader, DELETED_OFFSET, RECORD_HEADER_SIZE, XMAX_OFFSET,
};
use crate::{
    CommandId, Lsn, PageId, Result, Rid, SlotId, StorageError, TransactionId, NULL_PAGE,
    NULL_XID, PAGE_SIZE,
};

pub const PAGE_HEADER_SIZE: usize = 20;
pub const SLOT_SIZE: usize = 8;
/// Largest record that fits on an empty page.
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - SLOT_SIZE;

const LSN_OFFSET: usize = 0;
const NEXT_PAGE_OFFSET: usize = 8;
const LOWER_OFFSET: usize = 12;
const UPPER_OFFSET: usize = 16;

/// A fixed-size block of data that is read from and written to disk.
#[derive(Clone)]
pub struct Page {
    pub id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    /// Returns a page with an initialised, empty header.
    pub fn new(id: PageId) -> Self {
        let mut page = Page {
            id,
            data: [0; PAGE_SIZE],
        };
        page.table_mut().init();
        page
    }

    pub fn table(&self) -> TablePage<&[u8]> {
        TablePage::new(self.id, &self.data[..])
    }

    pub fn table_mut(&mut self) -> TablePage<&mut [u8]> {
        TablePage::new(self.id, &mut self.data[..])
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table();
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("page_lsn", &table.page_lsn())
            .field("next_page_id", &table.next_page_id())
            .field("lower", &table.lower())
            .field("upper", &table.upper())
            .finish()
    }
}

/// One entry of the slot directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: u32,
    pub size: u32,
}

/// Typed view of a slotted table page over a byte buffer.
pub struct TablePage<B> {
    page_id: PageId,
    buf: B,
}

impl<B: AsRef<[u8]>> TablePage<B> {
    pub fn new(page_id: PageId, buf: B) -> Self {
        debug_assert_eq!(buf.as_ref().len(), PAGE_SIZE);
        Self { page_id, buf }
    }

    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let b = self.bytes();
        u32::from_be_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]])
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn page_lsn(&self) -> Lsn {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes()[LSN_OFFSET..LSN_OFFSET + 8]);
        Lsn::from_be_bytes(raw)
    }

    pub fn next_page_id(&self) -> PageId {
        self.read_u32(NEXT_PAGE_OFFSET)
    }

    pub fn lower(&self) -> u32 {
        self.read_u32(LOWER_OFFSET)
    }

    pub fn upper(&self) -> u32 {
        self.read_u32(UPPER_OFFSET)
    }

    /// Number of slot entries, live or logically deleted.
    pub fn record_count(&self) -> u32 {
        self.lower().saturating_sub(PAGE_HEADER_SIZE as u32) / SLOT_SIZE as u32
    }

    /// Bytes available for one more record including its slot entry.
    pub fn free_space_size(&self) -> usize {
        (self.upper() as usize).saturating_sub(self.lower() as usize + SLOT_SIZE)
    }

    pub fn slot(&self, slot_id: SlotId) -> Result<Slot> {
        if slot_id >= self.record_count() {
            return Err(StorageError::SlotOutOfRange {
                page_id: self.page_id,
                slot_id,
            });
        }
        let at = slot_position(slot_id);
        let slot = Slot {
            offset: self.read_u32(at),
            size: self.read_u32(at + 4),
        };
        let end = slot.offset as usize + slot.size as usize;
        if (slot.size as usize) < RECORD_HEADER_SIZE
            || (slot.offset as usize) < self.lower() as usize
            || end > PAGE_SIZE
        {
            return Err(StorageError::corruption(format!(
                "slot {slot_id} on page {} points outside the record area",
                self.page_id
            )));
        }
        Ok(slot)
    }

    /// Encoded bytes of the record in `slot_id`, header included.
    pub fn raw_record(&self, slot_id: SlotId) -> Result<&[u8]> {
        let slot = self.slot(slot_id)?;
        let start = slot.offset as usize;
        Ok(&self.bytes()[start..start + slot.size as usize])
    }

    pub fn record_header(&self, slot_id: SlotId) -> Result<RecordHeader> {
        RecordHeader::decode(self.raw_record(slot_id)?)
    }

    pub fn get_record(&self, rid: Rid, columns: &[Column]) -> Result<Record> {
        let mut record = Record::deserialize(self.raw_record(rid.slot_id)?, columns)?;
        record.rid = Some(rid);
        Ok(record)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> TablePage<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Resets the header to an empty page.
    pub fn init(&mut self) {
        self.set_page_lsn(0);
        self.set_next_page_id(NULL_PAGE);
        self.write_u32(LOWER_OFFSET, PAGE_HEADER_SIZE as u32);
        self.write_u32(UPPER_OFFSET, PAGE_SIZE as u32);
    }

    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        self.bytes_mut()[LSN_OFFSET..LSN_OFFSET + 8].copy_from_slice(&lsn.to_be_bytes());
    }

    pub fn set_next_page_id(&mut self, page_id: PageId) {
        self.write_u32(NEXT_PAGE_OFFSET, page_id);
    }

    fn write_slot(&mut self, slot_id: SlotId, slot: Slot) {
        let at = slot_position(slot_id);
        self.write_u32(at, slot.offset);
        self.write_u32(at + 4, slot.size);
    }

    /// Stamps the version header with `(xmin = xid, cid)` and stores the record.
    ///
    /// The caller is expected to have checked `free_space_size()`; a record
    /// that does not fit is rejected without touching the page.
    pub fn insert_record(
        &mut self,
        record: &mut Record,
        xid: TransactionId,
        cid: CommandId,
    ) -> Result<SlotId> {
        record.header = RecordHeader {
            deleted: false,
            xmin: xid,
            xmax: NULL_XID,
            cid,
        };
        let size = record.size();
        if size > self.free_space_size() {
            return Err(StorageError::RecordTooLarge {
                size,
                max: self.free_space_size(),
            });
        }
        let slot_id = self.record_count();
        let offset = self.upper() as usize - size;
        record.serialize_to(&mut self.bytes_mut()[offset..offset + size]);
        self.write_slot(
            slot_id,
            Slot {
                offset: offset as u32,
                size: size as u32,
            },
        );
        let lower = self.lower() + SLOT_SIZE as u32;
        self.write_u32(LOWER_OFFSET, lower);
        self.write_u32(UPPER_OFFSET, offset as u32);
        record.rid = Some(Rid::new(self.page_id, slot_id));
        Ok(slot_id)
    }

    /// Logical delete: sets the deleted flag and `xmax`, keeps the bytes.
    pub fn delete_record(&mut self, slot_id: SlotId, xid: TransactionId) -> Result<()> {
        let start = self.slot(slot_id)?.offset as usize;
        let bytes = self.bytes_mut();
        bytes[start + DELETED_OFFSET] = 1;
        bytes[start + XMAX_OFFSET..start + XMAX_OFFSET + 4].copy_from_slice(&xid.to_be_bytes());
        Ok(())
    }

    /// Clears the deleted flag and resets `xmax`. Rollback only.
    pub fn undo_delete_record(&mut self, slot_id: SlotId) -> Result<()> {
        let start = self.slot(slot_id)?.offset as usize;
        let bytes = self.bytes_mut();
        bytes[start + DELETED_OFFSET] = 0;
        bytes[start + XMAX_OFFSET..start + XMAX_OFFSET + 4]
            .copy_from_slice(&NULL_XID.to_be_bytes());
        Ok(())
    }

    /// Recovery path for an Insert log record: places the logged bytes
    /// verbatim at the logged offset and slot.
    pub fn redo_insert_record(
        &mut self,
        slot_id: SlotId,
        raw_record: &[u8],
        offset: u32,
        size: u32,
    ) -> Result<()> {
        let start = offset as usize;
        let end = start + size as usize;
        let lower = (PAGE_HEADER_SIZE + (slot_id as usize + 1) * SLOT_SIZE) as u32;
        let lower = lower.max(self.lower());
        if raw_record.len() != size as usize || end > PAGE_SIZE || (start as u32) < lower {
            return Err(StorageError::corruption(format!(
                "insert redo for slot {slot_id} does not fit page {}",
                self.page_id
            )));
        }
        self.bytes_mut()[start..end].copy_from_slice(raw_record);
        self.write_slot(slot_id, Slot { offset, size });
        let upper = self.upper().min(offset);
        self.write_u32(LOWER_OFFSET, lower);
        self.write_u32(UPPER_OFFSET, upper);
        Ok(())
    }
}

fn slot_position(slot_id: SlotId) -> usize {
    PAGE_HEADER_SIZE + slot_id as usize * SLOT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ColumnType, Value};
    use proptest::prelude::*;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("id", ColumnType::Int),
            Column::new("name", ColumnType::Text),
        ]
    }

    fn row(id: i32, name: &str) -> Record {
        Record::new(vec![Value::Int(id), Value::Text(name.to_string())])
    }

    #[test]
    fn init_resets_header() {
        let page = Page::new(3);
        let table = page.table();
        assert_eq!(table.page_lsn(), 0);
        assert_eq!(table.next_page_id(), NULL_PAGE);
        assert_eq!(table.lower(), PAGE_HEADER_SIZE as u32);
        assert_eq!(table.upper(), PAGE_SIZE as u32);
        assert_eq!(table.record_count(), 0);
        assert_eq!(table.free_space_size(), MAX_RECORD_SIZE);
    }

    #[test]
    fn insert_places_record_at_page_end() {
        let mut page = Page::new(0);
        let mut record = row(1, "alpha");
        let size = record.size() as u32;
        let slot = page.table_mut().insert_record(&mut record, 5, 2).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(record.rid, Some(Rid::new(0, 0)));

        let table = page.table();
        assert_eq!(table.upper(), PAGE_SIZE as u32 - size);
        assert_eq!(table.lower(), (PAGE_HEADER_SIZE + SLOT_SIZE) as u32);
        let stored = table.get_record(Rid::new(0, 0), &columns()).unwrap();
        assert_eq!(stored.header.xmin, 5);
        assert_eq!(stored.header.cid, 2);
        assert_eq!(stored.values, row(1, "alpha").values);
    }

    #[test]
    fn delete_and_undo_delete_toggle_version_header() {
        let mut page = Page::new(0);
        let mut record = row(1, "alpha");
        let slot = page.table_mut().insert_record(&mut record, 5, 0).unwrap();

        page.table_mut().delete_record(slot, 9).unwrap();
        let header = page.table().record_header(slot).unwrap();
        assert!(header.is_deleted());
        assert_eq!(header.xmax, 9);

        page.table_mut().undo_delete_record(slot).unwrap();
        let header = page.table().record_header(slot).unwrap();
        assert!(!header.deleted);
        assert_eq!(header.xmax, NULL_XID);
    }

    #[test]
    fn redo_insert_reproduces_identical_bytes() {
        let mut original = Page::new(0);
        let mut replayed = Page::new(0);
        for (i, name) in ["a", "bb", "ccc"].iter().enumerate() {
            let mut record = row(i as i32, name);
            let slot = original.table_mut().insert_record(&mut record, 1, 0).unwrap();
            let table = original.table();
            let s = table.slot(slot).unwrap();
            let raw = table.raw_record(slot).unwrap().to_vec();
            replayed
                .table_mut()
                .redo_insert_record(slot, &raw, s.offset, s.size)
                .unwrap();
        }
        assert_eq!(original.data[..], replayed.data[..]);
    }

    #[test]
    fn insert_rejects_records_that_do_not_fit() {
        let mut page = Page::new(0);
        let mut big = Record::new(vec![Value::Text("x".repeat(MAX_RECORD_SIZE))]);
        let err = page.table_mut().insert_record(&mut big, 1, 0).unwrap_err();
        assert!(matches!(err, StorageError::RecordTooLarge { .. }));
        assert_eq!(page.table().record_count(), 0);
    }

    #[test]
    fn out_of_range_slot_is_reported() {
        let page = Page::new(4);
        assert!(matches!(
            page.table().slot(0),
            Err(StorageError::SlotOutOfRange { page_id: 4, slot_id: 0 })
        ));
    }

    proptest! {
        #[test]
        fn inserts_until_full_keep_lower_below_upper(names in proptest::collection::vec("[a-z]{0,300}", 1..200)) {
            let mut page = Page::new(0);
            let mut stored = Vec::new();
            for (i, name) in names.iter().enumerate() {
                let mut record = row(i as i32, name);
                if record.size() > page.table().free_space_size() {
                    break;
                }
                let slot = page.table_mut().insert_record(&mut record, 1, 0).unwrap();
                stored.push((slot, record.values.clone()));
                prop_assert!(page.table().lower() <= page.table().upper());
            }
            for (slot, values) in stored {
                let record = page.table().get_record(Rid::new(0, slot), &columns()).unwrap();
                prop_assert_eq!(record.values, values);
            }
        }
    }
}

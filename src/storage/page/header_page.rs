use crate::common::{PageId, PAGE_SIZE};

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;

const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4; // name (32) + root_page_id (4)

/// Maximum number of index records the header page can hold
pub const MAX_HEADER_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// The header page lives at page id 0 and maps index names to their root
/// page ids. Each record is a fixed 36-byte slot: a zero-padded 32-byte name
/// followed by the root page id.
pub struct HeaderPage<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderPage<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn init(&mut self) {
        self.data.fill(0);
        self.set_record_count(0);
    }

    pub fn record_count(&self) -> u32 {
        u32::from_le_bytes(
            self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]
                .try_into()
                .unwrap(),
        )
    }

    fn set_record_count(&mut self, count: u32) {
        self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]
            .copy_from_slice(&count.to_le_bytes());
    }

    /// Inserts a new `(name, root_page_id)` record.
    /// Returns false if the name already exists or the page is full.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        assert!(name.len() <= NAME_SIZE, "index name too long");

        let count = self.record_count() as usize;
        if count >= MAX_HEADER_RECORDS || self.find_record(name).is_some() {
            return false;
        }

        let offset = Self::record_offset(count);
        self.data[offset..offset + NAME_SIZE].fill(0);
        self.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        self.data[offset + NAME_SIZE..offset + RECORD_SIZE]
            .copy_from_slice(&root_page_id.as_u32().to_le_bytes());
        self.set_record_count(count as u32 + 1);
        true
    }

    /// Rewrites the root page id of an existing record.
    /// Returns false if no record carries that name.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match self.find_record(name) {
            Some(index) => {
                let offset = Self::record_offset(index);
                self.data[offset + NAME_SIZE..offset + RECORD_SIZE]
                    .copy_from_slice(&root_page_id.as_u32().to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Drops a record, compacting the slot array.
    /// Returns false if no record carries that name.
    pub fn delete_record(&mut self, name: &str) -> bool {
        let count = self.record_count() as usize;
        match self.find_record(name) {
            Some(index) => {
                let start = Self::record_offset(index);
                let tail = Self::record_offset(count);
                self.data.copy_within(start + RECORD_SIZE..tail, start);
                self.set_record_count(count as u32 - 1);
                true
            }
            None => false,
        }
    }

    pub fn root_page_id(&self, name: &str) -> Option<PageId> {
        let index = self.find_record(name)?;
        let offset = Self::record_offset(index) + NAME_SIZE;
        let raw = u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap());
        Some(PageId::new(raw))
    }

    fn record_offset(index: usize) -> usize {
        RECORDS_OFFSET + index * RECORD_SIZE
    }

    fn find_record(&self, name: &str) -> Option<usize> {
        let count = self.record_count() as usize;
        (0..count).find(|&i| {
            let offset = Self::record_offset(i);
            let stored = &self.data[offset..offset + NAME_SIZE];
            let len = stored.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
            &stored[..len] == name.as_bytes()
        })
    }
}

/// Read-only view of the header page
pub struct HeaderPageRef<'a> {
    data: &'a [u8],
}

impl<'a> HeaderPageRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn record_count(&self) -> u32 {
        u32::from_le_bytes(
            self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]
                .try_into()
                .unwrap(),
        )
    }

    pub fn root_page_id(&self, name: &str) -> Option<PageId> {
        let count = self.record_count() as usize;
        for i in 0..count {
            let offset = RECORDS_OFFSET + i * RECORD_SIZE;
            let stored = &self.data[offset..offset + NAME_SIZE];
            let len = stored.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
            if &stored[..len] == name.as_bytes() {
                let raw = u32::from_le_bytes(
                    self.data[offset + NAME_SIZE..offset + RECORD_SIZE]
                        .try_into()
                        .unwrap(),
                );
                return Some(PageId::new(raw));
            }
        }
        None
    }
}

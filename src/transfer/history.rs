use super::registry::OwnerId;
use chrono::{DateTime, Utc};
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use uuid::Uuid;

/// A completed ownership transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: Uuid,
    pub device_id: String,
    pub from_owner_id: OwnerId,
    pub to_owner_id: OwnerId,
    pub transferred_at: DateTime<Utc>,
}

/// Audit trail of completed transfers. Durable storage lives outside this
/// crate; implementations plug in here.
pub trait TransferLog: Send + Sync {
    fn record(&self, record: TransferRecord);

    /// Past transfers, newest first, optionally limited to one device.
    fn history(&self, device_id: Option<&str>) -> Vec<TransferRecord>;
}

/// Keeps nothing. Used when no persistence backend is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransferLog;

impl TransferLog for NullTransferLog {
    fn record(&self, _record: TransferRecord) {}

    fn history(&self, _device_id: Option<&str>) -> Vec<TransferRecord> {
        Vec::new()
    }
}

pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// Process-local log, lost on restart. Keeps only the newest `capacity`
/// records.
pub struct MemoryTransferLog {
    records: Mutex<CriticalSectionRawMutex, RefCell<VecDeque<TransferRecord>>>,
    capacity: usize,
}

impl Default for MemoryTransferLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MemoryTransferLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(RefCell::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.lock(|records| records.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransferLog for MemoryTransferLog {
    fn record(&self, record: TransferRecord) {
        self.records.lock(|records| {
            let mut records = records.borrow_mut();
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record);
        });
    }

    fn history(&self, device_id: Option<&str>) -> Vec<TransferRecord> {
        self.records.lock(|records| {
            records
                .borrow()
                .iter()
                .rev()
                .filter(|r| device_id.map_or(true, |id| r.device_id == id))
                .cloned()
                .collect()
        })
    }
}

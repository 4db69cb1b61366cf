use crate::memory::descriptor::DeviceMemU64;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A live address-keyed allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub address: u64,
    pub descriptor: DeviceMemU64,
}

/// Ordered index of live address-keyed allocations.
///
/// The lock covers the index only; driver calls happen outside it.
#[derive(Debug, Default)]
pub struct AllocationRegistry {
    records: Mutex<BTreeMap<u64, AllocationRecord>>,
}

impl AllocationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, AllocationRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false`, leaving the existing entry untouched, if the address is already present.
    pub fn insert(&self, record: AllocationRecord) -> bool {
        let mut records = self.lock();
        if records.contains_key(&record.address) {
            log::error!("allocation 0x{:x} is already registered", record.address);
            return false;
        }
        records.insert(record.address, record);
        true
    }

    #[must_use]
    pub fn find(&self, address: u64) -> Option<AllocationRecord> {
        self.lock().get(&address).copied()
    }

    pub fn remove(&self, address: u64) -> Option<AllocationRecord> {
        self.lock().remove(&address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn record(address: u64, size: u64) -> AllocationRecord {
        AllocationRecord {
            address,
            descriptor: DeviceMemU64::from_device(address, size),
        }
    }

    #[test]
    fn insert_find_remove() {
        let reg = AllocationRegistry::new();
        assert!(reg.insert(record(0x1000, 16)));
        assert!(!reg.insert(record(0x1000, 32)));
        assert_eq!(reg.find(0x1000).map(|r| r.descriptor.size()), Some(16));
        assert_eq!(reg.find(0x1001), None);
        assert_eq!(reg.remove(0x1000), Some(record(0x1000, 16)));
        assert_eq!(reg.find(0x1000), None);
        assert_eq!(reg.remove(0x1000), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn interleaved_sequences_stay_consistent() {
        let reg = AllocationRegistry::new();
        let mut live = Vec::new();
        for i in 0..64u64 {
            let r = record(0x1_0000_0000 + i * 0x10000, i + 1);
            assert!(reg.insert(r));
            live.push(r);
            if i % 3 == 2 {
                let gone = live.remove(0);
                assert_eq!(reg.remove(gone.address), Some(gone));
                assert_eq!(reg.find(gone.address), None);
            }
            for r in &live {
                assert_eq!(reg.find(r.address), Some(*r));
            }
        }
        assert_eq!(reg.len(), live.len());
    }

    #[test]
    fn concurrent_inserts() {
        let reg = Arc::new(AllocationRegistry::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let reg = reg.clone();
                thread::spawn(move || {
                    for i in 0..100u64 {
                        assert!(reg.insert(record((t << 32) | (i << 12), i + 1)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 800);
    }
}

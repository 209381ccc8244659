//! Sector-granular access over a byte device, with a dirty-page cache.
//!
//! All mutations stay in the cache until [`SectorStore::flush`], so a
//! container that is dropped without saving leaves the device bytes
//! untouched.

use crate::device::ByteDevice;
use crate::error::Result;
use crate::header::HEADER_SIZE;
use crate::types::SectorId;
use std::collections::HashMap;

/// A sector read, with the fact that the device ended early.
pub(crate) struct SectorRead {
    pub data: Vec<u8>,
    /// True if part of the sector was past the device end (zero-filled).
    pub truncated: bool,
}

/// Translates sector ids to byte offsets and buffers sector writes.
pub(crate) struct SectorStore<D: ByteDevice> {
    device: D,
    sector_size: usize,
    dirty: HashMap<u32, Vec<u8>>,
}

impl<D: ByteDevice> SectorStore<D> {
    pub fn new(device: D, sector_size: usize) -> Self {
        SectorStore {
            device,
            sector_size,
            dirty: HashMap::new(),
        }
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Byte offset of a sector: the header block comes first, then sectors
    /// back to back.
    pub fn offset(&self, id: SectorId) -> u64 {
        HEADER_SIZE as u64 + id.0 as u64 * self.sector_size as u64
    }

    /// Number of sectors the device currently covers, counting a partial
    /// trailing sector as present.
    pub fn device_sector_count(&self) -> u32 {
        let payload = self.device.len().saturating_sub(HEADER_SIZE as u64);
        let count = payload.div_ceil(self.sector_size as u64);
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Read a whole sector, zero-filling anything past the device end.
    pub fn read(&mut self, id: SectorId) -> Result<SectorRead> {
        debug_assert!(id.is_regular());
        if let Some(data) = self.dirty.get(&id.0) {
            return Ok(SectorRead {
                data: data.clone(),
                truncated: false,
            });
        }
        let mut data = vec![0_u8; self.sector_size];
        let n = self.device.read_at(self.offset(id), &mut data)?;
        Ok(SectorRead {
            data,
            truncated: n < self.sector_size,
        })
    }

    /// Stage a full sector write in the cache.
    pub fn write(&mut self, id: SectorId, data: Vec<u8>) {
        debug_assert!(id.is_regular());
        debug_assert_eq!(data.len(), self.sector_size);
        self.dirty.insert(id.0, data);
    }

    /// Stage a zero-filled sector.
    pub fn write_zeros(&mut self, id: SectorId) {
        self.write(id, vec![0_u8; self.sector_size]);
    }

    /// Write all staged sectors to the device, then the header block last,
    /// then sync. The header-last order bounds the window in which a crash
    /// leaves a stale header over fresh sectors.
    pub fn flush(&mut self, header_block: &[u8; HEADER_SIZE]) -> Result<()> {
        let mut ids: Vec<u32> = self.dirty.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let data = self.dirty.remove(&id).expect("staged sector");
            let offset = self.offset(SectorId(id));
            self.device.write_at(offset, &data)?;
        }
        self.device.write_at(0, header_block)?;
        self.device.flush()?;
        Ok(())
    }

    /// Hand the device back, discarding any unflushed sectors.
    pub fn into_device(self) -> D {
        self.device
    }

    #[cfg(test)]
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn test_offset_math() {
        let store = SectorStore::new(MemDevice::new(), 512);
        assert_eq!(store.offset(SectorId(0)), 512);
        assert_eq!(store.offset(SectorId(1)), 1024);
        assert_eq!(store.offset(SectorId(10)), 512 + 10 * 512);
    }

    #[test]
    fn test_read_past_end_zero_fills() {
        let mut store = SectorStore::new(MemDevice::new(), 512);
        let read = store.read(SectorId(3)).unwrap();
        assert!(read.truncated);
        assert_eq!(read.data, vec![0_u8; 512]);
    }

    #[test]
    fn test_writes_stay_in_cache_until_flush() {
        let mut store = SectorStore::new(MemDevice::new(), 512);
        store.write(SectorId(0), vec![0xAB; 512]);
        assert_eq!(store.dirty_count(), 1);

        // Read-your-writes before flush
        let read = store.read(SectorId(0)).unwrap();
        assert!(!read.truncated);
        assert_eq!(read.data[0], 0xAB);

        // Device still empty
        assert_eq!(store.device.len(), 0);

        store.flush(&[0_u8; HEADER_SIZE]).unwrap();
        assert_eq!(store.dirty_count(), 0);
        assert_eq!(store.device.len(), 1024);
    }

    #[test]
    fn test_partial_trailing_sector_counts() {
        let mut dev = MemDevice::new();
        dev.set_len(512 + 512 + 100).unwrap();
        let store = SectorStore::new(dev, 512);
        assert_eq!(store.device_sector_count(), 2);
    }
}

//! Sector allocation: the FAT, the DIFAT that indexes it, and the MiniFAT.
//!
//! All three tables are dense in-memory arrays of [`SectorId`]. Chains are
//! linked lists threaded through a table (`fat[i]` names the successor of
//! sector `i`). Growing the normal pool appends to the file; when the FAT
//! itself runs out of room a fresh FAT sector is claimed, marked `FATSECT`
//! in its own table and registered in the DIFAT, spilling into dedicated
//! `DIFSECT` sectors once the 109 inline header slots are exhausted.
//!
//! The mini pool is different: its backing bytes belong to the root
//! entry's mini-stream, so growing it is a container-level operation. The
//! allocator only exposes the cell bookkeeping ([`Allocator::grow_mini_pool`]).

use crate::diag::{report, Diagnostic, DiagnosticSink};
use crate::device::ByteDevice;
use crate::error::{CompoundError, Result};
use crate::header::{Header, DIFAT_INLINE};
use crate::sector::SectorStore;
use crate::types::{read_sector_id, SectorId};
use std::collections::HashSet;

/// Which allocation table a chain lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Normal,
    Mini,
}

#[derive(Debug, Clone, Copy)]
enum Table {
    Normal,
    Mini,
}

impl Table {
    fn out_of_range(self, id: SectorId) -> CompoundError {
        match self {
            Table::Normal => CompoundError::LargeNormalFat(id),
            Table::Mini => CompoundError::LargeMiniFat(id),
        }
    }

    fn loop_error(self, start: SectorId) -> CompoundError {
        match self {
            // Mini chains are FAT-shaped too; a cycle reads the same.
            Table::Normal | Table::Mini => CompoundError::NormalLoop(start),
        }
    }
}

/// Owner of the FAT, DIFAT, and MiniFAT in-memory state.
pub struct Allocator {
    /// One entry per file sector; `fat[i]` is the successor of sector `i`.
    fat: Vec<SectorId>,
    /// Ids of the sectors holding FAT blocks, in DIFAT order.
    difat: Vec<SectorId>,
    /// Ids of the dedicated DIFAT sectors, in chain order.
    difat_sectors: Vec<SectorId>,
    /// One entry per mini-stream cell.
    minifat: Vec<SectorId>,
    /// `sector_size / 4`.
    ids_per_sector: usize,
}

impl Allocator {
    pub fn new(sector_size: usize) -> Self {
        Allocator {
            fat: Vec::new(),
            difat: Vec::new(),
            difat_sectors: Vec::new(),
            minifat: Vec::new(),
            ids_per_sector: sector_size / 4,
        }
    }

    /// Total sectors the FAT covers; any regular id must be below this.
    pub fn total_sectors(&self) -> usize {
        self.fat.len()
    }

    pub fn mini_pool_cells(&self) -> usize {
        self.minifat.len()
    }

    pub fn mini_free_cells(&self) -> usize {
        self.minifat.iter().filter(|e| **e == SectorId::FREE).count()
    }

    pub(crate) fn fat_sectors(&self) -> &[SectorId] {
        &self.difat
    }

    // ── chain walking ───────────────────────────────────────────────────

    /// Walk a normal FAT chain from `start`, with loop detection.
    ///
    /// Any sentinel mid-chain terminates the walk like `ENDOFCHAIN`; only
    /// regular ids past the table end are fatal.
    pub fn chain(&self, start: SectorId) -> Result<Vec<SectorId>> {
        Self::walk(&self.fat, start, Table::Normal)
    }

    /// Walk a mini FAT chain from `start`.
    pub fn mini_chain(&self, start: SectorId) -> Result<Vec<SectorId>> {
        Self::walk(&self.minifat, start, Table::Mini)
    }

    fn walk(table: &[SectorId], start: SectorId, kind: Table) -> Result<Vec<SectorId>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cur = start;
        while cur.is_regular() {
            if cur.index() >= table.len() {
                return Err(kind.out_of_range(cur));
            }
            if !visited.insert(cur) {
                return Err(kind.loop_error(start));
            }
            chain.push(cur);
            cur = table[cur.index()];
        }
        Ok(chain)
    }

    // ── normal pool ─────────────────────────────────────────────────────

    /// Allocate a linked chain of `n` sectors, growing the file as needed.
    /// Returns the chain in order; the first element is the start.
    pub fn allocate(&mut self, n: usize) -> Vec<SectorId> {
        let mut sectors = Vec::with_capacity(n);
        for _ in 0..n {
            let id = self.alloc_sector();
            if let Some(&prev) = sectors.last() {
                self.fat[Self::idx(prev)] = id;
            }
            sectors.push(id);
        }
        sectors
    }

    /// Append `extra` sectors to the chain at `start` (creating the chain
    /// when `start` is `ENDOFCHAIN`). Returns the chain start and the
    /// newly appended sectors.
    pub fn extend(&mut self, start: SectorId, extra: usize) -> Result<(SectorId, Vec<SectorId>)> {
        if extra == 0 {
            return Ok((start, Vec::new()));
        }
        if start.is_end() {
            let added = self.allocate(extra);
            return Ok((added[0], added));
        }
        let chain = self.chain(start)?;
        let tail = *chain.last().ok_or_else(|| {
            CompoundError::NormalFat(format!("chain at {start} has no sectors"))
        })?;
        let added = self.allocate(extra);
        self.fat[Self::idx(tail)] = added[0];
        Ok((start, added))
    }

    /// Release a chain, marking each sector `FREESECT`. Returns the count.
    pub fn free(&mut self, start: SectorId) -> Result<usize> {
        let chain = self.chain(start)?;
        for &id in &chain {
            self.fat[Self::idx(id)] = SectorId::FREE;
        }
        Ok(chain.len())
    }

    /// Shorten a chain to `keep` sectors, freeing the rest. Returns the
    /// new start (`ENDOFCHAIN` when nothing is kept).
    pub fn truncate(&mut self, start: SectorId, keep: usize) -> Result<SectorId> {
        let chain = self.chain(start)?;
        if keep >= chain.len() {
            return Ok(start);
        }
        for &id in &chain[keep..] {
            self.fat[Self::idx(id)] = SectorId::FREE;
        }
        if keep == 0 {
            Ok(SectorId::END_OF_CHAIN)
        } else {
            self.fat[Self::idx(chain[keep - 1])] = SectorId::END_OF_CHAIN;
            Ok(start)
        }
    }

    /// Claim one sector: first `FREESECT` slot, else grow the file.
    fn alloc_sector(&mut self) -> SectorId {
        if let Some(i) = self.find_free() {
            self.fat[i] = SectorId::END_OF_CHAIN;
            return SectorId(i as u32);
        }
        self.ensure_fat_capacity(self.fat.len() + 1);
        if let Some(i) = self.find_free() {
            self.fat[i] = SectorId::END_OF_CHAIN;
            return SectorId(i as u32);
        }
        self.fat.push(SectorId::END_OF_CHAIN);
        SectorId((self.fat.len() - 1) as u32)
    }

    fn find_free(&self) -> Option<usize> {
        self.fat.iter().position(|e| *e == SectorId::FREE)
    }

    /// Make sure the FAT sectors registered in the DIFAT can hold at least
    /// `min_len` entries. Claims and marks FAT/DIFAT sectors as needed;
    /// those claims can themselves push the requirement up, hence the loop.
    fn ensure_fat_capacity(&mut self, min_len: usize) {
        loop {
            let needed = min_len.max(self.fat.len());
            if self.difat.len() * self.ids_per_sector >= needed {
                break;
            }
            let id = self.claim_raw();
            self.fat[Self::idx(id)] = SectorId::FAT;
            self.difat.push(id);
            self.ensure_difat_capacity();
        }
    }

    /// DIFAT entries past the 109 inline header slots need DIFSECT sectors.
    fn ensure_difat_capacity(&mut self) {
        let spill = self.difat.len().saturating_sub(DIFAT_INLINE);
        let per_sector = self.ids_per_sector - 1;
        let needed = spill.div_ceil(per_sector);
        while self.difat_sectors.len() < needed {
            let id = self.claim_raw();
            self.fat[Self::idx(id)] = SectorId::DIFAT;
            self.difat_sectors.push(id);
        }
    }

    /// Take a sector without linking it anywhere yet.
    fn claim_raw(&mut self) -> SectorId {
        if let Some(i) = self.find_free() {
            return SectorId(i as u32);
        }
        self.fat.push(SectorId::FREE);
        SectorId((self.fat.len() - 1) as u32)
    }

    fn idx(id: SectorId) -> usize {
        id.index()
    }

    // ── mini pool ───────────────────────────────────────────────────────

    /// Add `cells` free 64-byte cells to the mini pool. The caller has
    /// already extended the root mini-stream to back them.
    pub fn grow_mini_pool(&mut self, cells: usize) {
        self.minifat
            .extend(std::iter::repeat(SectorId::FREE).take(cells));
    }

    /// Force the mini pool to exactly `cells` entries (load-time
    /// normalization against the root entry's size).
    pub(crate) fn set_mini_pool_len(&mut self, cells: usize) {
        self.minifat.resize(cells, SectorId::FREE);
    }

    /// Allocate a linked chain of `n` mini cells from the existing pool.
    pub fn allocate_mini(&mut self, n: usize) -> Result<Vec<SectorId>> {
        let mut cells = Vec::with_capacity(n);
        for _ in 0..n {
            let i = self
                .minifat
                .iter()
                .position(|e| *e == SectorId::FREE)
                .ok_or_else(|| CompoundError::MiniFat("mini pool exhausted".into()))?;
            self.minifat[i] = SectorId::END_OF_CHAIN;
            if let Some(&prev) = cells.last() {
                self.minifat[Self::idx(prev)] = SectorId(i as u32);
            }
            cells.push(SectorId(i as u32));
        }
        Ok(cells)
    }

    /// Append `extra` cells to the mini chain at `start`.
    pub fn extend_mini(
        &mut self,
        start: SectorId,
        extra: usize,
    ) -> Result<(SectorId, Vec<SectorId>)> {
        if extra == 0 {
            return Ok((start, Vec::new()));
        }
        if start.is_end() {
            let added = self.allocate_mini(extra)?;
            return Ok((added[0], added));
        }
        let chain = self.mini_chain(start)?;
        let tail = *chain.last().ok_or_else(|| {
            CompoundError::MiniFat(format!("mini chain at {start} has no cells"))
        })?;
        let added = self.allocate_mini(extra)?;
        self.minifat[Self::idx(tail)] = added[0];
        Ok((start, added))
    }

    pub fn free_mini(&mut self, start: SectorId) -> Result<usize> {
        let chain = self.mini_chain(start)?;
        for &id in &chain {
            self.minifat[Self::idx(id)] = SectorId::FREE;
        }
        Ok(chain.len())
    }

    pub fn truncate_mini(&mut self, start: SectorId, keep: usize) -> Result<SectorId> {
        let chain = self.mini_chain(start)?;
        if keep >= chain.len() {
            return Ok(start);
        }
        for &id in &chain[keep..] {
            self.minifat[Self::idx(id)] = SectorId::FREE;
        }
        if keep == 0 {
            Ok(SectorId::END_OF_CHAIN)
        } else {
            self.minifat[Self::idx(chain[keep - 1])] = SectorId::END_OF_CHAIN;
            Ok(start)
        }
    }

    // ── load / store ────────────────────────────────────────────────────

    /// Rebuild allocator state from an opened document: walk the DIFAT
    /// (inline slots, then the `DIFSECT` chain), load every FAT block it
    /// names, then load the MiniFAT chain.
    pub(crate) fn load<D: ByteDevice>(
        header: &Header,
        store: &mut SectorStore<D>,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<Allocator> {
        let ids_per = store.sector_size() / 4;
        let device_sectors = store.device_sector_count() as usize;

        let mut difat: Vec<SectorId> = Vec::new();
        for &id in &header.difat_head {
            if !id.is_regular() {
                break;
            }
            difat.push(id);
        }

        let mut difat_sectors = Vec::new();
        let mut visited = HashSet::new();
        let mut cur = header.first_difat_sector;
        while cur.is_regular() {
            if cur.index() >= device_sectors {
                return Err(CompoundError::MasterFat(format!(
                    "DIFAT sector {cur} lies past the end of the document"
                )));
            }
            if !visited.insert(cur) {
                return Err(CompoundError::MasterLoop(cur));
            }
            difat_sectors.push(cur);
            let block = store.read(cur)?;
            if block.truncated {
                report(
                    sink,
                    Diagnostic::Truncated(format!("DIFAT sector {cur} is truncated")),
                )?;
            }
            for k in 0..ids_per - 1 {
                let id = read_sector_id(&block.data, k * 4);
                if !id.is_regular() {
                    break;
                }
                difat.push(id);
            }
            let next = read_sector_id(&block.data, (ids_per - 1) * 4);
            if next == SectorId::FREE {
                report(
                    sink,
                    Diagnostic::MasterSector(format!(
                        "DIFAT chain after sector {cur} terminated by FREESECT"
                    )),
                )?;
                break;
            }
            cur = next;
        }
        if difat_sectors.len() != header.num_difat_sectors as usize {
            report(
                sink,
                Diagnostic::MasterSector(format!(
                    "walked {} DIFAT sectors, header claims {}",
                    difat_sectors.len(),
                    header.num_difat_sectors
                )),
            )?;
        }
        if difat.len() != header.num_fat_sectors as usize {
            report(
                sink,
                Diagnostic::MasterSector(format!(
                    "DIFAT names {} FAT sectors, header claims {}",
                    difat.len(),
                    header.num_fat_sectors
                )),
            )?;
        }

        let mut fat = Vec::with_capacity(difat.len() * ids_per);
        for &fat_sector in &difat {
            if fat_sector.index() >= device_sectors {
                return Err(CompoundError::MasterFat(format!(
                    "FAT sector {fat_sector} lies past the end of the document"
                )));
            }
            let block = store.read(fat_sector)?;
            if block.truncated {
                report(
                    sink,
                    Diagnostic::Truncated(format!("FAT sector {fat_sector} is truncated")),
                )?;
            }
            for k in 0..ids_per {
                fat.push(read_sector_id(&block.data, k * 4));
            }
        }

        let mut alloc = Allocator {
            fat,
            difat,
            difat_sectors,
            minifat: Vec::new(),
            ids_per_sector: ids_per,
        };

        for &fs in &alloc.difat {
            if alloc.fat.get(fs.index()) != Some(&SectorId::FAT) {
                report(
                    sink,
                    Diagnostic::NormalSector(format!("FAT sector {fs} is not marked FATSECT")),
                )?;
            }
        }
        for &ds in &alloc.difat_sectors {
            if alloc.fat.get(ds.index()) != Some(&SectorId::DIFAT) {
                report(
                    sink,
                    Diagnostic::MasterSector(format!("DIFAT sector {ds} is not marked DIFSECT")),
                )?;
            }
        }

        let minifat_chain = alloc.chain(header.first_minifat_sector)?;
        if minifat_chain.len() != header.num_minifat_sectors as usize {
            report(
                sink,
                Diagnostic::Header(format!(
                    "walked {} MiniFAT sectors, header claims {}",
                    minifat_chain.len(),
                    header.num_minifat_sectors
                )),
            )?;
        }
        for &ms in &minifat_chain {
            let block = store.read(ms)?;
            if block.truncated {
                report(
                    sink,
                    Diagnostic::Truncated(format!("MiniFAT sector {ms} is truncated")),
                )?;
            }
            for k in 0..ids_per {
                alloc.minifat.push(read_sector_id(&block.data, k * 4));
            }
        }

        Ok(alloc)
    }

    /// Stage the FAT and DIFAT sectors and refresh the header fields that
    /// describe them. The MiniFAT is staged separately because its chain
    /// belongs to the container.
    pub(crate) fn store_tables<D: ByteDevice>(
        &mut self,
        store: &mut SectorStore<D>,
        header: &mut Header,
    ) -> Result<()> {
        self.ensure_fat_capacity(self.fat.len());
        self.ensure_difat_capacity();

        let ids_per = self.ids_per_sector;
        for (block, &fat_sector) in self.difat.iter().enumerate() {
            let mut data = vec![0_u8; store.sector_size()];
            for k in 0..ids_per {
                let id = self
                    .fat
                    .get(block * ids_per + k)
                    .copied()
                    .unwrap_or(SectorId::FREE);
                data[k * 4..k * 4 + 4].copy_from_slice(&id.0.to_le_bytes());
            }
            store.write(fat_sector, data);
        }

        let per_sector = ids_per - 1;
        let spill_start = DIFAT_INLINE.min(self.difat.len());
        let spill = &self.difat[spill_start..];
        for (block, &difat_sector) in self.difat_sectors.iter().enumerate() {
            let mut data = vec![0_u8; store.sector_size()];
            for k in 0..per_sector {
                let id = spill
                    .get(block * per_sector + k)
                    .copied()
                    .unwrap_or(SectorId::FREE);
                data[k * 4..k * 4 + 4].copy_from_slice(&id.0.to_le_bytes());
            }
            let next = self
                .difat_sectors
                .get(block + 1)
                .copied()
                .unwrap_or(SectorId::END_OF_CHAIN);
            data[per_sector * 4..per_sector * 4 + 4].copy_from_slice(&next.0.to_le_bytes());
            store.write(difat_sector, data);
        }

        header.num_fat_sectors = self.difat.len() as u32;
        header.first_difat_sector = self
            .difat_sectors
            .first()
            .copied()
            .unwrap_or(SectorId::END_OF_CHAIN);
        header.num_difat_sectors = self.difat_sectors.len() as u32;
        header.difat_head = [SectorId::FREE; DIFAT_INLINE];
        for (k, &fs) in self.difat.iter().take(DIFAT_INLINE).enumerate() {
            header.difat_head[k] = fs;
        }
        Ok(())
    }

    /// Stage the MiniFAT entries into the given (already sized) chain.
    pub(crate) fn store_minifat<D: ByteDevice>(
        &self,
        store: &mut SectorStore<D>,
        chain: &[SectorId],
    ) {
        let ids_per = self.ids_per_sector;
        for (block, &sector) in chain.iter().enumerate() {
            let mut data = vec![0_u8; store.sector_size()];
            for k in 0..ids_per {
                let id = self
                    .minifat
                    .get(block * ids_per + k)
                    .copied()
                    .unwrap_or(SectorId::FREE);
                data[k * 4..k * 4 + 4].copy_from_slice(&id.0.to_le_bytes());
            }
            store.write(sector, data);
        }
    }

    /// Sectors needed to persist the current MiniFAT.
    pub(crate) fn minifat_sectors_needed(&self) -> usize {
        (self.minifat.len() * 4).div_ceil(self.ids_per_sector * 4)
    }

    #[cfg(test)]
    pub(crate) fn fat_entry(&self, id: SectorId) -> SectorId {
        self.fat[id.index()]
    }

    #[cfg(test)]
    pub(crate) fn set_fat_entry(&mut self, id: SectorId, value: SectorId) {
        self.fat[id.index()] = value;
    }

    #[cfg(test)]
    pub(crate) fn difat_sector_list(&self) -> &[SectorId] {
        &self.difat_sectors
    }
}

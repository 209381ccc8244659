//! The container façade: reader/writer/editor lifecycle over one device.
//!
//! All mutable state lives in an [`Inner`] behind `Arc<Mutex<_>>`; stream
//! handles keep a back-reference plus their [`DirId`], never the bytes.
//! Mutations stay in the sector cache until [`CompoundFile::save`], so a
//! container dropped without saving leaves the device unchanged.

use crate::alloc::{Allocator, Pool};
use crate::device::ByteDevice;
use crate::diag::{report, Diagnostic, DiagnosticSink, LogSink};
use crate::dir::entry::{DirEntry, EntryType};
use crate::dir::Directory;
use crate::error::{CompoundError, Result};
use crate::header::{Header, Version, HEADER_SIZE};
use crate::sector::SectorStore;
use crate::stream::Stream;
use crate::types::{DirId, SectorId, Timestamp};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

const MINI_SECTOR_SIZE: u64 = 64;

/// Snapshot of a directory entry, used for navigation.
///
/// An `Entry` is a value: it records what the entry looked like when it
/// was fetched, plus the ids needed to address it. Operations re-resolve
/// the id and fail with `NotFound` if the slot has since been reused.
#[derive(Debug, Clone)]
pub struct Entry {
    pub(crate) id: DirId,
    pub(crate) parent: DirId,
    name: String,
    entry_type: EntryType,
    size: u64,
    clsid: Uuid,
    created: Timestamp,
    modified: Timestamp,
}

impl Entry {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream size in bytes; zero for storages.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.entry_type == EntryType::Stream
    }

    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(self.entry_type, EntryType::Storage | EntryType::Root)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.entry_type == EntryType::Root
    }

    #[must_use]
    pub fn clsid(&self) -> Uuid {
        self.clsid
    }

    #[must_use]
    pub fn created(&self) -> Timestamp {
        self.created
    }

    #[must_use]
    pub fn modified(&self) -> Timestamp {
        self.modified
    }

    /// Index of this entry in the directory sequence. Stable for the life
    /// of the entry; slots of deleted entries are reused by later inserts.
    #[must_use]
    pub fn dir_id(&self) -> u32 {
        self.id.0
    }
}

pub(crate) struct Inner<D: ByteDevice> {
    pub(crate) header: Header,
    pub(crate) store: SectorStore<D>,
    pub(crate) alloc: Allocator,
    pub(crate) dir: Directory,
    pub(crate) sink: Box<dyn DiagnosticSink>,
    read_only: bool,
    closed: bool,
}

/// An OLE compound document bound to a byte device.
///
/// Three entry points mirror the three lifecycles: [`open_reader`]
/// (read-only), [`open_editor`] (mutate an existing document), and
/// [`create`] (fresh document). Nothing reaches the device until
/// [`save`] or [`close`].
///
/// [`open_reader`]: CompoundFile::open_reader
/// [`open_editor`]: CompoundFile::open_editor
/// [`create`]: CompoundFile::create
/// [`save`]: CompoundFile::save
pub struct CompoundFile<D: ByteDevice> {
    pub(crate) inner: Arc<Mutex<Inner<D>>>,
}

impl<D: ByteDevice> CompoundFile<D> {
    /// Open an existing document read-only.
    pub fn open_reader(device: D) -> Result<Self> {
        Self::open_with_sink(device, Box::new(LogSink), true)
    }

    /// Open an existing document for editing.
    pub fn open_editor(device: D) -> Result<Self> {
        Self::open_with_sink(device, Box::new(LogSink), false)
    }

    /// Open with a custom diagnostic sink.
    pub fn open_with_sink(
        device: D,
        sink: Box<dyn DiagnosticSink>,
        read_only: bool,
    ) -> Result<Self> {
        let inner = Inner::open(device, sink, read_only)?;
        Ok(CompoundFile {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Create a fresh version-3 document on an empty device.
    pub fn create(device: D) -> Result<Self> {
        Self::create_with_version(device, Version::V3)
    }

    /// Create a fresh document with the given format version.
    pub fn create_with_version(device: D, version: Version) -> Result<Self> {
        let inner = Inner::create(device, version, Box::new(LogSink))?;
        Ok(CompoundFile {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Replace the diagnostic sink.
    pub fn set_sink(&self, sink: Box<dyn DiagnosticSink>) {
        self.inner.lock().sink = sink;
    }

    /// The root storage.
    pub fn root(&self) -> Result<Entry> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.snapshot(DirId::ROOT, DirId::NONE))
    }

    /// In-order children of a storage.
    pub fn children(&self, storage: &Entry) -> Result<Vec<Entry>> {
        let inner = self.inner.lock();
        inner.check_open()?;
        inner.verify(storage)?;
        let ids = inner.dir.children(storage.id)?;
        Ok(ids
            .into_iter()
            .map(|id| inner.snapshot(id, storage.id))
            .collect())
    }

    /// Look up a child of a storage by name (case-insensitive).
    pub fn lookup(&self, storage: &Entry, name: &str) -> Result<Entry> {
        let inner = self.inner.lock();
        inner.check_open()?;
        inner.verify(storage)?;
        let id = inner
            .dir
            .lookup(storage.id, name)?
            .ok_or_else(|| CompoundError::NotFound(name.into()))?;
        Ok(inner.snapshot(id, storage.id))
    }

    /// Resolve a `/`-separated path from the root.
    pub fn entry(&self, path: &str) -> Result<Entry> {
        let inner = self.inner.lock();
        inner.check_open()?;
        let (id, parent) = inner.dir.lookup_path_parent(path)?;
        Ok(inner.snapshot(id, parent))
    }

    /// Whether a path resolves to an entry.
    pub fn exists(&self, path: &str) -> Result<bool> {
        let inner = self.inner.lock();
        inner.check_open()?;
        match inner.dir.lookup_path_parent(path) {
            Ok(_) => Ok(true),
            Err(CompoundError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a stream by entry.
    pub fn open_stream(&self, entry: &Entry) -> Result<Stream<D>> {
        {
            let mut inner = self.inner.lock();
            inner.check_open()?;
            inner.verify(entry)?;
            inner.check_stream_open(entry.id)?;
        }
        Ok(Stream::new(Arc::clone(&self.inner), entry.id))
    }

    /// Open a stream by path.
    pub fn open_path(&self, path: &str) -> Result<Stream<D>> {
        let id = {
            let mut inner = self.inner.lock();
            inner.check_open()?;
            let (id, _) = inner.dir.lookup_path_parent(path)?;
            inner.check_stream_open(id)?;
            id
        };
        Ok(Stream::new(Arc::clone(&self.inner), id))
    }

    /// Read a whole stream by path.
    pub fn read_path(&self, path: &str) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let (id, _) = inner.dir.lookup_path_parent(path)?;
        inner.check_stream_open(id)?;
        // Chunked so a corrupt size field cannot drive the allocation.
        let mut out = Vec::new();
        let mut chunk = vec![0_u8; 64 * 1024];
        loop {
            let (n, _) = inner.stream_read(id, out.len() as u64, &mut chunk, out.is_empty())?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }

    /// Create an empty storage under a parent storage.
    pub fn create_storage(&self, parent: &Entry, name: &str) -> Result<Entry> {
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        inner.verify(parent)?;
        let now = Timestamp::now();
        let entry = DirEntry {
            name: name.into(),
            entry_type: EntryType::Storage,
            created: now,
            modified: now,
            ..DirEntry::empty()
        };
        let id = inner.dir.insert(parent.id, entry)?;
        Ok(inner.snapshot(id, parent.id))
    }

    /// Create the storages named by a path, reusing any that exist.
    pub fn create_storage_path(&self, path: &str) -> Result<Entry> {
        {
            let inner = self.inner.lock();
            inner.check_mutable()?;
        }
        let mut cur = self.root()?;
        for segment in path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>() {
            cur = match self.lookup(&cur, segment) {
                Ok(found) if found.is_storage() => found,
                Ok(found) => return Err(CompoundError::NotStorage(found.name)),
                Err(CompoundError::NotFound(_)) => self.create_storage(&cur, segment)?,
                Err(e) => return Err(e),
            };
        }
        Ok(cur)
    }

    /// Create a stream with the given contents under a parent storage.
    pub fn create_stream(&self, parent: &Entry, name: &str, data: &[u8]) -> Result<Entry> {
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        inner.verify(parent)?;
        let entry = DirEntry {
            name: name.into(),
            entry_type: EntryType::Stream,
            ..DirEntry::empty()
        };
        let id = inner.dir.insert(parent.id, entry)?;
        if !data.is_empty() {
            inner.stream_write(id, 0, data)?;
        }
        Ok(inner.snapshot(id, parent.id))
    }

    /// Rename an entry in place. Fails on collisions without touching the
    /// tree; the entry keeps its directory slot.
    pub fn rename(&self, entry: &Entry, new_name: &str) -> Result<Entry> {
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        inner.verify(entry)?;
        if entry.parent.is_none() {
            return Err(CompoundError::DirEntry("cannot rename the root".into()));
        }
        inner.dir.rename(entry.parent, entry.id, new_name)?;
        Ok(inner.snapshot(entry.id, entry.parent))
    }

    /// Delete an entry; storages are deleted recursively. Chains are freed
    /// and directory slots become reusable.
    pub fn delete(&self, entry: &Entry) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        inner.verify(entry)?;
        if entry.parent.is_none() {
            return Err(CompoundError::DirEntry("cannot delete the root".into()));
        }
        inner.delete_recursive(entry.parent, entry.id)
    }

    /// Set the class identifier of a storage.
    pub fn set_clsid(&self, entry: &Entry, clsid: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        inner.verify(entry)?;
        if !inner.dir.entry(entry.id)?.is_storage() {
            return Err(CompoundError::NotStorage(entry.name.clone()));
        }
        inner.dir.entry_mut(entry.id)?.clsid = clsid;
        Ok(())
    }

    /// Flush every buffered change: directory, MiniFAT, FAT, DIFAT, then
    /// the header last.
    pub fn save(&self) -> Result<()> {
        self.inner.lock().save()
    }

    /// Flush and invalidate the container; open stream handles error from
    /// here on.
    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.closed {
            if !inner.read_only {
                inner.save()?;
            }
            inner.closed = true;
        }
        Ok(())
    }

    /// Dissolve the container and return the underlying device. Unsaved
    /// changes are discarded; call [`save`](Self::save) first to keep
    /// them. Fails while stream handles are still alive.
    pub fn into_device(self) -> Result<D> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => Ok(mutex.into_inner().store.into_device()),
            Err(_) => Err(CompoundError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "stream handles are still open",
            ))),
        }
    }

    /// Format version of the document.
    pub fn version(&self) -> Version {
        if self.inner.lock().header.major_version == 3 {
            Version::V3
        } else {
            Version::V4
        }
    }

    /// Sector size in bytes.
    pub fn sector_size(&self) -> usize {
        self.inner.lock().header.sector_size()
    }
}

impl<D: ByteDevice> Inner<D> {
    // ── lifecycle ───────────────────────────────────────────────────────

    fn open(mut device: D, mut sink: Box<dyn DiagnosticSink>, read_only: bool) -> Result<Self> {
        let mut header_bytes = [0_u8; HEADER_SIZE];
        let n = device.read_at(0, &mut header_bytes)?;
        let header = Header::decode(&header_bytes[..n], sink.as_mut())?;

        let mut store = SectorStore::new(device, header.sector_size());
        let alloc = Allocator::load(&header, &mut store, sink.as_mut())?;

        let dir_chain = alloc.chain(header.first_dir_sector)?;
        if dir_chain.is_empty() {
            return Err(CompoundError::DirEntry(
                "header names no directory chain".into(),
            ));
        }
        let mut dir_bytes = Vec::with_capacity(dir_chain.len() * header.sector_size());
        for &sector in &dir_chain {
            let block = store.read(sector)?;
            if block.truncated {
                report(
                    sink.as_mut(),
                    Diagnostic::Truncated(format!("directory sector {sector} is truncated")),
                )?;
            }
            dir_bytes.extend_from_slice(&block.data);
        }
        let dir = Directory::load(
            &dir_bytes,
            header.sector_size(),
            header.sector_size() == 512,
            sink.as_mut(),
        )?;

        let mut inner = Inner {
            header,
            store,
            alloc,
            dir,
            sink,
            read_only,
            closed: false,
        };
        inner.validate_root()?;
        inner.validate_stream_starts()?;
        Ok(inner)
    }

    fn create(device: D, version: Version, sink: Box<dyn DiagnosticSink>) -> Result<Self> {
        let mut header = Header::new(version);
        let sector_size = header.sector_size();
        let store = SectorStore::new(device, sector_size);
        let mut alloc = Allocator::new(sector_size);
        let dir = Directory::new(sector_size);

        // One directory sector up front; its FAT sector registers itself
        // in DIFAT[0]. The MiniFAT stays absent until a mini stream needs it.
        let dir_sectors = alloc.allocate(1);
        header.first_dir_sector = dir_sectors[0];

        Ok(Inner {
            header,
            store,
            alloc,
            dir,
            sink,
            read_only: false,
            closed: false,
        })
    }

    /// Root entry sanity: its chain bounds and the 64-byte granularity of
    /// the mini stream; then size the mini pool to match.
    fn validate_root(&mut self) -> Result<()> {
        let total = self.alloc.total_sectors();
        let root = self.dir.root();
        let mut start = root.start;
        let mut size = root.size;
        if start.is_regular() && start.index() >= total {
            report(
                self.sink.as_mut(),
                Diagnostic::DirSector(format!(
                    "root mini stream starts at out-of-range sector {start}"
                )),
            )?;
            start = SectorId::END_OF_CHAIN;
            size = 0;
        }
        if !start.is_regular() && !start.is_end() {
            report(
                self.sink.as_mut(),
                Diagnostic::DirSector(format!("root mini stream starts at {start}")),
            )?;
            start = SectorId::END_OF_CHAIN;
            size = 0;
        }
        if size % MINI_SECTOR_SIZE != 0 {
            report(
                self.sink.as_mut(),
                Diagnostic::DirSize(format!(
                    "root mini stream size {size} is not a multiple of {MINI_SECTOR_SIZE}"
                )),
            )?;
            size -= size % MINI_SECTOR_SIZE;
        }
        let root = self.dir.root_mut();
        root.start = start;
        root.size = size;
        self.alloc
            .set_mini_pool_len(usize::try_from(size / MINI_SECTOR_SIZE).unwrap_or(0));
        Ok(())
    }

    /// Reset stream start sectors that cannot address their pool; reads of
    /// such streams yield nothing rather than failing.
    fn validate_stream_starts(&mut self) -> Result<()> {
        let cutoff = u64::from(self.header.mini_cutoff);
        let total = self.alloc.total_sectors();
        let mini_cells = self.alloc.mini_pool_cells();
        for i in 0..self.dir.len() {
            let id = DirId(i as u32);
            let Ok(entry) = self.dir.entry(id) else {
                continue;
            };
            if !entry.is_stream() {
                continue;
            }
            if entry.size < cutoff && mini_cells == 0 {
                // No mini pool at all; opening such a stream raises
                // `NoMiniFat` instead of quietly reading nothing.
                continue;
            }
            let bound = if entry.size < cutoff { mini_cells } else { total };
            let start = entry.start;
            let bad_regular = start.is_regular() && start.index() >= bound;
            let bad_sentinel = !start.is_regular() && !start.is_end();
            if bad_regular || bad_sentinel {
                report(
                    self.sink.as_mut(),
                    Diagnostic::DirSector(format!(
                        "stream {} has invalid start sector {start}",
                        entry.name
                    )),
                )?;
                self.dir.entry_mut(id)?.start = SectorId::END_OF_CHAIN;
            }
        }
        Ok(())
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(CompoundError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_mutable(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            Err(CompoundError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn snapshot(&self, id: DirId, parent: DirId) -> Entry {
        let e = self.dir.entry(id).expect("snapshot of live entry");
        Entry {
            id,
            parent,
            name: e.name.clone(),
            entry_type: e.entry_type,
            size: e.size,
            clsid: e.clsid,
            created: e.created,
            modified: e.modified,
        }
    }

    /// Guard against stale snapshots whose slot has been reused.
    fn verify(&self, entry: &Entry) -> Result<()> {
        match self.dir.entry(entry.id) {
            Ok(e) if e.name == entry.name && e.entry_type == entry.entry_type => Ok(()),
            _ => Err(CompoundError::NotFound(entry.name.clone())),
        }
    }

    /// Pre-open checks for a stream: it must be a stream, its chain must
    /// walk (loop detection happens here, not at container open), and its
    /// claimed size must fit the chain.
    pub(crate) fn check_stream_open(&mut self, id: DirId) -> Result<()> {
        let entry = self.dir.entry(id)?;
        if !entry.is_stream() {
            return Err(CompoundError::NotStream(entry.name.clone()));
        }
        let name = entry.name.clone();
        let size = entry.size;
        let start = entry.start;
        let cutoff = u64::from(self.header.mini_cutoff);
        let capacity = if size < cutoff {
            if start.is_regular() && self.alloc.mini_pool_cells() == 0 {
                return Err(CompoundError::NoMiniFat);
            }
            self.alloc.mini_chain(start)?.len() as u64 * MINI_SECTOR_SIZE
        } else {
            self.alloc.chain(start)?.len() as u64 * self.header.sector_size() as u64
        };
        if size > capacity {
            report(
                self.sink.as_mut(),
                Diagnostic::DirSize(format!(
                    "length ({size}) of stream {name} exceeds its chain ({capacity} bytes)"
                )),
            )?;
        }
        Ok(())
    }

    // ── stream I/O ──────────────────────────────────────────────────────

    /// Read from a stream at `pos`. Returns bytes read and whether device
    /// truncation was hit; `report_truncation` suppresses repeat warnings
    /// for a handle that has already seen one.
    pub(crate) fn stream_read(
        &mut self,
        id: DirId,
        pos: u64,
        buf: &mut [u8],
        report_truncation: bool,
    ) -> Result<(usize, bool)> {
        self.check_open()?;
        let entry = self.dir.entry(id)?;
        if !entry.is_stream() {
            return Err(CompoundError::NotStream(entry.name.clone()));
        }
        let size = entry.size;
        let start = entry.start;
        if pos >= size {
            return Ok((0, false));
        }
        let want = usize::try_from((size - pos).min(buf.len() as u64)).unwrap_or(buf.len());
        let cutoff = u64::from(self.header.mini_cutoff);
        let (n, truncated) = if size < cutoff {
            self.read_mini(start, pos, &mut buf[..want])?
        } else {
            self.read_normal(start, pos, &mut buf[..want])?
        };
        if truncated && report_truncation {
            report(
                self.sink.as_mut(),
                Diagnostic::Truncated("compound document appears to be truncated".into()),
            )?;
        }
        Ok((n, truncated))
    }

    fn read_normal(
        &mut self,
        start: SectorId,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<(usize, bool)> {
        let sector_size = self.header.sector_size() as u64;
        let chain = self.alloc.chain(start)?;
        let mut copied = 0;
        let mut truncated = false;
        while copied < buf.len() {
            let off = pos + copied as u64;
            let index = usize::try_from(off / sector_size).unwrap_or(usize::MAX);
            let Some(&sector) = chain.get(index) else {
                truncated = true;
                break;
            };
            let within = (off % sector_size) as usize;
            let take = (buf.len() - copied).min(sector_size as usize - within);
            let block = self.store.read(sector)?;
            truncated |= block.truncated;
            buf[copied..copied + take].copy_from_slice(&block.data[within..within + take]);
            copied += take;
        }
        Ok((copied, truncated))
    }

    fn read_mini(&mut self, start: SectorId, pos: u64, buf: &mut [u8]) -> Result<(usize, bool)> {
        if buf.is_empty() {
            return Ok((0, false));
        }
        if start.is_regular() && self.alloc.mini_pool_cells() == 0 {
            return Err(CompoundError::NoMiniFat);
        }
        let chain = self.alloc.mini_chain(start)?;
        let root_start = self.dir.root().start;
        let root_chain = self.alloc.chain(root_start)?;
        let sector_size = self.header.sector_size() as u64;
        let mut copied = 0;
        let mut truncated = false;
        while copied < buf.len() {
            let off = pos + copied as u64;
            let cell_index = usize::try_from(off / MINI_SECTOR_SIZE).unwrap_or(usize::MAX);
            let Some(&cell) = chain.get(cell_index) else {
                truncated = true;
                break;
            };
            let within_cell = off % MINI_SECTOR_SIZE;
            let take = (buf.len() - copied).min((MINI_SECTOR_SIZE - within_cell) as usize);
            let stream_off = u64::from(cell.0) * MINI_SECTOR_SIZE + within_cell;
            let sector_index = usize::try_from(stream_off / sector_size).unwrap_or(usize::MAX);
            let Some(&sector) = root_chain.get(sector_index) else {
                // Mini stream bytes missing from the backing chain.
                truncated = true;
                break;
            };
            let within_sector = (stream_off % sector_size) as usize;
            let block = self.store.read(sector)?;
            truncated |= block.truncated;
            buf[copied..copied + take]
                .copy_from_slice(&block.data[within_sector..within_sector + take]);
            copied += take;
        }
        Ok((copied, truncated))
    }

    /// Write to a stream at `pos`, extending and migrating pools as the
    /// new size requires.
    pub(crate) fn stream_write(&mut self, id: DirId, pos: u64, data: &[u8]) -> Result<()> {
        self.check_mutable()?;
        let entry = self.dir.entry(id)?;
        if !entry.is_stream() {
            return Err(CompoundError::NotStream(entry.name.clone()));
        }
        if data.is_empty() {
            return Ok(());
        }
        let old_size = entry.size;
        let end = pos + data.len() as u64;
        let new_size = old_size.max(end);
        self.ensure_stream_capacity(id, new_size)?;

        let start = self.dir.entry(id)?.start;
        let cutoff = u64::from(self.header.mini_cutoff);
        if new_size < cutoff {
            self.write_mini(start, pos, data)?;
        } else {
            self.write_normal(start, pos, data)?;
        }
        self.dir.entry_mut(id)?.size = new_size;
        Ok(())
    }

    fn write_normal(&mut self, start: SectorId, pos: u64, data: &[u8]) -> Result<()> {
        let sector_size = self.header.sector_size() as u64;
        let chain = self.alloc.chain(start)?;
        let mut written = 0;
        while written < data.len() {
            let off = pos + written as u64;
            let index = usize::try_from(off / sector_size).unwrap_or(usize::MAX);
            let &sector = chain.get(index).ok_or_else(|| {
                CompoundError::NormalFat(format!("chain at {start} shorter than the write"))
            })?;
            let within = (off % sector_size) as usize;
            let take = (data.len() - written).min(sector_size as usize - within);
            if within == 0 && take == sector_size as usize {
                self.store.write(sector, data[written..written + take].to_vec());
            } else {
                let mut block = self.store.read(sector)?.data;
                block[within..within + take].copy_from_slice(&data[written..written + take]);
                self.store.write(sector, block);
            }
            written += take;
        }
        Ok(())
    }

    fn write_mini(&mut self, start: SectorId, pos: u64, data: &[u8]) -> Result<()> {
        let chain = self.alloc.mini_chain(start)?;
        let root_start = self.dir.root().start;
        let root_chain = self.alloc.chain(root_start)?;
        let sector_size = self.header.sector_size() as u64;
        let mut written = 0;
        while written < data.len() {
            let off = pos + written as u64;
            let cell_index = usize::try_from(off / MINI_SECTOR_SIZE).unwrap_or(usize::MAX);
            let &cell = chain.get(cell_index).ok_or_else(|| {
                CompoundError::MiniFat(format!("mini chain at {start} shorter than the write"))
            })?;
            let within_cell = off % MINI_SECTOR_SIZE;
            let take = (data.len() - written).min((MINI_SECTOR_SIZE - within_cell) as usize);
            let stream_off = u64::from(cell.0) * MINI_SECTOR_SIZE + within_cell;
            let sector_index = usize::try_from(stream_off / sector_size).unwrap_or(usize::MAX);
            let &sector = root_chain.get(sector_index).ok_or_else(|| {
                CompoundError::MiniFat("mini stream backing chain too short".into())
            })?;
            let within_sector = (stream_off % sector_size) as usize;
            let mut block = self.store.read(sector)?.data;
            block[within_sector..within_sector + take]
                .copy_from_slice(&data[written..written + take]);
            self.store.write(sector, block);
            written += take;
        }
        Ok(())
    }

    /// Truncate or zero-extend a stream. Crossing the cutoff migrates the
    /// chain between pools immediately, in either direction.
    pub(crate) fn stream_set_len(&mut self, id: DirId, new_len: u64) -> Result<()> {
        self.check_mutable()?;
        let entry = self.dir.entry(id)?;
        if !entry.is_stream() {
            return Err(CompoundError::NotStream(entry.name.clone()));
        }
        let old_len = entry.size;
        if new_len == old_len {
            return Ok(());
        }
        if new_len > old_len {
            self.ensure_stream_capacity(id, new_len)?;
            self.dir.entry_mut(id)?.size = new_len;
            return Ok(());
        }

        let cutoff = u64::from(self.header.mini_cutoff);
        let old_mini = old_len < cutoff;
        let new_mini = new_len < cutoff;
        let start = entry.start;
        if old_mini == new_mini {
            let unit = if new_mini {
                MINI_SECTOR_SIZE
            } else {
                self.header.sector_size() as u64
            };
            let keep = usize::try_from(new_len.div_ceil(unit)).unwrap_or(usize::MAX);
            let new_start = if new_mini {
                self.alloc.truncate_mini(start, keep)?
            } else {
                self.alloc.truncate(start, keep)?
            };
            self.dir.entry_mut(id)?.start = new_start;
            self.dir.entry_mut(id)?.size = new_len;
            // Keep the tail of the last unit zeroed so later growth reads
            // zeros.
            let unit_end = new_len.div_ceil(unit) * unit;
            if unit_end > new_len && new_start.is_regular() {
                let zeros = vec![0_u8; (unit_end - new_len) as usize];
                if new_mini {
                    self.write_mini(new_start, new_len, &zeros)?;
                } else {
                    self.write_normal(new_start, new_len, &zeros)?;
                }
            }
        } else {
            // Shrinking across the cutoff: carry the surviving bytes down
            // into the mini pool.
            debug_assert!(!old_mini && new_mini);
            let mut survivors = vec![0_u8; usize::try_from(new_len).unwrap_or(0)];
            let (n, _) = self.read_normal(start, 0, &mut survivors)?;
            survivors.truncate(n);
            self.alloc.free(start)?;
            self.dir.entry_mut(id)?.start = SectorId::END_OF_CHAIN;
            self.dir.entry_mut(id)?.size = 0;
            if !survivors.is_empty() {
                self.ensure_stream_capacity(id, new_len)?;
                let mini_start = self.dir.entry(id)?.start;
                self.write_mini(mini_start, 0, &survivors)?;
            }
            self.dir.entry_mut(id)?.size = new_len;
        }
        Ok(())
    }

    pub(crate) fn stream_len(&self, id: DirId) -> Result<u64> {
        self.check_open()?;
        let entry = self.dir.entry(id)?;
        if !entry.is_stream() {
            return Err(CompoundError::NotStream(entry.name.clone()));
        }
        Ok(entry.size)
    }

    /// Grow a stream's chain (and migrate pools when the new size crosses
    /// the cutoff). Newly allocated units read as zeros.
    fn ensure_stream_capacity(&mut self, id: DirId, new_size: u64) -> Result<()> {
        let entry = self.dir.entry(id)?;
        let old_size = entry.size;
        let start = entry.start;
        let cutoff = u64::from(self.header.mini_cutoff);
        let old_mini = old_size < cutoff;
        let new_mini = new_size < cutoff;

        if old_mini == new_mini {
            if new_mini {
                let need = usize::try_from(new_size.div_ceil(MINI_SECTOR_SIZE)).unwrap_or(0);
                let have = self.alloc.mini_chain(start)?.len();
                if need > have {
                    self.reserve_mini_cells(need - have)?;
                    let (new_start, added) = self.alloc.extend_mini(start, need - have)?;
                    self.dir.entry_mut(id)?.start = new_start;
                    self.zero_mini_cells(&added)?;
                }
            } else {
                let sector_size = self.header.sector_size() as u64;
                let need = usize::try_from(new_size.div_ceil(sector_size)).unwrap_or(0);
                let have = self.alloc.chain(start)?.len();
                if need > have {
                    let (new_start, added) = self.alloc.extend(start, need - have)?;
                    self.dir.entry_mut(id)?.start = new_start;
                    for sector in added {
                        self.store.write_zeros(sector);
                    }
                }
            }
            return Ok(());
        }

        // Growing across the cutoff: lift the existing bytes into the
        // normal pool, then extend there.
        debug_assert!(old_mini && !new_mini);
        let mut content = vec![0_u8; usize::try_from(old_size).unwrap_or(0)];
        let (n, _) = self.read_mini(start, 0, &mut content)?;
        content.truncate(n);
        self.alloc.free_mini(start)?;

        let sector_size = self.header.sector_size() as u64;
        let need = usize::try_from(new_size.div_ceil(sector_size)).unwrap_or(0);
        let sectors = self.alloc.allocate(need);
        for &sector in &sectors {
            self.store.write_zeros(sector);
        }
        self.dir.entry_mut(id)?.start = sectors[0];
        if !content.is_empty() {
            self.write_normal(sectors[0], 0, &content)?;
        }
        Ok(())
    }

    /// Make at least `cells` free mini cells available, extending the root
    /// mini-stream by whole sectors.
    fn reserve_mini_cells(&mut self, cells: usize) -> Result<()> {
        let have = self.alloc.mini_free_cells();
        if have >= cells {
            return Ok(());
        }
        let sector_size = self.header.sector_size();
        let cells_per_sector = sector_size / MINI_SECTOR_SIZE as usize;
        let missing = cells - have;
        let sectors = missing.div_ceil(cells_per_sector);

        let root_start = self.dir.root().start;
        let (new_start, added) = self.alloc.extend(root_start, sectors)?;
        for &sector in &added {
            self.store.write_zeros(sector);
        }
        let root = self.dir.root_mut();
        root.start = new_start;
        root.size += (sectors * sector_size) as u64;
        self.alloc.grow_mini_pool(sectors * cells_per_sector);
        Ok(())
    }

    fn zero_mini_cells(&mut self, cells: &[SectorId]) -> Result<()> {
        let zeros = [0_u8; MINI_SECTOR_SIZE as usize];
        let root_start = self.dir.root().start;
        let root_chain = self.alloc.chain(root_start)?;
        let sector_size = self.header.sector_size() as u64;
        for &cell in cells {
            let stream_off = u64::from(cell.0) * MINI_SECTOR_SIZE;
            let sector_index = usize::try_from(stream_off / sector_size).unwrap_or(usize::MAX);
            let &sector = root_chain.get(sector_index).ok_or_else(|| {
                CompoundError::MiniFat("mini stream backing chain too short".into())
            })?;
            let within = (stream_off % sector_size) as usize;
            let mut block = self.store.read(sector)?.data;
            block[within..within + MINI_SECTOR_SIZE as usize].copy_from_slice(&zeros);
            self.store.write(sector, block);
        }
        Ok(())
    }

    /// Free whichever chain backs a stream of the given size.
    fn free_stream_chain(&mut self, start: SectorId, size: u64) -> Result<()> {
        if !start.is_regular() {
            return Ok(());
        }
        if size < u64::from(self.header.mini_cutoff) {
            self.alloc.free_mini(start)?;
        } else {
            self.alloc.free(start)?;
        }
        Ok(())
    }

    fn delete_recursive(&mut self, parent: DirId, id: DirId) -> Result<()> {
        // Collect the subtree first; descendants leave no tree behind, so
        // only the top entry is unlinked from a sibling tree.
        let mut descendants = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if cur != id {
                descendants.push(cur);
            }
            if self.dir.entry(cur)?.is_storage() {
                stack.extend(self.dir.children(cur)?);
            }
        }
        for d in descendants.into_iter().rev() {
            let (start, size) = {
                let e = self.dir.entry(d)?;
                (e.start, e.size)
            };
            self.free_stream_chain(start, size)?;
            self.dir.release_slot(d);
        }
        let (start, size) = {
            let e = self.dir.entry(id)?;
            (e.start, e.size)
        };
        self.free_stream_chain(start, size)?;
        self.dir.remove(parent, id)
    }

    // ── flush ───────────────────────────────────────────────────────────

    /// Resize a metadata chain (directory or MiniFAT) to exactly `needed`
    /// sectors and return it.
    fn adjust_chain(
        &mut self,
        start: SectorId,
        needed: usize,
    ) -> Result<(SectorId, Vec<SectorId>)> {
        let current = if start.is_end() {
            Vec::new()
        } else {
            self.alloc.chain(start)?
        };
        let mut start = start;
        if current.len() < needed {
            let (s, _) = self.alloc.extend(start, needed - current.len())?;
            start = s;
        } else if current.len() > needed {
            start = self.alloc.truncate(start, needed)?;
        }
        let chain = if start.is_end() {
            Vec::new()
        } else {
            self.alloc.chain(start)?
        };
        Ok((start, chain))
    }

    pub(crate) fn save(&mut self) -> Result<()> {
        self.check_mutable()?;
        let sector_size = self.header.sector_size();

        // Directory sectors
        let dir_needed = self.dir.sector_count();
        let (dir_start, dir_chain) = self.adjust_chain(self.header.first_dir_sector, dir_needed)?;
        self.header.first_dir_sector = dir_start;
        self.header.num_dir_sectors = if self.header.major_version == 3 {
            0
        } else {
            dir_chain.len() as u32
        };
        let dir_bytes = self.dir.encode(sector_size);
        for (i, &sector) in dir_chain.iter().enumerate() {
            self.store
                .write(sector, dir_bytes[i * sector_size..(i + 1) * sector_size].to_vec());
        }

        // MiniFAT sectors
        let mini_needed = self.alloc.minifat_sectors_needed();
        let (mini_start, mini_chain) =
            self.adjust_chain(self.header.first_minifat_sector, mini_needed)?;
        self.header.first_minifat_sector = mini_start;
        self.header.num_minifat_sectors = mini_chain.len() as u32;
        self.alloc.store_minifat(&mut self.store, &mini_chain);

        // FAT and DIFAT, then the header last
        self.alloc.store_tables(&mut self.store, &mut self.header)?;
        self.store.flush(&self.header.encode())?;
        Ok(())
    }
}

impl<D: ByteDevice> CompoundFile<D> {
    /// Which pool a stream currently lives in (by the size rule).
    pub fn stream_pool(&self, entry: &Entry) -> Result<Pool> {
        let inner = self.inner.lock();
        inner.check_open()?;
        let e = inner.dir.entry(entry.id)?;
        if !e.is_stream() {
            return Err(CompoundError::NotStream(e.name.clone()));
        }
        if e.size < u64::from(inner.header.mini_cutoff) {
            Ok(Pool::Mini)
        } else {
            Ok(Pool::Normal)
        }
    }

    /// Number of sectors (or mini cells) backing a stream's chain.
    pub fn stream_sectors(&self, entry: &Entry) -> Result<usize> {
        let inner = self.inner.lock();
        inner.check_open()?;
        let e = inner.dir.entry(entry.id)?;
        if !e.is_stream() {
            return Err(CompoundError::NotStream(e.name.clone()));
        }
        if e.size < u64::from(inner.header.mini_cutoff) {
            Ok(inner.alloc.mini_chain(e.start)?.len())
        } else {
            Ok(inner.alloc.chain(e.start)?.len())
        }
    }
}

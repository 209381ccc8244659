//! The directory: a flat table of 128-byte entries forming nested
//! red-black trees of named storages and streams.
//!
//! Entries are addressed by [`DirId`]. Each storage's `child` points at
//! the root of its sibling tree; the hierarchy nests through `child`
//! edges only, so the whole structure is a vector plus index links.

pub mod entry;
pub(crate) mod rbtree;

use crate::diag::{report, Diagnostic, DiagnosticSink};
use crate::error::{CompoundError, Result};
use crate::types::DirId;
use entry::{cmp_names, validate_name, DirEntry, DIR_ENTRY_SIZE};
use rbtree::TreeHealth;
use std::cmp::Ordering;
use std::collections::HashSet;

/// In-memory directory with LIFO reuse of unallocated slots.
pub(crate) struct Directory {
    entries: Vec<DirEntry>,
    free_slots: Vec<DirId>,
    entries_per_sector: usize,
}

impl Directory {
    /// Fresh directory holding just the root entry, padded to a whole
    /// directory sector.
    pub fn new(sector_size: usize) -> Self {
        let entries_per_sector = sector_size / DIR_ENTRY_SIZE;
        let mut entries = vec![DirEntry::root()];
        entries.resize(entries_per_sector, DirEntry::empty());
        let free_slots = (1..entries_per_sector)
            .rev()
            .map(|i| DirId(i as u32))
            .collect();
        Directory {
            entries,
            free_slots,
            entries_per_sector,
        }
    }

    /// Decode a directory from the raw bytes of its sector chain.
    pub fn load(
        bytes: &[u8],
        sector_size: usize,
        small_sector_file: bool,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<Self> {
        let entries_per_sector = sector_size / DIR_ENTRY_SIZE;
        let count = bytes.len() / DIR_ENTRY_SIZE;
        if count == 0 {
            return Err(CompoundError::DirEntry(
                "directory chain holds no entries".into(),
            ));
        }
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let slice = &bytes[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE];
            entries.push(DirEntry::decode(
                slice,
                DirId(i as u32),
                small_sector_file,
                sink,
            )?);
        }
        let free_slots = (1..count)
            .rev()
            .filter(|i| entries[*i].is_empty_slot())
            .map(|i| DirId(i as u32))
            .collect();
        let mut dir = Directory {
            entries,
            free_slots,
            entries_per_sector,
        };
        dir.repair_trees(sink)?;
        Ok(dir)
    }

    pub fn entry(&self, id: DirId) -> Result<&DirEntry> {
        self.entries
            .get(id.index())
            .filter(|e| !e.is_empty_slot())
            .ok_or_else(|| CompoundError::DirEntry(format!("no entry at index {id}")))
    }

    pub fn entry_mut(&mut self, id: DirId) -> Result<&mut DirEntry> {
        self.entries
            .get_mut(id.index())
            .filter(|e| !e.is_empty_slot())
            .ok_or_else(|| CompoundError::DirEntry(format!("no entry at index {id}")))
    }

    pub fn root(&self) -> &DirEntry {
        &self.entries[0]
    }

    pub fn root_mut(&mut self) -> &mut DirEntry {
        &mut self.entries[0]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sectors needed to persist the table.
    pub fn sector_count(&self) -> usize {
        self.entries.len().div_ceil(self.entries_per_sector)
    }

    // ── lookup ──────────────────────────────────────────────────────────

    /// BST descent through a storage's sibling tree. Case-insensitive by
    /// construction of the ordering key.
    pub fn lookup(&self, storage: DirId, name: &str) -> Result<Option<DirId>> {
        let parent = self.entry(storage)?;
        if !parent.is_storage() {
            return Err(CompoundError::NotStorage(parent.name.clone()));
        }
        let mut cur = parent.child;
        let mut steps = 0;
        while cur.is_some() {
            if cur.index() >= self.entries.len() {
                return Err(CompoundError::DirEntry(format!(
                    "sibling index {cur} out of range"
                )));
            }
            steps += 1;
            if steps > self.entries.len() {
                return Err(CompoundError::DirLoop(cur));
            }
            let node = &self.entries[cur.index()];
            match cmp_names(name, &node.name) {
                Ordering::Equal => return Ok(Some(cur)),
                Ordering::Less => cur = node.left,
                Ordering::Greater => cur = node.right,
            }
        }
        Ok(None)
    }

    /// Resolve a `/`-separated path from the root storage. Empty segments
    /// are skipped, so a leading `/` means the root.
    pub fn lookup_path(&self, path: &str) -> Result<DirId> {
        self.lookup_path_parent(path).map(|(id, _)| id)
    }

    /// Like [`lookup_path`](Self::lookup_path), also returning the parent
    /// storage of the resolved entry (`NOSTREAM` for the root itself).
    pub fn lookup_path_parent(&self, path: &str) -> Result<(DirId, DirId)> {
        let mut cur = DirId::ROOT;
        let mut parent = DirId::NONE;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !self.entry(cur)?.is_storage() {
                return Err(CompoundError::NotFound(path.into()));
            }
            parent = cur;
            cur = self
                .lookup(cur, segment)?
                .ok_or_else(|| CompoundError::NotFound(path.into()))?;
        }
        Ok((cur, parent))
    }

    /// In-order children of a storage.
    pub fn children(&self, storage: DirId) -> Result<Vec<DirId>> {
        let parent = self.entry(storage)?;
        if !parent.is_storage() {
            return Err(CompoundError::NotStorage(parent.name.clone()));
        }
        rbtree::in_order(&self.entries, parent.child)
    }

    // ── mutation ────────────────────────────────────────────────────────

    /// Insert a fresh entry under a storage. Fails on name collisions
    /// without touching the tree.
    pub fn insert(&mut self, storage: DirId, entry: DirEntry) -> Result<DirId> {
        validate_name(&entry.name)?;
        if self.lookup(storage, &entry.name)?.is_some() {
            return Err(CompoundError::Exists(entry.name));
        }
        let id = self.alloc_slot();
        self.entries[id.index()] = entry;
        let old_root = self.entries[storage.index()].child;
        let new_root = rbtree::insert(&mut self.entries, old_root, id);
        self.entries[storage.index()].child = new_root;
        Ok(id)
    }

    /// Unlink an entry from its parent storage's tree and release its
    /// slot. Chains are the caller's responsibility.
    pub fn remove(&mut self, storage: DirId, id: DirId) -> Result<()> {
        let old_root = self.entry(storage)?.child;
        let new_root = rbtree::remove(&mut self.entries, old_root, id);
        self.entries[storage.index()].child = new_root;
        self.release_slot(id);
        Ok(())
    }

    /// Mark a slot unallocated and stack it for LIFO reuse. Used directly
    /// for descendants of a deleted storage, which leave no tree behind.
    pub fn release_slot(&mut self, id: DirId) {
        self.entries[id.index()] = DirEntry::empty();
        self.free_slots.push(id);
    }

    /// Rename in place: the ordering key changes, so the entry is
    /// unlinked and re-inserted under the same id.
    pub fn rename(&mut self, storage: DirId, id: DirId, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        if let Some(existing) = self.lookup(storage, new_name)? {
            if existing != id {
                return Err(CompoundError::Exists(new_name.into()));
            }
            // Only the case changed; the ordering key is identical.
            self.entries[id.index()].name = new_name.into();
            return Ok(());
        }
        let old_root = self.entry(storage)?.child;
        let without = rbtree::remove(&mut self.entries, old_root, id);
        self.entries[id.index()].name = new_name.into();
        let new_root = rbtree::insert(&mut self.entries, without, id);
        self.entries[storage.index()].child = new_root;
        Ok(())
    }

    fn alloc_slot(&mut self) -> DirId {
        if let Some(id) = self.free_slots.pop() {
            return id;
        }
        // Grow by a whole directory sector of empty slots.
        let old_len = self.entries.len();
        self.entries
            .resize(old_len + self.entries_per_sector, DirEntry::empty());
        for i in (old_len + 1..self.entries.len()).rev() {
            self.free_slots.push(DirId(i as u32));
        }
        DirId(old_len as u32)
    }

    // ── load-time structural repair ─────────────────────────────────────

    /// Validate every storage's sibling tree, pruning unusable links and
    /// relinking trees whose order or coloring is broken. Loops through
    /// sibling edges, or an entry claimed by two storages, are fatal.
    fn repair_trees(&mut self, sink: &mut dyn DiagnosticSink) -> Result<()> {
        let mut claimed: HashSet<DirId> = HashSet::new();
        let mut storages = vec![DirId::ROOT];
        let mut seen_storages = HashSet::new();
        while let Some(storage) = storages.pop() {
            if !seen_storages.insert(storage) {
                return Err(CompoundError::DirLoop(storage));
            }
            self.sanitize_subtree(storage, &mut claimed, sink)?;

            let child = self.entries[storage.index()].child;
            let ids = rbtree::in_order(&self.entries, child)?;
            match rbtree::validate(&self.entries, child)? {
                TreeHealth::Healthy => {}
                TreeHealth::Miscolored => {
                    // Order intact: repaired without comment, the links
                    // just get rebuilt around the same sequence.
                    let root = rbtree::build_balanced(&mut self.entries, &ids);
                    self.entries[storage.index()].child = root;
                }
                TreeHealth::Disordered => {
                    report(
                        sink,
                        Diagnostic::DirIndex(format!(
                            "sibling tree of storage {storage} is out of order; rebuilt"
                        )),
                    )?;
                    let mut sorted = ids.clone();
                    sorted.sort_by(|a, b| {
                        cmp_names(&self.entries[a.index()].name, &self.entries[b.index()].name)
                    });
                    let root = rbtree::build_balanced(&mut self.entries, &sorted);
                    self.entries[storage.index()].child = root;
                }
            }

            for id in ids {
                if self.entries[id.index()].is_storage() {
                    storages.push(id);
                }
            }
        }
        Ok(())
    }

    /// Clear sibling/child links that point out of range or at
    /// unallocated slots; detect entries reachable from two places.
    fn sanitize_subtree(
        &mut self,
        storage: DirId,
        claimed: &mut HashSet<DirId>,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<()> {
        let child = self.entries[storage.index()].child;
        if child.is_some() && !self.link_target_valid(child) {
            report(
                sink,
                Diagnostic::DirIndex(format!(
                    "invalid child index {child} in storage {storage}"
                )),
            )?;
            self.entries[storage.index()].child = DirId::NONE;
            return Ok(());
        }

        let mut stack = vec![self.entries[storage.index()].child];
        while let Some(id) = stack.pop() {
            if id.is_none() {
                continue;
            }
            if !claimed.insert(id) {
                return Err(CompoundError::DirLoop(id));
            }
            for side in [true, false] {
                let link = if side {
                    self.entries[id.index()].left
                } else {
                    self.entries[id.index()].right
                };
                if link.is_none() {
                    continue;
                }
                if !self.link_target_valid(link) {
                    report(
                        sink,
                        Diagnostic::DirIndex(format!(
                            "invalid sibling index {link} in entry {id}"
                        )),
                    )?;
                    if side {
                        self.entries[id.index()].left = DirId::NONE;
                    } else {
                        self.entries[id.index()].right = DirId::NONE;
                    }
                } else {
                    stack.push(link);
                }
            }
        }
        Ok(())
    }

    fn link_target_valid(&self, id: DirId) -> bool {
        id.index() < self.entries.len() && !self.entries[id.index()].is_empty_slot()
    }

    // ── persistence ─────────────────────────────────────────────────────

    /// Serialize the whole table, padded to whole sectors.
    pub fn encode(&self, sector_size: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.sector_count() * sector_size);
        for entry in &self.entries {
            bytes.extend_from_slice(&entry.encode());
        }
        bytes.resize(self.sector_count() * sector_size, 0);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::CollectSink;
    use crate::types::SectorId;
    use entry::{Color, EntryType};

    fn stream(name: &str) -> DirEntry {
        DirEntry {
            name: name.into(),
            entry_type: EntryType::Stream,
            ..DirEntry::empty()
        }
    }

    fn storage(name: &str) -> DirEntry {
        DirEntry {
            name: name.into(),
            entry_type: EntryType::Storage,
            ..DirEntry::empty()
        }
    }

    #[test]
    fn test_new_directory_fills_one_sector() {
        let dir = Directory::new(512);
        assert_eq!(dir.len(), 4);
        assert_eq!(dir.sector_count(), 1);
        assert_eq!(dir.root().entry_type, EntryType::Root);
    }

    #[test]
    fn test_insert_lookup_children() {
        let mut dir = Directory::new(512);
        let s = dir.insert(DirId::ROOT, storage("S")).unwrap();
        let a = dir.insert(s, stream("a")).unwrap();
        dir.insert(s, stream("b")).unwrap();

        assert_eq!(dir.lookup(s, "a").unwrap(), Some(a));
        assert_eq!(dir.lookup(s, "A").unwrap(), Some(a), "case-insensitive");
        assert_eq!(dir.lookup(s, "missing").unwrap(), None);

        let kids = dir.children(s).unwrap();
        let names: Vec<&str> = kids
            .iter()
            .map(|id| dir.entry(*id).unwrap().name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_insert_collision_fails() {
        let mut dir = Directory::new(512);
        dir.insert(DirId::ROOT, stream("x")).unwrap();
        assert!(matches!(
            dir.insert(DirId::ROOT, stream("x")),
            Err(CompoundError::Exists(_))
        ));
        // Collisions are case-insensitive
        assert!(matches!(
            dir.insert(DirId::ROOT, stream("X")),
            Err(CompoundError::Exists(_))
        ));
    }

    #[test]
    fn test_lookup_path() {
        let mut dir = Directory::new(512);
        let s = dir.insert(DirId::ROOT, storage("S")).unwrap();
        let a = dir.insert(s, stream("a")).unwrap();

        assert_eq!(dir.lookup_path("/S/a").unwrap(), a);
        assert_eq!(dir.lookup_path("S/a").unwrap(), a);
        assert_eq!(dir.lookup_path("//S//a").unwrap(), a, "empty segments skip");
        assert_eq!(dir.lookup_path("/").unwrap(), DirId::ROOT);
        assert!(matches!(
            dir.lookup_path("/S/zz"),
            Err(CompoundError::NotFound(_))
        ));
        assert!(matches!(
            dir.lookup_path("/S/a/deeper"),
            Err(CompoundError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_only_child_clears_child_pointer() {
        let mut dir = Directory::new(512);
        let s = dir.insert(DirId::ROOT, storage("S")).unwrap();
        let a = dir.insert(s, stream("a")).unwrap();
        dir.remove(s, a).unwrap();
        assert!(dir.entry(s).unwrap().child.is_none());
        assert!(dir.entries[a.index()].is_empty_slot());
    }

    #[test]
    fn test_slot_reuse_is_lifo() {
        let mut dir = Directory::new(512);
        let s = dir.insert(DirId::ROOT, storage("S")).unwrap();
        let a = dir.insert(s, stream("a")).unwrap();
        dir.remove(s, a).unwrap();
        let b = dir.insert(s, stream("b")).unwrap();
        assert_eq!(a, b, "freed slot is reused first");
    }

    #[test]
    fn test_directory_grows_by_whole_sectors() {
        let mut dir = Directory::new(512);
        for i in 0..8 {
            dir.insert(DirId::ROOT, stream(&format!("s{i}"))).unwrap();
        }
        assert_eq!(dir.len() % 4, 0);
        assert!(dir.sector_count() >= 3);
    }

    #[test]
    fn test_rename_reorders() {
        let mut dir = Directory::new(512);
        let s = dir.insert(DirId::ROOT, storage("S")).unwrap();
        let aa = dir.insert(s, stream("aa")).unwrap();
        dir.insert(s, stream("bb")).unwrap();

        dir.rename(s, aa, "zz").unwrap();
        let names: Vec<String> = dir
            .children(s)
            .unwrap()
            .iter()
            .map(|id| dir.entry(*id).unwrap().name.clone())
            .collect();
        assert_eq!(names, vec!["bb", "zz"]);
        assert_eq!(
            rbtree::validate(&dir.entries, dir.entry(s).unwrap().child).unwrap(),
            TreeHealth::Healthy
        );
    }

    #[test]
    fn test_rename_collision_leaves_tree_untouched() {
        let mut dir = Directory::new(512);
        let s = dir.insert(DirId::ROOT, storage("S")).unwrap();
        let aa = dir.insert(s, stream("aa")).unwrap();
        dir.insert(s, stream("bb")).unwrap();

        assert!(matches!(
            dir.rename(s, aa, "bb"),
            Err(CompoundError::Exists(_))
        ));
        let names: Vec<String> = dir
            .children(s)
            .unwrap()
            .iter()
            .map(|id| dir.entry(*id).unwrap().name.clone())
            .collect();
        assert_eq!(names, vec!["aa", "bb"]);
    }

    #[test]
    fn test_rename_case_only() {
        let mut dir = Directory::new(512);
        let a = dir.insert(DirId::ROOT, stream("data")).unwrap();
        dir.rename(DirId::ROOT, a, "DATA").unwrap();
        assert_eq!(dir.entry(a).unwrap().name, "DATA");
    }

    #[test]
    fn test_load_round_trip() {
        let mut dir = Directory::new(512);
        let s = dir.insert(DirId::ROOT, storage("S")).unwrap();
        let mut st = stream("a");
        st.start = SectorId(3);
        st.size = 5;
        dir.insert(s, st).unwrap();

        let bytes = dir.encode(512);
        let mut sink = CollectSink::new();
        let loaded = Directory::load(&bytes, 512, true, &mut sink).unwrap();
        assert!(sink.is_empty());
        let a = loaded.lookup_path("/S/a").unwrap();
        assert_eq!(loaded.entry(a).unwrap().size, 5);
        assert_eq!(loaded.entry(a).unwrap().start, SectorId(3));
    }

    #[test]
    fn test_load_repairs_miscolored_tree_silently() {
        let mut dir = Directory::new(512);
        for name in ["a", "bb", "ccc"] {
            dir.insert(DirId::ROOT, stream(name)).unwrap();
        }
        // Break the coloring only
        let child = dir.root().child;
        dir.entries[child.index()].color = Color::Red;
        let bytes = dir.encode(512);

        let mut sink = CollectSink::new();
        let loaded = Directory::load(&bytes, 512, true, &mut sink).unwrap();
        assert!(sink.is_empty(), "color-only repair is silent");
        assert_eq!(
            rbtree::validate(&loaded.entries, loaded.root().child).unwrap(),
            TreeHealth::Healthy
        );
    }

    #[test]
    fn test_load_rebuilds_disordered_tree_with_diagnostic() {
        let mut dir = Directory::new(512);
        for name in ["a", "bb", "ccc"] {
            dir.insert(DirId::ROOT, stream(name)).unwrap();
        }
        // Swap two names behind the tree's back
        let ids = dir.children(DirId::ROOT).unwrap();
        dir.entries[ids[0].index()].name = "zzzz".into();
        let bytes = dir.encode(512);

        let mut sink = CollectSink::new();
        let loaded = Directory::load(&bytes, 512, true, &mut sink).unwrap();
        assert!(sink
            .diagnostics()
            .iter()
            .any(|d| matches!(d, Diagnostic::DirIndex(_))));
        let names: Vec<String> = loaded
            .children(DirId::ROOT)
            .unwrap()
            .iter()
            .map(|id| loaded.entry(*id).unwrap().name.clone())
            .collect();
        assert_eq!(names, vec!["bb", "ccc", "zzzz"]);
    }

    #[test]
    fn test_load_detects_sibling_loop() {
        let mut dir = Directory::new(512);
        for name in ["a", "bb", "ccc"] {
            dir.insert(DirId::ROOT, stream(name)).unwrap();
        }
        let ids = dir.children(DirId::ROOT).unwrap();
        // Leaf points back at the tree root
        let root_id = dir.root().child;
        let leaf = *ids
            .iter()
            .find(|id| {
                let e = dir.entry(**id).unwrap();
                e.left.is_none() && e.right.is_none()
            })
            .unwrap();
        dir.entries[leaf.index()].right = root_id;
        let bytes = dir.encode(512);

        let mut sink = CollectSink::new();
        assert!(matches!(
            Directory::load(&bytes, 512, true, &mut sink),
            Err(CompoundError::DirLoop(_))
        ));
    }

    #[test]
    fn test_load_prunes_out_of_range_link() {
        let mut dir = Directory::new(512);
        let a = dir.insert(DirId::ROOT, stream("a")).unwrap();
        dir.entries[a.index()].left = DirId(999);
        let bytes = dir.encode(512);

        let mut sink = CollectSink::new();
        let loaded = Directory::load(&bytes, 512, true, &mut sink).unwrap();
        assert!(sink
            .diagnostics()
            .iter()
            .any(|d| matches!(d, Diagnostic::DirIndex(_))));
        assert_eq!(loaded.children(DirId::ROOT).unwrap().len(), 1);
    }
}

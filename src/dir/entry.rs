//! The 128-byte directory entry codec and the storage ordering key.

use crate::diag::{report, Diagnostic, DiagnosticSink};
use crate::error::{CompoundError, Result};
use crate::types::{read_dir_id, read_sector_id, read_u16, read_u32, read_u64, DirId, SectorId, Timestamp};
use std::cmp::Ordering;
use uuid::Uuid;

/// Size of one directory entry on disk.
pub const DIR_ENTRY_SIZE: usize = 128;

/// Longest representable name: 31 UTF-16 code units plus the terminator.
pub const MAX_NAME_UNITS: usize = 31;

/// Object type of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    /// Unallocated slot, reusable by a later insert.
    Empty = 0,
    /// A named container of other entries.
    Storage = 1,
    /// A named byte sequence.
    Stream = 2,
    /// The root storage; exactly one, at directory index 0. Its start
    /// sector and size describe the mini-stream.
    Root = 5,
}

/// Red-black color of a directory entry. Advisory on read; restored by the
/// write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Red = 0,
    Black = 1,
}

/// One directory entry, indexed by [`DirId`] in the directory sequence.
///
/// Sibling and child edges are ids, not references, so the per-storage
/// red-black trees cannot form ownership cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub entry_type: EntryType,
    pub color: Color,
    pub left: DirId,
    pub right: DirId,
    pub child: DirId,
    pub clsid: Uuid,
    pub state: u32,
    pub created: Timestamp,
    pub modified: Timestamp,
    /// Start of the entry's chain; for the root entry, of the mini-stream.
    /// `ENDOFCHAIN` when there is no chain.
    pub start: SectorId,
    pub size: u64,
}

impl DirEntry {
    /// A blank, unallocated slot.
    #[must_use]
    pub fn empty() -> Self {
        DirEntry {
            name: String::new(),
            entry_type: EntryType::Empty,
            color: Color::Black,
            left: DirId::NONE,
            right: DirId::NONE,
            child: DirId::NONE,
            clsid: Uuid::nil(),
            state: 0,
            created: Timestamp::UNSET,
            modified: Timestamp::UNSET,
            start: SectorId::END_OF_CHAIN,
            size: 0,
        }
    }

    /// The root storage entry of a fresh container.
    #[must_use]
    pub fn root() -> Self {
        DirEntry {
            name: "Root Entry".into(),
            entry_type: EntryType::Root,
            ..DirEntry::empty()
        }
    }

    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(self.entry_type, EntryType::Storage | EntryType::Root)
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.entry_type == EntryType::Stream
    }

    #[must_use]
    pub fn is_empty_slot(&self) -> bool {
        self.entry_type == EntryType::Empty
    }

    /// Decode one entry, substituting recoverable nonsense per field.
    ///
    /// `small_sector_file` selects the version-3 size rules (the upper 32
    /// size bits are meaningless there and a size of 2 GiB or more cannot
    /// be valid).
    pub fn decode(
        bytes: &[u8],
        id: DirId,
        small_sector_file: bool,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<DirEntry> {
        debug_assert!(bytes.len() >= DIR_ENTRY_SIZE);

        let name_len = read_u16(bytes, 64) as usize;
        let units: Vec<u16> = (0..32).map(|k| read_u16(bytes, k * 2)).collect();
        let name = match units.iter().position(|u| *u == 0) {
            Some(end) => String::from_utf16_lossy(&units[..end]),
            None => {
                report(
                    sink,
                    Diagnostic::DirName(format!("missing NUL terminator in name of entry {id}")),
                )?;
                let end = (name_len / 2).saturating_sub(1).min(32);
                String::from_utf16_lossy(&units[..end])
            }
        };

        let raw_type = bytes[66];
        let mut entry_type = match raw_type {
            0 => EntryType::Empty,
            1 => EntryType::Storage,
            2 => EntryType::Stream,
            5 => EntryType::Root,
            other => {
                report(
                    sink,
                    Diagnostic::DirType(format!("invalid type {other} in entry {id}")),
                )?;
                EntryType::Empty
            }
        };
        if id == DirId::ROOT && entry_type != EntryType::Root {
            report(
                sink,
                Diagnostic::DirType(format!("entry 0 has type {raw_type}, expected root storage")),
            )?;
            entry_type = EntryType::Root;
        } else if id != DirId::ROOT && entry_type == EntryType::Root {
            report(
                sink,
                Diagnostic::DirType(format!("entry {id} claims to be the root storage")),
            )?;
            entry_type = EntryType::Storage;
        }

        if entry_type == EntryType::Empty {
            if !name.is_empty() {
                report(
                    sink,
                    Diagnostic::DirName(format!("non-empty name in unallocated entry {id}")),
                )?;
            }
        } else if (name.encode_utf16().count() + 1) * 2 != name_len {
            report(
                sink,
                Diagnostic::DirName(format!(
                    "invalid name length {name_len} in entry {id}"
                )),
            )?;
        }

        let color = if bytes[67] == 0 { Color::Red } else { Color::Black };
        let mut left = read_dir_id(bytes, 68);
        let mut right = read_dir_id(bytes, 72);
        let mut child = read_dir_id(bytes, 76);

        if matches!(entry_type, EntryType::Root | EntryType::Empty)
            && (left.is_some() || right.is_some())
        {
            report(
                sink,
                Diagnostic::DirIndex(format!("entry {id} must not have siblings")),
            )?;
            left = DirId::NONE;
            right = DirId::NONE;
        }
        if matches!(entry_type, EntryType::Stream | EntryType::Empty) && child.is_some() {
            report(
                sink,
                Diagnostic::DirIndex(format!("entry {id} must not have a child")),
            )?;
            child = DirId::NONE;
        }

        let mut clsid_bytes = [0_u8; 16];
        clsid_bytes.copy_from_slice(&bytes[80..96]);
        let clsid = Uuid::from_bytes(clsid_bytes);
        let state = read_u32(bytes, 96);
        let created = Timestamp(read_u64(bytes, 100));
        let modified = Timestamp(read_u64(bytes, 108));
        for (label, ticks) in [("creation", created.0), ("modification", modified.0)] {
            // Anything before ~1601-01-01T00:00:01 or after year ~3169 is noise.
            if ticks != 0 && !(10_000_000..=999_999_999_999_999_999).contains(&ticks) {
                report(
                    sink,
                    Diagnostic::DirTime(format!(
                        "implausible {label} timestamp {ticks} in entry {id}"
                    )),
                )?;
            }
        }

        let raw_start = read_sector_id(bytes, 116);
        let mut size = read_u64(bytes, 120);
        let mut start = raw_start;

        match entry_type {
            EntryType::Storage | EntryType::Empty => {
                if raw_start.0 != 0 {
                    report(
                        sink,
                        Diagnostic::DirSector(format!(
                            "non-zero start sector ({raw_start}) in entry {id}"
                        )),
                    )?;
                }
                if size != 0 {
                    report(
                        sink,
                        Diagnostic::DirSize(format!("non-zero size ({size}) in entry {id}")),
                    )?;
                }
                start = SectorId::END_OF_CHAIN;
                size = 0;
            }
            EntryType::Stream | EntryType::Root => {
                if small_sector_file {
                    if size >> 32 != 0 {
                        report(
                            sink,
                            Diagnostic::DirSize(format!(
                                "non-zero size high-bits in entry {id} of a small-sector file"
                            )),
                        )?;
                        size &= 0xFFFF_FFFF;
                    }
                    if size >= 1 << 31 {
                        report(
                            sink,
                            Diagnostic::DirSize(format!(
                                "size {size} too large for a small-sector file (entry {id})"
                            )),
                        )?;
                    }
                }
            }
        }

        Ok(DirEntry {
            name,
            entry_type,
            color,
            left,
            right,
            child,
            clsid,
            state,
            created,
            modified,
            start,
            size,
        })
    }

    /// Serialize into the 128-byte on-disk form.
    #[must_use]
    pub fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut bytes = [0_u8; DIR_ENTRY_SIZE];

        if self.entry_type != EntryType::Empty {
            let units: Vec<u16> = self.name.encode_utf16().take(MAX_NAME_UNITS).collect();
            for (k, unit) in units.iter().enumerate() {
                bytes[k * 2..k * 2 + 2].copy_from_slice(&unit.to_le_bytes());
            }
            let name_len = ((units.len() + 1) * 2) as u16;
            bytes[64..66].copy_from_slice(&name_len.to_le_bytes());
        }
        bytes[66] = self.entry_type as u8;
        bytes[67] = self.color as u8;
        bytes[68..72].copy_from_slice(&self.left.0.to_le_bytes());
        bytes[72..76].copy_from_slice(&self.right.0.to_le_bytes());
        bytes[76..80].copy_from_slice(&self.child.0.to_le_bytes());
        bytes[80..96].copy_from_slice(self.clsid.as_bytes());
        bytes[96..100].copy_from_slice(&self.state.to_le_bytes());
        bytes[100..108].copy_from_slice(&self.created.0.to_le_bytes());
        bytes[108..116].copy_from_slice(&self.modified.0.to_le_bytes());
        let (start, size) = match self.entry_type {
            // Storages and free slots persist a zeroed stream description.
            EntryType::Storage | EntryType::Empty => (0, 0),
            EntryType::Stream | EntryType::Root => (self.start.0, self.size),
        };
        bytes[116..120].copy_from_slice(&start.to_le_bytes());
        bytes[120..128].copy_from_slice(&size.to_le_bytes());
        bytes
    }
}

/// Reject names the format cannot represent or the path API cannot address.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CompoundError::DirEntry("name must not be empty".into()));
    }
    if name.contains('\0') {
        return Err(CompoundError::DirEntry(format!(
            "name {name:?} contains a NUL character"
        )));
    }
    if name.contains('/') {
        return Err(CompoundError::DirEntry(format!(
            "name {name:?} contains the path separator '/'"
        )));
    }
    if name.encode_utf16().count() > MAX_NAME_UNITS {
        return Err(CompoundError::NameTooLong(name.into()));
    }
    Ok(())
}

/// Storage ordering: shorter UTF-16 names sort first; equal lengths compare
/// by upper-cased code units.
pub fn cmp_names(a: &str, b: &str) -> Ordering {
    let a_units: Vec<u16> = a.encode_utf16().collect();
    let b_units: Vec<u16> = b.encode_utf16().collect();
    a_units.len().cmp(&b_units.len()).then_with(|| {
        for (&x, &y) in a_units.iter().zip(&b_units) {
            let ord = upcase_unit(x).cmp(&upcase_unit(y));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    })
}

/// Simple (single code unit) Unicode upper-casing. Code units whose
/// uppercase form would expand, or unpaired surrogate halves, are kept.
fn upcase_unit(unit: u16) -> u16 {
    let Some(c) = char::from_u32(u32::from(unit)) else {
        return unit;
    };
    let mut upper = c.to_uppercase();
    let first = upper.next().unwrap_or(c);
    if upper.next().is_some() {
        return unit;
    }
    u16::try_from(u32::from(first)).unwrap_or(unit)
}

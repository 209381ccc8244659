//! Semantic id types and little-endian field helpers.
//!
//! Sector and directory ids are unit-carrying wrappers so that FAT indices,
//! MiniFAT indices and directory indices cannot be mixed by accident.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identifier of a sector (normal pool) or mini sector (mini pool).
///
/// Values above [`SectorId::MAX_REGULAR`] are sentinels and never address
/// a real sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectorId(pub u32);

impl SectorId {
    /// Unallocated sector (`FREESECT`).
    pub const FREE: Self = Self(0xFFFF_FFFF);
    /// Chain terminator (`ENDOFCHAIN`).
    pub const END_OF_CHAIN: Self = Self(0xFFFF_FFFE);
    /// Sector holds a FAT block (`FATSECT`).
    pub const FAT: Self = Self(0xFFFF_FFFD);
    /// Sector holds a DIFAT block (`DIFSECT`).
    pub const DIFAT: Self = Self(0xFFFF_FFFC);
    /// Largest id that can address a real sector (`MAXREGSECT`).
    pub const MAX_REGULAR: Self = Self(0xFFFF_FFFA);

    /// True if this id addresses a real sector rather than a sentinel.
    #[must_use]
    pub fn is_regular(self) -> bool {
        self <= Self::MAX_REGULAR
    }

    #[must_use]
    pub fn is_end(self) -> bool {
        self == Self::END_OF_CHAIN
    }

    #[must_use]
    pub fn is_free(self) -> bool {
        self == Self::FREE
    }

    /// Index into a FAT-like table. Only meaningful for regular ids.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::FREE => f.write_str("FREESECT"),
            Self::END_OF_CHAIN => f.write_str("ENDOFCHAIN"),
            Self::FAT => f.write_str("FATSECT"),
            Self::DIFAT => f.write_str("DIFSECT"),
            Self(n) => write!(f, "{n}"),
        }
    }
}

/// Index of a directory entry in the directory sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirId(pub u32);

impl DirId {
    /// "No entry" sentinel (`NOSTREAM`); treated as a black leaf by the
    /// red-black tree.
    pub const NONE: Self = Self(0xFFFF_FFFF);
    /// The root storage always lives at directory index 0.
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    #[must_use]
    pub fn is_some(self) -> bool {
        self != Self::NONE
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("NOSTREAM")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Seconds between 1601-01-01 (the CFB epoch) and 1970-01-01 (Unix).
const EPOCH_DELTA_SECS: u64 = 11_644_473_600;

/// Timestamp in 100-nanosecond ticks since 1601-01-01 UTC; zero means unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const UNSET: Self = Self(0);

    /// The current wall-clock time, saturating to zero before 1601.
    #[must_use]
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let since_unix = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos()
            / 100;
        let ticks = u64::try_from(since_unix).unwrap_or(u64::MAX);
        Self(ticks.saturating_add(EPOCH_DELTA_SECS * 10_000_000))
    }

    /// Convert to wall-clock time; `None` when unset.
    #[must_use]
    pub fn to_system_time(self) -> Option<SystemTime> {
        if self.0 == 0 {
            return None;
        }
        let unix_ticks = i128::from(self.0) - i128::from(EPOCH_DELTA_SECS) * 10_000_000;
        let nanos = unix_ticks * 100;
        if nanos >= 0 {
            let nanos = u64::try_from(nanos).ok()?;
            Some(UNIX_EPOCH + Duration::from_nanos(nanos))
        } else {
            let nanos = u64::try_from(-nanos).ok()?;
            UNIX_EPOCH.checked_sub(Duration::from_nanos(nanos))
        }
    }

    #[must_use]
    pub fn is_unset(self) -> bool {
        self.0 == 0
    }
}

#[inline]
pub(crate) fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
pub(crate) fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
pub(crate) fn read_sector_id(data: &[u8], offset: usize) -> SectorId {
    SectorId(read_u32(data, offset))
}

#[inline]
pub(crate) fn read_dir_id(data: &[u8], offset: usize) -> DirId {
    DirId(read_u32(data, offset))
}

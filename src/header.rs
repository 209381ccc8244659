//! Codec for the fixed 512-byte file header.

use crate::diag::{report, Diagnostic, DiagnosticSink};
use crate::error::{CompoundError, Result};
use crate::types::{read_sector_id, read_u16, read_u32, SectorId};
use uuid::Uuid;

/// Magic identifier at the start of every compound document.
pub const MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Byte-order mark for little-endian documents (the only kind that exists).
pub const BYTE_ORDER_LE: u16 = 0xFFFE;

/// Size of the header block, independent of the sector size.
pub const HEADER_SIZE: usize = 512;

/// Number of DIFAT entries held inline in the header.
pub const DIFAT_INLINE: usize = 109;

/// Minor version emitted by this implementation.
pub const MINOR_VERSION: u16 = 0x3E;

/// Mini sectors are always 64 bytes.
pub const MINI_SECTOR_SHIFT: u16 = 6;

/// Standard mini-stream cutoff; smaller streams live in the mini pool.
pub const MINI_CUTOFF: u32 = 4096;

/// Major format version, which fixes the sector size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Version 3: 512-byte sectors.
    V3,
    /// Version 4: 4096-byte sectors.
    V4,
}

impl Version {
    #[must_use]
    pub fn major(self) -> u16 {
        match self {
            Version::V3 => 3,
            Version::V4 => 4,
        }
    }

    #[must_use]
    pub fn sector_shift(self) -> u16 {
        match self {
            Version::V3 => 9,
            Version::V4 => 12,
        }
    }
}

/// Parsed form of the 512-byte file header.
///
/// `decode` applies the validation order from the format: magic and byte
/// order are fatal, everything after that is substituted and reported to
/// the diagnostic sink. The sector-size exponent is trusted even when it
/// disagrees with the major version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub clsid: Uuid,
    pub minor_version: u16,
    pub major_version: u16,
    pub sector_shift: u16,
    pub mini_shift: u16,
    pub num_dir_sectors: u32,
    pub num_fat_sectors: u32,
    pub first_dir_sector: SectorId,
    pub transaction_signature: u32,
    /// Effective mini-stream cutoff. Taken from the file even when it is
    /// not the standard 4096.
    pub mini_cutoff: u32,
    pub first_minifat_sector: SectorId,
    pub num_minifat_sectors: u32,
    pub first_difat_sector: SectorId,
    pub num_difat_sectors: u32,
    pub difat_head: [SectorId; DIFAT_INLINE],
}

impl Header {
    /// Header for a freshly created, still-empty container.
    #[must_use]
    pub fn new(version: Version) -> Self {
        Header {
            clsid: Uuid::nil(),
            minor_version: MINOR_VERSION,
            major_version: version.major(),
            sector_shift: version.sector_shift(),
            mini_shift: MINI_SECTOR_SHIFT,
            num_dir_sectors: 0,
            num_fat_sectors: 0,
            first_dir_sector: SectorId::END_OF_CHAIN,
            transaction_signature: 0,
            mini_cutoff: MINI_CUTOFF,
            first_minifat_sector: SectorId::END_OF_CHAIN,
            num_minifat_sectors: 0,
            first_difat_sector: SectorId::END_OF_CHAIN,
            num_difat_sectors: 0,
            difat_head: [SectorId::FREE; DIFAT_INLINE],
        }
    }

    /// Sector size in bytes, derived from the trusted exponent.
    #[must_use]
    pub fn sector_size(&self) -> usize {
        1 << self.sector_shift
    }

    /// Mini sector size in bytes (always 64).
    #[must_use]
    pub fn mini_sector_size(&self) -> usize {
        1 << self.mini_shift
    }

    /// Decode and validate a header block.
    pub fn decode(bytes: &[u8], sink: &mut dyn DiagnosticSink) -> Result<Header> {
        if bytes.len() < HEADER_SIZE {
            return Err(CompoundError::Header(format!(
                "file too short for a header: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0..8] != MAGIC {
            return Err(CompoundError::InvalidMagic);
        }
        let bom = read_u16(bytes, 28);
        if bom != BYTE_ORDER_LE {
            return Err(CompoundError::InvalidBom);
        }
        let major_version = read_u16(bytes, 26);
        if major_version != 3 && major_version != 4 {
            return Err(CompoundError::Header(format!(
                "unsupported major version {major_version}"
            )));
        }
        let minor_version = read_u16(bytes, 24);
        if minor_version != MINOR_VERSION {
            report(
                sink,
                Diagnostic::Version(format!("unknown minor version {minor_version:#x}")),
            )?;
        }

        let sector_shift = read_u16(bytes, 30);
        // A shift outside this window makes sector arithmetic meaningless.
        if !(7..=20).contains(&sector_shift) {
            return Err(CompoundError::Header(format!(
                "implausible sector size exponent {sector_shift}"
            )));
        }
        let expected_shift = if major_version == 3 { 9 } else { 12 };
        if sector_shift != expected_shift {
            report(
                sink,
                Diagnostic::SectorSize(format!(
                    "sector size exponent {sector_shift} does not match version \
                     {major_version} (expected {expected_shift})"
                )),
            )?;
        }
        let mut mini_shift = read_u16(bytes, 32);
        if mini_shift != MINI_SECTOR_SHIFT {
            report(
                sink,
                Diagnostic::SectorSize(format!(
                    "mini sector size exponent {mini_shift} (expected {MINI_SECTOR_SHIFT})"
                )),
            )?;
            mini_shift = MINI_SECTOR_SHIFT;
        }
        if bytes[34..40].iter().any(|b| *b != 0) {
            report(
                sink,
                Diagnostic::Header("reserved header bytes are not zero".into()),
            )?;
        }

        let num_dir_sectors = read_u32(bytes, 40);
        if major_version == 3 && num_dir_sectors != 0 {
            report(
                sink,
                Diagnostic::Header(format!(
                    "non-zero directory sector count ({num_dir_sectors}) in a version 3 file"
                )),
            )?;
        }
        let mini_cutoff = read_u32(bytes, 56);
        if mini_cutoff != MINI_CUTOFF {
            report(
                sink,
                Diagnostic::Header(format!(
                    "non-standard mini stream cutoff {mini_cutoff} (expected {MINI_CUTOFF})"
                )),
            )?;
        }

        let mut clsid = [0_u8; 16];
        clsid.copy_from_slice(&bytes[8..24]);

        let mut difat_head = [SectorId::FREE; DIFAT_INLINE];
        for (k, slot) in difat_head.iter_mut().enumerate() {
            *slot = read_sector_id(bytes, 76 + k * 4);
        }

        Ok(Header {
            clsid: Uuid::from_bytes(clsid),
            minor_version,
            major_version,
            sector_shift,
            mini_shift,
            num_dir_sectors,
            num_fat_sectors: read_u32(bytes, 44),
            first_dir_sector: read_sector_id(bytes, 48),
            transaction_signature: read_u32(bytes, 52),
            mini_cutoff,
            first_minifat_sector: read_sector_id(bytes, 60),
            num_minifat_sectors: read_u32(bytes, 64),
            first_difat_sector: read_sector_id(bytes, 68),
            num_difat_sectors: read_u32(bytes, 72),
            difat_head,
        })
    }

    /// Serialize back into the 512-byte on-disk form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0_u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&MAGIC);
        bytes[8..24].copy_from_slice(self.clsid.as_bytes());
        bytes[24..26].copy_from_slice(&self.minor_version.to_le_bytes());
        bytes[26..28].copy_from_slice(&self.major_version.to_le_bytes());
        bytes[28..30].copy_from_slice(&BYTE_ORDER_LE.to_le_bytes());
        bytes[30..32].copy_from_slice(&self.sector_shift.to_le_bytes());
        bytes[32..34].copy_from_slice(&self.mini_shift.to_le_bytes());
        // 34..40 reserved, zero
        bytes[40..44].copy_from_slice(&self.num_dir_sectors.to_le_bytes());
        bytes[44..48].copy_from_slice(&self.num_fat_sectors.to_le_bytes());
        bytes[48..52].copy_from_slice(&self.first_dir_sector.0.to_le_bytes());
        bytes[52..56].copy_from_slice(&self.transaction_signature.to_le_bytes());
        bytes[56..60].copy_from_slice(&self.mini_cutoff.to_le_bytes());
        bytes[60..64].copy_from_slice(&self.first_minifat_sector.0.to_le_bytes());
        bytes[64..68].copy_from_slice(&self.num_minifat_sectors.to_le_bytes());
        bytes[68..72].copy_from_slice(&self.first_difat_sector.0.to_le_bytes());
        bytes[72..76].copy_from_slice(&self.num_difat_sectors.to_le_bytes());
        for (k, id) in self.difat_head.iter().enumerate() {
            let off = 76 + k * 4;
            bytes[off..off + 4].copy_from_slice(&id.0.to_le_bytes());
        }
        bytes
    }
}

//! Recoverable diagnostics and the sink they are routed through.
//!
//! The engine distinguishes structural impossibilities (surfaced as
//! [`CompoundError`](crate::error::CompoundError)) from non-conforming
//! values that can be substituted or ignored. The latter are modelled as a
//! tagged [`Diagnostic`] and pushed to an injected [`DiagnosticSink`];
//! default processing then continues. A sink may escalate selected classes
//! back into fatal errors.

use crate::error::{CompoundError, Result};
use std::fmt;

/// A recoverable, non-conforming condition observed while processing a
/// compound document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Header field outside its conforming range.
    Header(String),
    /// Sector or mini-sector size exponent is unusual.
    SectorSize(String),
    /// Unknown minor format version.
    Version(String),
    /// DIFAT bookkeeping disagrees with itself (counts, sector marks).
    MasterSector(String),
    /// FAT sector not marked `FATSECT`, or similar mis-marking.
    NormalSector(String),
    /// Malformed directory entry name.
    DirName(String),
    /// Unknown directory entry type.
    DirType(String),
    /// Sibling or child index out of range or otherwise invalid.
    DirIndex(String),
    /// Implausible directory timestamp.
    DirTime(String),
    /// Invalid start sector in a directory entry.
    DirSector(String),
    /// Invalid stream size in a directory entry.
    DirSize(String),
    /// The document is shorter than its metadata claims.
    Truncated(String),
    /// The byte device is an emulation of the preferred access mode.
    Emulation(String),
}

impl Diagnostic {
    fn class(&self) -> &'static str {
        match self {
            Self::Header(_) => "header",
            Self::SectorSize(_) => "sector-size",
            Self::Version(_) => "version",
            Self::MasterSector(_) => "master-sector",
            Self::NormalSector(_) => "normal-sector",
            Self::DirName(_) => "dir-name",
            Self::DirType(_) => "dir-type",
            Self::DirIndex(_) => "dir-index",
            Self::DirTime(_) => "dir-time",
            Self::DirSector(_) => "dir-sector",
            Self::DirSize(_) => "dir-size",
            Self::Truncated(_) => "truncated",
            Self::Emulation(_) => "emulation",
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Header(m)
            | Self::SectorSize(m)
            | Self::Version(m)
            | Self::MasterSector(m)
            | Self::NormalSector(m)
            | Self::DirName(m)
            | Self::DirType(m)
            | Self::DirIndex(m)
            | Self::DirTime(m)
            | Self::DirSector(m)
            | Self::DirSize(m)
            | Self::Truncated(m)
            | Self::Emulation(m) => m,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class(), self.message())
    }
}

/// Receiver for recoverable diagnostics.
///
/// The default policy is "surface all, escalate none". Installing a sink
/// whose [`escalates`](DiagnosticSink::escalates) returns `true` for a
/// class turns that class into a fatal error at the point of observation.
pub trait DiagnosticSink: Send {
    /// Record a diagnostic. Only called when it was not escalated.
    fn emit(&mut self, diagnostic: Diagnostic);

    /// Whether this diagnostic should abort the current operation.
    fn escalates(&self, _diagnostic: &Diagnostic) -> bool {
        false
    }
}

/// Default sink: forwards every diagnostic to `tracing::warn!`.
#[derive(Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn emit(&mut self, diagnostic: Diagnostic) {
        tracing::warn!(target: "compound_core", "{diagnostic}");
    }
}

/// Sink that collects diagnostics for later inspection.
///
/// Clones share the same buffer, so a caller can keep one handle and give
/// the other to the container.
#[derive(Debug, Default, Clone)]
pub struct CollectSink {
    diagnostics: std::sync::Arc<parking_lot::Mutex<Vec<Diagnostic>>>,
}

impl CollectSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diagnostics.lock().is_empty()
    }
}

impl DiagnosticSink for CollectSink {
    fn emit(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.lock().push(diagnostic);
    }
}

/// Sink that escalates every diagnostic into a fatal error.
#[derive(Debug, Default)]
pub struct StrictSink;

impl DiagnosticSink for StrictSink {
    fn emit(&mut self, diagnostic: Diagnostic) {
        tracing::warn!(target: "compound_core", "{diagnostic}");
    }

    fn escalates(&self, _diagnostic: &Diagnostic) -> bool {
        true
    }
}

/// Route a diagnostic through the sink, honoring its escalation policy.
pub(crate) fn report(sink: &mut dyn DiagnosticSink, diagnostic: Diagnostic) -> Result<()> {
    if sink.escalates(&diagnostic) {
        Err(CompoundError::Escalated(diagnostic))
    } else {
        sink.emit(diagnostic);
        Ok(())
    }
}

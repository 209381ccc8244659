//! # compound-core — OLE Compound File (CFB) containers
//!
//! Reads, writes, and edits OLE Compound File Binary documents: a
//! hierarchical container embedding multiple named byte streams inside a
//! single file. The format shows up in legacy office documents, audio and
//! video authoring formats, and scientific data files.
//!
//! ## Layers
//!
//! - [`device`] — random-access byte devices ([`FileDevice`], [`MemDevice`])
//! - [`header`] — the fixed 512-byte header codec
//! - [`alloc`] — FAT / DIFAT / MiniFAT sector allocation
//! - [`dir`] — the directory: per-storage red-black trees of 128-byte entries
//! - [`stream`] — sector chains presented as seekable byte streams
//! - [`container`] — the [`CompoundFile`] reader/writer/editor façade
//! - [`diag`] — recoverable diagnostics routed through a pluggable sink
//!
//! ## Quick start
//!
//! ```rust
//! use compound_core::{CompoundFile, MemDevice};
//! use std::io::Read;
//!
//! # fn main() -> compound_core::Result<()> {
//! // Build a document in memory
//! let cfb = CompoundFile::create(MemDevice::new())?;
//! let root = cfb.root()?;
//! let storage = cfb.create_storage(&root, "Workbook")?;
//! cfb.create_stream(&storage, "Summary", b"hello")?;
//! cfb.save()?;
//!
//! // Read it back
//! let mut stream = cfb.open_path("/Workbook/Summary")?;
//! let mut contents = Vec::new();
//! stream.read_to_end(&mut contents)?;
//! assert_eq!(contents, b"hello");
//! # Ok(())
//! # }
//! ```
//!
//! ## Error model
//!
//! Structural impossibilities (bad magic, chain loops, out-of-range FAT
//! entries) are fatal and surface as [`CompoundError`]. Non-conforming
//! values that can be substituted (odd header fields, broken directory
//! names, truncated sectors) are reported to a [`DiagnosticSink`] and
//! processing continues; install [`StrictSink`] (or any custom policy) to
//! escalate selected classes into errors.

pub mod alloc;
pub mod container;
pub mod device;
pub mod diag;
pub mod dir;
pub mod error;
pub mod header;
mod sector;
pub mod stream;
pub mod types;

pub use alloc::Pool;
pub use container::{CompoundFile, Entry};
pub use device::{ByteDevice, FileDevice, MemDevice};
pub use diag::{CollectSink, Diagnostic, DiagnosticSink, LogSink, StrictSink};
pub use dir::entry::EntryType;
pub use error::{CompoundError, Result};
pub use header::{Header, Version, MINI_CUTOFF};
pub use stream::Stream;
pub use types::{DirId, SectorId, Timestamp};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

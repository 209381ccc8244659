//! Stream handles: a sector chain presented as a seekable byte stream.

use crate::container::Inner;
use crate::device::ByteDevice;
use crate::error::Result;
use crate::types::DirId;
use parking_lot::Mutex;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// An open stream inside a compound document.
///
/// The handle holds the owning container by back-reference and addresses
/// its entry by [`DirId`]; it never owns the bytes. Reads past the logical
/// size return what is available. Writes and [`set_len`](Stream::set_len)
/// extend the underlying chain lazily and migrate between the mini and
/// normal pools exactly when the size crosses the cutoff.
///
/// Closing the container invalidates the handle; operations then fail
/// with [`Closed`](crate::CompoundError::Closed).
pub struct Stream<D: ByteDevice> {
    inner: Arc<Mutex<Inner<D>>>,
    id: DirId,
    pos: u64,
    truncation_reported: bool,
}

impl<D: ByteDevice> Stream<D> {
    pub(crate) fn new(inner: Arc<Mutex<Inner<D>>>, id: DirId) -> Self {
        Stream {
            inner,
            id,
            pos: 0,
            truncation_reported: false,
        }
    }

    /// Current logical size of the stream in bytes.
    pub fn len(&self) -> Result<u64> {
        self.inner.lock().stream_len(self.id)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Current cursor position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Truncate or zero-extend the stream to `size` bytes. The cursor is
    /// clamped to the new end when it would point past it.
    pub fn set_len(&mut self, size: u64) -> Result<()> {
        self.inner.lock().stream_set_len(self.id, size)?;
        self.pos = self.pos.min(size);
        Ok(())
    }

    /// Read the remainder of the stream from the current position.
    pub fn read_to_end_vec(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = vec![0_u8; 64 * 1024];
        loop {
            let n = self.read_inner(&mut chunk)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let (n, truncated) =
            inner.stream_read(self.id, self.pos, buf, !self.truncation_reported)?;
        if truncated {
            self.truncation_reported = true;
        }
        self.pos += n as u64;
        Ok(n)
    }
}

impl<D: ByteDevice> Read for Stream<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf).map_err(Into::into)
    }
}

impl<D: ByteDevice> Write for Stream<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .stream_write(self.id, self.pos, buf)
            .map_err(io::Error::from)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Data is buffered until the container saves; there is nothing to
        // push from the handle itself.
        Ok(())
    }
}

impl<D: ByteDevice> Seek for Stream<D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (origin, delta) = match pos {
            SeekFrom::Start(offset) => {
                self.pos = offset;
                return Ok(self.pos);
            }
            SeekFrom::Current(delta) => (self.pos, delta),
            SeekFrom::End(delta) => {
                let len = self.len().map_err(io::Error::from)?;
                (len, delta)
            }
        };
        let target = if delta >= 0 {
            origin.checked_add(delta as u64)
        } else {
            origin.checked_sub(delta.unsigned_abs())
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the stream",
            )),
        }
    }
}

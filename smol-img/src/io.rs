// Byte source/sink abstractions for the streaming decoders.
//
// Sources are pulled on demand (the decoder asks for more bytes when it
// runs dry) so a file never has to sit in RAM. ByteReader adds the 4KB
// chunk buffer every decoder reads through.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::Error;

// chunk size for buffered source reads
pub const CHUNK_SIZE: usize = 4096;

/// Sequential, pull-based byte source.
pub trait ByteSource {
    /// Read up to `buf.len()` bytes; `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, &'static str>;
}

/// Sequential byte sink receiving the encoded BMP.
pub trait ByteSink {
    /// Write all of `buf` or fail.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), &'static str>;
}

impl ByteSource for &[u8] {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, &'static str> {
        let n = buf.len().min(self.len());
        buf[..n].copy_from_slice(&self[..n]);
        *self = &self[n..];
        Ok(n)
    }
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, &'static str> {
        (**self).read(buf)
    }
}

impl ByteSink for Vec<u8> {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), &'static str> {
        self.try_reserve(buf.len()).map_err(|_| "sink: OOM")?;
        self.extend_from_slice(buf);
        Ok(())
    }
}

impl<S: ByteSink + ?Sized> ByteSink for &mut S {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), &'static str> {
        (**self).write_all(buf)
    }
}

// buffered reader over a ByteSource; 4KB refills
pub(crate) struct ByteReader<'s, S: ByteSource + ?Sized> {
    src: &'s mut S,
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    eof: bool,
}

impl<'s, S: ByteSource + ?Sized> ByteReader<'s, S> {
    pub(crate) fn new(src: &'s mut S) -> Self {
        Self {
            src,
            buf: vec![0u8; CHUNK_SIZE],
            pos: 0,
            len: 0,
            eof: false,
        }
    }

    fn refill(&mut self) -> Result<(), &'static str> {
        if self.eof {
            return Ok(());
        }
        let n = self.src.read(&mut self.buf)?;
        if n == 0 {
            self.eof = true;
        }
        self.pos = 0;
        self.len = n;
        Ok(())
    }

    #[inline]
    pub(crate) fn read_byte(&mut self) -> Result<u8, &'static str> {
        if self.pos >= self.len {
            self.refill()?;
            if self.len == 0 {
                return Err("unexpected end of data");
            }
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    // copy whatever is buffered (refilling once if empty); 0 = end of stream
    pub(crate) fn read(&mut self, out: &mut [u8]) -> Result<usize, &'static str> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.len {
            self.refill()?;
        }
        let n = (self.len - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    pub(crate) fn read_exact(&mut self, out: &mut [u8]) -> Result<(), &'static str> {
        let mut done = 0;
        while done < out.len() {
            let n = self.read(&mut out[done..])?;
            if n == 0 {
                return Err("unexpected end of data");
            }
            done += n;
        }
        Ok(())
    }

    pub(crate) fn skip(&mut self, mut n: usize) -> Result<(), &'static str> {
        while n > 0 {
            if self.pos >= self.len {
                self.refill()?;
                if self.len == 0 {
                    return Err("unexpected end of data");
                }
            }
            let step = (self.len - self.pos).min(n);
            self.pos += step;
            n -= step;
        }
        Ok(())
    }

    // true once the source is drained; a failing source counts as drained
    pub(crate) fn is_eof(&mut self) -> bool {
        if self.pos < self.len {
            return false;
        }
        if self.refill().is_err() {
            return true;
        }
        self.len == 0
    }
}

// remembers the first failure of the wrapped source; decoders flatten
// every problem to a message, this keeps a dead card apart from bad data
pub(crate) struct WatchedSource<'s, S: ByteSource + ?Sized> {
    inner: &'s mut S,
    failed: Option<&'static str>,
}

impl<S: ByteSource + ?Sized> ByteSource for WatchedSource<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, &'static str> {
        self.inner.read(buf).map_err(|e| {
            self.failed.get_or_insert(e);
            e
        })
    }
}

/// Run `f` over a watched `source`; a decode error caused by the source
/// itself comes back as [`Error::Io`] carrying the source's message.
pub(crate) fn watch_source<S, T, F>(source: &mut S, f: F) -> Result<T, Error>
where
    S: ByteSource + ?Sized,
    F: FnOnce(&mut WatchedSource<'_, S>) -> Result<T, Error>,
{
    let mut watched = WatchedSource {
        inner: source,
        failed: None,
    };
    let result = f(&mut watched);
    match (result, watched.failed) {
        (Err(Error::Decode(_)), Some(msg)) => Err(Error::Io(msg)),
        (r, _) => r,
    }
}

#[inline]
pub(crate) fn be_u16(d: &[u8], o: usize) -> u16 {
    u16::from_be_bytes([d[o], d[o + 1]])
}

#[inline]
pub(crate) fn be_u32(d: &[u8], o: usize) -> u32 {
    u32::from_be_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
}

#[inline]
pub(crate) fn le_u16(d: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([d[o], d[o + 1]])
}

#[inline]
pub(crate) fn le_u32(d: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
}

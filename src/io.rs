// std::io adapters for smol-img's byte traits.
//
// smol-img only speaks `&'static str` errors; the last io::Error is kept
// here so the caller can still report what the OS said.

use std::io::{self, ErrorKind, Read, Write};

use smol_img::io::{ByteSink, ByteSource};

pub struct IoSource<R: Read> {
    inner: R,
    last_error: Option<io::Error>,
}

impl<R: Read> IoSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            last_error: None,
        }
    }

    pub fn take_error(&mut self) -> Option<io::Error> {
        self.last_error.take()
    }
}

impl<R: Read> ByteSource for IoSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, &'static str> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("read failed: {}", e);
                    self.last_error = Some(e);
                    return Err("read failed");
                }
            }
        }
    }
}

pub struct IoSink<W: Write> {
    inner: W,
    last_error: Option<io::Error>,
}

impl<W: Write> IoSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            last_error: None,
        }
    }

    pub fn take_error(&mut self) -> Option<io::Error> {
        self.last_error.take()
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> ByteSink for IoSink<W> {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), &'static str> {
        self.inner.write_all(buf).map_err(|e| {
            log::warn!("write failed: {}", e);
            self.last_error = Some(e);
            "write failed"
        })
    }
}

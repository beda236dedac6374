// Streaming DEFLATE reader over miniz_oxide's core decompressor.
//
// Two modes:
//   windowed:   32KB circular dictionary (owned or caller-borrowed);
//               output is handed out in arbitrarily small pieces
//   windowless: output goes straight into the caller's buffer, which
//               must hold the whole stream; one read call only
//
// Input is a fixed byte range, a pull callback, or both (range first).
// Peak heap when windowed with an owned window: ~47KB (11KB
// decompressor + 32KB window + 4KB input buffer).

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use miniz_oxide::inflate::TINFLStatus;
use miniz_oxide::inflate::core::{DecompressorOxide, decompress, inflate_flags};

use crate::Error;

// LZ dictionary size; must be a power of two >= 32768
pub const WINDOW_SIZE: usize = 32_768;

// compressed input staging buffer
const IN_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflateStatus {
    /// bytes were produced, stream not finished
    Ok,
    /// end of the deflate stream reached
    Done,
    /// corrupt data, truncated input or misuse; sticky
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflateState {
    Uninitialized,
    Windowed,
    Windowless,
    Deinitialized,
}

/// Dictionary storage for windowed mode.
pub enum Window<'a> {
    Detached,
    Owned(Box<[u8]>),
    Borrowed(&'a mut [u8; WINDOW_SIZE]),
}

impl Window<'_> {
    pub fn is_borrowed(&self) -> bool {
        matches!(self, Window::Borrowed(_))
    }
}

type ReadCallback<'a> = Box<dyn FnMut(&mut [u8]) -> Result<usize, &'static str> + 'a>;

pub struct InflateReader<'a> {
    state: InflateState,
    decomp: Option<Box<DecompressorOxide>>, // ~11KB
    window: Window<'a>,

    source: &'a [u8],
    source_pos: usize,
    callback: Option<ReadCallback<'a>>,
    callback_eof: bool,

    in_buf: Vec<u8>,
    in_len: usize,

    write_pos: usize,     // total bytes decompressed into the window
    pending_start: usize, // window offset of the first unread byte
    pending: usize,       // decompressed bytes not yet handed out
    done: bool,           // miniz reported Done
    failed: bool,
    windowless_spent: bool,
}

impl Default for InflateReader<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> InflateReader<'a> {
    pub const fn new() -> Self {
        Self {
            state: InflateState::Uninitialized,
            decomp: None,
            window: Window::Detached,
            source: &[],
            source_pos: 0,
            callback: None,
            callback_eof: false,
            in_buf: Vec::new(),
            in_len: 0,
            write_pos: 0,
            pending_start: 0,
            pending: 0,
            done: false,
            failed: false,
            windowless_spent: false,
        }
    }

    pub fn state(&self) -> InflateState {
        self.state
    }

    pub fn window(&self) -> &Window<'a> {
        &self.window
    }

    /// Prepare for a new stream, tearing down any previous one.
    ///
    /// `streaming` selects windowed mode; `external` supplies the window
    /// instead of allocating one and is never freed by the reader.
    pub fn init(
        &mut self,
        streaming: bool,
        external: Option<&'a mut [u8; WINDOW_SIZE]>,
    ) -> Result<(), Error> {
        self.deinit();

        let layout = core::alloc::Layout::new::<DecompressorOxide>();
        // SAFETY: DecompressorOxide is plain-old-data (integer tables and
        // state); all-zero is a valid bit pattern and init() resets it.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::Decode("inflate: OOM for decompressor"));
        }
        // SAFETY: ptr was allocated above with the layout of DecompressorOxide.
        let mut decomp = unsafe { Box::from_raw(ptr as *mut DecompressorOxide) };
        decomp.init();

        let mut in_buf = Vec::new();
        in_buf
            .try_reserve_exact(IN_BUF_SIZE)
            .map_err(|_| Error::Decode("inflate: OOM for input buffer"))?;
        in_buf.resize(IN_BUF_SIZE, 0);

        self.window = if !streaming {
            Window::Detached
        } else if let Some(buf) = external {
            buf.fill(0);
            Window::Borrowed(buf)
        } else {
            let mut buf = Vec::new();
            buf.try_reserve_exact(WINDOW_SIZE)
                .map_err(|_| Error::Decode("inflate: OOM for window"))?;
            buf.resize(WINDOW_SIZE, 0);
            Window::Owned(buf.into_boxed_slice())
        };

        self.decomp = Some(decomp);
        self.in_buf = in_buf;
        self.state = if streaming {
            InflateState::Windowed
        } else {
            InflateState::Windowless
        };
        Ok(())
    }

    /// Fixed compressed input, consumed before any callback.
    pub fn set_source(&mut self, data: &'a [u8]) {
        self.source = data;
        self.source_pos = 0;
    }

    /// Pull callback for compressed input; `Ok(0)` means end of input.
    pub fn set_read_callback<F>(&mut self, f: F)
    where
        F: FnMut(&mut [u8]) -> Result<usize, &'static str> + 'a,
    {
        self.callback = Some(Box::new(f));
        self.callback_eof = false;
    }

    /// Consume and validate a 2-byte zlib header.
    pub fn skip_zlib_header(&mut self) -> Result<(), Error> {
        if self.decomp.is_none() || self.failed {
            return Err(Error::Decode("inflate: not initialised"));
        }
        while self.in_len < 2 && self.has_more_input() {
            if let Err(e) = self.fill_input() {
                self.failed = true;
                return Err(Error::Decode(e));
            }
        }
        if self.in_len < 2 {
            self.failed = true;
            return Err(Error::Decode("inflate: missing zlib header"));
        }
        let cmf = self.in_buf[0];
        let flg = self.in_buf[1];
        let check = (cmf as u16) << 8 | flg as u16;
        let bad = if cmf & 0x0F != 8 {
            Some("inflate: zlib method is not deflate")
        } else if cmf >> 4 > 7 {
            Some("inflate: zlib window too large")
        } else if check % 31 != 0 {
            Some("inflate: zlib header checksum mismatch")
        } else if flg & 0x20 != 0 {
            Some("inflate: preset dictionary not supported")
        } else {
            None
        };
        if let Some(msg) = bad {
            log::warn!("{}", msg);
            self.failed = true;
            return Err(Error::Decode(msg));
        }
        self.consume_input(2);
        Ok(())
    }

    /// Fill all of `dest`; false on error or a stream shorter than `dest`.
    pub fn read(&mut self, dest: &mut [u8]) -> bool {
        let (status, n) = self.read_at_most(dest);
        status != InflateStatus::Error && n == dest.len()
    }

    /// Produce up to `dest.len()` bytes; `Done` may come with a final
    /// partial fill.
    pub fn read_at_most(&mut self, dest: &mut [u8]) -> (InflateStatus, usize) {
        if self.failed {
            return (InflateStatus::Error, 0);
        }
        match self.state {
            InflateState::Windowed => self.read_windowed(dest),
            InflateState::Windowless => self.read_windowless(dest),
            _ => (InflateStatus::Error, 0),
        }
    }

    /// Release the decompressor and an owned window. Safe to call twice.
    pub fn deinit(&mut self) {
        if self.state == InflateState::Deinitialized {
            return;
        }
        self.decomp = None;
        // owned storage drops here; a borrowed window is only released
        self.window = Window::Detached;
        self.in_buf = Vec::new();
        self.in_len = 0;
        self.source = &[];
        self.source_pos = 0;
        self.callback = None;
        self.callback_eof = false;
        self.write_pos = 0;
        self.pending_start = 0;
        self.pending = 0;
        self.done = false;
        self.failed = false;
        self.windowless_spent = false;
        self.state = InflateState::Deinitialized;
    }

    fn read_windowed(&mut self, dest: &mut [u8]) -> (InflateStatus, usize) {
        let mut filled = 0usize;
        loop {
            if self.pending > 0 && filled < dest.len() {
                let n = self.pending.min(dest.len() - filled);
                let start = self.pending_start;
                match &self.window {
                    Window::Owned(b) => dest[filled..filled + n].copy_from_slice(&b[start..start + n]),
                    Window::Borrowed(b) => dest[filled..filled + n].copy_from_slice(&b[start..start + n]),
                    Window::Detached => return self.fail("inflate: window missing", filled),
                }
                self.pending_start += n;
                self.pending -= n;
                filled += n;
            }
            if filled == dest.len() {
                break;
            }
            if self.done {
                return (InflateStatus::Done, filled);
            }
            if let Err(e) = self.pump() {
                return self.fail(e, filled);
            }
        }
        if self.done && self.pending == 0 {
            (InflateStatus::Done, filled)
        } else {
            (InflateStatus::Ok, filled)
        }
    }

    fn read_windowless(&mut self, dest: &mut [u8]) -> (InflateStatus, usize) {
        if self.done {
            return (InflateStatus::Done, 0);
        }
        if self.windowless_spent {
            return self.fail("inflate: windowless stream needs one buffer", 0);
        }
        self.windowless_spent = true;

        let mut out_pos = 0usize;
        loop {
            if let Err(e) = self.fill_input() {
                return self.fail(e, out_pos);
            }
            let has_more = self.has_more_input();
            let flags = inflate_flags::TINFL_FLAG_USING_NON_WRAPPING_OUTPUT_BUF
                | if has_more {
                    inflate_flags::TINFL_FLAG_HAS_MORE_INPUT
                } else {
                    0
                };
            let Some(decomp) = self.decomp.as_deref_mut() else {
                return self.fail("inflate: not initialised", out_pos);
            };
            let (status, consumed, produced) =
                decompress(decomp, &self.in_buf[..self.in_len], dest, out_pos, flags);
            self.consume_input(consumed);
            out_pos += produced;

            match status {
                TINFLStatus::Done => {
                    self.done = true;
                    return (InflateStatus::Done, out_pos);
                }
                TINFLStatus::HasMoreOutput => return (InflateStatus::Ok, out_pos),
                TINFLStatus::NeedsMoreInput => {
                    if !has_more && self.in_len == 0 {
                        return self.fail("inflate: truncated stream", out_pos);
                    }
                    if consumed == 0 && produced == 0 && self.in_len == IN_BUF_SIZE {
                        return self.fail("inflate: decompression stuck", out_pos);
                    }
                }
                _ => return self.fail("inflate: corrupt stream", out_pos),
            }
        }
    }

    // decompress until at least one byte lands in the window (or Done);
    // only called once every pending byte has been handed out
    fn pump(&mut self) -> Result<(), &'static str> {
        loop {
            self.fill_input()?;
            let has_more = self.has_more_input();
            let flags = if has_more {
                inflate_flags::TINFL_FLAG_HAS_MORE_INPUT
            } else {
                0
            };

            let write_pos = self.write_pos & (WINDOW_SIZE - 1);
            let window: &mut [u8] = match &mut self.window {
                Window::Owned(b) => &mut b[..],
                Window::Borrowed(b) => &mut b[..],
                Window::Detached => return Err("inflate: window missing"),
            };
            let decomp = self.decomp.as_deref_mut().ok_or("inflate: not initialised")?;
            let (status, consumed, produced) =
                decompress(decomp, &self.in_buf[..self.in_len], window, write_pos, flags);
            self.consume_input(consumed);

            // wrapping mode never writes past the end of the window,
            // so the new bytes are contiguous
            self.pending_start = write_pos;
            self.pending = produced;
            self.write_pos += produced;

            match status {
                TINFLStatus::Done => {
                    self.done = true;
                    return Ok(());
                }
                TINFLStatus::NeedsMoreInput => {
                    if produced > 0 {
                        return Ok(());
                    }
                    if !has_more && self.in_len == 0 {
                        return Err("inflate: truncated stream");
                    }
                    if consumed == 0 && self.in_len == IN_BUF_SIZE {
                        return Err("inflate: decompression stuck");
                    }
                }
                TINFLStatus::HasMoreOutput => {
                    if produced > 0 {
                        return Ok(());
                    }
                    if consumed == 0 {
                        return Err("inflate: decompression stalled");
                    }
                }
                _ => return Err("inflate: corrupt stream"),
            }
        }
    }

    fn has_more_input(&self) -> bool {
        self.source_pos < self.source.len() || (self.callback.is_some() && !self.callback_eof)
    }

    // top up the input buffer from the fixed range, or once the range is
    // drained, with one callback pull
    fn fill_input(&mut self) -> Result<(), &'static str> {
        if self.in_len == IN_BUF_SIZE {
            return Ok(());
        }
        if self.source_pos < self.source.len() {
            let n = (IN_BUF_SIZE - self.in_len).min(self.source.len() - self.source_pos);
            self.in_buf[self.in_len..self.in_len + n]
                .copy_from_slice(&self.source[self.source_pos..self.source_pos + n]);
            self.in_len += n;
            self.source_pos += n;
        } else if !self.callback_eof {
            if let Some(cb) = self.callback.as_mut() {
                let space = IN_BUF_SIZE - self.in_len;
                let n = cb(&mut self.in_buf[self.in_len..])?.min(space);
                if n == 0 {
                    self.callback_eof = true;
                } else {
                    self.in_len += n;
                }
            }
        }
        Ok(())
    }

    fn consume_input(&mut self, n: usize) {
        if n > 0 && n < self.in_len {
            self.in_buf.copy_within(n..self.in_len, 0);
        }
        self.in_len -= n.min(self.in_len);
    }

    fn fail(&mut self, msg: &'static str, produced: usize) -> (InflateStatus, usize) {
        log::warn!("{}", msg);
        self.failed = true;
        (InflateStatus::Error, produced)
    }
}

impl Drop for InflateReader<'_> {
    fn drop(&mut self) {
        self.deinit();
    }
}

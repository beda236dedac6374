//! Sequential Huffman JPEG decoder (SOF0/SOF1) streaming grey rows.
//!
//! Markers are parsed straight off the byte source, then the entropy
//! data is decoded one MCU row at a time; peak RAM is the decoder state
//! (~12 KB) plus one MCU row of luma. Only the luminance component is
//! inverse-transformed; chroma blocks are Huffman-decoded to advance the
//! bitstream and discarded, which is the grey conversion.
//!
//! Progressive, lossless, hierarchical and arithmetic-coded files are
//! rejected up front.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::Error;
use crate::bmp::BmpLayout;
use crate::config::ImageConvertConfig;
use crate::io::{ByteReader, ByteSink, ByteSource, be_u16, watch_source};
use crate::pipeline::{GreyPipeline, MAX_SOURCE_HEIGHT, MAX_SOURCE_WIDTH};

// JPEG marker bytes

const M_SOF0: u8 = 0xC0;
const M_SOF1: u8 = 0xC1;
const M_SOF2: u8 = 0xC2;
const M_DHT: u8 = 0xC4;
const M_DAC: u8 = 0xCC;
const M_RST0: u8 = 0xD0;
const M_RST7: u8 = 0xD7;
const M_SOI: u8 = 0xD8;
const M_EOI: u8 = 0xD9;
const M_SOS: u8 = 0xDA;
const M_DQT: u8 = 0xDB;
const M_DRI: u8 = 0xDD;

const MAX_COMP: usize = 4;

// zig-zag scan order

#[rustfmt::skip]
const ZZ: [usize; 64] = [
     0,  1,  8, 16,  9,  2,  3, 10,
    17, 24, 32, 25, 18, 11,  4,  5,
    12, 19, 26, 33, 40, 48, 41, 34,
    27, 20, 13,  6,  7, 14, 21, 28,
    35, 42, 49, 56, 57, 50, 43, 36,
    29, 22, 15, 23, 30, 37, 44, 51,
    58, 59, 52, 45, 38, 31, 39, 46,
    53, 60, 61, 54, 47, 55, 62, 63,
];

// IDCT constants (IJG ISLOW, CONST_BITS = 13)

const CB: i32 = 13;
const P1: i32 = 2;
const F0298: i32 = 2446;
const F0390: i32 = 3196;
const F0541: i32 = 4433;
const F0765: i32 = 6270;
const F0899: i32 = 7373;
const F1175: i32 = 9633;
const F1501: i32 = 12299;
const F1847: i32 = 15137;
const F1961: i32 = 16069;
const F2053: i32 = 16819;
const F2562: i32 = 20995;
const F3072: i32 = 25172;

// types

#[derive(Clone, Copy, Default)]
struct Component {
    id: u8,
    h_samp: u8,
    v_samp: u8,
    qt_idx: u8,
    dc_tbl: u8,
    ac_tbl: u8,
}

struct HuffTable {
    lut: [(u8, u8); 256],
    mincode: [i32; 17],
    maxcode: [i32; 17],
    valptr: [usize; 17],
    values: [u8; 256],
}

struct JpegState {
    width: u16,
    height: u16,
    num_comp: u8,
    comp: [Component; MAX_COMP],
    max_h: u8,
    max_v: u8,
    qt: [[u16; 64]; 4],
    qt_ok: [bool; 4],
    dc_huff: [HuffTable; 4],
    ac_huff: [HuffTable; 4],
    dc_ok: [bool; 4],
    ac_ok: [bool; 4],
    restart_interval: u16,
    frame_seen: bool,
    scan_num_comp: u8,
    scan_order: [u8; MAX_COMP],
}

impl JpegState {
    fn heap_new() -> Result<Box<Self>, &'static str> {
        let layout = core::alloc::Layout::new::<Self>();
        // SAFETY: every field is an integer, bool or array of those, so
        // the all-zero pattern is a valid JpegState.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err("jpeg: OOM for decoder state");
        }
        // SAFETY: allocated above with the layout of Self.
        let mut st = unsafe { Box::from_raw(ptr as *mut Self) };
        st.max_h = 1;
        st.max_v = 1;
        for ht in st.dc_huff.iter_mut().chain(st.ac_huff.iter_mut()) {
            ht.maxcode.fill(-1);
        }
        Ok(st)
    }
}

// BitReader: entropy-coded bytes with stuffing and marker detection

struct BitReader<'s, S: ByteSource + ?Sized> {
    source: ByteReader<'s, S>,
    buf: u32,
    avail: u8,
    marker: u8, // stashed marker byte (non-zero = encountered during next_byte)
}

impl<'s, S: ByteSource + ?Sized> BitReader<'s, S> {
    fn new(source: ByteReader<'s, S>) -> Self {
        Self {
            source,
            buf: 0,
            avail: 0,
            marker: 0,
        }
    }

    // fetch next entropy-coded byte, handling JPEG byte stuffing
    fn next_byte(&mut self) -> Result<u8, &'static str> {
        if self.marker != 0 {
            return Ok(0);
        }
        let b = self.source.read_byte()?;
        if b != 0xFF {
            return Ok(b);
        }
        loop {
            if self.source.is_eof() {
                return Ok(0);
            }
            let next = self.source.read_byte()?;
            match next {
                0x00 => return Ok(0xFF),
                0xFF => continue,
                _ => {
                    self.marker = next;
                    return Ok(0);
                }
            }
        }
    }

    fn ensure(&mut self, n: u8) -> Result<(), &'static str> {
        while self.avail < n {
            let b = self.next_byte()?;
            self.buf |= (b as u32) << (24 - self.avail);
            self.avail += 8;
        }
        Ok(())
    }

    #[inline]
    fn peek(&mut self, n: u8) -> Result<u32, &'static str> {
        self.ensure(n)?;
        Ok(self.buf >> (32 - n as u32))
    }

    #[inline]
    fn drop_bits(&mut self, n: u8) {
        self.buf <<= n as u32;
        self.avail -= n;
    }

    #[inline]
    fn read_bits(&mut self, n: u8) -> Result<u32, &'static str> {
        if n == 0 {
            return Ok(0);
        }
        self.ensure(n)?;
        let val = self.buf >> (32 - n as u32);
        self.buf <<= n as u32;
        self.avail -= n;
        Ok(val)
    }

    // discard remaining bits, advance past the next restart marker
    fn consume_restart(&mut self) -> Result<(), &'static str> {
        self.buf = 0;
        self.avail = 0;

        // next_byte may already have stashed it
        if self.marker != 0 {
            let m = self.marker;
            self.marker = 0;
            if !(M_RST0..=M_RST7).contains(&m) {
                log::warn!("jpeg: expected RST, found marker {:02X}", m);
            }
            return Ok(());
        }

        loop {
            if self.source.is_eof() {
                return Ok(());
            }
            let b = self.source.read_byte()?;
            if b != 0xFF {
                continue;
            }
            loop {
                if self.source.is_eof() {
                    return Ok(());
                }
                match self.source.read_byte()? {
                    0xFF => continue,
                    0x00 => break,
                    _ => return Ok(()),
                }
            }
        }
    }
}

/// Streaming decoder over one JPEG file.
pub struct JpegDecoder<'s, S: ByteSource + ?Sized> {
    st: Box<JpegState>,
    reader: BitReader<'s, S>,
    interleaved: bool,
    // luma replication factors (max sampling / luma sampling)
    fx: usize,
    fy: usize,
    mcu_w: usize,
    mcu_h: usize,
    mcus_x: usize,
    mcus_y: usize,
    row_w: usize,
    rows: Vec<u8>, // one MCU row of luma, row_w * mcu_h
    dc_pred: [i32; MAX_COMP],
    block: [i32; 64],
    pix: [u8; 64],
    mcu_cnt: u32,
    total_mcus: u32,
    mcu_row: usize,
}

impl<'s, S: ByteSource + ?Sized> JpegDecoder<'s, S> {
    /// Parse everything up to the first scan.
    pub fn new(source: &'s mut S) -> Result<Self, &'static str> {
        let mut src = ByteReader::new(source);
        let st = parse_markers(&mut src)?;
        validate_tables(&st)?;

        let w = st.width as usize;
        let h = st.height as usize;
        if w == 0 || h == 0 {
            return Err("jpeg: zero dimensions");
        }
        if w as u32 > MAX_SOURCE_WIDTH || h as u32 > MAX_SOURCE_HEIGHT {
            log::warn!("jpeg: {}x{} exceeds size limit", w, h);
            return Err("jpeg: image too large");
        }

        let y = st.comp[0];
        if st.max_h % y.h_samp != 0 || st.max_v % y.v_samp != 0 {
            return Err("jpeg: unsupported luma sampling");
        }
        let fx = (st.max_h / y.h_samp) as usize;
        let fy = (st.max_v / y.v_samp) as usize;

        let interleaved = st.scan_num_comp > 1;
        let (mcu_w, mcu_h, mcus_x, mcus_y) = if interleaved {
            let mcu_w = st.max_h as usize * 8;
            let mcu_h = st.max_v as usize * 8;
            (mcu_w, mcu_h, w.div_ceil(mcu_w), h.div_ceil(mcu_h))
        } else {
            // one block per MCU, in luma-plane raster order
            let plane_w = w.div_ceil(fx);
            let plane_h = h.div_ceil(fy);
            (8 * fx, 8 * fy, plane_w.div_ceil(8), plane_h.div_ceil(8))
        };
        let row_w = mcus_x * mcu_w;

        let mut rows = Vec::new();
        rows.try_reserve_exact(row_w * mcu_h)
            .map_err(|_| "jpeg: OOM for MCU row")?;
        rows.resize(row_w * mcu_h, 128u8);

        log::info!(
            "jpeg: {}x{}, {} component(s), sampling {}x{}, restart {}",
            w,
            h,
            st.num_comp,
            st.max_h,
            st.max_v,
            st.restart_interval
        );

        Ok(Self {
            reader: BitReader::new(src),
            interleaved,
            fx,
            fy,
            mcu_w,
            mcu_h,
            mcus_x,
            mcus_y,
            row_w,
            rows,
            dc_pred: [0; MAX_COMP],
            block: [0; 64],
            pix: [0; 64],
            mcu_cnt: 0,
            total_mcus: (mcus_x * mcus_y) as u32,
            mcu_row: 0,
            st,
        })
    }

    pub fn width(&self) -> u32 {
        self.st.width as u32
    }

    pub fn height(&self) -> u32 {
        self.st.height as u32
    }

    /// Decode the next MCU row and hand each of its image rows
    /// (`width()` grey bytes) to `emit`. Returns false once every row
    /// has been delivered.
    pub fn next_row_group(
        &mut self,
        emit: &mut dyn FnMut(&[u8]) -> Result<(), Error>,
    ) -> Result<bool, Error> {
        if self.mcu_row >= self.mcus_y {
            return Ok(false);
        }
        self.decode_mcu_row()?;

        let w = self.st.width as usize;
        let h = self.st.height as usize;
        let y0 = self.mcu_row * self.mcu_h;
        let n = self.mcu_h.min(h.saturating_sub(y0));
        for py in 0..n {
            let off = py * self.row_w;
            emit(&self.rows[off..off + w])?;
        }
        self.mcu_row += 1;
        Ok(true)
    }

    fn decode_mcu_row(&mut self) -> Result<(), &'static str> {
        let st = &*self.st;
        for mcu_col in 0..self.mcus_x {
            if self.interleaved {
                for sci in 0..st.scan_num_comp as usize {
                    let ci = st.scan_order[sci] as usize;
                    let c = st.comp[ci];
                    for bv in 0..c.v_samp as usize {
                        for bh in 0..c.h_samp as usize {
                            if ci == 0 {
                                decode_block(
                                    &mut self.reader,
                                    &st.dc_huff[c.dc_tbl as usize],
                                    &st.ac_huff[c.ac_tbl as usize],
                                    &mut self.dc_pred[ci],
                                    &st.qt[c.qt_idx as usize],
                                    &mut self.block,
                                )?;
                                idct(&self.block, &mut self.pix);
                                place_block(
                                    &mut self.rows,
                                    self.row_w,
                                    &self.pix,
                                    mcu_col * self.mcu_w + bh * 8 * self.fx,
                                    bv * 8 * self.fy,
                                    self.fx,
                                    self.fy,
                                );
                            } else {
                                skip_block(
                                    &mut self.reader,
                                    &st.dc_huff[c.dc_tbl as usize],
                                    &st.ac_huff[c.ac_tbl as usize],
                                    &mut self.dc_pred[ci],
                                )?;
                            }
                        }
                    }
                }
            } else {
                let c = st.comp[0];
                decode_block(
                    &mut self.reader,
                    &st.dc_huff[c.dc_tbl as usize],
                    &st.ac_huff[c.ac_tbl as usize],
                    &mut self.dc_pred[0],
                    &st.qt[c.qt_idx as usize],
                    &mut self.block,
                )?;
                idct(&self.block, &mut self.pix);
                place_block(
                    &mut self.rows,
                    self.row_w,
                    &self.pix,
                    mcu_col * self.mcu_w,
                    0,
                    self.fx,
                    self.fy,
                );
            }

            self.mcu_cnt += 1;
            if st.restart_interval > 0
                && self.mcu_cnt % st.restart_interval as u32 == 0
                && self.mcu_cnt < self.total_mcus
            {
                self.reader.consume_restart()?;
                self.dc_pred.fill(0);
            }
        }
        Ok(())
    }
}

/// Decode a JPEG from `source` and write it to `sink` as a BMP sized by
/// `config`. Abort is polled before the header and once per MCU row.
pub fn transcode<S, W>(
    source: &mut S,
    sink: &mut W,
    config: &ImageConvertConfig,
) -> Result<BmpLayout, Error>
where
    S: ByteSource + ?Sized,
    W: ByteSink + ?Sized,
{
    watch_source(source, |src| {
        let mut dec = JpegDecoder::new(src)?;
        let mut pipe = GreyPipeline::begin(
            sink,
            dec.width(),
            dec.height(),
            config,
            config.depth(),
            config.quality(),
            true,
        )?;

        loop {
            config.check_abort()?;
            let more = dec.next_row_group(&mut |row: &[u8]| pipe.push_row(row))?;
            if !more || pipe.is_complete() {
                break;
            }
        }
        pipe.finish()
    })
}

// copy an 8x8 luma block into the MCU row, replicating each sample
// fx x fy times for subsampled luma
fn place_block(
    rows: &mut [u8],
    row_w: usize,
    pix: &[u8; 64],
    x0: usize,
    y0: usize,
    fx: usize,
    fy: usize,
) {
    if fx == 1 && fy == 1 {
        for r in 0..8 {
            let dst = (y0 + r) * row_w + x0;
            rows[dst..dst + 8].copy_from_slice(&pix[r * 8..r * 8 + 8]);
        }
        return;
    }
    for r in 0..8 {
        for ry in 0..fy {
            let dst = (y0 + r * fy + ry) * row_w + x0;
            for c in 0..8 {
                let o = dst + c * fx;
                rows[o..o + fx].fill(pix[r * 8 + c]);
            }
        }
    }
}

// marker parsing, straight off the byte source

fn parse_markers<S: ByteSource + ?Sized>(
    src: &mut ByteReader<'_, S>,
) -> Result<Box<JpegState>, &'static str> {
    let mut soi = [0u8; 2];
    src.read_exact(&mut soi)
        .map_err(|_| "jpeg: invalid signature")?;
    if soi != [0xFF, M_SOI] {
        return Err("jpeg: invalid signature");
    }
    let mut st = JpegState::heap_new()?;
    let mut seg = Vec::new();

    loop {
        let mut b = src.read_byte()?;
        while b != 0xFF {
            b = src.read_byte()?;
        }
        while b == 0xFF {
            b = src.read_byte()?;
        }
        let marker = b;

        match marker {
            0x00 | 0x01 | M_SOI | M_RST0..=M_RST7 => continue,
            M_EOI => return Err("jpeg: EOI before SOS"),
            M_SOF2 | 0xC6 | 0xCA => return Err("jpeg: progressive JPEG not supported"),
            0xC3 | 0xC5 | 0xC7 | 0xCB | 0xCD..=0xCF => {
                return Err("jpeg: lossless/hierarchical JPEG not supported");
            }
            0xC9 | M_DAC => return Err("jpeg: arithmetic coding not supported"),
            M_SOF0 | M_SOF1 | M_DHT | M_DQT | M_DRI | M_SOS => {
                read_segment(src, &mut seg)?;
                match marker {
                    M_DHT => parse_dht(&seg, &mut st)?,
                    M_DQT => parse_dqt(&seg, &mut st)?,
                    M_DRI => parse_dri(&seg, &mut st)?,
                    M_SOS => {
                        parse_sos(&seg, &mut st)?;
                        return Ok(st);
                    }
                    _ => parse_sof(&seg, &mut st)?,
                }
            }
            _ => {
                // APPn, COM and friends: skip by length
                let mut len = [0u8; 2];
                src.read_exact(&mut len)?;
                let n = be_u16(&len, 0) as usize;
                if n < 2 {
                    return Err("jpeg: bad marker length");
                }
                src.skip(n - 2)?;
            }
        }
    }
}

// read a length-prefixed segment body into seg
fn read_segment<S: ByteSource + ?Sized>(
    src: &mut ByteReader<'_, S>,
    seg: &mut Vec<u8>,
) -> Result<(), &'static str> {
    let mut len = [0u8; 2];
    src.read_exact(&mut len)?;
    let n = be_u16(&len, 0) as usize;
    if n < 2 {
        return Err("jpeg: bad marker length");
    }
    seg.clear();
    seg.try_reserve(n - 2).map_err(|_| "jpeg: OOM for segment")?;
    seg.resize(n - 2, 0);
    src.read_exact(seg)
}

fn parse_sof(data: &[u8], st: &mut JpegState) -> Result<(), &'static str> {
    if st.frame_seen {
        return Err("jpeg: multiple frames");
    }
    if data.len() < 6 {
        return Err("jpeg: SOF truncated");
    }
    if data[0] != 8 {
        return Err("jpeg: only 8-bit precision");
    }
    st.height = be_u16(data, 1);
    st.width = be_u16(data, 3);
    st.num_comp = data[5];
    if st.num_comp == 0 || st.num_comp as usize > MAX_COMP {
        return Err("jpeg: bad component count");
    }
    if data.len() < 6 + st.num_comp as usize * 3 {
        return Err("jpeg: SOF truncated");
    }
    st.max_h = 1;
    st.max_v = 1;
    for i in 0..st.num_comp as usize {
        let off = 6 + i * 3;
        let c = &mut st.comp[i];
        c.id = data[off];
        c.h_samp = data[off + 1] >> 4;
        c.v_samp = data[off + 1] & 0x0F;
        c.qt_idx = data[off + 2];
        if c.h_samp == 0 || c.v_samp == 0 || c.h_samp > 4 || c.v_samp > 4 {
            return Err("jpeg: bad sampling factor");
        }
        if c.qt_idx >= 4 {
            return Err("jpeg: quant table id out of range");
        }
        st.max_h = st.max_h.max(c.h_samp);
        st.max_v = st.max_v.max(c.v_samp);
    }
    if st.num_comp == 1 {
        // a lone component is never subsampled
        st.comp[0].h_samp = 1;
        st.comp[0].v_samp = 1;
        st.max_h = 1;
        st.max_v = 1;
    }
    st.frame_seen = true;
    Ok(())
}

fn parse_dqt(data: &[u8], st: &mut JpegState) -> Result<(), &'static str> {
    let mut pos = 0usize;
    while pos < data.len() {
        let info = data[pos];
        pos += 1;
        let prec = info >> 4;
        let id = (info & 0x0F) as usize;
        if id >= 4 {
            return Err("jpeg: DQT id out of range");
        }
        if prec == 0 {
            if pos + 64 > data.len() {
                return Err("jpeg: DQT truncated");
            }
            for i in 0..64 {
                st.qt[id][i] = data[pos + i] as u16;
            }
            pos += 64;
        } else {
            if pos + 128 > data.len() {
                return Err("jpeg: DQT truncated");
            }
            for i in 0..64 {
                st.qt[id][i] = be_u16(data, pos + i * 2);
            }
            pos += 128;
        }
        st.qt_ok[id] = true;
    }
    Ok(())
}

fn parse_dht(data: &[u8], st: &mut JpegState) -> Result<(), &'static str> {
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + 17 > data.len() {
            return Err("jpeg: DHT truncated");
        }
        let info = data[pos];
        pos += 1;
        let class = info >> 4;
        let id = (info & 0x0F) as usize;
        if id >= 4 || class > 1 {
            return Err("jpeg: DHT id out of range");
        }
        let mut bits = [0u8; 16];
        bits.copy_from_slice(&data[pos..pos + 16]);
        pos += 16;
        let total: usize = bits.iter().map(|&b| b as usize).sum();
        if total > 256 || pos + total > data.len() {
            return Err("jpeg: DHT value overflow");
        }
        let vals = &data[pos..pos + total];
        pos += total;
        if class == 0 {
            build_huff_table(&mut st.dc_huff[id], &bits, vals);
            st.dc_ok[id] = true;
        } else {
            build_huff_table(&mut st.ac_huff[id], &bits, vals);
            st.ac_ok[id] = true;
        }
    }
    Ok(())
}

fn parse_dri(data: &[u8], st: &mut JpegState) -> Result<(), &'static str> {
    if data.len() < 2 {
        return Err("jpeg: DRI truncated");
    }
    st.restart_interval = be_u16(data, 0);
    Ok(())
}

fn parse_sos(data: &[u8], st: &mut JpegState) -> Result<(), &'static str> {
    if !st.frame_seen {
        return Err("jpeg: SOS before SOF");
    }
    if data.is_empty() {
        return Err("jpeg: SOS truncated");
    }
    st.scan_num_comp = data[0];
    if st.scan_num_comp == 0 || st.scan_num_comp > st.num_comp {
        return Err("jpeg: bad SOS component count");
    }
    let n = st.scan_num_comp as usize;
    if data.len() < 1 + n * 2 + 3 {
        return Err("jpeg: SOS truncated");
    }
    for sci in 0..n {
        let cs = data[1 + sci * 2];
        let td_ta = data[2 + sci * 2];
        let j = st.comp[..st.num_comp as usize]
            .iter()
            .position(|c| c.id == cs)
            .ok_or("jpeg: SOS references unknown component")?;
        st.comp[j].dc_tbl = td_ta >> 4;
        st.comp[j].ac_tbl = td_ta & 0x0F;
        if st.comp[j].dc_tbl >= 4 || st.comp[j].ac_tbl >= 4 {
            return Err("jpeg: Huffman table id out of range");
        }
        st.scan_order[sci] = j as u8;
    }
    let p = 1 + n * 2;
    let (ss, se, ah_al) = (data[p], data[p + 1], data[p + 2]);
    if ss != 0 || se != 63 || ah_al != 0 {
        return Err("jpeg: not a sequential scan");
    }
    if n == 1 && st.scan_order[0] != 0 {
        return Err("jpeg: first scan does not carry luma");
    }
    if !st.scan_order[..n].contains(&0) {
        return Err("jpeg: scan does not carry luma");
    }
    Ok(())
}

fn validate_tables(st: &JpegState) -> Result<(), &'static str> {
    for sci in 0..st.scan_num_comp as usize {
        let ci = st.scan_order[sci] as usize;
        let c = &st.comp[ci];
        if !st.qt_ok[c.qt_idx as usize] {
            return Err("jpeg: missing quant table");
        }
        if !st.dc_ok[c.dc_tbl as usize] {
            return Err("jpeg: missing DC Huffman table");
        }
        if !st.ac_ok[c.ac_tbl as usize] {
            return Err("jpeg: missing AC Huffman table");
        }
    }
    Ok(())
}

// Huffman table construction

fn build_huff_table(table: &mut HuffTable, bits: &[u8; 16], vals: &[u8]) {
    let total: usize = bits.iter().map(|&b| b as usize).sum();
    table.values[..total].copy_from_slice(&vals[..total]);
    table.lut.fill((0, 0));
    table.maxcode.fill(-1);

    let mut code: u32 = 0;
    let mut si: usize = 0;

    for bl in 1..=16usize {
        let cnt = bits[bl - 1] as usize;
        if cnt > 0 {
            table.valptr[bl] = si;
            table.mincode[bl] = code as i32;
            for _ in 0..cnt {
                if bl <= 8 {
                    let prefix = (code << (8 - bl)) as usize;
                    let fill = 1usize << (8 - bl);
                    for k in 0..fill {
                        if prefix + k < 256 {
                            table.lut[prefix + k] = (vals[si], bl as u8);
                        }
                    }
                }
                si += 1;
                code += 1;
            }
            table.maxcode[bl] = (code - 1) as i32;
        }
        code <<= 1;
    }
}

// Huffman decode

fn huff_decode<S: ByteSource + ?Sized>(
    r: &mut BitReader<'_, S>,
    t: &HuffTable,
) -> Result<u8, &'static str> {
    let peek8 = r.peek(8)? as usize;
    let (sym, nb) = t.lut[peek8];
    if nb > 0 {
        r.drop_bits(nb);
        return Ok(sym);
    }
    let peek16 = r.peek(16)? as i32;
    for bl in 9..=16u8 {
        let code = peek16 >> (16 - bl);
        if t.maxcode[bl as usize] >= 0 && code <= t.maxcode[bl as usize] {
            r.drop_bits(bl);
            let idx = t.valptr[bl as usize] as i32 + code - t.mincode[bl as usize];
            return t
                .values
                .get(idx as usize)
                .copied()
                .ok_or("jpeg: invalid Huffman code");
        }
    }
    Err("jpeg: invalid Huffman code")
}

#[inline]
fn extend(bits: u32, size: u8) -> i32 {
    let half = 1u32 << (size as u32 - 1);
    if bits < half {
        bits as i32 - ((1u32 << size as u32) as i32 - 1)
    } else {
        bits as i32
    }
}

// block decode (Y) / skip (chroma)

fn decode_block<S: ByteSource + ?Sized>(
    r: &mut BitReader<'_, S>,
    dc_ht: &HuffTable,
    ac_ht: &HuffTable,
    dc_pred: &mut i32,
    qt: &[u16; 64],
    blk: &mut [i32; 64],
) -> Result<(), &'static str> {
    blk.fill(0);

    let dc_size = huff_decode(r, dc_ht)?;
    if dc_size > 0 {
        if dc_size > 11 {
            return Err("jpeg: DC size > 11");
        }
        let bits = r.read_bits(dc_size)?;
        *dc_pred = dc_pred.wrapping_add(extend(bits, dc_size));
    }
    blk[0] = (*dc_pred).wrapping_mul(qt[0] as i32);

    let mut k: usize = 1;
    while k <= 63 {
        let sym = huff_decode(r, ac_ht)?;
        let run = (sym >> 4) as usize;
        let size = sym & 0x0F;
        if size == 0 {
            if run == 15 {
                k += 16;
            } else {
                break;
            }
        } else {
            k += run;
            if k > 63 {
                return Err("jpeg: AC index overflow");
            }
            let bits = r.read_bits(size)?;
            blk[ZZ[k]] = extend(bits, size).wrapping_mul(qt[k] as i32);
            k += 1;
        }
    }
    Ok(())
}

fn skip_block<S: ByteSource + ?Sized>(
    r: &mut BitReader<'_, S>,
    dc_ht: &HuffTable,
    ac_ht: &HuffTable,
    dc_pred: &mut i32,
) -> Result<(), &'static str> {
    let dc_size = huff_decode(r, dc_ht)?;
    if dc_size > 0 {
        if dc_size > 11 {
            return Err("jpeg: DC size > 11");
        }
        let bits = r.read_bits(dc_size)?;
        *dc_pred = dc_pred.wrapping_add(extend(bits, dc_size));
    }
    let mut k: usize = 1;
    while k <= 63 {
        let sym = huff_decode(r, ac_ht)?;
        let run = (sym >> 4) as usize;
        let size = sym & 0x0F;
        if size == 0 {
            if run == 15 {
                k += 16;
            } else {
                break;
            }
        } else {
            k += run + 1;
            r.read_bits(size)?;
        }
    }
    Ok(())
}

// integer IDCT (IJG ISLOW, two-pass row + col)

fn idct(block: &[i32; 64], out: &mut [u8; 64]) {
    let mut ws = [0i32; 64];

    for row in 0..8 {
        let b = row * 8;
        let d: [i32; 8] = [
            block[b],
            block[b + 1],
            block[b + 2],
            block[b + 3],
            block[b + 4],
            block[b + 5],
            block[b + 6],
            block[b + 7],
        ];

        if d[1..].iter().all(|&v| v == 0) {
            ws[b..b + 8].fill(d[0] << P1);
            continue;
        }

        let o = idct_1d(d);
        let sh = CB - P1;
        for (i, &v) in o.iter().enumerate() {
            ws[b + i] = descale(v, sh);
        }
    }

    for col in 0..8 {
        let d: [i32; 8] = core::array::from_fn(|r| ws[col + r * 8]);

        if d[1..].iter().all(|&v| v == 0) {
            let v = clamp(descale(d[0], P1 + 3).wrapping_add(128));
            for r in 0..8 {
                out[col + r * 8] = v;
            }
            continue;
        }

        let o = idct_1d(d);
        let sh = CB + P1 + 3;
        for (r, &v) in o.iter().enumerate() {
            out[col + r * 8] = clamp(descale(v, sh).wrapping_add(128));
        }
    }
}

// one 8-point pass; outputs still scaled by 2^CB, all arithmetic wrapping
#[inline]
fn idct_1d(d: [i32; 8]) -> [i32; 8] {
    let [d0, d1, d2, d3, d4, d5, d6, d7] = d;

    let z1 = d2.wrapping_add(d6).wrapping_mul(F0541);
    let tmp2 = z1.wrapping_add(d6.wrapping_mul(-F1847));
    let tmp3 = z1.wrapping_add(d2.wrapping_mul(F0765));
    let tmp0 = d0.wrapping_add(d4) << CB;
    let tmp1 = d0.wrapping_sub(d4) << CB;
    let (t10, t13) = (tmp0.wrapping_add(tmp3), tmp0.wrapping_sub(tmp3));
    let (t11, t12) = (tmp1.wrapping_add(tmp2), tmp1.wrapping_sub(tmp2));

    let zz1 = d7.wrapping_add(d1);
    let zz2 = d5.wrapping_add(d3);
    let zz3 = d7.wrapping_add(d3);
    let zz4 = d5.wrapping_add(d1);
    let z5 = zz3.wrapping_add(zz4).wrapping_mul(F1175);
    let s1 = zz1.wrapping_mul(-F0899);
    let s2 = zz2.wrapping_mul(-F2562);
    let s3 = zz3.wrapping_mul(-F1961).wrapping_add(z5);
    let s4 = zz4.wrapping_mul(-F0390).wrapping_add(z5);
    let o0 = d7.wrapping_mul(F0298).wrapping_add(s1).wrapping_add(s3);
    let o1 = d5.wrapping_mul(F2053).wrapping_add(s2).wrapping_add(s4);
    let o2 = d3.wrapping_mul(F3072).wrapping_add(s2).wrapping_add(s3);
    let o3 = d1.wrapping_mul(F1501).wrapping_add(s1).wrapping_add(s4);

    [
        t10.wrapping_add(o3),
        t11.wrapping_add(o2),
        t12.wrapping_add(o1),
        t13.wrapping_add(o0),
        t13.wrapping_sub(o0),
        t12.wrapping_sub(o1),
        t11.wrapping_sub(o2),
        t10.wrapping_sub(o3),
    ]
}

// helpers

#[inline]
fn descale(x: i32, n: i32) -> i32 {
    x.wrapping_add(1 << (n - 1)) >> n
}

#[inline]
fn clamp(x: i32) -> u8 {
    x.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputDepth;
    use crate::io::le_u32;
    use image::ExtendedColorType;
    use image::codecs::jpeg::JpegEncoder;
    use jpeg_encoder::ColorType;

    fn encode(pixels: &[u8], w: u32, h: u32, color: ExtendedColorType) -> Vec<u8> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 95)
            .encode(pixels, w, h, color)
            .unwrap();
        out
    }

    fn gradient(w: u32, h: u32) -> Vec<u8> {
        (0..h)
            .flat_map(|y| (0..w).map(move |x| ((x * 255 / w.max(2)) / 2 + (y * 127 / h)) as u8))
            .collect()
    }

    fn decode_rows(jpeg: &[u8]) -> (u32, u32, Vec<Vec<u8>>) {
        let mut src: &[u8] = jpeg;
        let mut dec = JpegDecoder::new(&mut src).unwrap();
        let (w, h) = (dec.width(), dec.height());
        let mut rows = Vec::new();
        while dec
            .next_row_group(&mut |row: &[u8]| {
                rows.push(row.to_vec());
                Ok(())
            })
            .unwrap()
        {}
        (w, h, rows)
    }

    #[test]
    fn grey_image_round_trips_closely() {
        let (w, h) = (64, 48);
        let src = gradient(w, h);
        let jpeg = encode(&src, w, h, ExtendedColorType::L8);
        let (dw, dh, rows) = decode_rows(&jpeg);
        assert_eq!((dw, dh), (w, h));
        assert_eq!(rows.len(), h as usize);
        let mut err = 0u64;
        for (y, row) in rows.iter().enumerate() {
            assert_eq!(row.len(), w as usize);
            for (x, &p) in row.iter().enumerate() {
                err += (p as i32 - src[y * w as usize + x] as i32).unsigned_abs() as u64;
            }
        }
        let mean = err as f64 / (w * h) as f64;
        assert!(mean < 3.0, "mean abs error {}", mean);
    }

    #[test]
    fn colour_image_decodes_to_luma() {
        let (w, h) = (40u32, 30u32);
        let rgb: Vec<u8> = (0..w * h).flat_map(|_| [200u8, 100, 50]).collect();
        let jpeg = encode(&rgb, w, h, ExtendedColorType::Rgb8);
        let (_, _, rows) = decode_rows(&jpeg);
        let expect = crate::dither::rgb_to_grey(200, 100, 50) as i32;
        assert_eq!(rows.len(), h as usize);
        for row in &rows {
            for &p in row {
                assert!((p as i32 - expect).abs() <= 4, "{} vs {}", p, expect);
            }
        }
    }

    #[test]
    fn odd_dimensions_deliver_exact_rows() {
        let (w, h) = (37u32, 21u32);
        let rgb: Vec<u8> = (0..w * h).flat_map(|i| [(i % 256) as u8, 80, 160]).collect();
        let jpeg = encode(&rgb, w, h, ExtendedColorType::Rgb8);
        let (dw, dh, rows) = decode_rows(&jpeg);
        assert_eq!((dw, dh), (37, 21));
        assert_eq!(rows.len(), 21);
        assert!(rows.iter().all(|r| r.len() == 37));
    }

    #[test]
    fn rejects_progressive() {
        // SOI, SOF2 for a 16x16 single-component frame
        let data = [
            0xFF, 0xD8, 0xFF, 0xC2, 0x00, 0x0B, 0x08, 0x00, 0x10, 0x00, 0x10, 0x01, 0x01, 0x11,
            0x00,
        ];
        let mut src: &[u8] = &data;
        assert_eq!(
            JpegDecoder::new(&mut src).err(),
            Some("jpeg: progressive JPEG not supported")
        );
    }

    #[test]
    fn rejects_non_jpeg() {
        let mut src: &[u8] = b"\x89PNG\r\n\x1a\n";
        assert!(JpegDecoder::new(&mut src).is_err());
        let mut empty: &[u8] = &[];
        assert!(JpegDecoder::new(&mut empty).is_err());
    }

    #[test]
    fn skips_app_segments() {
        let src = gradient(16, 16);
        let jpeg = encode(&src, 16, 16, ExtendedColorType::L8);
        // splice an APP1 segment with a 0xFF-laden payload after SOI
        let mut with_app = vec![0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x08];
        with_app.extend_from_slice(&[0xFF, 0xD9, 0xFF, 0xDA, 0xFF, 0x00]);
        with_app.extend_from_slice(&jpeg[2..]);
        let (w, h, rows) = decode_rows(&with_app);
        assert_eq!((w, h, rows.len()), (16, 16, 16));
    }

    #[test]
    fn truncated_scan_fails() {
        let (w, h) = (96u32, 96u32);
        let rgb: Vec<u8> = (0..w * h)
            .flat_map(|i| [(i * 7 % 256) as u8, (i * 13 % 256) as u8, (i % 256) as u8])
            .collect();
        let jpeg = encode(&rgb, w, h, ExtendedColorType::Rgb8);
        let cut = &jpeg[..jpeg.len() / 2];
        let mut src: &[u8] = cut;
        let mut out = Vec::new();
        let r = transcode(&mut src, &mut out, &ImageConvertConfig::default());
        assert!(r.is_err());
    }

    #[test]
    fn transcode_fits_box_and_depth() {
        let (w, h) = (120u32, 200u32);
        let src = gradient(w, h);
        let jpeg = encode(&src, w, h, ExtendedColorType::L8);

        let mut src_bytes: &[u8] = &jpeg;
        let mut out = Vec::new();
        let config = ImageConvertConfig {
            max_width: 60,
            max_height: 60,
            one_bit: true,
            ..Default::default()
        };
        let layout = transcode(&mut src_bytes, &mut out, &config).unwrap();
        assert_eq!((layout.width, layout.height), (36, 60));
        assert_eq!(layout.depth, OutputDepth::Mono1);
        assert_eq!(le_u32(&out, 10), 62);
        assert_eq!(out.len() as u32, layout.file_size);

        let mut src_bytes: &[u8] = &jpeg;
        let mut out = Vec::new();
        let layout = transcode(&mut src_bytes, &mut out, &ImageConvertConfig::default()).unwrap();
        assert_eq!((layout.width, layout.height), (120, 200));
        assert_eq!(layout.depth, OutputDepth::Gray2);
        assert_eq!(le_u32(&out, 10), 70);
    }

    #[test]
    fn abort_before_header_writes_nothing() {
        let src = gradient(32, 32);
        let jpeg = encode(&src, 32, 32, ExtendedColorType::L8);
        let mut src_bytes: &[u8] = &jpeg;
        let mut out = Vec::new();
        let stop = || true;
        let config = ImageConvertConfig {
            should_abort: Some(&stop),
            ..Default::default()
        };
        let err = transcode(&mut src_bytes, &mut out, &config).unwrap_err();
        assert_eq!(err, Error::Aborted);
        assert!(out.is_empty());
    }

    #[test]
    fn abort_mid_image_stops_at_row_group() {
        let src = gradient(32, 64);
        let jpeg = encode(&src, 32, 64, ExtendedColorType::L8);
        let mut src_bytes: &[u8] = &jpeg;
        let mut out = Vec::new();
        let polls = core::cell::Cell::new(0u32);
        let stop = || {
            polls.set(polls.get() + 1);
            polls.get() > 3
        };
        let config = ImageConvertConfig {
            should_abort: Some(&stop),
            ..Default::default()
        };
        let err = transcode(&mut src_bytes, &mut out, &config).unwrap_err();
        assert!(err.is_aborted());
        // header plus two MCU rows of 8 lines, 2-bit rows of 8 bytes
        assert_eq!(out.len(), 70 + 16 * 8);
    }

    fn encode_with_restarts(pixels: &[u8], w: u16, h: u16, color: ColorType, interval: u16) -> Vec<u8> {
        let mut out = Vec::new();
        let mut enc = jpeg_encoder::Encoder::new(&mut out, 90);
        enc.set_restart_interval(interval);
        enc.encode(pixels, w, h, color).unwrap();
        out
    }

    fn has_marker(jpeg: &[u8], marker: u8) -> bool {
        jpeg.windows(2).any(|m| m == [0xFF, marker])
    }

    #[test]
    fn restart_intervals_decode_like_plain_scans() {
        let (w, h) = (48u16, 40u16);
        let grey = gradient(w as u32, h as u32);
        let rgb: Vec<u8> = grey.iter().flat_map(|&g| [g, g / 2, 255 - g]).collect();

        for (pixels, color) in [(&grey, ColorType::Luma), (&rgb, ColorType::Rgb)] {
            let (_, _, plain) = decode_rows(&encode_with_restarts(pixels, w, h, color, 0));
            for interval in [1, 3, 7] {
                let jpeg = encode_with_restarts(pixels, w, h, color, interval);
                assert!(has_marker(&jpeg, M_DRI));
                assert!(has_marker(&jpeg, M_RST0));
                let (dw, dh, rows) = decode_rows(&jpeg);
                assert_eq!((dw, dh), (w as u32, h as u32));
                assert_eq!(rows, plain, "interval {}", interval);
            }
        }
    }

    // rewrite every quantization table as 16-bit entries of 0xFFFF
    fn widen_dqt(jpeg: &[u8]) -> Vec<u8> {
        let mut out = jpeg[..2].to_vec();
        let mut pos = 2;
        while pos + 4 <= jpeg.len() {
            let marker = jpeg[pos + 1];
            let len = be_u16(jpeg, pos + 2) as usize;
            if marker == M_SOS {
                out.extend_from_slice(&jpeg[pos..]);
                break;
            }
            let body = &jpeg[pos + 4..pos + 2 + len];
            if marker == M_DQT {
                let mut tables = Vec::new();
                let mut i = 0;
                while i < body.len() {
                    let id = body[i] & 0x0F;
                    i += if body[i] >> 4 == 0 { 65 } else { 129 };
                    tables.push(0x10 | id);
                    tables.extend_from_slice(&[0xFF; 128]);
                }
                out.extend_from_slice(&[0xFF, M_DQT]);
                out.extend_from_slice(&((tables.len() + 2) as u16).to_be_bytes());
                out.extend_from_slice(&tables);
            } else {
                out.extend_from_slice(&jpeg[pos..pos + 2 + len]);
            }
            pos += 2 + len;
        }
        out
    }

    #[test]
    fn huge_sixteen_bit_tables_decode_without_overflow() {
        let (w, h) = (32u32, 24u32);
        let plain = encode(&gradient(w, h), w, h, ExtendedColorType::L8);
        let jpeg = widen_dqt(&plain);
        assert!(jpeg.len() > plain.len() + 64);
        let (dw, dh, rows) = decode_rows(&jpeg);
        assert_eq!((dw, dh), (w, h));
        assert_eq!(rows.len(), h as usize);
        assert!(rows.iter().all(|r| r.len() == w as usize));
    }

    #[test]
    fn quick_mode_thresholds_every_pixel() {
        let jpeg = encode(&[128u8; 32 * 16], 32, 16, ExtendedColorType::L8);
        let run = |quick_mode| {
            let mut src: &[u8] = &jpeg;
            let mut out = Vec::new();
            let config = ImageConvertConfig {
                quick_mode,
                ..Default::default()
            };
            transcode(&mut src, &mut out, &config).unwrap();
            out.split_off(70)
        };

        // flat mid-grey decodes exactly; level 2 of 0..=3 everywhere
        let quick = run(true);
        assert_eq!(quick.len(), 8 * 16);
        assert!(quick.iter().all(|&b| b == 0xAA));
        assert!(run(false).iter().any(|&b| b != 0xAA));
    }
}

// Aspect-preserving fit and a streaming area-average row scaler.
//
// Source rows are pushed one at a time; each output pixel is the mean of
// the source pixels its box covers. Box edges come from 16.16 fixed-point
// scale factors so a row costs no divisions beyond the final average.
// Only downscaling is supported; fit_within never asks for more.

extern crate alloc;

use alloc::vec::Vec;

/// Largest size with the source's aspect ratio that fits `max_w` x `max_h`.
///
/// Sources already inside the box come back unchanged; both dimensions
/// are floored and never drop below 1.
pub fn fit_within(src_w: u32, src_h: u32, max_w: u16, max_h: u16) -> (u16, u16) {
    let (mw, mh) = (max_w.max(1) as u64, max_h.max(1) as u64);
    let (sw, sh) = (src_w.max(1) as u64, src_h.max(1) as u64);
    if sw <= mw && sh <= mh {
        return (sw as u16, sh as u16);
    }
    let (w, h) = if mw * sh <= mh * sw {
        // width is the limiting side
        (mw, sh * mw / sw)
    } else {
        (sw * mh / sh, mh)
    };
    (w.max(1) as u16, h.max(1) as u16)
}

pub struct RowResampler {
    src_w: usize,
    src_h: usize,
    out_w: usize,
    out_h: usize,
    scale_y: u64,      // 16.16 source rows per output row
    x_edges: Vec<u32>, // out_w + 1 bin edges in source columns
    accum: Vec<u32>,
    out: Vec<u8>,
    rows_in_bin: u32,
    src_y: usize,
    out_y: usize,
}

impl RowResampler {
    pub fn new(src_w: u32, src_h: u32, out_w: u16, out_h: u16) -> Result<Self, &'static str> {
        if src_w == 0 || src_h == 0 || out_w == 0 || out_h == 0 {
            return Err("resample: zero dimension");
        }
        if out_w as u32 > src_w || out_h as u32 > src_h {
            return Err("resample: upscaling not supported");
        }
        let (src_w, src_h) = (src_w as usize, src_h as usize);
        let (out_w, out_h) = (out_w as usize, out_h as usize);

        let scale_x = ((src_w as u64) << 16) / out_w as u64;
        let scale_y = ((src_h as u64) << 16) / out_h as u64;

        let mut x_edges = Vec::new();
        x_edges
            .try_reserve_exact(out_w + 1)
            .map_err(|_| "resample: OOM")?;
        for ox in 0..out_w {
            x_edges.push(((ox as u64 * scale_x) >> 16) as u32);
        }
        x_edges.push(src_w as u32);

        let mut accum = Vec::new();
        accum.try_reserve_exact(out_w).map_err(|_| "resample: OOM")?;
        accum.resize(out_w, 0u32);
        let mut out = Vec::new();
        out.try_reserve_exact(out_w).map_err(|_| "resample: OOM")?;
        out.resize(out_w, 0u8);

        Ok(Self {
            src_w,
            src_h,
            out_w,
            out_h,
            scale_y,
            x_edges,
            accum,
            out,
            rows_in_bin: 0,
            src_y: 0,
            out_y: 0,
        })
    }

    pub fn rows_emitted(&self) -> usize {
        self.out_y
    }

    /// True once every output row has been produced.
    pub fn finished(&self) -> bool {
        self.out_y >= self.out_h
    }

    // source row index one past the last row feeding output row `oy`
    fn bin_end(&self, oy: usize) -> usize {
        if oy + 1 >= self.out_h {
            self.src_h
        } else {
            (((oy as u64 + 1) * self.scale_y) >> 16) as usize
        }
    }

    /// Feed the next source row (at least `src_w` grey bytes). Returns an
    /// output row when this source row closes one.
    pub fn push_row(&mut self, row: &[u8]) -> Option<&[u8]> {
        if self.finished() || self.src_y >= self.src_h || row.len() < self.src_w {
            return None;
        }
        let row = &row[..self.src_w];
        self.src_y += 1;

        if self.src_w == self.out_w && self.src_h == self.out_h {
            self.out.copy_from_slice(row);
            self.out_y += 1;
            return Some(self.out.as_slice());
        }

        for (ox, acc) in self.accum.iter_mut().enumerate() {
            let x0 = self.x_edges[ox] as usize;
            let x1 = self.x_edges[ox + 1] as usize;
            *acc += row[x0..x1].iter().map(|&p| p as u32).sum::<u32>();
        }
        self.rows_in_bin += 1;

        if self.src_y < self.bin_end(self.out_y) {
            return None;
        }

        let rows = self.rows_in_bin;
        for (ox, (acc, o)) in self.accum.iter_mut().zip(self.out.iter_mut()).enumerate() {
            let cols = self.x_edges[ox + 1] - self.x_edges[ox];
            let n = cols * rows;
            *o = ((*acc + n / 2) / n) as u8;
            *acc = 0;
        }
        self.rows_in_bin = 0;
        self.out_y += 1;
        Some(self.out.as_slice())
    }
}

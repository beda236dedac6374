// Grey -> 1/2-bit palette index quantizer.
//
// Threshold mode maps every pixel to the nearest linear level on its own.
// Dither mode is Floyd-Steinberg with a single carried error row
// (err_cur/err_nxt, one sentinel column each side). Output indices are
// packed MSB-first; index 0 is black, the top index white, matching the
// grey palette the BMP writer emits.

extern crate alloc;

use alloc::vec::Vec;

use crate::config::{OutputDepth, Quality};

// contrast multiplier around mid-grey, in hundredths
const CONTRAST_PCT: i32 = 135;

/// The panel's contrast boost: `(g - 128) * 1.35 + 128`, clamped.
#[inline]
pub fn adjust_contrast(grey: u8) -> u8 {
    let v = (grey as i32 - 128) * CONTRAST_PCT / 100 + 128;
    v.clamp(0, 255) as u8
}

/// BT.601 luma from 8-bit RGB channels.
#[inline]
pub fn rgb_to_grey(r: u8, g: u8, b: u8) -> u8 {
    ((r as u16 * 77 + g as u16 * 150 + b as u16 * 29) >> 8) as u8
}

pub struct Quantizer {
    width: usize,
    depth: OutputDepth,
    quality: Quality,
    err_cur: Vec<i16>, // width + 2 when dithering, empty otherwise
    err_nxt: Vec<i16>,
}

impl Quantizer {
    pub fn new(width: usize, depth: OutputDepth, quality: Quality) -> Result<Self, &'static str> {
        let (mut err_cur, mut err_nxt) = (Vec::new(), Vec::new());
        if quality == Quality::Dither {
            err_cur
                .try_reserve_exact(width + 2)
                .map_err(|_| "dither: OOM for error rows")?;
            err_nxt
                .try_reserve_exact(width + 2)
                .map_err(|_| "dither: OOM for error rows")?;
            err_cur.resize(width + 2, 0i16);
            err_nxt.resize(width + 2, 0i16);
        }
        Ok(Self {
            width,
            depth,
            quality,
            err_cur,
            err_nxt,
        })
    }

    /// True when quantizing a pixel depends on earlier pixels.
    pub fn carries_error(&self) -> bool {
        !self.err_cur.is_empty()
    }

    /// Bytes of one packed output row (before BMP padding).
    pub fn packed_len(&self) -> usize {
        (self.width * self.depth.bits() as usize).div_ceil(8)
    }

    /// Quantize one grey row into `out` (at least `packed_len()` bytes).
    pub fn quantize_row(&mut self, grey: &[u8], out: &mut [u8]) {
        let len = self.packed_len();
        out[..len].fill(0);
        let top = (self.depth.levels() - 1) as i16;
        let bits = self.depth.bits() as usize;
        let per_byte = 8 / bits;

        for x in 0..self.width.min(grey.len()) {
            let idx = match self.quality {
                Quality::Threshold => nearest_level(grey[x] as i16, top),
                Quality::Dither => {
                    // offset by 1 for the left sentinel
                    let val = (grey[x] as i16 + self.err_cur[x + 1]).clamp(0, 255);
                    let idx = nearest_level(val, top);
                    let err = val - idx as i16 * 255 / top;

                    // Floyd-Steinberg weights
                    self.err_cur[x + 2] += err * 7 / 16; // right
                    self.err_nxt[x] += err * 3 / 16; // below-left
                    self.err_nxt[x + 1] += err * 5 / 16; // below
                    self.err_nxt[x + 2] += err / 16; // below-right
                    idx
                }
            };
            let shift = 8 - bits * (x % per_byte + 1);
            out[x / per_byte] |= idx << shift;
        }
        self.next_row();
    }

    fn next_row(&mut self) {
        if self.carries_error() {
            core::mem::swap(&mut self.err_cur, &mut self.err_nxt);
            self.err_nxt.fill(0);
        }
    }
}

// index of the closest of top + 1 evenly spaced levels
#[inline]
fn nearest_level(v: i16, top: i16) -> u8 {
    ((v as i32 * top as i32 + 127) / 255) as u8
}

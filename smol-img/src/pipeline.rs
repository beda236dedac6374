// Grey rows in, BMP rows out: resample -> contrast -> quantize -> write.
//
// Every decoder funnels its rows through one GreyPipeline. Holding it
// costs one accumulator row, one grey row, one packed row and (when
// dithering) two error rows, all sized to the output width.

extern crate alloc;

use alloc::vec::Vec;

use crate::Error;
use crate::bmp::{BmpLayout, BmpWriter};
use crate::config::{ImageConvertConfig, OutputDepth, Quality};
use crate::dither::{Quantizer, adjust_contrast};
use crate::io::ByteSink;
use crate::resample::{RowResampler, fit_within};

// largest decoded source accepted (memory guard)
pub const MAX_SOURCE_WIDTH: u32 = 2048;
pub const MAX_SOURCE_HEIGHT: u32 = 3072;

pub struct GreyPipeline<'s, W: ByteSink + ?Sized> {
    resampler: RowResampler,
    quantizer: Quantizer,
    writer: BmpWriter<'s, W>,
    grey: Vec<u8>,
    packed: Vec<u8>,
    contrast: bool,
}

impl<'s, W: ByteSink + ?Sized> GreyPipeline<'s, W> {
    /// Size the output for `src_w` x `src_h`, poll the abort predicate and
    /// write the BMP header. An abort here leaves the sink untouched.
    pub fn begin(
        sink: &'s mut W,
        src_w: u32,
        src_h: u32,
        config: &ImageConvertConfig,
        depth: OutputDepth,
        quality: Quality,
        contrast: bool,
    ) -> Result<Self, Error> {
        if src_w == 0 || src_h == 0 {
            return Err(Error::Decode("image has no pixels"));
        }
        if src_w > MAX_SOURCE_WIDTH || src_h > MAX_SOURCE_HEIGHT {
            log::warn!(
                "{}: {}x{} exceeds {}x{} limit",
                config.log_tag,
                src_w,
                src_h,
                MAX_SOURCE_WIDTH,
                MAX_SOURCE_HEIGHT
            );
            return Err(Error::Decode("image too large"));
        }

        let (box_w, box_h) = config.target_box();
        let (out_w, out_h) = fit_within(src_w, src_h, box_w, box_h);
        let resampler = RowResampler::new(src_w, src_h, out_w, out_h)?;
        let quantizer = Quantizer::new(out_w as usize, depth, quality)?;

        let mut grey = Vec::new();
        grey.try_reserve_exact(out_w as usize)
            .map_err(|_| Error::Decode("pipeline: OOM for row buffers"))?;
        grey.resize(out_w as usize, 0u8);
        let mut packed = Vec::new();
        packed
            .try_reserve_exact(quantizer.packed_len())
            .map_err(|_| Error::Decode("pipeline: OOM for row buffers"))?;
        packed.resize(quantizer.packed_len(), 0u8);

        log::info!(
            "{}: {}x{} -> {}x{}, {}-bit, {}",
            config.log_tag,
            src_w,
            src_h,
            out_w,
            out_h,
            depth.bits(),
            match quality {
                Quality::Dither => "dithered",
                Quality::Threshold => "threshold",
            }
        );

        config.check_abort()?;
        let writer = BmpWriter::begin(sink, BmpLayout::new(out_w, out_h, depth))?;

        Ok(Self {
            resampler,
            quantizer,
            writer,
            grey,
            packed,
            contrast,
        })
    }

    /// True once every output row has been written.
    pub fn is_complete(&self) -> bool {
        self.resampler.finished()
    }

    /// Feed one decoded source row of 8-bit grey.
    pub fn push_row(&mut self, src: &[u8]) -> Result<(), Error> {
        let Some(row) = self.resampler.push_row(src) else {
            return Ok(());
        };
        if self.contrast {
            for (g, &p) in self.grey.iter_mut().zip(row) {
                *g = adjust_contrast(p);
            }
        } else {
            self.grey.copy_from_slice(row);
        }
        self.quantizer.quantize_row(&self.grey, &mut self.packed);
        self.writer.write_row(&self.packed)
    }

    pub fn finish(self) -> Result<BmpLayout, Error> {
        self.writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::le_u32;
    use core::cell::Cell;

    #[test]
    fn streams_scaled_rows_into_bmp() {
        let mut out = Vec::new();
        let config = ImageConvertConfig::with_size(4, 4);
        let mut p = GreyPipeline::begin(
            &mut out,
            8,
            8,
            &config,
            OutputDepth::Gray2,
            Quality::Threshold,
            false,
        )
        .unwrap();
        for _ in 0..8 {
            p.push_row(&[255u8; 8]).unwrap();
        }
        assert!(p.is_complete());
        let layout = p.finish().unwrap();
        assert_eq!((layout.width, layout.height), (4, 4));
        assert_eq!(out.len(), 70 + 4 * 4);
        // all white: index 3 everywhere, 4 pixels per byte
        assert!(out[70..].chunks(4).all(|r| r == [0xFF, 0, 0, 0]));
    }

    #[test]
    fn header_written_before_first_row() {
        let mut out = Vec::new();
        let config = ImageConvertConfig::default();
        let p = GreyPipeline::begin(
            &mut out,
            10,
            10,
            &config,
            OutputDepth::Mono1,
            Quality::Dither,
            true,
        )
        .unwrap();
        assert!(!p.is_complete());
        drop(p);
        assert_eq!(out.len(), 62);
        assert_eq!(le_u32(&out, 2), 62 + 10 * 4);
    }

    #[test]
    fn abort_before_header_leaves_sink_empty() {
        let mut out = Vec::new();
        let polled = Cell::new(false);
        let stop = || {
            polled.set(true);
            true
        };
        let config = ImageConvertConfig {
            should_abort: Some(&stop),
            ..Default::default()
        };
        let r = GreyPipeline::begin(
            &mut out,
            10,
            10,
            &config,
            OutputDepth::Gray2,
            Quality::Dither,
            true,
        );
        assert!(matches!(r, Err(Error::Aborted)));
        assert!(polled.get());
        assert!(out.is_empty());
    }

    #[test]
    fn rejects_oversized_sources() {
        let mut out = Vec::new();
        let config = ImageConvertConfig::default();
        let r = GreyPipeline::begin(
            &mut out,
            4000,
            10,
            &config,
            OutputDepth::Gray2,
            Quality::Dither,
            true,
        );
        assert!(r.is_err());
        assert!(out.is_empty());
    }
}

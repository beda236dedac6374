// BMP container: layout maths, streaming writer, and a reader for the
// 1/2-bit top-down bitmaps this crate produces.
//
// Files are written top-down (negative height) so rows go out in decode
// order and nothing beyond one packed row is ever buffered. Palettes are
// pure greys: black/white for 1-bit, 0/0x55/0xAA/0xFF for 2-bit.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::Error;
use crate::config::{ImageConvertConfig, OutputDepth, Quality};
use crate::dither::rgb_to_grey;
use crate::io::{ByteReader, ByteSink, ByteSource, le_u16, le_u32, watch_source};
use crate::pipeline::{GreyPipeline, MAX_SOURCE_HEIGHT, MAX_SOURCE_WIDTH};

const FILE_HEADER_LEN: u32 = 14;
const INFO_HEADER_LEN: u32 = 40;
const PIXELS_PER_METER: u32 = 2835; // 72 dpi

const PALETTE_1BIT: [u8; 2] = [0x00, 0xFF];
const PALETTE_2BIT: [u8; 4] = [0x00, 0x55, 0xAA, 0xFF];

/// Geometry of one output bitmap; fixed once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmpLayout {
    pub width: u16,
    pub height: u16,
    pub depth: OutputDepth,
    /// bytes per row, padded to a multiple of 4
    pub stride: usize,
    pub palette_len: u32,
    pub pixel_offset: u32,
    pub file_size: u32,
}

impl BmpLayout {
    pub fn new(width: u16, height: u16, depth: OutputDepth) -> Self {
        let bits = depth.bits() as usize;
        let stride = (width as usize * bits).div_ceil(32) * 4;
        let palette_len = depth.levels() as u32;
        let pixel_offset = FILE_HEADER_LEN + INFO_HEADER_LEN + palette_len * 4;
        let file_size = pixel_offset + (stride * height as usize) as u32;
        Self {
            width,
            height,
            depth,
            stride,
            palette_len,
            pixel_offset,
            file_size,
        }
    }

    pub fn image_size(&self) -> u32 {
        self.file_size - self.pixel_offset
    }

    fn palette(&self) -> &'static [u8] {
        match self.depth {
            OutputDepth::Mono1 => &PALETTE_1BIT,
            OutputDepth::Gray2 => &PALETTE_2BIT,
        }
    }

    // file header + BITMAPINFOHEADER + palette; pixel_offset bytes used
    fn header(&self) -> [u8; 70] {
        let mut h = [0u8; 70];
        h[0..2].copy_from_slice(b"BM");
        h[2..6].copy_from_slice(&self.file_size.to_le_bytes());
        h[10..14].copy_from_slice(&self.pixel_offset.to_le_bytes());

        h[14..18].copy_from_slice(&INFO_HEADER_LEN.to_le_bytes());
        h[18..22].copy_from_slice(&(self.width as i32).to_le_bytes());
        // negative height: rows stored top to bottom
        h[22..26].copy_from_slice(&(-(self.height as i32)).to_le_bytes());
        h[26..28].copy_from_slice(&1u16.to_le_bytes());
        h[28..30].copy_from_slice(&(self.depth.bits() as u16).to_le_bytes());
        // 30..34 compression = BI_RGB
        h[34..38].copy_from_slice(&self.image_size().to_le_bytes());
        h[38..42].copy_from_slice(&PIXELS_PER_METER.to_le_bytes());
        h[42..46].copy_from_slice(&PIXELS_PER_METER.to_le_bytes());
        h[46..50].copy_from_slice(&self.palette_len.to_le_bytes());
        h[50..54].copy_from_slice(&self.palette_len.to_le_bytes());

        for (i, &g) in self.palette().iter().enumerate() {
            let o = 54 + i * 4;
            h[o..o + 4].copy_from_slice(&[g, g, g, 0]);
        }
        h
    }
}

/// Streams one BMP into a sink: header up front, then packed rows.
pub struct BmpWriter<'s, W: ByteSink + ?Sized> {
    sink: &'s mut W,
    layout: BmpLayout,
    rows: u16,
}

impl<'s, W: ByteSink + ?Sized> BmpWriter<'s, W> {
    pub fn begin(sink: &'s mut W, layout: BmpLayout) -> Result<Self, Error> {
        let header = layout.header();
        sink.write_all(&header[..layout.pixel_offset as usize])
            .map_err(Error::Io)?;
        Ok(Self {
            sink,
            layout,
            rows: 0,
        })
    }

    /// Write one packed row; padding up to the stride is added here.
    pub fn write_row(&mut self, packed: &[u8]) -> Result<(), Error> {
        if self.rows >= self.layout.height {
            return Err(Error::Decode("bmp: more rows than declared"));
        }
        let data = packed.len().min(self.layout.stride);
        self.sink.write_all(&packed[..data]).map_err(Error::Io)?;
        let pad = self.layout.stride - data;
        if pad > 0 {
            self.sink.write_all(&[0u8; 4][..pad.min(4)]).map_err(Error::Io)?;
            if pad > 4 {
                let zeros = vec![0u8; pad - 4];
                self.sink.write_all(&zeros).map_err(Error::Io)?;
            }
        }
        self.rows += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<BmpLayout, Error> {
        if self.rows != self.layout.height {
            log::warn!(
                "bmp: wrote {} of {} rows",
                self.rows,
                self.layout.height
            );
            return Err(Error::Decode("bmp: image ended early"));
        }
        Ok(self.layout)
    }
}

/// Reader for 1/2-bit top-down BMPs (the shape [`BmpWriter`] emits).
pub struct BmpReader<'s, S: ByteSource + ?Sized> {
    src: ByteReader<'s, S>,
    width: u32,
    height: u32,
    bpp: u8,
    stride: usize,
    grey_lut: [u8; 4],
    row: Vec<u8>,
    rows_read: u32,
}

impl<'s, S: ByteSource + ?Sized> BmpReader<'s, S> {
    pub fn new(source: &'s mut S) -> Result<Self, &'static str> {
        let mut src = ByteReader::new(source);

        let mut fh = [0u8; 18];
        src.read_exact(&mut fh)?;
        if &fh[0..2] != b"BM" {
            return Err("bmp: bad signature");
        }
        let pixel_offset = le_u32(&fh, 10);
        let dib_size = le_u32(&fh, 14);
        if dib_size < INFO_HEADER_LEN {
            return Err("bmp: unsupported DIB header");
        }

        let mut info = [0u8; 36];
        src.read_exact(&mut info)?;
        let width = le_u32(&info, 0) as i32;
        let raw_height = le_u32(&info, 4) as i32;
        let bpp = le_u16(&info, 10);
        let compression = le_u32(&info, 12);
        let colors_used = le_u32(&info, 28);
        src.skip((dib_size - INFO_HEADER_LEN) as usize)?;

        if raw_height >= 0 {
            log::warn!("bmp: bottom-up bitmap, expected top-down");
            return Err("bmp: bottom-up bitmaps not supported");
        }
        if bpp != 1 && bpp != 2 {
            log::warn!("bmp: expected 1 or 2-bit bitmap, got {}-bit", bpp);
            return Err("bmp: unsupported bit depth");
        }
        if compression != 0 {
            return Err("bmp: compressed bitmaps not supported");
        }
        let height = raw_height.unsigned_abs();
        if width <= 0 || height == 0 {
            return Err("bmp: empty image");
        }
        let width = width as u32;
        if width > MAX_SOURCE_WIDTH || height > MAX_SOURCE_HEIGHT {
            return Err("bmp: image too large");
        }

        let max_colors = 1u32 << bpp;
        let entries = if colors_used == 0 {
            max_colors
        } else {
            colors_used.min(max_colors)
        };
        let mut grey_lut = match bpp {
            1 => [0x00, 0xFF, 0xFF, 0xFF],
            _ => PALETTE_2BIT,
        };
        for slot in grey_lut.iter_mut().take(entries as usize) {
            let mut e = [0u8; 4];
            src.read_exact(&mut e)?;
            // entries are B, G, R, reserved
            *slot = rgb_to_grey(e[2], e[1], e[0]);
        }

        let consumed = FILE_HEADER_LEN + dib_size + entries * 4;
        if pixel_offset < consumed {
            return Err("bmp: pixel data overlaps header");
        }
        src.skip((pixel_offset - consumed) as usize)?;

        let stride = (width as usize * bpp as usize).div_ceil(32) * 4;
        let mut row = Vec::new();
        row.try_reserve_exact(stride)
            .map_err(|_| "bmp: OOM for row buffer")?;
        row.resize(stride, 0);

        Ok(Self {
            src,
            width,
            height,
            bpp: bpp as u8,
            stride,
            grey_lut,
            row,
            rows_read: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bits_per_pixel(&self) -> u8 {
        self.bpp
    }

    /// Read the next row (top first) as 8-bit grey into `out`.
    pub fn read_row(&mut self, out: &mut [u8]) -> Result<(), &'static str> {
        if self.rows_read >= self.height {
            return Err("bmp: no more rows");
        }
        self.src.read_exact(&mut self.row[..self.stride])?;
        self.rows_read += 1;

        let w = (self.width as usize).min(out.len());
        match self.bpp {
            1 => {
                for (x, o) in out[..w].iter_mut().enumerate() {
                    let idx = (self.row[x / 8] >> (7 - (x & 7))) & 1;
                    *o = self.grey_lut[idx as usize];
                }
            }
            _ => {
                for (x, o) in out[..w].iter_mut().enumerate() {
                    let idx = (self.row[x / 4] >> (6 - 2 * (x & 3))) & 3;
                    *o = self.grey_lut[idx as usize];
                }
            }
        }
        Ok(())
    }
}

/// Rescale a device-ready 1/2-bit BMP into a 1-bit dithered thumbnail
/// fitting `max_w` x `max_h`. No contrast boost is applied.
pub fn thumbnail<S, W>(
    source: &mut S,
    sink: &mut W,
    max_w: u16,
    max_h: u16,
    abort: Option<&dyn Fn() -> bool>,
) -> Result<BmpLayout, Error>
where
    S: ByteSource + ?Sized,
    W: ByteSink + ?Sized,
{
    let config = ImageConvertConfig {
        max_width: max_w,
        max_height: max_h,
        one_bit: true,
        quick_mode: false,
        log_tag: "BMP",
        should_abort: abort,
    };
    watch_source(source, |src| {
        let mut reader = BmpReader::new(src)?;
        log::info!(
            "BMP: scaling {}x{} {}-bit bitmap to 1-bit thumbnail",
            reader.width(),
            reader.height(),
            reader.bits_per_pixel()
        );

        let mut pipe = GreyPipeline::begin(
            sink,
            reader.width(),
            reader.height(),
            &config,
            OutputDepth::Mono1,
            Quality::Dither,
            false,
        )?;

        let mut grey = vec![0u8; reader.width() as usize];
        while !pipe.is_complete() {
            config.check_abort()?;
            reader.read_row(&mut grey)?;
            pipe.push_row(&grey)?;
        }
        pipe.finish()
    })
}

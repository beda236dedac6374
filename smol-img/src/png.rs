// Streaming PNG decoder for grey e-ink output.
// Chunks are read in order straight off the byte source; IDAT payloads
// (any number of chunks) are pulled by an InflateReader through its read
// callback, one scanline at a time. Peak RAM ~50KB (32KB window + 11KB
// decompressor + two scanlines).
// Colour types: 0=greyscale, 2=RGB, 3=palette, 4=grey+alpha, 6=RGBA.
// Interlaced (Adam7) rejected. Output is always 2-bit.

extern crate alloc;

use alloc::vec::Vec;

use crate::Error;
use crate::bmp::BmpLayout;
use crate::config::{ImageConvertConfig, OutputDepth};
use crate::dither::rgb_to_grey;
use crate::inflate::{InflateReader, InflateStatus};
use crate::io::{ByteReader, ByteSink, ByteSource, be_u32, watch_source};
use crate::pipeline::{GreyPipeline, MAX_SOURCE_HEIGHT, MAX_SOURCE_WIDTH};

// PNG constants

const PNG_SIG: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

const CHUNK_IHDR: [u8; 4] = *b"IHDR";
const CHUNK_PLTE: [u8; 4] = *b"PLTE";
const CHUNK_TRNS: [u8; 4] = *b"tRNS";
const CHUNK_IDAT: [u8; 4] = *b"IDAT";
const CHUNK_IEND: [u8; 4] = *b"IEND";

const COLOR_GREYSCALE: u8 = 0;
const COLOR_RGB: u8 = 2;
const COLOR_PALETTE: u8 = 3;
const COLOR_GREY_ALPHA: u8 = 4;
const COLOR_RGBA: u8 = 6;

const FILTER_NONE: u8 = 0;
const FILTER_SUB: u8 = 1;
const FILTER_UP: u8 = 2;
const FILTER_AVERAGE: u8 = 3;
const FILTER_PAETH: u8 = 4;

// IHDR

#[derive(Debug, Clone, Copy)]
struct PngHeader {
    width: u32,
    height: u32,
    bit_depth: u8,
    color_type: u8,
}

impl PngHeader {
    // bytes per complete pixel; filter stride for Sub/Paeth; 1 for sub-byte depths
    fn bytes_per_pixel(&self) -> usize {
        let channels: usize = match self.color_type {
            COLOR_GREYSCALE => 1,
            COLOR_RGB => 3,
            COLOR_PALETTE => 1,
            COLOR_GREY_ALPHA => 2,
            COLOR_RGBA => 4,
            _ => 1,
        };
        if self.bit_depth >= 8 {
            channels * (self.bit_depth as usize / 8)
        } else {
            1 // sub-byte packed
        }
    }

    // byte length of one unfiltered row (without the leading filter byte)
    fn scanline_bytes(&self) -> usize {
        let bits_per_pixel: usize = match self.color_type {
            COLOR_RGB => 3 * self.bit_depth as usize,
            COLOR_GREY_ALPHA => 2 * self.bit_depth as usize,
            COLOR_RGBA => 4 * self.bit_depth as usize,
            _ => self.bit_depth as usize,
        };
        (self.width as usize * bits_per_pixel).div_ceil(8)
    }
}

// IDAT payload across consecutive chunks; what the inflater pulls from
struct IdatStream<'s, S: ByteSource + ?Sized> {
    src: ByteReader<'s, S>,
    chunk_left: usize,
    more: bool,
}

impl<S: ByteSource + ?Sized> IdatStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, &'static str> {
        loop {
            if self.chunk_left > 0 {
                let want = buf.len().min(self.chunk_left);
                let n = self.src.read(&mut buf[..want])?;
                if n == 0 {
                    return Err("png: truncated IDAT chunk");
                }
                self.chunk_left -= n;
                return Ok(n);
            }
            if !self.more {
                return Ok(0);
            }
            self.src.skip(4)?; // CRC
            let mut hdr = [0u8; 8];
            self.src.read_exact(&mut hdr)?;
            if hdr[4..8] == CHUNK_IDAT {
                self.chunk_left = be_u32(&hdr, 0) as usize;
            } else {
                self.more = false;
            }
        }
    }
}

/// Scanline-at-a-time PNG decoder producing 8-bit grey rows.
pub struct PngDecoder<'s> {
    header: PngHeader,
    palette_grey: [u8; 256],
    inflate: InflateReader<'s>,
    bpp: usize,
    row_buf: Vec<u8>, // filter byte + scanline
    prev: Vec<u8>,
    grey: Vec<u8>,
    rows_read: u32,
}

impl<'s> PngDecoder<'s> {
    /// Read the signature and every chunk up to the first IDAT.
    pub fn new<S: ByteSource + ?Sized + 's>(source: &'s mut S) -> Result<Self, &'static str> {
        let mut src = ByteReader::new(source);

        let mut sig = [0u8; 8];
        src.read_exact(&mut sig)
            .map_err(|_| "png: invalid signature")?;
        if sig != PNG_SIG {
            return Err("png: invalid signature");
        }

        // IHDR (must be first chunk)
        let mut chunk_hdr = [0u8; 8]; // 4-byte length + 4-byte type
        src.read_exact(&mut chunk_hdr)?;
        let ihdr_len = be_u32(&chunk_hdr, 0) as usize;
        if chunk_hdr[4..8] != CHUNK_IHDR || ihdr_len < 13 {
            return Err("png: missing or invalid IHDR");
        }
        let mut ihdr = [0u8; 13];
        src.read_exact(&mut ihdr)?;
        src.skip(ihdr_len - 13 + 4)?; // extra bytes + CRC

        let header = PngHeader {
            width: be_u32(&ihdr, 0),
            height: be_u32(&ihdr, 4),
            bit_depth: ihdr[8],
            color_type: ihdr[9],
        };
        if header.width == 0 || header.height == 0 {
            return Err("png: zero dimensions");
        }
        if ihdr[12] != 0 {
            return Err("png: interlaced PNGs not supported");
        }
        match (header.color_type, header.bit_depth) {
            (COLOR_GREYSCALE, 1 | 2 | 4 | 8 | 16) => {}
            (COLOR_RGB, 8 | 16) => {}
            (COLOR_PALETTE, 1 | 2 | 4 | 8) => {}
            (COLOR_GREY_ALPHA, 8 | 16) => {}
            (COLOR_RGBA, 8 | 16) => {}
            _ => return Err("png: unsupported colour type / bit depth"),
        }
        if header.width > MAX_SOURCE_WIDTH || header.height > MAX_SOURCE_HEIGHT {
            log::warn!("png: {}x{} exceeds size limit", header.width, header.height);
            return Err("png: image too large");
        }

        // palette / transparency, then stop at the first IDAT
        let mut palette_grey = [0u8; 256];
        let mut have_plte = false;
        let first_idat_len: usize;
        loop {
            src.read_exact(&mut chunk_hdr)?;
            let clen = be_u32(&chunk_hdr, 0) as usize;
            let ctype = [chunk_hdr[4], chunk_hdr[5], chunk_hdr[6], chunk_hdr[7]];
            if ctype == CHUNK_IDAT {
                first_idat_len = clen;
                break;
            } else if ctype == CHUNK_IEND {
                return Err("png: no IDAT data");
            } else if ctype == CHUNK_PLTE && header.color_type == COLOR_PALETTE {
                if clen % 3 != 0 || clen > 768 {
                    return Err("png: invalid PLTE");
                }
                let mut p = [0u8; 768];
                src.read_exact(&mut p[..clen])?;
                for (i, rgb) in p[..clen].chunks_exact(3).enumerate() {
                    palette_grey[i] = rgb_to_grey(rgb[0], rgb[1], rgb[2]);
                }
                have_plte = true;
                src.skip(4)?;
            } else if ctype == CHUNK_TRNS && header.color_type == COLOR_PALETTE && clen <= 256 {
                let mut alpha = [0u8; 256];
                src.read_exact(&mut alpha[..clen])?;
                for (g, &a) in palette_grey.iter_mut().zip(&alpha[..clen]) {
                    *g = blend_white(*g, a);
                }
                src.skip(4)?;
            } else {
                src.skip(clen + 4)?; // skip data + CRC
            }
        }
        if header.color_type == COLOR_PALETTE && !have_plte {
            return Err("png: palette image without PLTE");
        }

        let mut inflate = InflateReader::new();
        inflate.init(true, None).map_err(|_| "png: OOM for inflater")?;
        let mut idat = IdatStream {
            src,
            chunk_left: first_idat_len,
            more: true,
        };
        inflate.set_read_callback(move |buf: &mut [u8]| idat.read(buf));
        inflate
            .skip_zlib_header()
            .map_err(|_| "png: bad zlib header")?;

        let scanline = header.scanline_bytes();
        let row_buf = alloc_row(1 + scanline)?;
        let prev = alloc_row(scanline)?;
        let grey = alloc_row(header.width as usize)?;

        log::info!(
            "png: {}x{}, colour type {}, {}-bit",
            header.width,
            header.height,
            header.color_type,
            header.bit_depth
        );

        Ok(Self {
            bpp: header.bytes_per_pixel(),
            header,
            palette_grey,
            inflate,
            row_buf,
            prev,
            grey,
            rows_read: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.header.width
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    /// Next image row as 8-bit grey; `None` once every row was read.
    pub fn next_row(&mut self) -> Result<Option<&[u8]>, &'static str> {
        if self.rows_read >= self.header.height {
            return Ok(None);
        }

        let mut filled = 0usize;
        while filled < self.row_buf.len() {
            let (status, n) = self.inflate.read_at_most(&mut self.row_buf[filled..]);
            filled += n;
            match status {
                InflateStatus::Ok if n > 0 => {}
                InflateStatus::Ok => return Err("png: IDAT decompression stalled"),
                InflateStatus::Done if filled < self.row_buf.len() => {
                    log::warn!(
                        "png: expected {} rows, got {}",
                        self.header.height,
                        self.rows_read
                    );
                    return Err("png: image data ended early");
                }
                InflateStatus::Done => {}
                InflateStatus::Error => return Err("png: corrupt IDAT stream"),
            }
        }

        let filter = self.row_buf[0];
        if filter > FILTER_PAETH {
            return Err("png: bad filter type");
        }
        let row = &mut self.row_buf[1..];
        unfilter_row(filter, row, &self.prev, self.bpp);
        for (x, g) in self.grey.iter_mut().enumerate() {
            *g = pixel_to_grey(row, x, &self.header, &self.palette_grey);
        }
        self.prev.copy_from_slice(row);
        self.rows_read += 1;
        Ok(Some(&self.grey))
    }
}

fn alloc_row(len: usize) -> Result<Vec<u8>, &'static str> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| "png: OOM for row buffers")?;
    v.resize(len, 0u8);
    Ok(v)
}

/// Decode a PNG from `source` into a 2-bit BMP on `sink`; `one_bit` is
/// ignored. Abort is polled before the header and once per scanline.
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
        let mut dec = PngDecoder::new(src)?;
        if config.one_bit {
            log::info!("{}: PNG output is always 2-bit", config.log_tag);
        }
        let mut pipe = GreyPipeline::begin(
            sink,
            dec.width(),
            dec.height(),
            config,
            OutputDepth::Gray2,
            config.quality(),
            true,
        )?;

        while !pipe.is_complete() {
            config.check_abort()?;
            match dec.next_row()? {
                Some(row) => pipe.push_row(row)?,
                None => break,
            }
        }
        pipe.finish()
    })
}

// unfiltering

// reconstruct one scanline in-place given the previous unfiltered row; bpp = byte stride
fn unfilter_row(filter: u8, row: &mut [u8], prev: &[u8], bpp: usize) {
    let len = row.len();
    match filter {
        FILTER_NONE => {}
        FILTER_SUB => {
            for i in bpp..len {
                row[i] = row[i].wrapping_add(row[i - bpp]);
            }
        }
        FILTER_UP => {
            for i in 0..len {
                row[i] = row[i].wrapping_add(prev[i]);
            }
        }
        FILTER_AVERAGE => {
            for i in 0..len {
                let a = if i >= bpp { row[i - bpp] as u16 } else { 0 };
                let b = prev[i] as u16;
                row[i] = row[i].wrapping_add(((a + b) / 2) as u8);
            }
        }
        FILTER_PAETH => {
            for i in 0..len {
                let a = if i >= bpp { row[i - bpp] } else { 0 };
                let b = prev[i];
                let c = if i >= bpp { prev[i - bpp] } else { 0 };
                row[i] = row[i].wrapping_add(paeth(a, b, c));
            }
        }
        _ => {}
    }
}

#[inline]
fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let a = a as i16;
    let b = b as i16;
    let c = c as i16;
    let p = a + b - c;
    let pa = (p - a).unsigned_abs();
    let pb = (p - b).unsigned_abs();
    let pc = (p - c).unsigned_abs();
    if pa <= pb && pa <= pc {
        a as u8
    } else if pb <= pc {
        b as u8
    } else {
        c as u8
    }
}

// pixel -> greyscale conversion

// sample one pixel from an unfiltered scanline; return 0-255 grey.
// alpha pre-blended against white (e-paper background).
#[inline]
fn pixel_to_grey(row: &[u8], x: usize, hdr: &PngHeader, pal: &[u8; 256]) -> u8 {
    match (hdr.color_type, hdr.bit_depth) {
        // greyscale
        (COLOR_GREYSCALE, 8) => row[x],
        (COLOR_GREYSCALE, 16) => row[x * 2], // high byte only
        (COLOR_GREYSCALE, bd) => unpack_sub_byte(row, x, bd),

        // RGB
        (COLOR_RGB, 8) => rgb_to_grey(row[x * 3], row[x * 3 + 1], row[x * 3 + 2]),
        (COLOR_RGB, 16) => rgb_to_grey(row[x * 6], row[x * 6 + 2], row[x * 6 + 4]),

        // palette
        (COLOR_PALETTE, 8) => pal[row[x] as usize],
        (COLOR_PALETTE, bd) => pal[unpack_sub_byte_raw(row, x, bd) as usize],

        // greyscale + alpha
        (COLOR_GREY_ALPHA, 8) => blend_white(row[x * 2], row[x * 2 + 1]),
        (COLOR_GREY_ALPHA, 16) => blend_white(row[x * 4], row[x * 4 + 2]),

        // RGBA
        (COLOR_RGBA, 8) => {
            let g = rgb_to_grey(row[x * 4], row[x * 4 + 1], row[x * 4 + 2]);
            blend_white(g, row[x * 4 + 3])
        }
        (COLOR_RGBA, 16) => {
            let g = rgb_to_grey(row[x * 8], row[x * 8 + 2], row[x * 8 + 4]);
            blend_white(g, row[x * 8 + 6])
        }

        _ => 128, // unreachable for validated header
    }
}

// alpha-blend grey against white: out = grey*a/255 + 255*(255-a)/255
#[inline]
fn blend_white(grey: u8, alpha: u8) -> u8 {
    let g = grey as u16;
    let a = alpha as u16;
    ((g * a + 255 * (255 - a)) / 255) as u8
}

// unpack a sub-byte greyscale sample (1/2/4 bit) and scale to 0-255
#[inline]
fn unpack_sub_byte(row: &[u8], x: usize, bit_depth: u8) -> u8 {
    let raw = unpack_sub_byte_raw(row, x, bit_depth);
    let max = (1u16 << bit_depth) - 1;
    (raw as u16 * 255 / max) as u8
}

// unpack a sub-byte sample without rescaling (for palette index)
#[inline]
fn unpack_sub_byte_raw(row: &[u8], x: usize, bit_depth: u8) -> u8 {
    let bpp = bit_depth as usize;
    let ppb = 8 / bpp; // pixels per byte
    let byte_idx = x / ppb;
    let bit_offset = (ppb - 1 - x % ppb) * bpp;
    let mask = (1u8 << bpp) - 1;
    (row[byte_idx] >> bit_offset) & mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{le_u16, le_u32};
    use image::codecs::png::{CompressionType, FilterType, PngEncoder};
    use image::{ExtendedColorType, ImageEncoder};
    use miniz_oxide::deflate::compress_to_vec_zlib;

    fn encode(pixels: &[u8], w: u32, h: u32, color: ExtendedColorType, filter: FilterType) -> Vec<u8> {
        let mut out = Vec::new();
        PngEncoder::new_with_quality(&mut out, CompressionType::Best, filter)
            .write_image(pixels, w, h, color)
            .unwrap();
        out
    }

    fn chunk(out: &mut Vec<u8>, ty: &[u8; 4], data: &[u8]) {
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(ty);
        out.extend_from_slice(data);
        out.extend_from_slice(&[0; 4]); // CRC is not checked
    }

    // hand-built PNG; raw holds filter-prefixed scanlines
    fn build(
        w: u32,
        h: u32,
        depth: u8,
        color: u8,
        extra: &[(&[u8; 4], &[u8])],
        raw: &[u8],
        idat_piece: usize,
    ) -> Vec<u8> {
        let mut out = PNG_SIG.to_vec();
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&w.to_be_bytes());
        ihdr.extend_from_slice(&h.to_be_bytes());
        ihdr.extend_from_slice(&[depth, color, 0, 0, 0]);
        chunk(&mut out, b"IHDR", &ihdr);
        for (ty, data) in extra {
            chunk(&mut out, ty, data);
        }
        let z = compress_to_vec_zlib(raw, 6);
        for piece in z.chunks(idat_piece) {
            chunk(&mut out, b"IDAT", piece);
        }
        chunk(&mut out, b"IEND", &[]);
        out
    }

    fn decode_all(png: &[u8]) -> Result<Vec<Vec<u8>>, &'static str> {
        let mut src: &[u8] = png;
        let mut dec = PngDecoder::new(&mut src)?;
        let mut rows = Vec::new();
        while let Some(row) = dec.next_row()? {
            rows.push(row.to_vec());
        }
        Ok(rows)
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut x = 0x2545_F491u32;
        (0..len)
            .map(|i| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                // mix smooth and noisy areas so every filter gets picked
                if i % 7 < 3 { (i % 251) as u8 } else { x as u8 }
            })
            .collect()
    }

    #[test]
    fn every_filter_reconstructs_exactly() {
        let (w, h) = (23u32, 17u32);
        let src = noise((w * h) as usize);
        for filter in [
            FilterType::NoFilter,
            FilterType::Sub,
            FilterType::Up,
            FilterType::Avg,
            FilterType::Paeth,
            FilterType::Adaptive,
        ] {
            let png = encode(&src, w, h, ExtendedColorType::L8, filter);
            let rows = decode_all(&png).unwrap();
            assert_eq!(rows.len(), h as usize);
            for (y, row) in rows.iter().enumerate() {
                assert_eq!(&row[..], &src[y * w as usize..(y + 1) * w as usize], "{:?}", filter);
            }
        }
    }

    #[test]
    fn rgb_filters_use_pixel_stride() {
        let (w, h) = (9u32, 6u32);
        let rgb = noise((w * h * 3) as usize);
        let png = encode(&rgb, w, h, ExtendedColorType::Rgb8, FilterType::Paeth);
        let rows = decode_all(&png).unwrap();
        for (y, row) in rows.iter().enumerate() {
            for (x, &g) in row.iter().enumerate() {
                let p = (y * w as usize + x) * 3;
                assert_eq!(g, rgb_to_grey(rgb[p], rgb[p + 1], rgb[p + 2]));
            }
        }
    }

    #[test]
    fn alpha_blends_against_white() {
        let rgba = [0u8, 0, 0, 0, 0, 0, 0, 255, 0, 0, 0, 128, 255, 255, 255, 255];
        let png = encode(&rgba, 4, 1, ExtendedColorType::Rgba8, FilterType::NoFilter);
        let rows = decode_all(&png).unwrap();
        assert_eq!(rows, vec![vec![255, 0, 127, 255]]);
    }

    #[test]
    fn palette_with_transparency() {
        let plte = [0, 0, 0, 255, 255, 255, 255, 0, 0, 0, 0, 255];
        let trns = [255, 255, 255, 0];
        let raw = [0, 0b00_01_10_11, 0, 0b10_10_10_10];
        let png = build(
            4,
            2,
            2,
            COLOR_PALETTE,
            &[(b"PLTE", &plte), (b"tRNS", &trns)],
            &raw,
            1000,
        );
        let rows = decode_all(&png).unwrap();
        assert_eq!(rows, vec![vec![0, 255, 76, 255], vec![76, 76, 76, 76]]);
    }

    #[test]
    fn palette_without_plte_is_rejected() {
        let png = build(1, 1, 8, COLOR_PALETTE, &[], &[0, 0], 1000);
        assert_eq!(decode_all(&png).err(), Some("png: palette image without PLTE"));
    }

    #[test]
    fn sixteen_bit_uses_high_byte() {
        let raw = [0, 0x12, 0x34, 0xFF, 0x00];
        let png = build(2, 1, 16, COLOR_GREYSCALE, &[], &raw, 1000);
        assert_eq!(decode_all(&png).unwrap(), vec![vec![0x12, 0xFF]]);
    }

    #[test]
    fn sub_byte_grey_scales_to_full_range() {
        // 2-bit grey: 0, 1, 2, 3
        let raw = [0, 0b00_01_10_11];
        let png = build(4, 1, 2, COLOR_GREYSCALE, &[], &raw, 1000);
        assert_eq!(decode_all(&png).unwrap(), vec![vec![0, 85, 170, 255]]);
    }

    #[test]
    fn idat_split_across_many_chunks() {
        let (w, h) = (31usize, 12usize);
        let pixels = noise(w * h);
        let mut raw = Vec::new();
        for row in pixels.chunks(w) {
            raw.push(0);
            raw.extend_from_slice(row);
        }
        let extra: [(&[u8; 4], &[u8]); 1] = [(b"tEXt", b"Title\0cover")];
        let png = build(w as u32, h as u32, 8, COLOR_GREYSCALE, &extra, &raw, 7);
        let rows = decode_all(&png).unwrap();
        let flat: Vec<u8> = rows.concat();
        assert_eq!(flat, pixels);
    }

    #[test]
    fn rejects_interlaced_and_garbage() {
        let mut png = build(1, 1, 8, COLOR_GREYSCALE, &[], &[0, 0], 1000);
        png[8 + 8 + 12] = 1; // interlace method
        assert_eq!(decode_all(&png).err(), Some("png: interlaced PNGs not supported"));
        assert!(decode_all(b"GIF89a\x01\x00\x01\x00").is_err());
        let bad_depth = build(1, 1, 3, COLOR_GREYSCALE, &[], &[0, 0], 1000);
        assert!(decode_all(&bad_depth).is_err());
    }

    #[test]
    fn truncated_image_data_fails() {
        let (w, h) = (64u32, 64u32);
        let png = encode(&noise(4096), w, h, ExtendedColorType::L8, FilterType::Sub);
        let cut = &png[..png.len() * 2 / 3];
        assert!(decode_all(cut).is_err());
    }

    #[test]
    fn short_stream_is_an_error() {
        // zlib stream ends after one of two declared rows
        let png = build(2, 2, 8, COLOR_GREYSCALE, &[], &[0, 9, 9], 1000);
        assert_eq!(decode_all(&png).err(), Some("png: image data ended early"));
    }

    #[test]
    fn transcode_is_always_two_bit() {
        let (w, h) = (40u32, 40u32);
        let png = encode(&noise(1600), w, h, ExtendedColorType::L8, FilterType::Adaptive);
        let mut src: &[u8] = &png;
        let mut out = Vec::new();
        let config = ImageConvertConfig {
            one_bit: true,
            max_width: 20,
            max_height: 20,
            ..Default::default()
        };
        let layout = transcode(&mut src, &mut out, &config).unwrap();
        assert_eq!(layout.depth, OutputDepth::Gray2);
        assert_eq!((layout.width, layout.height), (20, 20));
        assert_eq!(le_u32(&out, 10), 70);
        assert_eq!(le_u16(&out, 28), 2);
        assert_eq!(out.len() as u32, layout.file_size);
    }

    #[test]
    fn abort_before_header_writes_nothing() {
        let png = encode(&noise(64), 8, 8, ExtendedColorType::L8, FilterType::NoFilter);
        let mut src: &[u8] = &png;
        let mut out = Vec::new();
        let stop = || true;
        let config = ImageConvertConfig {
            should_abort: Some(&stop),
            ..Default::default()
        };
        assert_eq!(transcode(&mut src, &mut out, &config), Err(Error::Aborted));
        assert!(out.is_empty());
    }

    fn flat_grey_pixels(quick_mode: bool) -> Vec<u8> {
        let png = encode(&[128u8; 32 * 8], 32, 8, ExtendedColorType::L8, FilterType::Sub);
        let mut src: &[u8] = &png;
        let mut out = Vec::new();
        let config = ImageConvertConfig {
            quick_mode,
            ..Default::default()
        };
        transcode(&mut src, &mut out, &config).unwrap();
        out.split_off(70)
    }

    #[test]
    fn quick_mode_thresholds_every_pixel() {
        // 128 sits nearest level 2 of 0..=3; 2-bit 0b10 four times
        let pixels = flat_grey_pixels(true);
        assert_eq!(pixels.len(), 8 * 8);
        assert!(pixels.iter().all(|&b| b == 0xAA));

        let dithered = flat_grey_pixels(false);
        assert!(dithered.iter().any(|&b| b != 0xAA));
    }

    #[test]
    fn failing_source_is_io_error() {
        struct Pulled<'a>(&'a [u8]);
        impl ByteSource for Pulled<'_> {
            fn read(&mut self, buf: &mut [u8]) -> Result<usize, &'static str> {
                if self.0.is_empty() {
                    return Err("card removed");
                }
                let n = buf.len().min(self.0.len());
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }
        let png = encode(&noise(64 * 64), 64, 64, ExtendedColorType::L8, FilterType::Paeth);
        let mut src = Pulled(&png[..png.len() / 2]);
        let mut out = Vec::new();
        let r = transcode(&mut src, &mut out, &ImageConvertConfig::default());
        assert_eq!(r, Err(Error::Io("card removed")));
    }
}

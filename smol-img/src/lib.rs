// smol-img: streaming image transcoder for 1/2-bit e-ink bitmaps.
// io:       byte source/sink traits, chunked reader
// inflate:  streaming DEFLATE reader with owned or borrowed 32KB window
// jpeg:     baseline JPEG decoder, luma only, MCU-row streaming
// png:      PNG decoder, IDAT fed through inflate, scanline streaming
// resample: aspect-preserving fit + streaming area-average row scaler
// dither:   threshold / Floyd-Steinberg quantizer to 1 or 2 bits
// bmp:      BMP layout, streaming writer, 1/2-bit reader + thumbnailer
// pipeline: resample -> quantize -> BMP glue shared by the decoders
// convert:  format registry, converter trait, pass-through BMP copy

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::fmt;

pub mod bmp;
pub mod config;
pub mod convert;
pub mod dither;
pub mod inflate;
pub mod io;
pub mod jpeg;
pub mod pipeline;
pub mod png;
pub mod resample;

pub use config::{ImageConvertConfig, OutputDepth, Quality};
pub use convert::{ConverterRegistry, ImageConverter, ImageFormat};

/// Outcome of a failed conversion.
///
/// Decoders work in terms of `&'static str` messages internally; those
/// surface as [`Error::Decode`]. Source or sink failures are
/// [`Error::Io`] and a fired abort predicate is [`Error::Aborted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// malformed or unsupported source data
    Decode(&'static str),
    /// the source could not be read or the sink refused bytes
    Io(&'static str),
    /// the abort predicate returned true
    Aborted,
}

impl Error {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}

impl From<&'static str> for Error {
    fn from(msg: &'static str) -> Self {
        Error::Decode(msg)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Decode(msg) => write!(f, "decode failed: {}", msg),
            Error::Io(msg) => write!(f, "i/o failed: {}", msg),
            Error::Aborted => write!(f, "conversion aborted"),
        }
    }
}

impl core::error::Error for Error {}

// pulp-transcode: turns cover images on disk into e-ink ready BMPs.
// All decoding lives in smol-img; this crate adds files, cleanup on
// failure and the command line front-end.

pub mod error;
pub mod io;
pub mod storage;

pub use error::ConvertError;
pub use smol_img::{ImageConvertConfig, ImageFormat, OutputDepth, Quality};
pub use storage::{DirStorage, Storage, convert_to_bmp, thumbnail_to_bmp};

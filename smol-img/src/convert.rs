// Format dispatch: file extension -> converter.
//
// Converters are zero-sized and stateless; one registry can be a
// `static` shared by every caller.

use crate::Error;
use crate::config::ImageConvertConfig;
use crate::io::{ByteSink, ByteSource};
use crate::{jpeg, png};

// pass-through copy granularity
const COPY_CHUNK: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Bmp,
}

impl ImageFormat {
    /// Classify by extension, ignoring ASCII case.
    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
        let (_, ext) = name.rsplit_once('.')?;
        if ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg") {
            Some(ImageFormat::Jpeg)
        } else if ext.eq_ignore_ascii_case("png") {
            Some(ImageFormat::Png)
        } else if ext.eq_ignore_ascii_case("bmp") {
            Some(ImageFormat::Bmp)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Png => "PNG",
            ImageFormat::Bmp => "BMP",
        }
    }
}

/// One source format's route to a device BMP.
pub trait ImageConverter: Sync {
    fn convert(
        &self,
        input: &mut dyn ByteSource,
        output: &mut dyn ByteSink,
        config: &ImageConvertConfig,
    ) -> Result<(), Error>;

    fn format_name(&self) -> &'static str;
}

pub struct JpegConverter;

impl ImageConverter for JpegConverter {
    fn convert(
        &self,
        input: &mut dyn ByteSource,
        output: &mut dyn ByteSink,
        config: &ImageConvertConfig,
    ) -> Result<(), Error> {
        jpeg::transcode(input, output, config).map(|_| ())
    }

    fn format_name(&self) -> &'static str {
        ImageFormat::Jpeg.name()
    }
}

pub struct PngConverter;

impl ImageConverter for PngConverter {
    fn convert(
        &self,
        input: &mut dyn ByteSource,
        output: &mut dyn ByteSink,
        config: &ImageConvertConfig,
    ) -> Result<(), Error> {
        png::transcode(input, output, config).map(|_| ())
    }

    fn format_name(&self) -> &'static str {
        ImageFormat::Png.name()
    }
}

/// Copies an already device-ready BMP byte for byte; config is ignored.
pub struct BmpConverter;

impl ImageConverter for BmpConverter {
    fn convert(
        &self,
        input: &mut dyn ByteSource,
        output: &mut dyn ByteSink,
        _config: &ImageConvertConfig,
    ) -> Result<(), Error> {
        let mut buf = [0u8; COPY_CHUNK];
        let mut total = 0usize;
        loop {
            let n = input.read(&mut buf).map_err(Error::Io)?;
            if n == 0 {
                break;
            }
            output.write_all(&buf[..n]).map_err(Error::Io)?;
            total += n;
        }
        log::info!("BMP: copied {} bytes", total);
        Ok(())
    }

    fn format_name(&self) -> &'static str {
        ImageFormat::Bmp.name()
    }
}

pub struct ConverterRegistry {
    jpeg: JpegConverter,
    png: PngConverter,
    bmp: BmpConverter,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConverterRegistry {
    pub const fn new() -> Self {
        Self {
            jpeg: JpegConverter,
            png: PngConverter,
            bmp: BmpConverter,
        }
    }

    /// Converter for `path`'s extension; `None` when unsupported.
    pub fn get_converter(&self, path: &str) -> Option<&dyn ImageConverter> {
        match ImageFormat::from_path(path)? {
            ImageFormat::Jpeg => Some(&self.jpeg),
            ImageFormat::Png => Some(&self.png),
            ImageFormat::Bmp => Some(&self.bmp),
        }
    }

    pub fn is_supported(&self, path: &str) -> bool {
        ImageFormat::from_path(path).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static REGISTRY: ConverterRegistry = ConverterRegistry::new();

    #[test]
    fn classifies_extensions_ignoring_case() {
        assert_eq!(ImageFormat::from_path("cover.jpg"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_path("COVER.JPEG"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_path("a/b/img.Png"), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::from_path("thumb.BMP"), Some(ImageFormat::Bmp));
        assert_eq!(ImageFormat::from_path("cover.gif"), None);
        assert_eq!(ImageFormat::from_path("jpg"), None);
        assert_eq!(ImageFormat::from_path("dir.png/file"), None);
        assert_eq!(ImageFormat::from_path(""), None);
    }

    #[test]
    fn registry_routes_by_format() {
        let c = REGISTRY.get_converter("x.jpeg").unwrap();
        assert_eq!(c.format_name(), "JPEG");
        assert_eq!(REGISTRY.get_converter("x.png").unwrap().format_name(), "PNG");
        assert_eq!(REGISTRY.get_converter("x.bmp").unwrap().format_name(), "BMP");
        assert!(REGISTRY.get_converter("x.webp").is_none());
        assert!(REGISTRY.is_supported("X.JPG"));
        assert!(!REGISTRY.is_supported("notes.txt"));
    }

    #[test]
    fn bmp_passes_through_unchanged() {
        let data: Vec<u8> = (0..1500u32).map(|i| (i * 7) as u8).collect();
        let mut src: &[u8] = &data;
        let mut out = Vec::new();
        let config = ImageConvertConfig {
            one_bit: true,
            max_width: 10,
            ..Default::default()
        };
        BmpConverter.convert(&mut src, &mut out, &config).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn bmp_sink_failure_is_io_error() {
        struct Full;
        impl ByteSink for Full {
            fn write_all(&mut self, _buf: &[u8]) -> Result<(), &'static str> {
                Err("disk full")
            }
        }
        let mut src: &[u8] = &[1, 2, 3];
        let r = BmpConverter.convert(&mut src, &mut Full, &ImageConvertConfig::default());
        assert_eq!(r, Err(Error::Io("disk full")));
    }

    struct Unplugged;
    impl ByteSource for Unplugged {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, &'static str> {
            Err("card removed")
        }
    }

    #[test]
    fn source_failure_is_io_error_for_every_format() {
        for path in ["a.jpg", "a.png", "a.bmp"] {
            let mut out = Vec::new();
            let c = REGISTRY.get_converter(path).unwrap();
            let r = c.convert(&mut Unplugged, &mut out, &ImageConvertConfig::default());
            assert_eq!(r, Err(Error::Io("card removed")), "{}", path);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn jpeg_garbage_surfaces_decode_error() {
        let mut src: &[u8] = b"not a jpeg at all";
        let mut out = Vec::new();
        let c = REGISTRY.get_converter("a.jpg").unwrap();
        let r = c.convert(&mut src, &mut out, &ImageConvertConfig::default());
        assert!(matches!(r, Err(Error::Decode(_))));
        assert!(out.is_empty());
    }
}

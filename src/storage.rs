// File access for path-to-path conversion, plus the convert entry points.
// The destination is created (or truncated) up front and removed again
// on any failure, so a half-written BMP never stays behind.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use smol_img::io::{ByteSink, ByteSource};
use smol_img::{ConverterRegistry, ImageConvertConfig, ImageFormat, bmp};

use crate::error::ConvertError;
use crate::io::{IoSink, IoSource};

static REGISTRY: ConverterRegistry = ConverterRegistry::new();

pub trait Storage {
    type Reader: Read;
    type Writer: Write;

    fn exists(&self, path: &str) -> bool;

    fn open_read(&self, path: &str) -> io::Result<Self::Reader>;

    /// Create or truncate `path`.
    fn create(&self, path: &str) -> io::Result<Self::Writer>;

    /// Delete `path`; no-op if absent.
    fn remove(&self, path: &str) -> io::Result<()>;
}

/// Storage rooted at a directory. Relative paths resolve against the
/// root; absolute paths are used as given.
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Storage for DirStorage {
    type Reader = BufReader<File>;
    type Writer = BufWriter<File>;

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn open_read(&self, path: &str) -> io::Result<Self::Reader> {
        File::open(self.resolve(path)).map(BufReader::new)
    }

    fn create(&self, path: &str) -> io::Result<Self::Writer> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(full).map(BufWriter::new)
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        match fs::remove_file(self.resolve(path)) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            r => r,
        }
    }
}

/// Convert the JPEG, PNG or BMP at `input` into a device BMP at `output`.
pub fn convert_to_bmp<S: Storage + ?Sized>(
    storage: &S,
    input: &str,
    output: &str,
    config: &ImageConvertConfig,
) -> Result<(), ConvertError> {
    let Some(converter) = REGISTRY.get_converter(input) else {
        log::error!("{}: unsupported image format: {}", config.log_tag, input);
        return Err(ConvertError::Unsupported(input.to_string()));
    };
    let format = converter.format_name();
    transcode_file(storage, input, output, config.log_tag, format, |src, sink| {
        converter.convert(src, sink, config)
    })?;
    log::info!("{}: converted {} to BMP: {}", config.log_tag, format, output);
    Ok(())
}

/// Rescale a device BMP (a cached cover) into a 1-bit thumbnail.
pub fn thumbnail_to_bmp<S: Storage + ?Sized>(
    storage: &S,
    input: &str,
    output: &str,
    config: &ImageConvertConfig,
) -> Result<(), ConvertError> {
    if ImageFormat::from_path(input) != Some(ImageFormat::Bmp) {
        log::error!("{}: thumbnail source is not a BMP: {}", config.log_tag, input);
        return Err(ConvertError::Unsupported(input.to_string()));
    }
    let (max_w, max_h) = config.target_box();
    transcode_file(storage, input, output, config.log_tag, "BMP", |src, sink| {
        bmp::thumbnail(src, sink, max_w, max_h, config.should_abort).map(|_| ())
    })?;
    log::info!("{}: wrote thumbnail {}", config.log_tag, output);
    Ok(())
}

// open both ends, run `f`, close both; remove `output` on any failure
fn transcode_file<S, F>(
    storage: &S,
    input: &str,
    output: &str,
    tag: &str,
    format: &'static str,
    f: F,
) -> Result<(), ConvertError>
where
    S: Storage + ?Sized,
    F: FnOnce(&mut dyn ByteSource, &mut dyn ByteSink) -> Result<(), smol_img::Error>,
{
    let reader = storage.open_read(input).map_err(|source| {
        log::error!("{}: failed to open input file {}: {}", tag, input, source);
        ConvertError::OpenSource {
            path: input.to_string(),
            source,
        }
    })?;
    let writer = storage.create(output).map_err(|source| {
        log::error!("{}: failed to create output file {}: {}", tag, output, source);
        ConvertError::CreateDest {
            path: output.to_string(),
            source,
        }
    })?;

    let mut src = IoSource::new(reader);
    let mut sink = IoSink::new(writer);
    let result = match f(&mut src, &mut sink) {
        Ok(()) => sink.flush().map_err(|source| ConvertError::CloseDest {
            path: output.to_string(),
            source,
        }),
        Err(smol_img::Error::Aborted) => Err(ConvertError::Aborted),
        Err(e) => Err(if let Some(source) = src.take_error() {
            ConvertError::ReadSource {
                path: input.to_string(),
                source,
            }
        } else if let Some(source) = sink.take_error() {
            ConvertError::WriteDest {
                path: output.to_string(),
                source,
            }
        } else {
            ConvertError::Conversion { format, source: e }
        }),
    };
    drop(src);
    drop(sink);

    if let Err(e) = &result {
        if e.is_cancelled() {
            log::info!("{}: conversion of {} cancelled", tag, input);
        } else {
            log::error!("{}: {}", tag, e);
        }
        if let Err(re) = storage.remove(output) {
            log::warn!("{}: failed to remove {}: {}", tag, output, re);
        }
    }
    result
}

// Failures of a path-to-path conversion.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("unsupported image format: {0}")]
    Unsupported(String),
    #[error("failed to open input file {path}: {source}")]
    OpenSource {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to create output file {path}: {source}")]
    CreateDest {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read input file {path}: {source}")]
    ReadSource {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write output file {path}: {source}")]
    WriteDest {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to finish output file {path}: {source}")]
    CloseDest {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to convert {format} to BMP: {source}")]
    Conversion {
        format: &'static str,
        #[source]
        source: smol_img::Error,
    },
    #[error("conversion aborted")]
    Aborted,
}

impl ConvertError {
    /// True when the caller's abort predicate stopped the conversion.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConvertError::Aborted)
    }
}

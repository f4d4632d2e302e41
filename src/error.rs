use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MosaicError {
    #[error("archive request failed: {0}")]
    #[diagnostic(help("transient network failures are retried; check connectivity and the archive URL"))]
    Transport(String),

    #[error("archive rejected the credentials (HTTP {status})")]
    #[diagnostic(help("check S2M_USERNAME and S2M_PASSWORD"))]
    Auth { status: u16 },

    #[error("archive returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("archive reported error {code}: {message}")]
    Remote { code: String, message: String },

    #[error(
        "checksum mismatch for {path} after {attempts} attempt(s): expected {expected}, got {actual}"
    )]
    Integrity {
        path: String,
        expected: String,
        actual: String,
        attempts: u32,
    },

    #[error("malformed data: {0}")]
    Data(String),

    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedChecksum(String),

    #[error("raster error: {0}")]
    Raster(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("missing config file s2-mosaic.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl MosaicError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, MosaicError::Auth { .. } | MosaicError::Cancelled)
    }
}

impl From<quick_xml::Error> for MosaicError {
    fn from(err: quick_xml::Error) -> Self {
        MosaicError::Data(format!("xml: {err}"))
    }
}

impl From<quick_xml::events::attributes::AttrError> for MosaicError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        MosaicError::Data(format!("xml attribute: {err}"))
    }
}

impl From<tiff::TiffError> for MosaicError {
    fn from(err: tiff::TiffError) -> Self {
        MosaicError::Raster(err.to_string())
    }
}

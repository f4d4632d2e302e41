use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Sha3_256;

use crate::error::MosaicError;

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
    Sha3_256,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Md5 => write!(f, "MD5"),
            ChecksumAlgorithm::Sha256 => write!(f, "SHA256"),
            ChecksumAlgorithm::Sha3_256 => write!(f, "SHA3-256"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = MosaicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .trim()
            .chars()
            .filter(|ch| !matches!(ch, '-' | '_'))
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "MD5" => Ok(ChecksumAlgorithm::Md5),
            "SHA256" | "SHA2256" => Ok(ChecksumAlgorithm::Sha256),
            "SHA3256" => Ok(ChecksumAlgorithm::Sha3_256),
            _ => Err(MosaicError::UnsupportedChecksum(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into().trim().to_string(),
        }
    }

    pub fn matches(&self, actual_hex: &str) -> bool {
        self.value.eq_ignore_ascii_case(actual_hex.trim())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

pub fn file_digest(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, MosaicError> {
    let file = File::open(path)
        .map_err(|err| MosaicError::Filesystem(format!("open {}: {err}", path.display())))?;
    match algorithm {
        ChecksumAlgorithm::Md5 => digest_reader::<Md5, _>(file),
        ChecksumAlgorithm::Sha256 => digest_reader::<Sha256, _>(file),
        ChecksumAlgorithm::Sha3_256 => digest_reader::<Sha3_256, _>(file),
    }
}

pub fn verify_file(path: &Path, expected: &Checksum) -> Result<bool, MosaicError> {
    if !path.is_file() {
        return Ok(false);
    }
    let actual = file_digest(path, expected.algorithm)?;
    Ok(expected.matches(&actual))
}

fn digest_reader<D: Digest, R: Read>(mut reader: R) -> Result<String, MosaicError> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

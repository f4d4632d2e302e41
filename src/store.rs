use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::TileCode;
use crate::error::MosaicError;

const METADATA_FILE: &str = "METADATA";

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn band_dir(&self, tile: &TileCode) -> Utf8PathBuf {
        self.root.join("bands").join(tile.as_str())
    }

    pub fn band_path(&self, tile: &TileCode, file_name: &str) -> Utf8PathBuf {
        self.band_dir(tile).join(file_name)
    }

    pub fn product_path(&self, title: &str) -> Utf8PathBuf {
        self.root.join("products").join(format!("{title}.zip"))
    }

    pub fn composite_path(&self, file_name: &str) -> Utf8PathBuf {
        self.root.join("composites").join(file_name)
    }

    pub fn mosaic_path(&self) -> Utf8PathBuf {
        self.root.join("mosaic.tif")
    }

    pub fn metadata_path(&self) -> Utf8PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn ensure_root(&self) -> Result<(), MosaicError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| MosaicError::Filesystem(err.to_string()))
    }

    pub fn append_record(&self, record: &BandRecord) -> Result<(), MosaicError> {
        self.ensure_root()?;
        let mut line = serde_json::to_vec(record)
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.metadata_path().as_std_path())
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        file.write_all(&line)
            .map_err(|err| MosaicError::Filesystem(err.to_string()))
    }

    pub fn read_records(&self) -> Result<Vec<BandRecord>, MosaicError> {
        let path = self.metadata_path();
        if !path.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(path.as_std_path())
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| MosaicError::Filesystem(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: BandRecord = serde_json::from_str(&line)
                .map_err(|err| MosaicError::Data(format!("{METADATA_FILE}: {err}")))?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn write_atomic_with<F>(dest: &Utf8Path, write: F) -> Result<(), MosaicError>
    where
        F: FnOnce(&Path) -> Result<(), MosaicError>,
    {
        let parent = dest
            .parent()
            .ok_or_else(|| MosaicError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".s2m-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        write(temp.path())?;
        temp.persist(dest.as_std_path())
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandRecord {
    pub tile: String,
    pub product_id: String,
    pub title: String,
    pub band: String,
    pub path: String,
    pub size: u64,
    pub checksum: String,
    pub cloud_cover: f64,
    pub acquired_at: Option<DateTime<Utc>>,
    pub transferred: bool,
    pub recorded_at: DateTime<Utc>,
    pub tool: String,
}

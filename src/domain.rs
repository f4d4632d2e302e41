use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MosaicError;
use crate::geometry::Geometry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCode(String);

impl TileCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn title_token(&self) -> String {
        format!("T{}", self.0)
    }
}

impl fmt::Display for TileCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TileCode {
    type Err = MosaicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().to_uppercase();
        let normalized = match trimmed.strip_prefix('T') {
            Some(rest) if trimmed.len() == 6 => rest.to_string(),
            _ => trimmed,
        };
        let bytes = normalized.as_bytes();
        let is_valid = bytes.len() == 5
            && bytes[..2].iter().all(u8::is_ascii_digit)
            && bytes[2..].iter().all(u8::is_ascii_uppercase);
        if !is_valid {
            return Err(MosaicError::Data(format!("invalid tile code: {value}")));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BandLabel {
    band: String,
    resolution_m: u32,
}

impl BandLabel {
    pub fn band(&self) -> &str {
        &self.band
    }

    pub fn resolution_m(&self) -> u32 {
        self.resolution_m
    }

    pub fn resolution_folder(&self) -> String {
        format!("R{}m", self.resolution_m)
    }
}

impl fmt::Display for BandLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}m", self.band, self.resolution_m)
    }
}

impl FromStr for BandLabel {
    type Err = MosaicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let caps = band_label_regex()
            .captures(value.trim())
            .ok_or_else(|| MosaicError::Data(format!("invalid band label: {value}")))?;
        let resolution_m = caps[2]
            .parse::<u32>()
            .map_err(|_| MosaicError::Data(format!("invalid band label: {value}")))?;
        Ok(Self {
            band: caps[1].to_uppercase(),
            resolution_m,
        })
    }
}

impl TryFrom<String> for BandLabel {
    type Error = MosaicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BandLabel> for String {
    fn from(value: BandLabel) -> Self {
        value.to_string()
    }
}

fn band_label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(B\d{2}|B8A|TCI|AOT|WVP|SCL)_(\d{2})m$").expect("static band regex")
    })
}

fn title_tile_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_T(\d{2}[A-Z]{3})_").expect("static tile regex"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbBands {
    pub red: BandLabel,
    pub green: BandLabel,
    pub blue: BandLabel,
}

impl Default for RgbBands {
    fn default() -> Self {
        Self {
            red: BandLabel {
                band: "B04".to_string(),
                resolution_m: 10,
            },
            green: BandLabel {
                band: "B03".to_string(),
                resolution_m: 10,
            },
            blue: BandLabel {
                band: "B02".to_string(),
                resolution_m: 10,
            },
        }
    }
}

impl RgbBands {
    pub fn labels(&self) -> [&BandLabel; 3] {
        [&self.red, &self.green, &self.blue]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductEntry {
    pub id: String,
    pub title: String,
    pub download_uri: String,
    pub size_bytes: u64,
    pub acquired_at: Option<DateTime<Utc>>,
    pub cloud_cover: f64,
    pub relative_orbit: Option<u32>,
    pub platform_id: Option<String>,
    pub orbit_direction: Option<String>,
    pub footprint: Option<Geometry>,
}

impl ProductEntry {
    pub fn safe_name(&self) -> String {
        format!("{}.SAFE", self.title)
    }

    pub fn tile_code(&self) -> Option<TileCode> {
        title_tile_regex()
            .captures(&self.title)
            .and_then(|caps| caps[1].parse().ok())
    }

    pub fn matches_tile(&self, tile: &TileCode) -> bool {
        self.tile_code().as_ref() == Some(tile)
    }
}

// Stable sort by cloud cover ascending; equal values keep arrival order.
pub fn sort_by_cloud_cover(entries: &mut [ProductEntry]) {
    entries.sort_by(|a, b| a.cloud_cover.total_cmp(&b.cloud_cover));
}

pub fn select_for_tile<'a>(entries: &'a [ProductEntry], tile: &TileCode) -> Option<&'a ProductEntry> {
    entries.iter().find(|entry| entry.matches_tile(tile))
}

pub fn parse_size(value: &str) -> Result<u64, MosaicError> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|ch: char| ch.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number = number
        .trim()
        .parse::<f64>()
        .map_err(|_| MosaicError::Data(format!("invalid size: {value}")))?;
    let multiplier: f64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(MosaicError::Data(format!("invalid size unit: {value}"))),
    };
    if number < 0.0 {
        return Err(MosaicError::Data(format!("negative size: {value}")));
    }
    Ok((number * multiplier).round() as u64)
}

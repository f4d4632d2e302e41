use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{BandLabel, RgbBands};
use crate::error::MosaicError;
use crate::query::{CloudCoverRange, MAX_PAGE_SIZE};
use crate::retrieval::RetrievalPolicy;
use crate::tiles::CentroidFilter;

pub const DEFAULT_CONFIG_FILE: &str = "s2-mosaic.json";
pub const DEFAULT_SEARCH_URL: &str = "https://scihub.copernicus.eu/dhus/search";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub region: String,
    pub catalog: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    pub time_window: String,
    #[serde(default)]
    pub cloud_cover: Option<CloudCoverRange>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub mode: Option<RetrievalMode>,
    #[serde(default)]
    pub rgb: Option<RgbBands>,
    #[serde(default)]
    pub bands: Vec<String>,
    #[serde(default)]
    pub centroid_filter: Option<CentroidFilter>,
    #[serde(default)]
    pub retrieval: Option<RetrievalEntry>,
    #[serde(default)]
    pub http: Option<HttpEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetrievalEntry {
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub ticks_per_envelope: Option<u32>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HttpEntry {
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Bands,
    Product,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub region: PathBuf,
    pub catalog: PathBuf,
    pub output: Utf8PathBuf,
    pub search_url: String,
    pub product_type: String,
    pub time_window: String,
    pub cloud_cover: CloudCoverRange,
    pub page_size: u32,
    pub mode: RetrievalMode,
    pub rgb: RgbBands,
    pub bands: Vec<BandLabel>,
    pub centroid_filter: CentroidFilter,
    pub retrieval: RetrievalPolicy,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
}

impl ResolvedConfig {
    pub fn requested_bands(&self) -> Vec<BandLabel> {
        let mut labels: Vec<BandLabel> = self.rgb.labels().into_iter().cloned().collect();
        for label in &self.bands {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }
        labels
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, MosaicError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(MosaicError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| MosaicError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| MosaicError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, MosaicError> {
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(MosaicError::ConfigParse(format!(
                "unsupported schema_version {schema_version}, expected {SCHEMA_VERSION}"
            )));
        }

        let page_size = config.page_size.unwrap_or(MAX_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(MosaicError::ConfigParse(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }

        let cloud_cover = config.cloud_cover.unwrap_or_default();
        if !(0.0..=100.0).contains(&cloud_cover.min)
            || !(0.0..=100.0).contains(&cloud_cover.max)
            || cloud_cover.min > cloud_cover.max
        {
            return Err(MosaicError::ConfigParse(format!(
                "cloud_cover must satisfy 0 <= min <= max <= 100, got [{}, {}]",
                cloud_cover.min, cloud_cover.max
            )));
        }

        let bands = config
            .bands
            .iter()
            .map(|value| value.parse::<BandLabel>())
            .collect::<Result<Vec<_>, MosaicError>>()?;

        let entry = config.retrieval.unwrap_or_default();
        let defaults = RetrievalPolicy::default();
        let retrieval = RetrievalPolicy {
            poll_tick: entry
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_tick),
            ticks_per_envelope: entry.ticks_per_envelope.unwrap_or(defaults.ticks_per_envelope),
            max_attempts: entry.max_attempts.unwrap_or(defaults.max_attempts),
            chunk_size: entry.chunk_size.unwrap_or(defaults.chunk_size),
        };
        if retrieval.max_attempts == 0 || retrieval.ticks_per_envelope == 0 || retrieval.chunk_size == 0 {
            return Err(MosaicError::ConfigParse(
                "retrieval max_attempts, ticks_per_envelope and chunk_size must be positive"
                    .to_string(),
            ));
        }

        let http = config.http.unwrap_or_default();

        Ok(ResolvedConfig {
            region: PathBuf::from(config.region),
            catalog: PathBuf::from(config.catalog),
            output: Utf8PathBuf::from(config.output.unwrap_or_else(|| "output".to_string())),
            search_url: config
                .search_url
                .unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
            product_type: config.product_type.unwrap_or_else(|| "S2MSI2A".to_string()),
            time_window: config.time_window,
            cloud_cover,
            page_size,
            mode: config.mode.unwrap_or_default(),
            rgb: config.rgb.unwrap_or_default(),
            bands,
            centroid_filter: config.centroid_filter.unwrap_or_default(),
            retrieval,
            connect_timeout: http.connect_timeout_ms.map(Duration::from_millis),
            read_timeout: http.read_timeout_ms.map(Duration::from_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        serde_json::from_str(
            r#"{
                "region": "region.geojson",
                "catalog": "tiles.geojson",
                "time_window": "[NOW-30DAYS TO NOW]"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let resolved = ConfigLoader::resolve_config(minimal()).unwrap();
        assert_eq!(resolved.page_size, MAX_PAGE_SIZE);
        assert_eq!(resolved.mode, RetrievalMode::Bands);
        assert_eq!(resolved.retrieval, RetrievalPolicy::default());
        assert_eq!(resolved.product_type, "S2MSI2A");
        assert_eq!(resolved.requested_bands().len(), 3);
    }

    #[test]
    fn page_size_out_of_range_is_rejected() {
        let mut config = minimal();
        config.page_size = Some(101);
        assert!(ConfigLoader::resolve_config(config).is_err());
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let mut config = minimal();
        config.schema_version = Some(2);
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert!(err.to_string().contains("schema_version 2"));

        let mut config = minimal();
        config.schema_version = Some(SCHEMA_VERSION);
        assert!(ConfigLoader::resolve_config(config).is_ok());
    }
}

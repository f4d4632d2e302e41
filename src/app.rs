use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::archive::{ArchiveClient, ProductNodes};
use crate::checksum::{Checksum, ChecksumAlgorithm, verify_file};
use crate::composite::{assemble_composite, assemble_mosaic, composite_file_name};
use crate::config::{ResolvedConfig, RetrievalMode};
use crate::domain::{BandLabel, ProductEntry, TileCode, select_for_tile};
use crate::error::MosaicError;
use crate::fs_util::{ZipSelection, extract_selected, read_entry_text, validate_zip};
use crate::manifest::{
    BandDescriptor, ManifestEntry, band_descriptors, granule_folder, parse_manifest,
    parse_tile_geocoding,
};
use crate::query::{SearchQuery, SpatialFilter};
use crate::raster::{Raster, RasterIo, StorageLayout};
use crate::retrieval::{
    Cancellation, DownloadTask, Pause, RetrievalController, RetrievalReport, ThreadPause,
};
use crate::search::{SearchOutcome, search_all};
use crate::store::{BandRecord, Store};
use crate::tiles::{SelectedTile, load_catalog, load_region, select};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub percent: Option<u8>,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            percent: None,
            elapsed: None,
        }
    }

    pub fn percent(message: impl Into<String>, percent: u8) -> Self {
        Self {
            message: message.into(),
            percent: Some(percent),
            elapsed: None,
        }
    }

    pub fn done(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            message: message.into(),
            percent: None,
            elapsed: Some(elapsed),
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    Composite,
    NoResults,
    NoMatchingProduct,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandOutcome {
    pub band: String,
    pub path: String,
    pub transferred: bool,
    pub attempts: u32,
    pub bytes: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TileReport {
    pub tile: String,
    pub status: TileStatus,
    pub product: Option<String>,
    pub cloud_cover: Option<f64>,
    pub candidates: usize,
    pub bands: Vec<BandOutcome>,
    pub composite: Option<String>,
    pub error: Option<String>,
}

impl TileReport {
    fn empty(tile: &TileCode, status: TileStatus, candidates: usize) -> Self {
        Self {
            tile: tile.to_string(),
            status,
            product: None,
            cloud_cover: None,
            candidates,
            bands: Vec::new(),
            composite: None,
            error: None,
        }
    }

    fn failed(tile: &TileCode, err: &MosaicError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::empty(tile, TileStatus::Failed, 0)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub tiles: Vec<TileReport>,
    pub mosaic: Option<MosaicResult>,
    pub mosaic_error: Option<String>,
}

impl RunReport {
    pub fn any_failed(&self) -> bool {
        self.mosaic_error.is_some()
            || self.tiles.iter().any(|tile| {
                tile.status == TileStatus::Failed
                    || tile.bands.iter().any(|band| band.error.is_some())
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TileSummary {
    pub tile: String,
    pub epsg: u32,
    pub centroid_lon: f64,
    pub centroid_lat: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TilesResult {
    pub tiles: Vec<TileSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub id: String,
    pub title: String,
    pub cloud_cover: f64,
    pub size_bytes: u64,
    pub acquired_at: Option<String>,
    pub matches_tile: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub tile: String,
    pub candidates: Vec<Candidate>,
    pub selected: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MosaicResult {
    pub output: String,
    pub inputs: usize,
    pub width: u32,
    pub height: u32,
    pub epsg: u32,
}

pub struct App<A: ArchiveClient, R: RasterIo> {
    store: Store,
    archive: A,
    raster: R,
    pause: Box<dyn Pause>,
    cancellation: Cancellation,
}

impl<A: ArchiveClient, R: RasterIo> App<A, R> {
    pub fn new(store: Store, archive: A, raster: R) -> Self {
        Self {
            store,
            archive,
            raster,
            pause: Box::new(ThreadPause),
            cancellation: Cancellation::new(),
        }
    }

    pub fn with_pause(mut self, pause: Box<dyn Pause>) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn select_tiles(
        &self,
        config: &ResolvedConfig,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<SelectedTile>, MosaicError> {
        sink.event(ProgressEvent::message("phase=Resolve; selecting tiles"));
        let region = load_region(&config.region)?;
        let catalog = load_catalog(&config.catalog)?;
        Ok(select(&region, &catalog, &config.centroid_filter))
    }

    pub fn list_tiles(
        &self,
        config: &ResolvedConfig,
        sink: &dyn ProgressSink,
    ) -> Result<TilesResult, MosaicError> {
        let tiles = self
            .select_tiles(config, sink)?
            .into_iter()
            .map(|selected| TileSummary {
                tile: selected.code().to_string(),
                epsg: selected.tile.epsg,
                centroid_lon: selected.query_centroid.x,
                centroid_lat: selected.query_centroid.y,
            })
            .collect();
        Ok(TilesResult { tiles })
    }

    pub fn search_tile(
        &self,
        config: &ResolvedConfig,
        tile: &SelectedTile,
        sink: &dyn ProgressSink,
    ) -> Result<SearchOutcome, MosaicError> {
        sink.event(ProgressEvent::message(format!("phase=Search; tile {}", tile.code())));
        let query = SearchQuery {
            product_type: config.product_type.clone(),
            time_window: config.time_window.clone(),
            spatial_filter: SpatialFilter::Point(tile.query_centroid),
            cloud_cover: config.cloud_cover,
            offset: 0,
            page_size: config.page_size,
        };
        let start = Instant::now();
        let outcome = search_all(&self.archive, &query, config.page_size)?;
        sink.event(ProgressEvent::done(
            format!("{} candidates for {}", outcome.entries().len(), tile.code()),
            start.elapsed(),
        ));
        Ok(outcome)
    }

    pub fn search(
        &self,
        config: &ResolvedConfig,
        code: &TileCode,
        sink: &dyn ProgressSink,
    ) -> Result<SearchResult, MosaicError> {
        let tiles = self.select_tiles(config, sink)?;
        let tile = tiles
            .iter()
            .find(|tile| tile.code() == code)
            .ok_or_else(|| MosaicError::Data(format!("tile {code} does not intersect the region")))?;
        let outcome = self.search_tile(config, tile, sink)?;
        let entries = outcome.entries();
        Ok(SearchResult {
            tile: code.to_string(),
            candidates: entries
                .iter()
                .map(|entry| Candidate {
                    id: entry.id.clone(),
                    title: entry.title.clone(),
                    cloud_cover: entry.cloud_cover,
                    size_bytes: entry.size_bytes,
                    acquired_at: entry.acquired_at.map(|at| at.to_rfc3339()),
                    matches_tile: entry.matches_tile(code),
                })
                .collect(),
            selected: select_for_tile(entries, code).map(|entry| entry.title.clone()),
        })
    }

    pub fn run(&self, config: &ResolvedConfig, sink: &dyn ProgressSink) -> Result<RunReport, MosaicError> {
        self.store.ensure_root()?;
        let tiles = self.select_tiles(config, sink)?;
        let mut reports = Vec::with_capacity(tiles.len());
        for tile in &tiles {
            self.cancellation.check()?;
            match self.process_tile(config, tile, sink) {
                Ok(report) => reports.push(report),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(tile = %tile.code(), error = %err, "tile failed");
                    sink.event(ProgressEvent::message(format!("{}: failed: {err}", tile.code())));
                    reports.push(TileReport::failed(tile.code(), &err));
                }
            }
        }

        let composites: Vec<Utf8PathBuf> = reports
            .iter()
            .filter_map(|report| report.composite.as_deref().map(Utf8PathBuf::from))
            .collect();
        let (mosaic, mosaic_error) = if composites.is_empty() {
            (None, None)
        } else {
            match self.mosaic_files(&composites, &self.store.mosaic_path(), sink) {
                Ok(result) => (Some(result), None),
                Err(err) => {
                    warn!(error = %err, "mosaic failed");
                    (None, Some(err.to_string()))
                }
            }
        };

        Ok(RunReport {
            tiles: reports,
            mosaic,
            mosaic_error,
        })
    }

    pub fn mosaic_files(
        &self,
        inputs: &[Utf8PathBuf],
        output: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<MosaicResult, MosaicError> {
        mosaic_files(&self.raster, inputs, output, sink)
    }

    fn process_tile(
        &self,
        config: &ResolvedConfig,
        tile: &SelectedTile,
        sink: &dyn ProgressSink,
    ) -> Result<TileReport, MosaicError> {
        let code = tile.code();
        let outcome = self.search_tile(config, tile, sink)?;
        let entries = match &outcome {
            SearchOutcome::NoResults => {
                info!(tile = %code, "no results");
                return Ok(TileReport::empty(code, TileStatus::NoResults, 0));
            }
            SearchOutcome::Found(entries) => entries,
        };
        let Some(product) = select_for_tile(entries, code) else {
            info!(tile = %code, candidates = entries.len(), "no suitable product for this tile");
            return Ok(TileReport::empty(code, TileStatus::NoMatchingProduct, entries.len()));
        };
        info!(tile = %code, title = %product.title, cloud_cover = product.cloud_cover, "product selected");

        let mut report = TileReport {
            product: Some(product.title.clone()),
            cloud_cover: Some(product.cloud_cover),
            ..TileReport::empty(code, TileStatus::Composite, entries.len())
        };

        let retrieved = match config.mode {
            RetrievalMode::Bands => self.retrieve_bands(config, code, product, sink)?,
            RetrievalMode::Product => self.retrieve_product(config, code, product, sink)?,
        };

        for (descriptor, result) in &retrieved {
            let outcome = match result {
                Ok(done) => {
                    if done.transferred {
                        self.store.append_record(&band_record(code, product, descriptor, done))?;
                    }
                    BandOutcome {
                        band: descriptor.label.to_string(),
                        path: done.path.to_string(),
                        transferred: done.transferred,
                        attempts: done.attempts,
                        bytes: done.bytes,
                        error: None,
                    }
                }
                Err(err) => BandOutcome {
                    band: descriptor.label.to_string(),
                    path: self.store.band_path(code, &descriptor.file_name).to_string(),
                    transferred: false,
                    attempts: 0,
                    bytes: 0,
                    error: Some(err.to_string()),
                },
            };
            report.bands.push(outcome);
        }

        let missing: Vec<String> = config
            .rgb
            .labels()
            .into_iter()
            .filter(|label| {
                !retrieved
                    .iter()
                    .any(|(descriptor, result)| &descriptor.label == *label && result.is_ok())
            })
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            report.status = TileStatus::Failed;
            report.error = Some(format!("composite bands unavailable: {}", missing.join(", ")));
            return Ok(report);
        }

        sink.event(ProgressEvent::message(format!("phase=Composite; tile {code}")));
        let path = self.build_composite(config, code, &retrieved)?;
        report.composite = Some(path.to_string());
        Ok(report)
    }

    fn retrieve_bands(
        &self,
        config: &ResolvedConfig,
        tile: &TileCode,
        product: &ProductEntry,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<(BandDescriptor, Result<RetrievalReport, MosaicError>)>, MosaicError> {
        let nodes = ProductNodes::new(&product.download_uri, &product.safe_name())?;
        sink.event(ProgressEvent::message(format!(
            "phase=Prepare; reading manifest of {}",
            product.title
        )));
        let manifest = parse_manifest(&self.archive.fetch_text(&nodes.manifest_uri())?)?;
        let granule = granule_folder(&manifest)?;
        let geocoding =
            parse_tile_geocoding(&self.archive.fetch_text(&nodes.tile_metadata_uri(&granule))?)?;
        let descriptors = band_descriptors(&manifest, &geocoding, &config.requested_bands())?;

        let controller = RetrievalController::new(
            &self.archive,
            config.retrieval,
            self.pause.as_ref(),
            self.cancellation.clone(),
        );
        let mut results = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            sink.event(ProgressEvent::message(format!(
                "phase=Fetch; {} {}",
                tile, descriptor.label
            )));
            let task = DownloadTask {
                uri: nodes.band_uri(&descriptor.granule, &descriptor.label, &descriptor.file_name),
                destination: self.store.band_path(tile, &descriptor.file_name),
                expected_size: Some(descriptor.size),
                checksum: descriptor.checksum.clone(),
            };
            let result = match controller.retrieve(&task, sink) {
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(tile = %tile, band = %descriptor.label, error = %err, "band failed");
                    Err(err)
                }
                done => done,
            };
            results.push((descriptor, result));
        }
        Ok(results)
    }

    fn retrieve_product(
        &self,
        config: &ResolvedConfig,
        tile: &TileCode,
        product: &ProductEntry,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<(BandDescriptor, Result<RetrievalReport, MosaicError>)>, MosaicError> {
        let nodes = ProductNodes::new(&product.download_uri, &product.safe_name())?;
        let md5 = self.archive.fetch_text(&nodes.checksum_uri())?;
        let task = DownloadTask {
            uri: nodes.product_uri(),
            destination: self.store.product_path(&product.title),
            expected_size: (product.size_bytes > 0).then_some(product.size_bytes),
            checksum: Checksum::new(ChecksumAlgorithm::Md5, md5),
        };
        sink.event(ProgressEvent::message(format!(
            "phase=Fetch; product {}",
            product.title
        )));
        let controller = RetrievalController::new(
            &self.archive,
            config.retrieval,
            self.pause.as_ref(),
            self.cancellation.clone(),
        );
        let download = controller.retrieve(&task, sink)?;
        let zip_path = download.path.as_std_path();

        sink.event(ProgressEvent::message("phase=Verify; validating product archive"));
        validate_zip(zip_path)?;
        let manifest: Vec<ManifestEntry> = parse_manifest(&read_entry_text(zip_path, "manifest.safe")?)?;
        let granule = granule_folder(&manifest)?;
        let geocoding = parse_tile_geocoding(&read_entry_text(
            zip_path,
            &format!("GRANULE/{granule}/MTD_TL.xml"),
        )?)?;
        let descriptors = band_descriptors(&manifest, &geocoding, &config.requested_bands())?;

        let selections: Vec<ZipSelection> = descriptors
            .iter()
            .map(|descriptor| ZipSelection {
                relative_path: descriptor.relative_path.clone(),
                destination: self
                    .store
                    .band_path(tile, &descriptor.file_name)
                    .into_std_path_buf(),
            })
            .collect();
        extract_selected(zip_path, &selections)?;

        let mut results = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let path = self.store.band_path(tile, &descriptor.file_name);
            let result = if verify_file(path.as_std_path(), &descriptor.checksum)? {
                Ok(RetrievalReport {
                    bytes: descriptor.size,
                    path,
                    attempts: download.attempts,
                    transferred: download.transferred,
                })
            } else {
                Err(MosaicError::Integrity {
                    path: path.to_string(),
                    expected: descriptor.checksum.value.clone(),
                    actual: "extracted file differs".to_string(),
                    attempts: 1,
                })
            };
            results.push((descriptor, result));
        }
        Ok(results)
    }

    fn build_composite(
        &self,
        config: &ResolvedConfig,
        tile: &TileCode,
        retrieved: &[(BandDescriptor, Result<RetrievalReport, MosaicError>)],
    ) -> Result<Utf8PathBuf, MosaicError> {
        let load = |label: &BandLabel| -> Result<Option<(Raster, String)>, MosaicError> {
            let Some((descriptor, Ok(done))) = retrieved
                .iter()
                .find(|(descriptor, result)| &descriptor.label == label && result.is_ok())
            else {
                return Ok(None);
            };
            let band = self.raster.read_band(done.path.as_std_path())?;
            let raster = band.georeferenced(&descriptor.georeference())?;
            Ok(Some((raster, descriptor.file_name.clone())))
        };
        let red = load(&config.rgb.red)?;
        let green = load(&config.rgb.green)?;
        let blue = load(&config.rgb.blue)?;

        let composite = assemble_composite(
            tile,
            red.as_ref().map(|(raster, _)| raster),
            green.as_ref().map(|(raster, _)| raster),
            blue.as_ref().map(|(raster, _)| raster),
        )?;
        let red_file = red
            .as_ref()
            .map(|(_, file)| file.as_str())
            .unwrap_or(tile.as_str());
        let path = self
            .store
            .composite_path(&composite_file_name(red_file, &config.rgb.red));
        self.write_raster(&path, &composite)?;
        info!(tile = %tile, path = %path, "composite written");
        Ok(path)
    }

    fn write_raster(&self, path: &Utf8Path, raster: &Raster) -> Result<(), MosaicError> {
        write_raster(&self.raster, path, raster)
    }
}

pub fn mosaic_files<R: RasterIo + ?Sized>(
    raster_io: &R,
    inputs: &[Utf8PathBuf],
    output: &Utf8Path,
    sink: &dyn ProgressSink,
) -> Result<MosaicResult, MosaicError> {
    sink.event(ProgressEvent::message(format!(
        "phase=Mosaic; {} composite(s)",
        inputs.len()
    )));
    let start = Instant::now();
    let rasters = inputs
        .iter()
        .map(|path| raster_io.read_raster(path.as_std_path()))
        .collect::<Result<Vec<_>, _>>()?;
    let mosaic = assemble_mosaic(&rasters)?;
    write_raster(raster_io, output, &mosaic)?;
    sink.event(ProgressEvent::done(format!("mosaic written to {output}"), start.elapsed()));
    Ok(MosaicResult {
        output: output.to_string(),
        inputs: inputs.len(),
        width: mosaic.width,
        height: mosaic.height,
        epsg: mosaic.georef.epsg,
    })
}

fn write_raster<R: RasterIo + ?Sized>(
    raster_io: &R,
    path: &Utf8Path,
    raster: &Raster,
) -> Result<(), MosaicError> {
    Store::write_atomic_with(path, |temp| {
        raster_io.write(temp, raster, &StorageLayout::composite())
    })
}

fn band_record(
    tile: &TileCode,
    product: &ProductEntry,
    descriptor: &BandDescriptor,
    done: &RetrievalReport,
) -> BandRecord {
    BandRecord {
        tile: tile.to_string(),
        product_id: product.id.clone(),
        title: product.title.clone(),
        band: descriptor.label.to_string(),
        path: done.path.to_string(),
        size: done.bytes,
        checksum: descriptor.checksum.to_string(),
        cloud_cover: product.cloud_cover,
        acquired_at: product.acquired_at,
        transferred: done.transferred,
        recorded_at: Utc::now(),
        tool: format!("s2-mosaic/{}", env!("CARGO_PKG_VERSION")),
    }
}

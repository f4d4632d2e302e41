use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use serde::Serialize;
use tiff::ColorType;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{Gray16, RGB16};
use tiff::encoder::{Compression, DeflateLevel, DirectoryEncoder, Predictor, TiffEncoder, TiffKind};
use tiff::tags::Tag;
use tracing::{debug, warn};

use crate::error::MosaicError;
use crate::geometry::BoundingBox;

const GEOTIFF_MODELPIXELSCALE: u16 = 33550;
const GEOTIFF_MODELTIEPOINT: u16 = 33922;
const GEOTIFF_GEOKEYDIRECTORY: u16 = 34735;

const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

// North-up affine transform. `pixel_height` is negative for the usual
// top-down row order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            // Metadata sometimes gives a positive y size; rows always run south.
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            0.0,
            self.origin_y,
            0.0,
            self.pixel_height,
        ]
    }

    pub fn bounds(&self, width: u32, height: u32) -> BoundingBox {
        let max_x = self.origin_x + f64::from(width) * self.pixel_width;
        let min_y = self.origin_y + f64::from(height) * self.pixel_height;
        BoundingBox::new(self.origin_x, min_y, max_x, self.origin_y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoReference {
    pub epsg: u32,
    pub transform: GeoTransform,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub georef: GeoReference,
    pub width: u32,
    pub height: u32,
    pub bands: Vec<Vec<u16>>,
}

impl Raster {
    pub fn new(
        georef: GeoReference,
        width: u32,
        height: u32,
        bands: Vec<Vec<u16>>,
    ) -> Result<Self, MosaicError> {
        let expected = width as usize * height as usize;
        if bands.is_empty() {
            return Err(MosaicError::Raster("raster needs at least one band".to_string()));
        }
        if let Some((index, band)) = bands.iter().enumerate().find(|(_, b)| b.len() != expected) {
            return Err(MosaicError::Raster(format!(
                "band {} has {} samples, expected {width}x{height}",
                index + 1,
                band.len()
            )));
        }
        Ok(Self {
            georef,
            width,
            height,
            bands,
        })
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn bounds(&self) -> BoundingBox {
        self.georef.transform.bounds(self.width, self.height)
    }

    pub fn sample(&self, band: usize, row: u32, col: u32) -> u16 {
        self.bands[band][row as usize * self.width as usize + col as usize]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BandRaster {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
    pub georef: Option<GeoReference>,
}

impl BandRaster {
    pub fn georeferenced(self, fallback: &GeoReference) -> Result<Raster, MosaicError> {
        let georef = match self.georef {
            Some(own) => {
                if own.epsg != fallback.epsg {
                    warn!(
                        file_epsg = own.epsg,
                        metadata_epsg = fallback.epsg,
                        "band CRS differs from tile metadata, keeping the file's"
                    );
                }
                own
            }
            None => *fallback,
        };
        Raster::new(georef, self.width, self.height, vec![self.pixels])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageLayout {
    pub block_size: u32,
    pub horizontal_predictor: bool,
    pub deflate: bool,
}

impl StorageLayout {
    pub fn composite() -> Self {
        Self {
            block_size: 256,
            horizontal_predictor: true,
            deflate: true,
        }
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::composite()
    }
}

pub trait RasterIo: Send + Sync {
    fn read_band(&self, path: &Path) -> Result<BandRaster, MosaicError>;
    fn read_raster(&self, path: &Path) -> Result<Raster, MosaicError>;
    fn write(&self, path: &Path, raster: &Raster, layout: &StorageLayout) -> Result<(), MosaicError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GeoTiffIo;

impl GeoTiffIo {
    fn decode(path: &Path) -> Result<(u32, u32, Vec<Vec<u16>>, Option<GeoReference>), MosaicError> {
        let file = File::open(path)
            .map_err(|err| MosaicError::Filesystem(format!("open {}: {err}", path.display())))?;
        let mut decoder = Decoder::new(file)?.with_limits(Limits::unlimited());
        let (width, height) = decoder.dimensions()?;
        let samples = match decoder.colortype()? {
            ColorType::Gray(_) => 1,
            ColorType::RGB(_) => 3,
            other => {
                return Err(MosaicError::Raster(format!(
                    "{}: unsupported color type {other:?}",
                    path.display()
                )));
            }
        };
        let georef = read_georeference(&mut decoder, path);
        let interleaved: Vec<u16> = match decoder.read_image()? {
            DecodingResult::U16(data) => data,
            DecodingResult::U8(data) => data.into_iter().map(u16::from).collect(),
            _ => {
                return Err(MosaicError::Raster(format!(
                    "{}: only 8/16-bit unsigned samples are supported",
                    path.display()
                )));
            }
        };
        let mut bands = vec![Vec::with_capacity(width as usize * height as usize); samples];
        for pixel in interleaved.chunks_exact(samples) {
            for (band, value) in bands.iter_mut().zip(pixel) {
                band.push(*value);
            }
        }
        Ok((width, height, bands, georef))
    }
}

impl RasterIo for GeoTiffIo {
    fn read_band(&self, path: &Path) -> Result<BandRaster, MosaicError> {
        let (width, height, mut bands, georef) = Self::decode(path)?;
        if bands.len() != 1 {
            return Err(MosaicError::Raster(format!(
                "{}: expected a single-band raster, found {} bands",
                path.display(),
                bands.len()
            )));
        }
        Ok(BandRaster {
            width,
            height,
            pixels: bands.remove(0),
            georef,
        })
    }

    fn read_raster(&self, path: &Path) -> Result<Raster, MosaicError> {
        let (width, height, bands, georef) = Self::decode(path)?;
        let georef = georef.ok_or_else(|| {
            MosaicError::Raster(format!("{}: no GeoTIFF georeferencing", path.display()))
        })?;
        Raster::new(georef, width, height, bands)
    }

    fn write(&self, path: &Path, raster: &Raster, layout: &StorageLayout) -> Result<(), MosaicError> {
        let file = File::create(path)
            .map_err(|err| MosaicError::Filesystem(format!("create {}: {err}", path.display())))?;
        let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
        if layout.deflate {
            encoder = encoder.with_compression(Compression::Deflate(DeflateLevel::Balanced));
        }
        if layout.horizontal_predictor {
            encoder = encoder.with_predictor(Predictor::Horizontal);
        }
        match raster.band_count() {
            1 => {
                let mut image = encoder.new_image::<Gray16>(raster.width, raster.height)?;
                image.rows_per_strip(layout.block_size.min(raster.height).max(1))?;
                write_geotiff_tags(image.encoder(), &raster.georef)?;
                image.write_data(&raster.bands[0])?;
            }
            3 => {
                let mut image = encoder.new_image::<RGB16>(raster.width, raster.height)?;
                image.rows_per_strip(layout.block_size.min(raster.height).max(1))?;
                write_geotiff_tags(image.encoder(), &raster.georef)?;
                image.write_data(&interleave(raster))?;
            }
            other => {
                return Err(MosaicError::Raster(format!(
                    "GeoTIFF backend writes 1 or 3 bands, got {other}"
                )));
            }
        }
        debug!(path = %path.display(), width = raster.width, height = raster.height, "raster written");
        Ok(())
    }
}

fn interleave(raster: &Raster) -> Vec<u16> {
    let pixels = raster.width as usize * raster.height as usize;
    let mut out = Vec::with_capacity(pixels * raster.band_count());
    for index in 0..pixels {
        for band in &raster.bands {
            out.push(band[index]);
        }
    }
    out
}

fn is_geographic(epsg: u32) -> bool {
    (4000..5000).contains(&epsg)
}

fn write_geotiff_tags<W: Write + Seek, K: TiffKind>(
    dir: &mut DirectoryEncoder<W, K>,
    georef: &GeoReference,
) -> Result<(), MosaicError> {
    let transform = georef.transform;
    let pixel_scale = [transform.pixel_width, transform.pixel_height.abs(), 0.0];
    dir.write_tag(Tag::Unknown(GEOTIFF_MODELPIXELSCALE), pixel_scale.as_slice())?;

    let tiepoint = [0.0, 0.0, 0.0, transform.origin_x, transform.origin_y, 0.0];
    dir.write_tag(Tag::Unknown(GEOTIFF_MODELTIEPOINT), tiepoint.as_slice())?;

    let geographic = is_geographic(georef.epsg);
    let crs_key = if geographic {
        GEOGRAPHIC_TYPE_GEO_KEY
    } else {
        PROJECTED_CS_TYPE_GEO_KEY
    };
    let model_type = if geographic {
        MODEL_TYPE_GEOGRAPHIC
    } else {
        MODEL_TYPE_PROJECTED
    };
    let epsg = u16::try_from(georef.epsg)
        .map_err(|_| MosaicError::Raster(format!("EPSG code {} out of range", georef.epsg)))?;
    let geokeys: [u16; 16] = [
        1, 1, 0, 3,
        GT_MODEL_TYPE_GEO_KEY, 0, 1, model_type,
        GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA,
        crs_key, 0, 1, epsg,
    ];
    dir.write_tag(Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY), geokeys.as_slice())?;
    Ok(())
}

fn read_georeference<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    path: &Path,
) -> Option<GeoReference> {
    let tiepoint = decoder.get_tag_f64_vec(Tag::Unknown(GEOTIFF_MODELTIEPOINT)).ok()?;
    let scale = decoder.get_tag_f64_vec(Tag::Unknown(GEOTIFF_MODELPIXELSCALE)).ok()?;
    if tiepoint.len() < 6 || scale.len() < 2 {
        debug!(path = %path.display(), "incomplete GeoTIFF tiepoint/scale");
        return None;
    }
    let keys = decoder
        .get_tag_u16_vec(Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY))
        .ok()?;
    let epsg = keys
        .get(4..)?
        .chunks_exact(4)
        .find(|key| {
            (key[0] == PROJECTED_CS_TYPE_GEO_KEY || key[0] == GEOGRAPHIC_TYPE_GEO_KEY) && key[1] == 0
        })
        .map(|key| u32::from(key[3]))?;

    // Tiepoint may reference a pixel other than (0, 0).
    let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
    let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
    Some(GeoReference {
        epsg,
        transform: GeoTransform::north_up(origin_x, origin_y, scale[0], scale[1]),
    })
}

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Serialize;
use tracing::debug;

use crate::checksum::{Checksum, ChecksumAlgorithm};
use crate::domain::BandLabel;
use crate::error::MosaicError;
use crate::raster::{GeoReference, GeoTransform};

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub id: String,
    pub size: u64,
    pub href: String,
    pub checksum: Option<Checksum>,
}

impl ManifestEntry {
    pub fn file_name(&self) -> &str {
        self.href.rsplit('/').next().unwrap_or(&self.href)
    }

    pub fn granule(&self) -> Option<&str> {
        let mut segments = self.href.split('/');
        segments.find(|segment| *segment == "GRANULE")?;
        segments.next().filter(|segment| !segment.is_empty())
    }

    fn is_band(&self, label: &BandLabel) -> bool {
        if self.id.contains(&format!("Band_{label}")) {
            return true;
        }
        let stem = self
            .file_name()
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(self.file_name());
        stem.ends_with(&format!("_{label}"))
    }
}

pub fn parse_manifest(xml: &str) -> Result<Vec<ManifestEntry>, MosaicError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut id: Option<String> = None;
    let mut size: Option<u64> = None;
    let mut href: Option<String> = None;
    let mut checksum_name: Option<String> = None;
    let mut checksum_value: Option<String> = None;
    let mut in_checksum = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"dataObject" => {
                id = attribute(&e, b"ID")?;
                size = None;
                href = None;
                checksum_name = None;
                checksum_value = None;
            }
            Event::Start(e) => match e.local_name().as_ref() {
                b"byteStream" if id.is_some() => size = parse_size_attr(&e)?,
                b"fileLocation" if id.is_some() => href = attribute(&e, b"href")?,
                b"checksum" if id.is_some() => {
                    checksum_name = attribute(&e, b"checksumName")?;
                    in_checksum = true;
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"byteStream" if id.is_some() => size = parse_size_attr(&e)?,
                b"fileLocation" if id.is_some() => href = attribute(&e, b"href")?,
                _ => {}
            },
            Event::Text(t) if in_checksum => {
                checksum_value = Some(t.unescape()?.trim().to_string());
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"checksum" => in_checksum = false,
                b"dataObject" => {
                    let Some(object_id) = id.take() else {
                        continue;
                    };
                    let location = href.take().ok_or_else(|| {
                        MosaicError::Data(format!("dataObject {object_id} has no fileLocation"))
                    })?;
                    let checksum = match (checksum_name.take(), checksum_value.take()) {
                        (Some(name), Some(value)) => {
                            Some(Checksum::new(name.parse::<ChecksumAlgorithm>()?, value))
                        }
                        _ => None,
                    };
                    entries.push(ManifestEntry {
                        id: object_id,
                        size: size.take().unwrap_or(0),
                        href: location.trim_start_matches("./").to_string(),
                        checksum,
                    });
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if entries.is_empty() {
        return Err(MosaicError::Data("manifest has no dataObject entries".to_string()));
    }
    Ok(entries)
}

fn parse_size_attr(e: &BytesStart<'_>) -> Result<Option<u64>, MosaicError> {
    attribute(e, b"size")?
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| MosaicError::Data(format!("invalid byteStream size: {value}")))
        })
        .transpose()
}

pub(crate) fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, MosaicError> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

pub fn granule_folder(entries: &[ManifestEntry]) -> Result<String, MosaicError> {
    entries
        .iter()
        .filter(|entry| entry.href.contains("IMG_DATA"))
        .find_map(ManifestEntry::granule)
        .map(str::to_string)
        .ok_or_else(|| MosaicError::Data("manifest has no GRANULE image data".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeocodingTier {
    pub resolution_m: u32,
    pub rows: u32,
    pub cols: u32,
    pub ulx: f64,
    pub uly: f64,
    pub xdim: f64,
    pub ydim: f64,
}

impl GeocodingTier {
    pub fn transform(&self) -> GeoTransform {
        GeoTransform::north_up(self.ulx, self.uly, self.xdim, self.ydim)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileGeocoding {
    pub cs_name: String,
    pub epsg: u32,
    pub tiers: BTreeMap<u32, GeocodingTier>,
}

impl TileGeocoding {
    pub fn tier(&self, resolution_m: u32) -> Option<&GeocodingTier> {
        self.tiers.get(&resolution_m)
    }
}

#[derive(Default)]
struct PartialTier {
    rows: Option<u32>,
    cols: Option<u32>,
    ulx: Option<f64>,
    uly: Option<f64>,
    xdim: Option<f64>,
    ydim: Option<f64>,
}

pub fn parse_tile_geocoding(xml: &str) -> Result<TileGeocoding, MosaicError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut cs_name = None;
    let mut cs_code = None;
    let mut partial: BTreeMap<u32, PartialTier> = BTreeMap::new();
    let mut resolution: Option<u32> = None;
    let mut element = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if matches!(name.as_slice(), b"Size" | b"Geoposition") {
                    resolution = attribute(&e, b"resolution")?
                        .map(|value| {
                            value.trim().parse::<u32>().map_err(|_| {
                                MosaicError::Data(format!("invalid resolution: {value}"))
                            })
                        })
                        .transpose()?;
                }
                element = name;
            }
            Event::Text(t) => {
                let value = t.unescape()?.trim().to_string();
                match element.as_slice() {
                    b"HORIZONTAL_CS_NAME" => cs_name = Some(value),
                    b"HORIZONTAL_CS_CODE" => cs_code = Some(value),
                    leaf => {
                        if let Some(res) = resolution {
                            let tier = partial.entry(res).or_default();
                            match leaf {
                                b"NROWS" => tier.rows = Some(parse_num(&value)?),
                                b"NCOLS" => tier.cols = Some(parse_num(&value)?),
                                b"ULX" => tier.ulx = Some(parse_num(&value)?),
                                b"ULY" => tier.uly = Some(parse_num(&value)?),
                                b"XDIM" => tier.xdim = Some(parse_num(&value)?),
                                b"YDIM" => tier.ydim = Some(parse_num(&value)?),
                                _ => {}
                            }
                        }
                    }
                }
            }
            Event::End(e) => {
                if matches!(e.local_name().as_ref(), b"Size" | b"Geoposition") {
                    resolution = None;
                }
                element.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let cs_code =
        cs_code.ok_or_else(|| MosaicError::Data("tile metadata without HORIZONTAL_CS_CODE".to_string()))?;
    let epsg = cs_code
        .rsplit(':')
        .next()
        .and_then(|code| code.trim().parse::<u32>().ok())
        .ok_or_else(|| MosaicError::Data(format!("invalid CRS code: {cs_code}")))?;

    let mut tiers = BTreeMap::new();
    for (resolution_m, tier) in partial {
        match (tier.rows, tier.cols, tier.ulx, tier.uly, tier.xdim, tier.ydim) {
            (Some(rows), Some(cols), Some(ulx), Some(uly), Some(xdim), Some(ydim)) => {
                tiers.insert(
                    resolution_m,
                    GeocodingTier {
                        resolution_m,
                        rows,
                        cols,
                        ulx,
                        uly,
                        xdim,
                        ydim,
                    },
                );
            }
            _ => debug!(resolution_m, "skipping incomplete geocoding tier"),
        }
    }
    if tiers.is_empty() {
        return Err(MosaicError::Data("tile metadata has no geocoding tiers".to_string()));
    }

    Ok(TileGeocoding {
        cs_name: cs_name.unwrap_or_default(),
        epsg,
        tiers,
    })
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T, MosaicError> {
    value
        .parse::<T>()
        .map_err(|_| MosaicError::Data(format!("invalid number in tile metadata: {value}")))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandDescriptor {
    pub label: BandLabel,
    pub size: u64,
    pub relative_path: String,
    pub file_name: String,
    pub granule: String,
    pub checksum: Checksum,
    pub geocoding: GeocodingTier,
    pub epsg: u32,
}

impl BandDescriptor {
    pub fn georeference(&self) -> GeoReference {
        GeoReference {
            epsg: self.epsg,
            transform: self.geocoding.transform(),
        }
    }
}

pub fn band_descriptors(
    entries: &[ManifestEntry],
    geocoding: &TileGeocoding,
    labels: &[BandLabel],
) -> Result<Vec<BandDescriptor>, MosaicError> {
    labels
        .iter()
        .map(|label| {
            let entry = entries
                .iter()
                .find(|entry| entry.is_band(label))
                .ok_or_else(|| MosaicError::Data(format!("band {label} not in manifest")))?;
            let checksum = entry
                .checksum
                .clone()
                .ok_or_else(|| MosaicError::Data(format!("band {label} has no checksum")))?;
            let granule = entry
                .granule()
                .ok_or_else(|| MosaicError::Data(format!("band {label} is not below GRANULE/")))?
                .to_string();
            let tier = geocoding.tier(label.resolution_m()).ok_or_else(|| {
                MosaicError::Data(format!(
                    "tile metadata has no {}m geocoding for {label}",
                    label.resolution_m()
                ))
            })?;
            Ok(BandDescriptor {
                label: label.clone(),
                size: entry.size,
                relative_path: entry.href.clone(),
                file_name: entry.file_name().to_string(),
                granule,
                checksum,
                geocoding: *tier,
                epsg: geocoding.epsg,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xfdu:XFDU xmlns:xfdu="urn:ccsds:schema:xfdu:1">
  <dataObjectSection>
    <dataObject ID="S2_Level-2A_Tile1_Metadata">
      <byteStream mimeType="text/xml" size="612345">
        <fileLocation locatorType="URL" href="./GRANULE/L2A_T33TWJ_A032172_20210812T095220/MTD_TL.xml"/>
        <checksum checksumName="MD5">0123456789abcdef0123456789abcdef</checksum>
      </byteStream>
    </dataObject>
    <dataObject ID="IMG_DATA_Band_B04_10m_Tile1_Data">
      <byteStream mimeType="application/octet-stream" size="135790">
        <fileLocation locatorType="URL" href="./GRANULE/L2A_T33TWJ_A032172_20210812T095220/IMG_DATA/R10m/T33TWJ_20210812T094039_B04_10m.jp2"/>
        <checksum checksumName="SHA3-256">AABBCC</checksum>
      </byteStream>
    </dataObject>
    <dataObject ID="IMG_DATA_Band_B03_10m_Tile1_Data">
      <byteStream mimeType="application/octet-stream" size="24680">
        <fileLocation locatorType="URL" href="./GRANULE/L2A_T33TWJ_A032172_20210812T095220/IMG_DATA/R10m/T33TWJ_20210812T094039_B03_10m.jp2"/>
        <checksum checksumName="MD5">ddeeff</checksum>
      </byteStream>
    </dataObject>
  </dataObjectSection>
</xfdu:XFDU>"#;

    const TILE_METADATA: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<n1:Level-2A_Tile_ID xmlns:n1="https://psd-14.sentinel2.eo.esa.int/PSD/S2_PDI_Level-2A_Tile_Metadata.xsd">
  <n1:Geometric_Info>
    <Tile_Geocoding metadataLevel="Brief">
      <HORIZONTAL_CS_NAME>WGS84 / UTM zone 33N</HORIZONTAL_CS_NAME>
      <HORIZONTAL_CS_CODE>EPSG:32633</HORIZONTAL_CS_CODE>
      <Size resolution="10"><NROWS>10980</NROWS><NCOLS>10980</NCOLS></Size>
      <Size resolution="20"><NROWS>5490</NROWS><NCOLS>5490</NCOLS></Size>
      <Geoposition resolution="10"><ULX>499980</ULX><ULY>5000040</ULY><XDIM>10</XDIM><YDIM>-10</YDIM></Geoposition>
      <Geoposition resolution="20"><ULX>499980</ULX><ULY>5000040</ULY><XDIM>20</XDIM><YDIM>-20</YDIM></Geoposition>
    </Tile_Geocoding>
  </n1:Geometric_Info>
</n1:Level-2A_Tile_ID>"#;

    #[test]
    fn parse_manifest_entries() {
        let entries = parse_manifest(MANIFEST).unwrap();
        assert_eq!(entries.len(), 3);
        let band = &entries[1];
        assert_eq!(band.size, 135790);
        assert_eq!(band.file_name(), "T33TWJ_20210812T094039_B04_10m.jp2");
        assert_eq!(band.granule(), Some("L2A_T33TWJ_A032172_20210812T095220"));
        let checksum = band.checksum.as_ref().unwrap();
        assert_eq!(checksum.algorithm, ChecksumAlgorithm::Sha3_256);
        assert_eq!(checksum.value, "AABBCC");
        assert_eq!(
            granule_folder(&entries).unwrap(),
            "L2A_T33TWJ_A032172_20210812T095220"
        );
    }

    #[test]
    fn parse_geocoding_tiers() {
        let geocoding = parse_tile_geocoding(TILE_METADATA).unwrap();
        assert_eq!(geocoding.epsg, 32633);
        assert_eq!(geocoding.cs_name, "WGS84 / UTM zone 33N");
        let tier = geocoding.tier(10).unwrap();
        assert_eq!((tier.rows, tier.cols), (10980, 10980));
        assert_eq!(tier.ulx, 499980.0);
        assert_eq!(tier.ydim, -10.0);
        assert_eq!(geocoding.tier(20).unwrap().xdim, 20.0);
        assert!(geocoding.tier(60).is_none());
    }

    #[test]
    fn descriptors_for_requested_bands() {
        let entries = parse_manifest(MANIFEST).unwrap();
        let geocoding = parse_tile_geocoding(TILE_METADATA).unwrap();
        let labels: Vec<BandLabel> = vec!["B04_10m".parse().unwrap(), "B03_10m".parse().unwrap()];
        let bands = band_descriptors(&entries, &geocoding, &labels).unwrap();
        assert_eq!(bands.len(), 2);
        assert_eq!(bands[0].size, 135790);
        assert_eq!(bands[1].checksum.algorithm, ChecksumAlgorithm::Md5);
        assert_eq!(bands[0].epsg, 32633);
        assert_eq!(bands[0].georeference().transform.origin_x, 499980.0);

        let missing: Vec<BandLabel> = vec!["B02_10m".parse().unwrap()];
        assert_matches!(
            band_descriptors(&entries, &geocoding, &missing),
            Err(MosaicError::Data(_))
        );
    }
}

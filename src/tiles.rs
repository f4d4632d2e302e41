use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::TileCode;
use crate::error::MosaicError;
use crate::geometry::{BoundingBox, Geometry, Point, geometry_from_geojson, parse_wkt};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridTile {
    pub code: TileCode,
    pub boundary: Geometry,
    pub projected_boundary: Option<Geometry>,
    pub centroid: Point,
    pub epsg: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectedTile {
    pub tile: GridTile,
    pub query_centroid: Point,
}

impl SelectedTile {
    pub fn code(&self) -> &TileCode {
        &self.tile.code
    }
}

/// Accept only tiles whose centroid falls inside this box.
///
/// Known limitation: this exists to drop catalog entries whose geometry is
/// split across the antimeridian (their centroid lands mid-globe). It is not
/// an antimeridian-aware intersection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CentroidFilter {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl CentroidFilter {
    pub fn accepts(&self, point: &Point) -> bool {
        BoundingBox::new(self.min_lon, self.min_lat, self.max_lon, self.max_lat).contains(point)
    }
}

impl Default for CentroidFilter {
    fn default() -> Self {
        Self {
            min_lon: -180.0,
            min_lat: -90.0,
            max_lon: 180.0,
            max_lat: 90.0,
        }
    }
}

pub fn load_catalog(path: &Path) -> Result<Vec<GridTile>, MosaicError> {
    let value = read_json(path)?;
    let tiles = catalog_from_geojson(&value)?;
    info!(path = %path.display(), tiles = tiles.len(), "tile catalog loaded");
    Ok(tiles)
}

pub fn catalog_from_geojson(value: &Value) -> Result<Vec<GridTile>, MosaicError> {
    features(value)?.iter().map(|feature| grid_tile(feature)).collect()
}

pub fn load_region(path: &Path) -> Result<Geometry, MosaicError> {
    region_from_geojson(&read_json(path)?)
}

pub fn region_from_geojson(value: &Value) -> Result<Geometry, MosaicError> {
    let geometry = match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") | Some("Feature") => {
            let features = features(value)?;
            let [feature] = features.as_slice() else {
                return Err(MosaicError::Data(format!(
                    "region must contain exactly one feature, found {}",
                    features.len()
                )));
            };
            feature_geometry(feature)?
        }
        _ => geometry_from_geojson(value)?,
    };
    match geometry {
        Geometry::Point(_) => Err(MosaicError::Data("region must be a polygon".to_string())),
        polygonal => Ok(polygonal),
    }
}

pub fn select(region: &Geometry, catalog: &[GridTile], filter: &CentroidFilter) -> Vec<SelectedTile> {
    let selected: Vec<SelectedTile> = catalog
        .iter()
        .filter(|tile| {
            if !filter.accepts(&tile.centroid) {
                debug!(tile = %tile.code, "centroid outside filter, skipping");
                return false;
            }
            tile.boundary.intersects(region)
        })
        .map(|tile| SelectedTile {
            tile: tile.clone(),
            query_centroid: tile.centroid,
        })
        .collect();
    info!(selected = selected.len(), catalog = catalog.len(), "tiles selected");
    selected
}

fn read_json(path: &Path) -> Result<Value, MosaicError> {
    let raw = fs::read_to_string(path)
        .map_err(|err| MosaicError::Filesystem(format!("read {}: {err}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|err| MosaicError::Data(format!("{}: {err}", path.display())))
}

fn features(value: &Value) -> Result<Vec<&Value>, MosaicError> {
    match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => Ok(value
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| MosaicError::Data("FeatureCollection without features".to_string()))?
            .iter()
            .collect()),
        Some("Feature") => Ok(vec![value]),
        other => Err(MosaicError::Data(format!(
            "expected a GeoJSON feature collection, got {}",
            other.unwrap_or("no type")
        ))),
    }
}

fn feature_geometry(feature: &Value) -> Result<Geometry, MosaicError> {
    let geometry = feature
        .get("geometry")
        .filter(|geometry| !geometry.is_null())
        .ok_or_else(|| MosaicError::Data("feature without geometry".to_string()))?;
    geometry_from_geojson(geometry)
}

fn grid_tile(feature: &Value) -> Result<GridTile, MosaicError> {
    let properties = feature
        .get("properties")
        .ok_or_else(|| MosaicError::Data("catalog feature without properties".to_string()))?;
    let code: TileCode = properties
        .get("Name")
        .and_then(Value::as_str)
        .ok_or_else(|| MosaicError::Data("catalog feature without Name".to_string()))?
        .parse()?;
    let epsg = match properties.get("EPSG") {
        Some(Value::Number(number)) => number.as_u64(),
        Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
    .and_then(|epsg| u32::try_from(epsg).ok())
    .ok_or_else(|| MosaicError::Data(format!("tile {code}: missing or invalid EPSG")))?;

    let boundary = feature_geometry(feature)
        .map_err(|err| MosaicError::Data(format!("tile {code}: {err}")))?;
    if boundary.polygons().is_empty() {
        return Err(MosaicError::Data(format!("tile {code}: boundary is not polygonal")));
    }
    let projected_boundary = properties
        .get("UTM_WKT")
        .and_then(Value::as_str)
        .map(parse_wkt)
        .transpose()?;
    let centroid = match properties.get("CENTROID").and_then(Value::as_str) {
        Some(wkt) => match parse_wkt(wkt)? {
            Geometry::Point(point) => point,
            _ => {
                return Err(MosaicError::Data(format!("tile {code}: CENTROID is not a POINT")));
            }
        },
        None => boundary
            .centroid()
            .ok_or_else(|| MosaicError::Data(format!("tile {code}: cannot compute centroid")))?,
    };

    Ok(GridTile {
        code,
        boundary,
        projected_boundary,
        centroid,
        epsg,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn square(min_x: f64, min_y: f64, size: f64) -> Value {
        json!({
            "type": "Polygon",
            "coordinates": [[
                [min_x, min_y], [min_x + size, min_y], [min_x + size, min_y + size],
                [min_x, min_y + size], [min_x, min_y]
            ]]
        })
    }

    fn catalog() -> Value {
        json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "geometry": square(14.0, 40.0, 1.0),
                    "properties": { "Name": "33TVF", "EPSG": 32633 }
                },
                {
                    "type": "Feature",
                    "geometry": square(15.0, 40.0, 1.0),
                    "properties": {
                        "Name": "33TWF",
                        "EPSG": "32633",
                        "UTM_WKT": "POLYGON((500000 4400000,600000 4400000,600000 4500000,500000 4500000,500000 4400000))",
                        "CENTROID": "POINT(15.5 40.5)"
                    }
                }
            ]
        })
    }

    #[test]
    fn catalog_reads_properties_and_computes_missing_centroid() {
        let tiles = catalog_from_geojson(&catalog()).unwrap();
        assert_eq!(tiles.len(), 2);
        assert_eq!(tiles[0].code.as_str(), "33TVF");
        assert_eq!(tiles[0].epsg, 32633);
        let centroid = tiles[0].centroid;
        assert!((centroid.x - 14.5).abs() < 1e-9 && (centroid.y - 40.5).abs() < 1e-9);
        assert!(tiles[0].projected_boundary.is_none());
        assert!(tiles[1].projected_boundary.is_some());
    }

    #[test]
    fn region_inside_one_tile_selects_one() {
        let tiles = catalog_from_geojson(&catalog()).unwrap();
        let region = region_from_geojson(&square(14.2, 40.2, 0.3)).unwrap();
        let selected = select(&region, &tiles, &CentroidFilter::default());
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].code().as_str(), "33TVF");
        assert_eq!(selected[0].query_centroid, tiles[0].centroid);
    }

    #[test]
    fn region_across_tiles_keeps_catalog_order() {
        let tiles = catalog_from_geojson(&catalog()).unwrap();
        let region = region_from_geojson(&square(14.8, 40.2, 0.4)).unwrap();
        let codes: Vec<_> = select(&region, &tiles, &CentroidFilter::default())
            .iter()
            .map(|tile| tile.code().to_string())
            .collect();
        assert_eq!(codes, vec!["33TVF", "33TWF"]);
    }

    #[test]
    fn disjoint_region_selects_nothing() {
        let tiles = catalog_from_geojson(&catalog()).unwrap();
        let region = region_from_geojson(&square(-70.0, -10.0, 1.0)).unwrap();
        assert!(select(&region, &tiles, &CentroidFilter::default()).is_empty());
    }

    #[test]
    fn centroid_filter_rejects_tiles() {
        let tiles = catalog_from_geojson(&catalog()).unwrap();
        let region = region_from_geojson(&square(14.8, 40.2, 0.4)).unwrap();
        let filter = CentroidFilter {
            min_lon: 15.0,
            min_lat: -90.0,
            max_lon: 180.0,
            max_lat: 90.0,
        };
        let selected = select(&region, &tiles, &filter);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].code().as_str(), "33TWF");
    }

    #[test]
    fn region_feature_collection_must_have_one_feature() {
        let doc = json!({ "type": "FeatureCollection", "features": [] });
        assert_matches!(region_from_geojson(&doc), Err(MosaicError::Data(_)));
        let point = json!({ "type": "Point", "coordinates": [1.0, 2.0] });
        assert_matches!(region_from_geojson(&point), Err(MosaicError::Data(_)));
    }

    #[test]
    fn catalog_feature_without_epsg_is_rejected() {
        let doc = json!({
            "type": "FeatureCollection",
            "features": [{ "type": "Feature", "geometry": square(0.0, 0.0, 1.0), "properties": { "Name": "31NAA" } }]
        });
        assert_matches!(catalog_from_geojson(&doc), Err(MosaicError::Data(_)));
    }
}

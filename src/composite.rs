use tracing::{debug, info};

use crate::domain::{BandLabel, TileCode};
use crate::error::MosaicError;
use crate::geometry::BoundingBox;
use crate::raster::{GeoReference, GeoTransform, Raster};

const PIXEL_SIZE_TOLERANCE: f64 = 1e-6;

pub fn assemble_composite(
    tile: &TileCode,
    red: Option<&Raster>,
    green: Option<&Raster>,
    blue: Option<&Raster>,
) -> Result<Raster, MosaicError> {
    let missing = |role: &str| MosaicError::Data(format!("tile {tile}: no {role} band for composite"));
    let red = red.ok_or_else(|| missing("red"))?;
    let green = green.ok_or_else(|| missing("green"))?;
    let blue = blue.ok_or_else(|| missing("blue"))?;

    let mut bands = Vec::with_capacity(3);
    for (role, raster) in [("red", red), ("green", green), ("blue", blue)] {
        if raster.band_count() != 1 {
            return Err(MosaicError::Data(format!(
                "tile {tile}: {role} raster has {} bands",
                raster.band_count()
            )));
        }
        if (raster.width, raster.height) != (red.width, red.height) {
            return Err(MosaicError::Data(format!(
                "tile {tile}: {role} grid {}x{} differs from red {}x{}",
                raster.width, raster.height, red.width, red.height
            )));
        }
        bands.push(raster.bands[0].clone());
    }
    debug!(tile = %tile, width = red.width, height = red.height, "composite assembled");
    Raster::new(red.georef, red.width, red.height, bands)
}

/// Paste composites onto their union extent.
///
/// Known limitation: overlapping pixels take the value of the last input
/// covering them; there is no blending or cloud-aware selection.
pub fn assemble_mosaic(composites: &[Raster]) -> Result<Raster, MosaicError> {
    let first = composites
        .first()
        .ok_or_else(|| MosaicError::Data("mosaic needs at least one composite".to_string()))?;
    let reference = first.georef;
    let band_count = first.band_count();

    let mut extent: BoundingBox = first.bounds();
    for raster in &composites[1..] {
        check_compatible(&reference, band_count, raster)?;
        extent = extent.union(&raster.bounds());
    }

    let pixel_width = reference.transform.pixel_width;
    let pixel_height = reference.transform.pixel_height;
    let width = grid_steps(extent.width(), pixel_width)?;
    let height = grid_steps(extent.height(), pixel_height.abs())?;
    let transform = GeoTransform::north_up(extent.min_x, extent.max_y, pixel_width, pixel_height);

    let pixels = width as usize * height as usize;
    let mut bands = vec![vec![0u16; pixels]; band_count];
    for raster in composites {
        let col_offset = grid_offset(raster.georef.transform.origin_x - extent.min_x, pixel_width);
        let row_offset = grid_offset(extent.max_y - raster.georef.transform.origin_y, pixel_height.abs());
        for row in 0..raster.height as usize {
            let target_row = row_offset + row;
            if target_row >= height as usize {
                break;
            }
            let copy_cols = (raster.width as usize).min((width as usize).saturating_sub(col_offset));
            let src_start = row * raster.width as usize;
            let dst_start = target_row * width as usize + col_offset;
            for (target, source) in bands.iter_mut().zip(&raster.bands) {
                target[dst_start..dst_start + copy_cols]
                    .copy_from_slice(&source[src_start..src_start + copy_cols]);
            }
        }
    }

    info!(inputs = composites.len(), width, height, "mosaic assembled");
    Raster::new(
        GeoReference {
            epsg: reference.epsg,
            transform,
        },
        width,
        height,
        bands,
    )
}

pub fn composite_file_name(band_file: &str, red: &BandLabel) -> String {
    let renamed = band_file.replace(&red.to_string(), "RGB");
    match renamed.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}.tif"),
        None => format!("{renamed}.tif"),
    }
}

fn check_compatible(reference: &GeoReference, band_count: usize, raster: &Raster) -> Result<(), MosaicError> {
    if raster.georef.epsg != reference.epsg {
        return Err(MosaicError::Data(format!(
            "mosaic inputs mix EPSG:{} and EPSG:{}; reprojection is not supported",
            reference.epsg, raster.georef.epsg
        )));
    }
    let same_pixel = (raster.georef.transform.pixel_width - reference.transform.pixel_width).abs()
        < PIXEL_SIZE_TOLERANCE
        && (raster.georef.transform.pixel_height - reference.transform.pixel_height).abs()
            < PIXEL_SIZE_TOLERANCE;
    if !same_pixel {
        return Err(MosaicError::Data(
            "mosaic inputs have different pixel sizes; resampling is not supported".to_string(),
        ));
    }
    if raster.band_count() != band_count {
        return Err(MosaicError::Data(format!(
            "mosaic inputs have {band_count} and {} bands",
            raster.band_count()
        )));
    }
    Ok(())
}

fn grid_steps(span: f64, pixel: f64) -> Result<u32, MosaicError> {
    let steps = (span / pixel).round();
    if !steps.is_finite() || steps < 1.0 || steps > f64::from(u32::MAX) {
        return Err(MosaicError::Data(format!("invalid mosaic extent {span} for pixel size {pixel}")));
    }
    Ok(steps as u32)
}

fn grid_offset(distance: f64, pixel: f64) -> usize {
    (distance / pixel).round().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn band(origin_x: f64, origin_y: f64, width: u32, height: u32, value: u16) -> Raster {
        Raster::new(
            GeoReference {
                epsg: 32633,
                transform: GeoTransform::north_up(origin_x, origin_y, 10.0, -10.0),
            },
            width,
            height,
            vec![vec![value; (width * height) as usize]],
        )
        .unwrap()
    }

    fn tile() -> TileCode {
        "33TWJ".parse().unwrap()
    }

    #[test]
    fn composite_copies_bands_in_rgb_order() {
        let mut red = band(0.0, 100.0, 2, 2, 0);
        red.bands[0] = vec![1, 2, 3, 4];
        let green = band(0.0, 100.0, 2, 2, 5);
        let blue = band(0.0, 100.0, 2, 2, 9);

        let composite = assemble_composite(&tile(), Some(&red), Some(&green), Some(&blue)).unwrap();
        assert_eq!(composite.band_count(), 3);
        assert_eq!(composite.bands[0], vec![1, 2, 3, 4]);
        assert_eq!(composite.bands[1], vec![5; 4]);
        assert_eq!(composite.bands[2], vec![9; 4]);
        assert_eq!(composite.georef, red.georef);
    }

    #[test]
    fn composite_requires_every_role() {
        let red = band(0.0, 100.0, 2, 2, 1);
        let err = assemble_composite(&tile(), Some(&red), None, Some(&red)).unwrap_err();
        assert_matches!(err, MosaicError::Data(message) if message.contains("green"));
    }

    #[test]
    fn composite_rejects_grid_mismatch() {
        let red = band(0.0, 100.0, 2, 2, 1);
        let green = band(0.0, 100.0, 3, 2, 1);
        assert_matches!(
            assemble_composite(&tile(), Some(&red), Some(&green), Some(&red)),
            Err(MosaicError::Data(_))
        );
    }

    #[test]
    fn mosaic_extent_is_union_and_last_writer_wins() {
        let left = band(0.0, 100.0, 4, 2, 1);
        let right = band(20.0, 90.0, 4, 2, 2);
        let mosaic = assemble_mosaic(&[left.clone(), right.clone()]).unwrap();

        let expected = left.bounds().union(&right.bounds());
        assert_eq!(mosaic.bounds(), expected);
        assert_eq!((mosaic.width, mosaic.height), (6, 3));
        // Row 0 only covered by `left`.
        assert_eq!(mosaic.sample(0, 0, 0), 1);
        assert_eq!(mosaic.sample(0, 0, 5), 0);
        // Overlap at row 1, cols 2..4 is taken from `right`.
        assert_eq!(mosaic.sample(0, 1, 1), 1);
        assert_eq!(mosaic.sample(0, 1, 2), 2);
        assert_eq!(mosaic.sample(0, 2, 0), 0);
        assert_eq!(mosaic.sample(0, 2, 5), 2);
    }

    #[test]
    fn mosaic_rejects_mixed_crs() {
        let a = band(0.0, 100.0, 2, 2, 1);
        let mut b = band(20.0, 100.0, 2, 2, 1);
        b.georef.epsg = 32634;
        assert_matches!(assemble_mosaic(&[a, b]), Err(MosaicError::Data(_)));
        assert_matches!(assemble_mosaic(&[]), Err(MosaicError::Data(_)));
    }

    #[test]
    fn composite_name_from_red_band_file() {
        let red: BandLabel = "B04_10m".parse().unwrap();
        assert_eq!(
            composite_file_name("T33TWJ_20210812T094039_B04_10m.jp2", &red),
            "T33TWJ_20210812T094039_RGB.tif"
        );
    }
}

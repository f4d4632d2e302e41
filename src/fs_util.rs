use std::fs;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::MosaicError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipSelection {
    pub relative_path: String,
    pub destination: PathBuf,
}

// Extract the selected entries. Product archives wrap everything in a
// `<title>.SAFE/` folder, so entries are matched by path suffix.
pub fn extract_selected(zip_path: &Path, selections: &[ZipSelection]) -> Result<usize, MosaicError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        MosaicError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| MosaicError::Filesystem(err.to_string()))?;

    let mut extracted = 0;
    for selection in selections {
        let index = find_entry(&mut archive, &selection.relative_path, zip_path)?;
        let mut entry = archive
            .by_index(index)
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        if let Some(parent) = selection.destination.parent() {
            fs::create_dir_all(parent).map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        }
        let temp = tempfile::Builder::new()
            .prefix(".s2m-extract")
            .tempfile_in(selection.destination.parent().unwrap_or(Path::new(".")))
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        let mut outfile = temp.as_file();
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        temp.persist(&selection.destination)
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        extracted += 1;
    }
    Ok(extracted)
}

pub fn read_entry_text(zip_path: &Path, relative_path: &str) -> Result<String, MosaicError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        MosaicError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| MosaicError::Filesystem(err.to_string()))?;
    let index = find_entry(&mut archive, relative_path, zip_path)?;
    let mut entry = archive
        .by_index(index)
        .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .map_err(|err| MosaicError::Data(format!("{relative_path}: {err}")))?;
    Ok(text)
}

fn find_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    relative_path: &str,
    zip_path: &Path,
) -> Result<usize, MosaicError> {
    let wanted = relative_path.trim_start_matches("./");
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        let Some(entry_path) = entry.enclosed_name() else {
            return Err(MosaicError::Filesystem(
                "zip entry path traversal detected".to_string(),
            ));
        };
        if !entry.is_dir() && entry_path.ends_with(wanted) {
            return Ok(i);
        }
    }
    Err(MosaicError::Data(format!("{wanted} not found in {}", zip_path.display())))
}

pub fn validate_zip(zip_path: &Path) -> Result<(), MosaicError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        MosaicError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| MosaicError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn product_zip(dir: &Path) -> PathBuf {
        let path = dir.join("product.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&path).unwrap());
        writer
            .start_file(
                "P.SAFE/GRANULE/L2A_G/IMG_DATA/R10m/T33TWJ_B04_10m.jp2",
                SimpleFileOptions::default(),
            )
            .unwrap();
        writer.write_all(b"red").unwrap();
        writer
            .start_file("P.SAFE/manifest.safe", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"<xfdu/>").unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn extracts_by_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let zip = product_zip(dir.path());
        validate_zip(&zip).unwrap();
        assert_eq!(read_entry_text(&zip, "manifest.safe").unwrap(), "<xfdu/>");

        let destination = dir.path().join("bands").join("red.jp2");
        let count = extract_selected(
            &zip,
            &[ZipSelection {
                relative_path: "./GRANULE/L2A_G/IMG_DATA/R10m/T33TWJ_B04_10m.jp2".to_string(),
                destination: destination.clone(),
            }],
        )
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(fs::read(destination).unwrap(), b"red");
    }

    #[test]
    fn missing_entry_is_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let zip = product_zip(dir.path());
        let err = extract_selected(
            &zip,
            &[ZipSelection {
                relative_path: "GRANULE/L2A_G/IMG_DATA/R10m/T33TWJ_B03_10m.jp2".to_string(),
                destination: dir.path().join("green.jp2"),
            }],
        )
        .unwrap_err();
        assert_matches!(err, MosaicError::Data(_));
    }
}

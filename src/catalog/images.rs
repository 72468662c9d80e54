use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use tracing::warn;

use crate::catalog::ImageStore;
use crate::config::StorageConfig;
use crate::error::{MetashopError, Result};
use crate::types::{ImageData, ProductId};

/// Canonical images stored as `<dir>/<product_id>.<extension>`.
pub struct DirImageStore {
    dir: PathBuf,
}

impl DirImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn find(&self, id: ProductId) -> Result<Option<PathBuf>> {
        let stem = id.to_string();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str()) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

impl ImageStore for DirImageStore {
    fn load(&self, id: ProductId) -> Result<Option<ImageData>> {
        match self.find(id)? {
            Some(path) => read_image_file(&path).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, id: ProductId, image: &ImageData) -> Result<()> {
        let extension = sanitize_extension(&image.extension)?;
        if let Some(existing) = self.find(id)? {
            std::fs::remove_file(existing)?;
        }
        std::fs::write(self.dir.join(format!("{id}.{extension}")), &image.data)?;
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<ProductId>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<ProductId>().ok())
            {
                Some(id) => ids.push(id),
                None => warn!(path = %path.display(), "ignoring unrecognised file in image store"),
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

/// Read an image file, taking the extension as the file-type hint.
pub fn read_image_file(path: &Path) -> Result<ImageData> {
    let data = std::fs::read(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    Ok(ImageData::new(data, extension))
}

/// Image attached to unidentified products: the configured file, or a small
/// generated grey PNG.
pub fn fallback_image(storage: &StorageConfig) -> Result<ImageData> {
    if let Some(path) = &storage.fallback_image {
        return read_image_file(path);
    }
    let placeholder = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([160])));
    let mut data = Vec::new();
    placeholder.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)?;
    Ok(ImageData::new(data, "png"))
}

fn sanitize_extension(extension: &str) -> Result<String> {
    let extension = extension.trim_start_matches('.').to_ascii_lowercase();
    if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(MetashopError::Validation(format!(
            "invalid image extension '{extension}'"
        )));
    }
    Ok(extension)
}

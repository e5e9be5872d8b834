//! On-disk raster cache
//!
//! Caches composited tile imagery as PNG files so revisited tiles skip the
//! fetch-and-composite round trip. File names are sha2 digests of the fetch
//! parameters plus the raster registry generation, one subdirectory per
//! quadtree level; any layer-set change moves the key, so stale composites
//! stop matching.

use std::fs;
use std::path::{Path, PathBuf};

use image::RgbaImage;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};
use crate::layers::RasterRequest;

/// Directory-backed cache of composited raster tiles
pub struct RasterCache {
    root: PathBuf,
}

impl RasterCache {
    /// Open (and create if needed) a cache rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> EngineResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, request: &RasterRequest, generation: u64) -> PathBuf {
        let mut hasher = Sha256::new();
        let min = request.extents.minimum();
        let max = request.extents.maximum();
        hasher.update(min.x.to_le_bytes());
        hasher.update(min.y.to_le_bytes());
        hasher.update(max.x.to_le_bytes());
        hasher.update(max.y.to_le_bytes());
        hasher.update(request.width.to_le_bytes());
        hasher.update(request.height.to_le_bytes());
        hasher.update(generation.to_le_bytes());
        let digest = hasher.finalize();
        self.root
            .join(format!("{}", request.level))
            .join(format!("{:x}.png", digest))
    }

    /// Look up a cached image. A missing or unreadable entry is a miss, not
    /// an error; corrupt entries are removed so the slot can be rewritten.
    pub fn load(&self, request: &RasterRequest, generation: u64) -> Option<RgbaImage> {
        let path = self.entry_path(request, generation);
        if !path.exists() {
            return None;
        }
        match image::open(&path) {
            Ok(img) => {
                let img = img.into_rgba8();
                if img.dimensions() == (request.width, request.height) {
                    Some(img)
                } else {
                    log::warn!("cache entry {} has wrong dimensions, dropping", path.display());
                    let _ = fs::remove_file(&path);
                    None
                }
            }
            Err(err) => {
                log::warn!("unreadable cache entry {}: {}", path.display(), err);
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Write an image into the cache.
    pub fn store(
        &self,
        request: &RasterRequest,
        image: &RgbaImage,
        generation: u64,
    ) -> EngineResult<()> {
        let path = self.entry_path(request, generation);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .map_err(|err| EngineError::cache(format!("write {}: {}", path.display(), err)))
    }
}

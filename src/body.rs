//! Body orchestration
//!
//! A [`Body`] owns the top-level tiles of one globe (or planar map), the
//! layer registries, and the deferred-deletion list. The render host calls
//! [`Body::update_notify`] once per frame from a single thread; everything
//! slow happens on the job pool the body was given.

use std::path::PathBuf;
use std::sync::Arc;

use glam::{DMat4, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::cache::RasterCache;
use crate::error::EngineResult;
use crate::geo::Extents;
use crate::jobs::JobManager;
use crate::land::LandModel;
use crate::layers::{ElevationLayer, LayerId, RasterLayer, VectorLayer};
use crate::scene::SceneSink;
use crate::tile::{dirty, RequestBudget, Tile, TileContext};

/// Tunables for one body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyConfig {
    /// View distance below which a level-0 tile splits; halves per level.
    pub split_distance: f64,
    /// Deepest level a tile may reach.
    pub max_level: u32,
    pub mesh_rows: u32,
    pub mesh_columns: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub skirts: bool,
    /// Skirt drop of a level-0 tile, in elevation units; halves per level.
    pub skirt_height: f64,
    /// Vertical exaggeration applied to elevations.
    pub scale: f64,
    /// New fetch jobs allowed per frame.
    pub requests_per_frame: u32,
    /// Directory for the composited-raster disk cache; none disables it.
    pub cache_dir: Option<PathBuf>,
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            split_distance: 4_000_000.0,
            max_level: 50,
            mesh_rows: 17,
            mesh_columns: 17,
            image_width: 256,
            image_height: 256,
            skirts: true,
            skirt_height: 10_000.0,
            scale: 1.0,
            requests_per_frame: 8,
            cache_dir: None,
        }
    }
}

impl BodyConfig {
    /// Parse from a JSON document; absent fields take their defaults.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).map_err(crate::error::EngineError::config)
    }
}

/// One globe: top tiles, layers, and the per-frame update loop
pub struct Body {
    context: Arc<TileContext>,
    config: BodyConfig,
    top_tiles: Vec<Arc<Tile>>,
    pending_delete: Vec<Arc<Tile>>,
    frame: u64,
}

impl Body {
    pub fn new(
        land: Arc<dyn LandModel>,
        jobs: Arc<JobManager>,
        scene: Arc<dyn SceneSink>,
        config: BodyConfig,
    ) -> EngineResult<Self> {
        let cache = match config.cache_dir.as_ref() {
            Some(dir) => Some(RasterCache::new(dir)?),
            None => None,
        };
        let context = Arc::new(TileContext::new(
            land,
            jobs,
            scene,
            cache,
            config.mesh_rows,
            config.mesh_columns,
            config.image_width,
            config.image_height,
            config.max_level,
            config.skirts,
        ));
        Ok(Self {
            context,
            config,
            top_tiles: Vec::new(),
            pending_delete: Vec::new(),
            frame: 0,
        })
    }

    pub fn config(&self) -> &BodyConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<TileContext> {
        &self.context
    }

    pub fn top_tiles(&self) -> &[Arc<Tile>] {
        &self.top_tiles
    }

    /// Bootstrap a level-0 tile. A globe typically gets two, one per
    /// hemisphere.
    pub fn add_tile(&mut self, extents: Extents) -> EngineResult<Arc<Tile>> {
        let tile = Tile::new_top(
            Arc::clone(&self.context),
            extents,
            self.config.split_distance,
            self.config.skirt_height,
        )?;
        self.top_tiles.push(Arc::clone(&tile));
        Ok(tile)
    }

    /// One frame: split/collapse against the eye, drain and issue jobs,
    /// refresh the scene, then purge tiles whose jobs have all settled.
    pub fn update_notify(&mut self, eye: DVec3) {
        self.frame += 1;
        let mut budget = RequestBudget::new(self.config.requests_per_frame);
        let mut deleted = Vec::new();
        for tile in &self.top_tiles {
            tile.update(eye, &mut budget, &mut deleted);
        }
        if !deleted.is_empty() {
            log::debug!(
                "frame {}: {} tiles queued for deletion",
                self.frame,
                deleted.len()
            );
        }
        self.pending_delete.extend(deleted);
        self.purge_tiles();
    }

    /// Drop queued tiles whose jobs are all terminal; keep the rest for a
    /// later pass. A tile with a live job is never freed.
    pub fn purge_tiles(&mut self) {
        let before = self.pending_delete.len();
        self.pending_delete.retain(|tile| !tile.jobs_terminal());
        let purged = before - self.pending_delete.len();
        if purged > 0 {
            log::debug!("purged {} tiles, {} still pending", purged, self.pending_delete.len());
        }
    }

    pub fn pending_deletion_count(&self) -> usize {
        self.pending_delete.len()
    }

    pub fn raster_append(&mut self, layer: Arc<dyn RasterLayer>) -> LayerId {
        let extents = layer.extents();
        let id = self.context.rasters.lock().unwrap().add(layer);
        self.dirty_tiles(dirty::IMAGE, Some(&extents));
        id
    }

    pub fn raster_remove(&mut self, id: LayerId) -> bool {
        let removed = self.context.rasters.lock().unwrap().remove(id);
        match removed {
            Some(layer) => {
                self.dirty_tiles(dirty::IMAGE, Some(&layer.extents()));
                true
            }
            None => false,
        }
    }

    /// A layer's content changed in place; refetch imagery under it.
    pub fn raster_changed(&mut self, id: LayerId) -> bool {
        let layer = {
            let mut rasters = self.context.rasters.lock().unwrap();
            let layer = rasters.get(id);
            if layer.is_some() {
                // Invalidate cached composites built from the old content.
                rasters.touch();
            }
            layer
        };
        match layer {
            Some(layer) => {
                self.dirty_tiles(dirty::IMAGE, Some(&layer.extents()));
                true
            }
            None => false,
        }
    }

    pub fn elevation_append(&mut self, layer: Arc<dyn ElevationLayer>) -> LayerId {
        let extents = layer.extents();
        let id = self.context.elevations.lock().unwrap().add(layer);
        self.dirty_tiles(dirty::VERTICES, Some(&extents));
        id
    }

    pub fn elevation_remove(&mut self, id: LayerId) -> bool {
        let removed = self.context.elevations.lock().unwrap().remove(id);
        match removed {
            Some(layer) => {
                self.dirty_tiles(dirty::VERTICES, Some(&layer.extents()));
                true
            }
            None => false,
        }
    }

    pub fn vector_append(&mut self, layer: Arc<dyn VectorLayer>) -> LayerId {
        let extents = layer.extents();
        let id = self.context.vectors.lock().unwrap().add(layer);
        self.dirty_tiles(dirty::VECTOR, Some(&extents));
        id
    }

    pub fn vector_remove(&mut self, id: LayerId) -> bool {
        let removed = self.context.vectors.lock().unwrap().remove(id);
        match removed {
            Some(layer) => {
                self.dirty_tiles(dirty::VECTOR, Some(&layer.extents()));
                true
            }
            None => false,
        }
    }

    fn dirty_tiles(&self, flags: u32, bounding: Option<&Extents>) {
        for tile in &self.top_tiles {
            tile.dirty(true, flags, true, bounding);
        }
    }

    /// Elevation at a geographic position from the deepest loaded tile.
    /// Positions outside every top tile report 0.0, not an error.
    pub fn elevation(&self, lat: f64, lon: f64) -> f64 {
        let point = DVec2::new(lon, lat);
        for top in &self.top_tiles {
            if !top.extents().contains(point) {
                continue;
            }
            let mut tile = Arc::clone(top);
            loop {
                let next = tile
                    .children()
                    .into_iter()
                    .flatten()
                    .find(|child| child.extents().contains(point));
                match next {
                    Some(child) => tile = child,
                    None => break,
                }
            }
            return tile.elevation_at(lat, lon) as f64 * self.config.scale;
        }
        log::debug!("elevation query ({}, {}) outside all tiles", lat, lon);
        0.0
    }

    pub fn lat_lon_height_to_xyz(&self, lat: f64, lon: f64, elevation: f64) -> DVec3 {
        self.context
            .land
            .lat_lon_height_to_xyz(lat, lon, elevation * self.config.scale)
    }

    pub fn xyz_to_lat_lon_height(&self, point: DVec3) -> (f64, f64, f64) {
        let (lat, lon, elevation) = self.context.land.xyz_to_lat_lon_height(point);
        (lat, lon, elevation / self.config.scale)
    }

    pub fn rotation_matrix_at(&self, lat: f64, lon: f64, height: f64, heading: f64) -> DMat4 {
        self.context
            .land
            .rotation_matrix_at(lat, lon, height * self.config.scale, heading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::land::FlatLandModel;
    use crate::layers::{ConstantElevationLayer, SolidRasterLayer};
    use crate::scene::RecordingSink;
    use std::time::Duration;

    fn body(config: BodyConfig) -> (Body, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let body = Body::new(
            Arc::new(FlatLandModel),
            Arc::new(JobManager::new(2)),
            Arc::clone(&sink) as Arc<dyn SceneSink>,
            config,
        )
        .unwrap();
        (body, sink)
    }

    fn small_config() -> BodyConfig {
        BodyConfig {
            split_distance: 100.0,
            max_level: 4,
            mesh_rows: 5,
            mesh_columns: 5,
            image_width: 8,
            image_height: 8,
            skirt_height: 1.0,
            requests_per_frame: 16,
            ..BodyConfig::default()
        }
    }

    fn run_frames(body: &mut Body, eye: DVec3, frames: usize) {
        for _ in 0..frames {
            body.update_notify(eye);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_add_tile_and_first_frame_attaches() {
        let (mut body, sink) = body(small_config());
        let tile = body
            .add_tile(Extents::new(-10.0, -10.0, 10.0, 10.0).unwrap())
            .unwrap();
        assert_eq!(tile.level(), 0);

        run_frames(&mut body, DVec3::new(1e6, 1e6, 1e6), 10);
        assert!(tile.has_mesh());
        assert!(sink.is_attached(tile.id()));
    }

    #[test]
    fn test_config_from_json_with_defaults() {
        let config = BodyConfig::from_json(r#"{ "split_distance": 5.0, "max_level": 3 }"#).unwrap();
        assert_eq!(config.split_distance, 5.0);
        assert_eq!(config.max_level, 3);
        assert_eq!(config.mesh_rows, BodyConfig::default().mesh_rows);
        assert!(BodyConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_elevation_outside_tiles_is_zero() {
        let (mut body, _sink) = body(small_config());
        body.add_tile(Extents::new(-10.0, -10.0, 10.0, 10.0).unwrap())
            .unwrap();
        assert_eq!(body.elevation(50.0, 50.0), 0.0);
    }

    #[test]
    fn test_elevation_from_loaded_tile() {
        let (mut body, _sink) = body(small_config());
        let extents = Extents::new(-10.0, -10.0, 10.0, 10.0).unwrap();
        body.add_tile(extents).unwrap();
        body.elevation_append(Arc::new(ConstantElevationLayer::new(extents, 123.0)));

        run_frames(&mut body, DVec3::new(1e6, 1e6, 1e6), 30);
        assert_eq!(body.elevation(0.0, 0.0), 123.0);
    }

    #[test]
    fn test_scale_applies_to_queries_and_mapping() {
        let mut config = small_config();
        config.scale = 2.0;
        let (mut body, _sink) = body(config);
        let extents = Extents::new(-10.0, -10.0, 10.0, 10.0).unwrap();
        body.add_tile(extents).unwrap();
        body.elevation_append(Arc::new(ConstantElevationLayer::new(extents, 100.0)));
        run_frames(&mut body, DVec3::new(1e6, 1e6, 1e6), 30);

        assert_eq!(body.elevation(0.0, 0.0), 200.0);
        let p = body.lat_lon_height_to_xyz(0.0, 0.0, 10.0);
        assert_eq!(p.z, 20.0);
        let (_, _, h) = body.xyz_to_lat_lon_height(p);
        assert_eq!(h, 10.0);
    }

    #[test]
    fn test_rotation_matrix_carries_height_and_heading() {
        let (body, _sink) = body(small_config());
        let m = body.rotation_matrix_at(2.0, 3.0, 4.0, 90.0);
        // Flat model: translation (lon, lat, height), quarter turn about up.
        assert!((m.w_axis.truncate() - DVec3::new(3.0, 2.0, 4.0)).length() < 1e-12);
        assert!((m.x_axis.truncate() - DVec3::Y).length() < 1e-12);
    }

    #[test]
    fn test_raster_append_dirties_only_intersecting_tiles() {
        let (mut body, _sink) = body(small_config());
        let west = body
            .add_tile(Extents::new(-180.0, -90.0, 0.0, 90.0).unwrap())
            .unwrap();
        let east = body
            .add_tile(Extents::new(0.0, -90.0, 180.0, 90.0).unwrap())
            .unwrap();
        west.dirty(false, dirty::ALL, true, None);
        east.dirty(false, dirty::ALL, true, None);

        let patch = Extents::new(-120.0, -10.0, -60.0, 10.0).unwrap();
        body.raster_append(Arc::new(SolidRasterLayer::new(patch, [1, 2, 3, 255])));

        assert_ne!(west.flags() & dirty::IMAGE, 0);
        assert_eq!(east.flags() & dirty::IMAGE, 0);
    }

    #[test]
    fn test_layer_remove_unknown_id_is_false() {
        let (mut body, _sink) = body(small_config());
        assert!(!body.raster_remove(LayerId(42)));
        assert!(!body.elevation_remove(LayerId(42)));
        assert!(!body.vector_remove(LayerId(42)));
        assert!(!body.raster_changed(LayerId(42)));
    }

    #[test]
    fn test_split_and_collapse_through_frames() {
        let (mut body, sink) = body(small_config());
        let top = body
            .add_tile(Extents::new(-10.0, -10.0, 10.0, 10.0).unwrap())
            .unwrap();

        // Eye on the surface: splits.
        run_frames(&mut body, DVec3::ZERO, 40);
        assert!(top.children().iter().any(|child| child.is_some()));

        // Eye far away: collapses; children eventually purge.
        run_frames(&mut body, DVec3::new(1e7, 1e7, 1e7), 40);
        assert!(top.children().iter().all(|child| child.is_none()));
        assert_eq!(body.pending_deletion_count(), 0);
        assert!(sink.is_attached(top.id()));
    }
}

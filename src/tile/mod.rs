//! Quadtree tile state machine
//!
//! Each [`Tile`] is one node of the render quadtree: immutable identity
//! (level, extents, quadrant) plus mutable state behind a single mutex.
//! Splitting, data fetches and texture composition run as jobs on the
//! worker pool; the render thread drives everything else through
//! [`Tile::update`], which never blocks on a job.
//!
//! Lock discipline: a thread holds at most one tile lock, except that a
//! thread may lock a tile and then an ancestor. The registries in
//! [`TileContext`] are locked only while no other lock is needed.

pub mod mesh;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use glam::DVec3;
use image::RgbaImage;

use crate::cache::RasterCache;
use crate::error::{EngineError, EngineResult};
use crate::geo::Extents;
use crate::jobs::{JobHandle, JobManager};
use crate::land::LandModel;
use crate::layers::{
    blend_over, crop_scale, ElevationGrid, ElevationLayer, ElevationRequest, LayerId, LayerStack,
    RasterLayer, RasterRequest, VectorLayer, VectorPatch,
};
use crate::scene::SceneSink;

pub use mesh::{MeshParams, TexCoordRect, TileMesh};

/// Dirty-flag bits; set means the corresponding data is stale.
pub mod dirty {
    /// Elevation samples need fetching (and the mesh rebuilding).
    pub const VERTICES: u32 = 1 << 0;
    /// The texture sub-rectangle changed; the mesh needs rebuilding.
    pub const TEX_COORDS: u32 = 1 << 1;
    /// The scene sink holds an outdated bundle for this tile.
    pub const TEXTURE: u32 = 1 << 2;
    /// Raster imagery needs fetching and compositing.
    pub const IMAGE: u32 = 1 << 3;
    /// Vector features need fetching.
    pub const VECTOR: u32 = 1 << 4;
    /// Children need rebuilding.
    pub const CHILDREN: u32 = 1 << 5;

    pub const ALL: u32 = VERTICES | TEX_COORDS | TEXTURE | IMAGE | VECTOR | CHILDREN;
}

/// Capabilities and settings shared by every tile of a body
pub struct TileContext {
    pub land: Arc<dyn LandModel>,
    pub jobs: Arc<JobManager>,
    pub scene: Arc<dyn SceneSink>,
    pub rasters: Mutex<LayerStack<dyn RasterLayer>>,
    pub elevations: Mutex<LayerStack<dyn ElevationLayer>>,
    pub vectors: Mutex<LayerStack<dyn VectorLayer>>,
    pub cache: Option<RasterCache>,
    pub mesh_rows: u32,
    pub mesh_columns: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub max_level: u32,
    pub skirts: bool,
    next_tile_id: AtomicU64,
}

impl TileContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        land: Arc<dyn LandModel>,
        jobs: Arc<JobManager>,
        scene: Arc<dyn SceneSink>,
        cache: Option<RasterCache>,
        mesh_rows: u32,
        mesh_columns: u32,
        image_width: u32,
        image_height: u32,
        max_level: u32,
        skirts: bool,
    ) -> Self {
        Self {
            land,
            jobs,
            scene,
            rasters: Mutex::new(LayerStack::default()),
            elevations: Mutex::new(LayerStack::default()),
            vectors: Mutex::new(LayerStack::default()),
            cache,
            mesh_rows,
            mesh_columns,
            image_width,
            image_height,
            max_level,
            skirts,
            next_tile_id: AtomicU64::new(1),
        }
    }

    fn next_tile_id(&self) -> u64 {
        self.next_tile_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Cached per-layer texture: the image plus the sub-rectangle of it this
/// tile maps onto itself.
#[derive(Clone)]
pub struct TextureData {
    pub image: Arc<RgbaImage>,
    pub rect: TexCoordRect,
}

/// How many new fetch jobs one frame may launch
pub struct RequestBudget {
    remaining: u32,
}

impl RequestBudget {
    pub fn new(remaining: u32) -> Self {
        Self { remaining }
    }

    fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

struct TileState {
    flags: u32,
    tex_rect: TexCoordRect,
    image: Option<Arc<RgbaImage>>,
    textures: HashMap<LayerId, TextureData>,
    elevation: ElevationGrid,
    vector: VectorPatch,
    mesh: Option<Arc<TileMesh>>,
    children: [Option<Arc<Tile>>; 4],
    image_job: Option<Arc<JobHandle>>,
    elevation_job: Option<Arc<JobHandle>>,
    vector_job: Option<Arc<JobHandle>>,
    split_job: Option<Arc<JobHandle>>,
    attached: bool,
}

/// One node of the render quadtree
pub struct Tile {
    id: u64,
    level: u32,
    quadrant: usize,
    extents: Extents,
    split_distance: f64,
    skirt_height: f64,
    parent: Weak<Tile>,
    context: Arc<TileContext>,
    state: Mutex<TileState>,
}

impl Tile {
    /// Top-level tile owned directly by the body.
    pub fn new_top(
        context: Arc<TileContext>,
        extents: Extents,
        split_distance: f64,
        skirt_height: f64,
    ) -> EngineResult<Arc<Tile>> {
        if extents.is_empty() || extents.size().min_element() <= 0.0 {
            return Err(EngineError::invalid_extents(
                "top tile requires non-degenerate extents",
            ));
        }
        let rows = context.mesh_rows;
        let columns = context.mesh_columns;
        Ok(Arc::new(Tile {
            id: context.next_tile_id(),
            level: 0,
            quadrant: 0,
            extents,
            split_distance,
            skirt_height,
            parent: Weak::new(),
            context,
            state: Mutex::new(TileState {
                flags: dirty::VERTICES | dirty::IMAGE | dirty::VECTOR,
                tex_rect: TexCoordRect::FULL,
                image: None,
                textures: HashMap::new(),
                elevation: ElevationGrid::zero(rows, columns, extents),
                vector: VectorPatch::default(),
                mesh: None,
                children: [None, None, None, None],
                image_job: None,
                elevation_job: None,
                vector_job: None,
                split_job: None,
                attached: false,
            }),
        }))
    }

    fn new_child(
        parent: &Arc<Tile>,
        quadrant: usize,
        extents: Extents,
        tex_rect: TexCoordRect,
        image: Option<Arc<RgbaImage>>,
        elevation: ElevationGrid,
        flags: u32,
    ) -> Arc<Tile> {
        let context = Arc::clone(&parent.context);
        Arc::new(Tile {
            id: context.next_tile_id(),
            level: parent.level + 1,
            quadrant,
            extents,
            split_distance: parent.split_distance * 0.5,
            skirt_height: parent.skirt_height * 0.5,
            parent: Arc::downgrade(parent),
            context,
            state: Mutex::new(TileState {
                flags,
                tex_rect,
                image,
                textures: HashMap::new(),
                elevation,
                vector: VectorPatch::default(),
                mesh: None,
                children: [None, None, None, None],
                image_job: None,
                elevation_job: None,
                vector_job: None,
                split_job: None,
                attached: false,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn quadrant(&self) -> usize {
        self.quadrant
    }

    pub fn extents(&self) -> Extents {
        self.extents
    }

    pub fn split_distance(&self) -> f64 {
        self.split_distance
    }

    pub fn parent(&self) -> Option<Arc<Tile>> {
        self.parent.upgrade()
    }

    /// Split test. A tile exactly at its split distance does not split, and
    /// tiles at the maximum level never do.
    pub fn should_split(&self, view_distance: f64) -> bool {
        view_distance < self.split_distance && self.level < self.context.max_level
    }

    pub fn flags(&self) -> u32 {
        self.state.lock().unwrap().flags
    }

    pub fn has_mesh(&self) -> bool {
        self.state.lock().unwrap().mesh.is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().unwrap().attached
    }

    pub fn children(&self) -> [Option<Arc<Tile>>; 4] {
        self.state.lock().unwrap().children.clone()
    }

    /// The current composited (or inherited) imagery.
    pub fn image(&self) -> Option<Arc<RgbaImage>> {
        self.state.lock().unwrap().image.clone()
    }

    /// Vector features fetched for this tile.
    pub fn vector(&self) -> VectorPatch {
        self.state.lock().unwrap().vector.clone()
    }

    /// Cached texture for one raster layer, when this tile has composited
    /// (or inherited) it.
    pub fn texture(&self, layer: LayerId) -> Option<TextureData> {
        self.state.lock().unwrap().textures.get(&layer).cloned()
    }

    /// Elevation at a geographic position from this tile's grid.
    pub fn elevation_at(&self, lat: f64, lon: f64) -> f32 {
        self.state.lock().unwrap().elevation.sample(lat, lon)
    }

    /// True once every outstanding job reached a terminal status; a purged
    /// tile must satisfy this.
    pub fn jobs_terminal(&self) -> bool {
        let state = self.state.lock().unwrap();
        let terminal = [
            &state.image_job,
            &state.elevation_job,
            &state.vector_job,
            &state.split_job,
        ]
        .into_iter()
        .all(|slot| slot.as_ref().map(|job| job.is_terminal()).unwrap_or(true));
        terminal
    }

    /// Mark data stale (or fresh). With `bounding` given, a tile applies the
    /// change only when its extents intersect it; children are always
    /// visited so deeper tiles inside the region still catch it.
    pub fn dirty(&self, set: bool, flags: u32, recurse: bool, bounding: Option<&Extents>) {
        let applies = bounding
            .map(|region| self.extents.intersects(region))
            .unwrap_or(true);

        let children = {
            let mut state = self.state.lock().unwrap();
            if applies {
                if set {
                    state.flags |= flags;
                } else {
                    state.flags &= !flags;
                }
            }
            if recurse {
                state.children.clone()
            } else {
                [None, None, None, None]
            }
        };

        for child in children.into_iter().flatten() {
            child.dirty(set, flags, recurse, bounding);
        }
    }

    /// One frame of work for this subtree: drain finished jobs, issue new
    /// fetches within `budget`, rebuild stale geometry, split or collapse
    /// against the eye position, and keep the scene sink in step. Collapsed
    /// descendants are appended to `deleted` for deferred purging.
    pub fn update(self: &Arc<Self>, eye: DVec3, budget: &mut RequestBudget, deleted: &mut Vec<Arc<Tile>>) {
        let (distance_squared, children_present) = {
            let mut state = self.state.lock().unwrap();
            Self::drain_jobs(&mut state);
            self.launch_fetches(&mut state, budget);
            self.rebuild_mesh(&mut state);
            (
                state
                    .mesh
                    .as_ref()
                    .map(|mesh| mesh.smallest_distance_squared(eye)),
                state.children.iter().any(|child| child.is_some()),
            )
        };

        let wants_split = distance_squared
            .map(|d2| self.should_split(d2.sqrt()))
            .unwrap_or(false);

        let mut children_ready = false;
        if wants_split {
            if children_present {
                let children = self.children();
                children_ready = children
                    .iter()
                    .all(|child| child.as_ref().map(|c| c.has_mesh()).unwrap_or(false));
                for child in children.into_iter().flatten() {
                    child.update(eye, budget, deleted);
                }
            } else {
                let mut state = self.state.lock().unwrap();
                let idle = state
                    .split_job
                    .as_ref()
                    .map(|job| job.is_terminal())
                    .unwrap_or(true);
                if idle && budget.take() {
                    self.launch_split(&mut state);
                }
            }
        } else if children_present {
            self.collapse(deleted);
        }

        // A tile renders itself until its children can cover for it.
        let render_self = !wants_split || !children_ready;
        let mut state = self.state.lock().unwrap();
        if render_self {
            if let Some(mesh) = state.mesh.as_ref() {
                if !state.attached || state.flags & dirty::TEXTURE != 0 {
                    let image = state.image.as_ref().map(|img| (**img).clone());
                    self.context.scene.attach(self.id, mesh.bundle(image));
                    state.attached = true;
                    state.flags &= !dirty::TEXTURE;
                }
            }
        } else if state.attached {
            self.context.scene.detach(self.id);
            state.attached = false;
        }
    }

    /// Detach this subtree's children from the tree and the scene, cancel
    /// their jobs, and hand them to the caller for deferred deletion.
    pub fn collapse(self: &Arc<Self>, deleted: &mut Vec<Arc<Tile>>) {
        let children = {
            let mut state = self.state.lock().unwrap();
            state.flags |= dirty::CHILDREN;
            std::mem::replace(&mut state.children, [None, None, None, None])
        };
        for child in children.into_iter().flatten() {
            child.teardown(deleted);
        }
    }

    fn teardown(self: Arc<Self>, deleted: &mut Vec<Arc<Tile>>) {
        let children = {
            let mut state = self.state.lock().unwrap();
            for slot in [
                &state.image_job,
                &state.elevation_job,
                &state.vector_job,
                &state.split_job,
            ] {
                if let Some(job) = slot {
                    job.cancel();
                }
            }
            if state.attached {
                self.context.scene.detach(self.id);
                state.attached = false;
            }
            std::mem::replace(&mut state.children, [None, None, None, None])
        };
        for child in children.into_iter().flatten() {
            child.teardown(deleted);
        }
        deleted.push(self);
    }

    fn drain_jobs(state: &mut TileState) {
        for slot in [
            &mut state.image_job,
            &mut state.elevation_job,
            &mut state.vector_job,
        ] {
            if slot.as_ref().map(|job| job.is_terminal()).unwrap_or(false) {
                *slot = None;
            }
        }
        // The split slot is kept once terminal so a finished split is not
        // relaunched; launch_split replaces it explicitly.
        if state
            .split_job
            .as_ref()
            .map(|job| job.status() == crate::jobs::JobStatus::Cancelled)
            .unwrap_or(false)
        {
            state.split_job = None;
        }
    }

    fn launch_fetches(self: &Arc<Self>, state: &mut TileState, budget: &mut RequestBudget) {
        if state.flags & dirty::IMAGE != 0 {
            let has_layers = !self.context.rasters.lock().unwrap().is_empty();
            if !has_layers {
                state.image = None;
                state.textures.clear();
                state.tex_rect = TexCoordRect::FULL;
                state.flags &= !dirty::IMAGE;
                state.flags |= dirty::TEXTURE;
            } else if budget.take() {
                self.launch_image(state);
            }
        }

        if state.flags & dirty::VERTICES != 0 {
            let has_layers = !self.context.elevations.lock().unwrap().is_empty();
            if !has_layers {
                state.elevation =
                    ElevationGrid::zero(self.context.mesh_rows, self.context.mesh_columns, self.extents);
                state.mesh = None;
                state.flags &= !dirty::VERTICES;
            } else if budget.take() {
                self.launch_elevation(state);
            }
        }

        if state.flags & dirty::VECTOR != 0 {
            let has_layers = !self.context.vectors.lock().unwrap().is_empty();
            if !has_layers {
                state.vector = VectorPatch::default();
                state.flags &= !dirty::VECTOR;
            } else if budget.take() {
                self.launch_vector(state);
            }
        }
    }

    fn rebuild_mesh(&self, state: &mut TileState) {
        if state.mesh.is_some() && state.flags & dirty::TEX_COORDS == 0 {
            return;
        }
        let params = MeshParams {
            rows: self.context.mesh_rows,
            columns: self.context.mesh_columns,
            extents: self.extents,
            skirt_height: self.skirt_height,
            skirts: self.context.skirts,
            tex_rect: state.tex_rect,
            elevation: Some(&state.elevation),
        };
        match TileMesh::build(&params, self.context.land.as_ref()) {
            Ok(mesh) => {
                state.mesh = Some(Arc::new(mesh));
                state.flags &= !dirty::TEX_COORDS;
                state.flags |= dirty::TEXTURE;
            }
            Err(err) => {
                // Bad settings, not bad data; log once per rebuild attempt.
                log::error!("tile {} mesh build failed: {}", self.id, err);
                state.flags &= !dirty::TEX_COORDS;
            }
        }
    }

    /// Launch a raster composite job, cancelling any outstanding one. The
    /// freshest request always wins; the superseded job's result is
    /// discarded by the handle identity check on install.
    pub fn request_image(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        self.launch_image(&mut state);
    }

    fn launch_image(self: &Arc<Self>, state: &mut TileState) {
        if let Some(previous) = state.image_job.take() {
            previous.cancel();
        }
        state.flags &= !dirty::IMAGE;

        let weak = Arc::downgrade(self);
        let handle = self.context.jobs.submit(move |own| {
            let tile = match weak.upgrade() {
                Some(tile) => tile,
                None => return Ok(()),
            };
            Tile::run_image_job(&tile, own)
        });
        log::debug!("tile {} image job {} launched", self.id, handle.id());
        state.image_job = Some(handle);
    }

    fn run_image_job(tile: &Arc<Tile>, own: &JobHandle) -> EngineResult<()> {
        let context = &tile.context;
        let request = RasterRequest {
            extents: tile.extents,
            width: context.image_width,
            height: context.image_height,
            level: tile.level,
        };

        let (entries, generation): (Vec<(LayerId, Arc<dyn RasterLayer>)>, u64) = {
            let rasters = context.rasters.lock().unwrap();
            let entries = rasters
                .iter()
                .filter(|(_, layer)| {
                    let (lo, hi) = layer.level_range();
                    layer.extents().intersects(&tile.extents)
                        && tile.level >= lo
                        && tile.level <= hi
                })
                .map(|(id, layer)| (id, Arc::clone(layer)))
                .collect();
            (entries, rasters.generation())
        };

        if entries.is_empty() {
            let mut state = tile.state.lock().unwrap();
            if Self::is_current(&state.image_job, own) {
                state.image = None;
                state.textures.clear();
                state.tex_rect = TexCoordRect::FULL;
                state.flags |= dirty::TEXTURE;
            }
            return Ok(());
        }

        // Whole-composite disk cache short-circuits the fetches; the key
        // carries the registry generation, so entries from an older layer
        // set never match.
        if let Some(cached) = context
            .cache
            .as_ref()
            .and_then(|cache| cache.load(&request, generation))
        {
            let mut state = tile.state.lock().unwrap();
            if Self::is_current(&state.image_job, own) {
                state.image = Some(Arc::new(cached));
                state.tex_rect = TexCoordRect::FULL;
                state.flags |= dirty::TEX_COORDS | dirty::TEXTURE;
            }
            return Ok(());
        }

        let mut composite = RgbaImage::new(request.width, request.height);
        let mut textures: HashMap<LayerId, TextureData> = HashMap::new();
        let mut failures = 0usize;

        for (id, layer) in &entries {
            if own.is_cancelled() {
                return Ok(());
            }
            match layer.fetch(&request) {
                Ok(img) if img.dimensions() == (request.width, request.height) => {
                    blend_over(&mut composite, &img);
                    textures.insert(
                        *id,
                        TextureData {
                            image: Arc::new(img),
                            rect: TexCoordRect::FULL,
                        },
                    );
                }
                Ok(img) => {
                    log::warn!(
                        "tile {} layer {:?} returned {}x{}, wanted {}x{}",
                        tile.id,
                        id,
                        img.width(),
                        img.height(),
                        request.width,
                        request.height
                    );
                    failures += 1;
                }
                Err(err) => {
                    log::warn!("tile {} layer {:?} fetch failed: {}", tile.id, id, err);
                    // Fall back to the parent's texture for this layer,
                    // narrowed to our quadrant of it.
                    let fallback = tile
                        .parent()
                        .and_then(|parent| parent.texture(*id))
                        .map(|data| TextureData {
                            rect: data.rect.quarter(tile.quadrant),
                            image: data.image,
                        });
                    match fallback {
                        Some(data) => {
                            let crop = crop_scale(
                                &data.image,
                                data.rect.u0,
                                data.rect.u1,
                                data.rect.v0,
                                data.rect.v1,
                                request.width,
                                request.height,
                            );
                            blend_over(&mut composite, &crop);
                            textures.insert(*id, data);
                        }
                        None => failures += 1,
                    }
                }
            }
        }

        if own.is_cancelled() {
            return Ok(());
        }

        let complete = failures == 0;
        if complete {
            if let Some(cache) = context.cache.as_ref() {
                if let Err(err) = cache.store(&request, &composite, generation) {
                    log::warn!("tile {} cache store failed: {}", tile.id, err);
                }
            }
        }

        let mut state = tile.state.lock().unwrap();
        if !Self::is_current(&state.image_job, own) {
            log::debug!("tile {} discarding stale image job {}", tile.id, own.id());
            return Ok(());
        }
        state.image = Some(Arc::new(composite));
        state.textures = textures;
        state.tex_rect = TexCoordRect::FULL;
        state.flags |= dirty::TEX_COORDS | dirty::TEXTURE;
        if !complete {
            // Keep the flag set so a later frame retries the failed layers.
            state.flags |= dirty::IMAGE;
            drop(state);
            return Err(EngineError::data_fetch(format!(
                "{} of {} raster layers failed",
                failures,
                entries.len()
            )));
        }
        Ok(())
    }

    fn launch_elevation(self: &Arc<Self>, state: &mut TileState) {
        if let Some(previous) = state.elevation_job.take() {
            previous.cancel();
        }
        state.flags &= !dirty::VERTICES;

        let weak = Arc::downgrade(self);
        let handle = self.context.jobs.submit(move |own| {
            let tile = match weak.upgrade() {
                Some(tile) => tile,
                None => return Ok(()),
            };
            Tile::run_elevation_job(&tile, own)
        });
        state.elevation_job = Some(handle);
    }

    fn run_elevation_job(tile: &Arc<Tile>, own: &JobHandle) -> EngineResult<()> {
        let context = &tile.context;
        let request = ElevationRequest {
            extents: tile.extents,
            rows: context.mesh_rows,
            columns: context.mesh_columns,
            level: tile.level,
        };

        let entries: Vec<(LayerId, Arc<dyn ElevationLayer>)> = {
            let elevations = context.elevations.lock().unwrap();
            elevations
                .iter()
                .filter(|(_, layer)| layer.extents().intersects(&tile.extents))
                .map(|(id, layer)| (id, Arc::clone(layer)))
                .collect()
        };

        let mut grid = None;
        let mut failures = 0usize;
        for (id, layer) in &entries {
            if own.is_cancelled() {
                return Ok(());
            }
            match layer.fetch(&request) {
                // Registration order; the last successful layer wins.
                Ok(fetched) if fetched.rows() == request.rows && fetched.columns() == request.columns => {
                    grid = Some(fetched);
                }
                Ok(_) => {
                    log::warn!("tile {} elevation layer {:?} returned wrong grid size", tile.id, id);
                    failures += 1;
                }
                Err(err) => {
                    log::warn!("tile {} elevation layer {:?} failed: {}", tile.id, id, err);
                    failures += 1;
                }
            }
        }

        if own.is_cancelled() {
            return Ok(());
        }

        let mut state = tile.state.lock().unwrap();
        if !Self::is_current(&state.elevation_job, own) {
            return Ok(());
        }
        if let Some(grid) = grid {
            state.elevation = grid;
            state.mesh = None;
        }
        if failures > 0 {
            state.flags |= dirty::VERTICES;
            drop(state);
            return Err(EngineError::data_fetch(format!(
                "{} of {} elevation layers failed",
                failures,
                entries.len()
            )));
        }
        Ok(())
    }

    fn launch_vector(self: &Arc<Self>, state: &mut TileState) {
        if let Some(previous) = state.vector_job.take() {
            previous.cancel();
        }
        state.flags &= !dirty::VECTOR;

        let weak = Arc::downgrade(self);
        let handle = self.context.jobs.submit(move |own| {
            let tile = match weak.upgrade() {
                Some(tile) => tile,
                None => return Ok(()),
            };
            Tile::run_vector_job(&tile, own)
        });
        state.vector_job = Some(handle);
    }

    fn run_vector_job(tile: &Arc<Tile>, own: &JobHandle) -> EngineResult<()> {
        let entries: Vec<(LayerId, Arc<dyn VectorLayer>)> = {
            let vectors = tile.context.vectors.lock().unwrap();
            vectors
                .iter()
                .filter(|(_, layer)| layer.extents().intersects(&tile.extents))
                .map(|(id, layer)| (id, Arc::clone(layer)))
                .collect()
        };

        let mut patch = VectorPatch::default();
        let mut failures = 0usize;
        for (id, layer) in &entries {
            if own.is_cancelled() {
                return Ok(());
            }
            match layer.fetch(&tile.extents, tile.level) {
                Ok(fetched) => patch.append(fetched),
                Err(err) => {
                    log::warn!("tile {} vector layer {:?} failed: {}", tile.id, id, err);
                    failures += 1;
                }
            }
        }

        let mut state = tile.state.lock().unwrap();
        if !Self::is_current(&state.vector_job, own) {
            return Ok(());
        }
        state.vector = patch;
        if failures > 0 {
            state.flags |= dirty::VECTOR;
            drop(state);
            return Err(EngineError::data_fetch(format!(
                "{} of {} vector layers failed",
                failures,
                entries.len()
            )));
        }
        Ok(())
    }

    fn launch_split(self: &Arc<Self>, state: &mut TileState) {
        if let Some(previous) = state.split_job.take() {
            previous.cancel();
        }

        let weak = Arc::downgrade(self);
        let handle = self.context.jobs.submit(move |own| {
            let tile = match weak.upgrade() {
                Some(tile) => tile,
                None => return Ok(()),
            };
            Tile::run_split_job(&tile, own)
        });
        log::debug!("tile {} split job {} launched", self.id, handle.id());
        state.split_job = Some(handle);
    }

    fn run_split_job(tile: &Arc<Tile>, own: &JobHandle) -> EngineResult<()> {
        if tile.level >= tile.context.max_level {
            return Ok(());
        }

        let (parent_rect, parent_image, parent_elevation) = {
            let state = tile.state.lock().unwrap();
            if state.children.iter().any(|child| child.is_some()) {
                return Ok(());
            }
            (state.tex_rect, state.image.clone(), state.elevation.clone())
        };

        // Children refine elevation only when a source exists; otherwise
        // the resampled placeholder is their final grid and must survive.
        let mut child_flags = dirty::IMAGE | dirty::VECTOR;
        if !tile.context.elevations.lock().unwrap().is_empty() {
            child_flags |= dirty::VERTICES;
        }

        let child_extents = tile.extents.split();
        let mut built: [Option<Arc<Tile>>; 4] = [None, None, None, None];
        for (quadrant, extents) in child_extents.into_iter().enumerate() {
            if own.is_cancelled() {
                return Ok(());
            }
            // Children start with the parent's imagery narrowed to their
            // quadrant and a resampled quarter of its elevation, so they can
            // render before their own fetches land.
            let (tex_rect, image) = match parent_image.as_ref() {
                Some(image) => (parent_rect.quarter(quadrant), Some(Arc::clone(image))),
                None => (TexCoordRect::FULL, None),
            };
            let elevation = parent_elevation.resample(&extents);
            built[quadrant] = Some(Tile::new_child(
                tile,
                quadrant,
                extents,
                tex_rect,
                image,
                elevation,
                child_flags,
            ));
        }

        let mut state = tile.state.lock().unwrap();
        if !Self::is_current(&state.split_job, own) {
            return Ok(());
        }
        if state.children.iter().any(|child| child.is_some()) {
            return Ok(());
        }
        state.children = built;
        state.flags &= !dirty::CHILDREN;
        Ok(())
    }

    fn is_current(slot: &Option<Arc<JobHandle>>, own: &JobHandle) -> bool {
        slot.as_ref().map(|job| job.id()) == Some(own.id())
    }
}

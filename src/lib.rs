//! quadglobe: streaming level-of-detail tile engine for virtual globes
//!
//! A [`Body`](body::Body) owns a quadtree of surface [`Tile`](tile::Tile)s
//! that split and collapse with view distance. Raster, elevation and vector
//! content arrives asynchronously through provider traits on a worker pool;
//! finished tiles hand skirted grid meshes to a
//! [`SceneSink`](scene::SceneSink) the render host implements. The engine
//! itself never blocks the render thread and never touches a GPU.

pub mod body;
pub mod cache;
pub mod error;
pub mod geo;
pub mod index;
pub mod jobs;
pub mod land;
pub mod layers;
pub mod scene;
pub mod tile;

pub use body::{Body, BodyConfig};
pub use error::{EngineError, EngineResult};
pub use geo::Extents;
pub use index::QuadTreeIndex;
pub use jobs::{JobHandle, JobManager, JobStatus};
pub use land::{FlatLandModel, LandModel, SphereLandModel};
pub use layers::{ElevationGrid, ElevationLayer, LayerId, RasterLayer, VectorLayer};
pub use scene::{GeometryBundle, SceneSink, SceneVertex};
pub use tile::{dirty, RequestBudget, TexCoordRect, Tile, TileMesh};

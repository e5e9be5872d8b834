//! Scene sink seam
//!
//! The engine never talks to a GPU. Finished tile geometry is packed into a
//! [`GeometryBundle`] and handed to whatever implements [`SceneSink`]; the
//! render host owns upload, draw and eviction. [`RecordingSink`] is an
//! in-memory implementation for tests and headless runs.

use std::collections::HashMap;
use std::sync::Mutex;

use glam::DVec3;
use image::RgbaImage;

/// Packed vertex stream element handed to the render host
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SceneVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub texcoord: [f32; 2],
}

/// Renderable payload for one tile
#[derive(Debug, Clone)]
pub struct GeometryBundle {
    /// Double-precision anchor; vertex positions are relative to it.
    pub origin: DVec3,
    pub vertices: Vec<SceneVertex>,
    /// Triangle-strip index lists into `vertices`.
    pub strips: Vec<Vec<u32>>,
    /// Composited imagery, when the tile has any.
    pub image: Option<RgbaImage>,
}

/// Render-host seam for tile geometry
pub trait SceneSink: Send + Sync {
    /// Install or replace the bundle for a tile.
    fn attach(&self, tile_id: u64, bundle: GeometryBundle);

    /// Remove a tile's bundle. Detaching an unknown tile is a no-op.
    fn detach(&self, tile_id: u64);
}

/// What happened, in order, for assertions in tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneEvent {
    Attached(u64),
    Detached(u64),
}

#[derive(Default)]
struct RecordingState {
    bundles: HashMap<u64, GeometryBundle>,
    events: Vec<SceneEvent>,
}

/// In-memory sink that records every attach/detach
#[derive(Default)]
pub struct RecordingSink {
    state: Mutex<RecordingState>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_attached(&self, tile_id: u64) -> bool {
        self.state.lock().unwrap().bundles.contains_key(&tile_id)
    }

    pub fn attached_count(&self) -> usize {
        self.state.lock().unwrap().bundles.len()
    }

    pub fn events(&self) -> Vec<SceneEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn bundle_vertex_count(&self, tile_id: u64) -> Option<usize> {
        self.state
            .lock()
            .unwrap()
            .bundles
            .get(&tile_id)
            .map(|bundle| bundle.vertices.len())
    }
}

impl SceneSink for RecordingSink {
    fn attach(&self, tile_id: u64, bundle: GeometryBundle) {
        let mut state = self.state.lock().unwrap();
        state.bundles.insert(tile_id, bundle);
        state.events.push(SceneEvent::Attached(tile_id));
    }

    fn detach(&self, tile_id: u64) {
        let mut state = self.state.lock().unwrap();
        if state.bundles.remove(&tile_id).is_some() {
            state.events.push(SceneEvent::Detached(tile_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> GeometryBundle {
        GeometryBundle {
            origin: DVec3::ZERO,
            vertices: vec![SceneVertex {
                position: [0.0; 3],
                normal: [0.0, 0.0, 1.0],
                texcoord: [0.0; 2],
            }],
            strips: vec![vec![0]],
            image: None,
        }
    }

    #[test]
    fn test_attach_replace_detach() {
        let sink = RecordingSink::new();
        sink.attach(7, bundle());
        assert!(sink.is_attached(7));
        sink.attach(7, bundle());
        assert_eq!(sink.attached_count(), 1);

        sink.detach(7);
        assert!(!sink.is_attached(7));
        // Detaching twice records a single event.
        sink.detach(7);
        assert_eq!(
            sink.events(),
            vec![
                SceneEvent::Attached(7),
                SceneEvent::Attached(7),
                SceneEvent::Detached(7)
            ]
        );
    }

    #[test]
    fn test_scene_vertex_is_pod() {
        let v = SceneVertex {
            position: [1.0, 2.0, 3.0],
            normal: [0.0, 0.0, 1.0],
            texcoord: [0.5, 0.5],
        };
        let bytes: &[u8] = bytemuck::bytes_of(&v);
        assert_eq!(bytes.len(), 32);
    }
}

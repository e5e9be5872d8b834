//! Data layer providers and registries
//!
//! Raster, elevation and vector content reaches the engine through provider
//! traits. Providers return `anyhow::Result` so implementations can bubble
//! whatever I/O errors they hit; the engine folds failures into
//! `EngineError::DataFetch` at the job boundary and treats them as
//! retryable. Each kind of provider lives in a [`LayerStack`] that hands out
//! stable ids and preserves registration order, which is also compositing
//! order.

use std::sync::Arc;

use glam::DVec2;
use image::{Rgba, RgbaImage};

use crate::geo::Extents;

/// Stable identifier for a registered layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u32);

/// Parameters for one raster fetch
#[derive(Debug, Clone)]
pub struct RasterRequest {
    pub extents: Extents,
    pub width: u32,
    pub height: u32,
    pub level: u32,
}

/// Parameters for one elevation fetch
#[derive(Debug, Clone)]
pub struct ElevationRequest {
    pub extents: Extents,
    pub rows: u32,
    pub columns: u32,
    pub level: u32,
}

/// Source of raster imagery
pub trait RasterLayer: Send + Sync {
    /// Geographic coverage; tiles outside it skip this layer.
    fn extents(&self) -> Extents;

    /// Inclusive quadtree level range this layer contributes to.
    fn level_range(&self) -> (u32, u32) {
        (0, u32::MAX)
    }

    /// Produce an RGBA image covering exactly `request.extents`.
    fn fetch(&self, request: &RasterRequest) -> anyhow::Result<RgbaImage>;
}

/// Source of terrain elevation samples
pub trait ElevationLayer: Send + Sync {
    fn extents(&self) -> Extents;

    /// Produce a grid of elevations covering exactly `request.extents`.
    fn fetch(&self, request: &ElevationRequest) -> anyhow::Result<ElevationGrid>;
}

/// Source of per-tile vector features
pub trait VectorLayer: Send + Sync {
    fn extents(&self) -> Extents;

    fn fetch(&self, extents: &Extents, level: u32) -> anyhow::Result<VectorPatch>;
}

/// Polyline features clipped to one tile
#[derive(Debug, Clone, Default)]
pub struct VectorPatch {
    pub polylines: Vec<Vec<DVec2>>,
}

impl VectorPatch {
    pub fn is_empty(&self) -> bool {
        self.polylines.is_empty()
    }

    /// Merge another patch's features into this one.
    pub fn append(&mut self, mut other: VectorPatch) {
        self.polylines.append(&mut other.polylines);
    }
}

/// Row-major grid of elevation samples over an extents
#[derive(Debug, Clone)]
pub struct ElevationGrid {
    rows: u32,
    columns: u32,
    extents: Extents,
    values: Vec<f32>,
}

impl ElevationGrid {
    /// All-zero grid, the placeholder before any elevation data arrives.
    pub fn zero(rows: u32, columns: u32, extents: Extents) -> Self {
        Self {
            rows,
            columns,
            extents,
            values: vec![0.0; (rows * columns) as usize],
        }
    }

    /// Grid from row-major samples; `values.len()` must be `rows * columns`.
    pub fn from_values(rows: u32, columns: u32, extents: Extents, values: Vec<f32>) -> Self {
        assert_eq!(values.len(), (rows * columns) as usize);
        Self {
            rows,
            columns,
            extents,
            values,
        }
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn extents(&self) -> &Extents {
        &self.extents
    }

    /// Sample at a grid coordinate. Row 0 is the southern edge.
    pub fn value(&self, row: u32, column: u32) -> f32 {
        self.values[(row * self.columns + column) as usize]
    }

    pub fn set_value(&mut self, row: u32, column: u32, value: f32) {
        self.values[(row * self.columns + column) as usize] = value;
    }

    /// Bilinear sample at a geographic position, clamped to the grid.
    pub fn sample(&self, lat: f64, lon: f64) -> f32 {
        let size = self.extents.size();
        let u = if size.x > 0.0 {
            ((lon - self.extents.minimum().x) / size.x).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let v = if size.y > 0.0 {
            ((lat - self.extents.minimum().y) / size.y).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let fc = u * (self.columns - 1) as f64;
        let fr = v * (self.rows - 1) as f64;
        let c0 = fc.floor() as u32;
        let r0 = fr.floor() as u32;
        let c1 = (c0 + 1).min(self.columns - 1);
        let r1 = (r0 + 1).min(self.rows - 1);
        let tc = (fc - c0 as f64) as f32;
        let tr = (fr - r0 as f64) as f32;

        let bottom = self.value(r0, c0) * (1.0 - tc) + self.value(r0, c1) * tc;
        let top = self.value(r1, c0) * (1.0 - tc) + self.value(r1, c1) * tc;
        bottom * (1.0 - tr) + top * tr
    }

    /// Resample one quadrant into a same-sized grid, used to seed children
    /// with placeholder elevation until their own fetch lands.
    pub fn resample(&self, target: &Extents) -> ElevationGrid {
        let mut out = ElevationGrid::zero(self.rows, self.columns, *target);
        let size = target.size();
        for row in 0..self.rows {
            let v = row as f64 / (self.rows - 1).max(1) as f64;
            let lat = target.minimum().y + v * size.y;
            for column in 0..self.columns {
                let u = column as f64 / (self.columns - 1).max(1) as f64;
                let lon = target.minimum().x + u * size.x;
                out.set_value(row, column, self.sample(lat, lon));
            }
        }
        out
    }
}

/// Registered layer with its id
pub struct LayerEntry<T: ?Sized> {
    pub id: LayerId,
    pub layer: Arc<T>,
}

/// Ordered registry of layers of one kind
pub struct LayerStack<T: ?Sized> {
    layers: Vec<LayerEntry<T>>,
    next_id: u32,
    generation: u64,
}

impl<T: ?Sized> Default for LayerStack<T> {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            next_id: 0,
            generation: 0,
        }
    }
}

impl<T: ?Sized> LayerStack<T> {
    /// Register a layer. Returns its id; order of registration is
    /// compositing order.
    pub fn add(&mut self, layer: Arc<T>) -> LayerId {
        let id = LayerId(self.next_id);
        self.next_id += 1;
        self.layers.push(LayerEntry { id, layer });
        self.generation += 1;
        id
    }

    /// Remove a layer by id. Returns the layer if it was present.
    pub fn remove(&mut self, id: LayerId) -> Option<Arc<T>> {
        let pos = self.layers.iter().position(|entry| entry.id == id)?;
        self.generation += 1;
        Some(self.layers.remove(pos).layer)
    }

    /// Monotonic counter covering every membership change and every `touch`.
    /// Cached composites derived from this stack key on it, so stale entries
    /// stop matching once the stack mutates.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record an in-place content change of some registered layer.
    pub fn touch(&mut self) {
        self.generation += 1;
    }

    pub fn get(&self, id: LayerId) -> Option<Arc<T>> {
        self.layers
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| Arc::clone(&entry.layer))
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayerId, &Arc<T>)> {
        self.layers.iter().map(|entry| (entry.id, &entry.layer))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Source-over blend of `src` onto `dst`; sizes must match.
pub fn blend_over(dst: &mut RgbaImage, src: &RgbaImage) {
    debug_assert_eq!(dst.dimensions(), src.dimensions());
    for (d, s) in dst.pixels_mut().zip(src.pixels()) {
        let sa = s[3] as u32;
        if sa == 255 {
            *d = *s;
            continue;
        }
        if sa == 0 {
            continue;
        }
        let da = d[3] as u32;
        let out_a = sa + da * (255 - sa) / 255;
        let mut out = Rgba([0, 0, 0, out_a as u8]);
        if out_a > 0 {
            for i in 0..3 {
                let sc = s[i] as u32;
                let dc = d[i] as u32;
                out[i] = ((sc * sa + dc * da * (255 - sa) / 255) / out_a) as u8;
            }
        }
        *d = out;
    }
}

/// Nearest-neighbour resample of a normalized sub-rectangle of `src` into a
/// `width` x `height` image. Texcoord v runs bottom-up while image rows run
/// top-down, hence the flip. Used to derive a child tile's placeholder
/// imagery from its parent's texture.
pub fn crop_scale(
    src: &RgbaImage,
    u0: f64,
    u1: f64,
    v0: f64,
    v1: f64,
    width: u32,
    height: u32,
) -> RgbaImage {
    let (sw, sh) = src.dimensions();
    let mut out = RgbaImage::new(width, height);
    for y in 0..height {
        // Output row 0 is the top of the image, v1 end of the rectangle.
        let v = v1 - (y as f64 + 0.5) / height as f64 * (v1 - v0);
        let sy = ((1.0 - v) * sh as f64 - 0.5)
            .round()
            .clamp(0.0, (sh - 1) as f64) as u32;
        for x in 0..width {
            let u = u0 + (x as f64 + 0.5) / width as f64 * (u1 - u0);
            let sx = (u * sw as f64 - 0.5).round().clamp(0.0, (sw - 1) as f64) as u32;
            out.put_pixel(x, y, *src.get_pixel(sx, sy));
        }
    }
    out
}

/// Solid-color raster fill over a fixed extents
pub struct SolidRasterLayer {
    extents: Extents,
    color: Rgba<u8>,
    level_range: (u32, u32),
}

impl SolidRasterLayer {
    pub fn new(extents: Extents, color: [u8; 4]) -> Self {
        Self {
            extents,
            color: Rgba(color),
            level_range: (0, u32::MAX),
        }
    }

    pub fn with_level_range(mut self, min: u32, max: u32) -> Self {
        self.level_range = (min, max);
        self
    }
}

impl RasterLayer for SolidRasterLayer {
    fn extents(&self) -> Extents {
        self.extents
    }

    fn level_range(&self) -> (u32, u32) {
        self.level_range
    }

    fn fetch(&self, request: &RasterRequest) -> anyhow::Result<RgbaImage> {
        Ok(RgbaImage::from_pixel(
            request.width,
            request.height,
            self.color,
        ))
    }
}

/// Constant elevation over a fixed extents
pub struct ConstantElevationLayer {
    extents: Extents,
    elevation: f32,
}

impl ConstantElevationLayer {
    pub fn new(extents: Extents, elevation: f32) -> Self {
        Self { extents, elevation }
    }
}

impl ElevationLayer for ConstantElevationLayer {
    fn extents(&self) -> Extents {
        self.extents
    }

    fn fetch(&self, request: &ElevationRequest) -> anyhow::Result<ElevationGrid> {
        let mut grid = ElevationGrid::zero(request.rows, request.columns, request.extents);
        for row in 0..request.rows {
            for column in 0..request.columns {
                grid.set_value(row, column, self.elevation);
            }
        }
        Ok(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extents(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Extents {
        Extents::new(min_x, min_y, max_x, max_y).unwrap()
    }

    #[test]
    fn test_layer_stack_order_and_removal() {
        let mut stack: LayerStack<dyn RasterLayer> = LayerStack::default();
        let e = extents(0.0, 0.0, 10.0, 10.0);
        let a = stack.add(Arc::new(SolidRasterLayer::new(e, [255, 0, 0, 255])));
        let b = stack.add(Arc::new(SolidRasterLayer::new(e, [0, 255, 0, 255])));
        assert_ne!(a, b);
        assert_eq!(stack.len(), 2);

        let order: Vec<LayerId> = stack.iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![a, b]);

        assert!(stack.remove(a).is_some());
        assert!(stack.remove(a).is_none());
        assert_eq!(stack.len(), 1);
        assert!(stack.get(b).is_some());
    }

    #[test]
    fn test_generation_tracks_mutations() {
        let mut stack: LayerStack<dyn RasterLayer> = LayerStack::default();
        let e = extents(0.0, 0.0, 10.0, 10.0);
        let g0 = stack.generation();
        let id = stack.add(Arc::new(SolidRasterLayer::new(e, [0, 0, 0, 255])));
        assert!(stack.generation() > g0);

        let g1 = stack.generation();
        stack.touch();
        assert!(stack.generation() > g1);

        let g2 = stack.generation();
        assert!(stack.remove(id).is_some());
        assert!(stack.generation() > g2);

        // A failed removal is not a mutation.
        let g3 = stack.generation();
        assert!(stack.remove(id).is_none());
        assert_eq!(stack.generation(), g3);
    }

    #[test]
    fn test_elevation_grid_bilinear_sample() {
        let e = extents(0.0, 0.0, 10.0, 10.0);
        let mut grid = ElevationGrid::zero(2, 2, e);
        grid.set_value(0, 0, 0.0);
        grid.set_value(0, 1, 10.0);
        grid.set_value(1, 0, 20.0);
        grid.set_value(1, 1, 30.0);

        assert_eq!(grid.sample(0.0, 0.0), 0.0);
        assert_eq!(grid.sample(10.0, 10.0), 30.0);
        assert!((grid.sample(5.0, 5.0) - 15.0).abs() < 1e-6);
        // Clamped outside the extents.
        assert_eq!(grid.sample(-5.0, -5.0), 0.0);
    }

    #[test]
    fn test_resample_quadrant_of_linear_field() {
        let e = extents(0.0, 0.0, 10.0, 10.0);
        let mut grid = ElevationGrid::zero(3, 3, e);
        for row in 0..3 {
            for column in 0..3 {
                // Linear in lon: 0, 5, 10 across columns.
                grid.set_value(row, column, column as f32 * 5.0);
            }
        }
        let quadrant = extents(0.0, 0.0, 5.0, 5.0);
        let child = grid.resample(&quadrant);
        assert_eq!(child.rows(), 3);
        assert!((child.sample(2.5, 2.5) - 2.5).abs() < 1e-5);
        assert!((child.value(0, 2) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_blend_over_opaque_and_transparent() {
        let mut dst = RgbaImage::from_pixel(2, 1, Rgba([10, 20, 30, 255]));
        let src = RgbaImage::from_pixel(2, 1, Rgba([200, 100, 50, 255]));
        blend_over(&mut dst, &src);
        assert_eq!(dst.get_pixel(0, 0), &Rgba([200, 100, 50, 255]));

        let clear = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 0]));
        blend_over(&mut dst, &clear);
        assert_eq!(dst.get_pixel(0, 0), &Rgba([200, 100, 50, 255]));
    }

    #[test]
    fn test_blend_over_half_alpha() {
        let mut dst = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 255]));
        let src = RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 128]));
        blend_over(&mut dst, &src);
        let p = dst.get_pixel(0, 0);
        assert_eq!(p[3], 255);
        // Roughly half-way grey after source-over.
        assert!(p[0] >= 126 && p[0] <= 130, "got {}", p[0]);
    }

    #[test]
    fn test_crop_scale_quadrant() {
        // 2x2 source: top row red/green, bottom row blue/white.
        let mut src = RgbaImage::new(2, 2);
        src.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        src.put_pixel(1, 0, Rgba([0, 255, 0, 255]));
        src.put_pixel(0, 1, Rgba([0, 0, 255, 255]));
        src.put_pixel(1, 1, Rgba([255, 255, 255, 255]));

        // Lower-left quadrant in texcoords is the bottom-left pixel (blue).
        let out = crop_scale(&src, 0.0, 0.5, 0.0, 0.5, 2, 2);
        for pixel in out.pixels() {
            assert_eq!(pixel, &Rgba([0, 0, 255, 255]));
        }

        // Upper-right quadrant is green.
        let out = crop_scale(&src, 0.5, 1.0, 0.5, 1.0, 2, 2);
        for pixel in out.pixels() {
            assert_eq!(pixel, &Rgba([0, 255, 0, 255]));
        }
    }

    #[test]
    fn test_solid_layer_fetch_dimensions() {
        let e = extents(0.0, 0.0, 10.0, 10.0);
        let layer = SolidRasterLayer::new(e, [1, 2, 3, 4]);
        let img = layer
            .fetch(&RasterRequest {
                extents: e,
                width: 8,
                height: 4,
                level: 0,
            })
            .unwrap();
        assert_eq!(img.dimensions(), (8, 4));
        assert_eq!(img.get_pixel(3, 3), &Rgba([1, 2, 3, 4]));
    }
}

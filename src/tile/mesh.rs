//! Skirted grid mesh for one tile
//!
//! A tile's surface is a row-major grid of vertices plus one "skirt" twin
//! per vertex, dropped by the skirt height so neighbouring tiles at
//! different detail levels never show a gap. The surface is one triangle
//! strip per adjacent row pair; the skirts are four border strips welding
//! each edge vertex to its twin. Building is pure: the same inputs always
//! produce the same mesh.

use glam::DVec3;

use crate::error::{EngineError, EngineResult};
use crate::geo::Extents;
use crate::land::LandModel;
use crate::layers::ElevationGrid;
use crate::scene::{GeometryBundle, SceneVertex};

/// Texture sub-rectangle a tile samples from an inherited image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexCoordRect {
    pub u0: f64,
    pub u1: f64,
    pub v0: f64,
    pub v1: f64,
}

impl TexCoordRect {
    /// The whole image.
    pub const FULL: TexCoordRect = TexCoordRect {
        u0: 0.0,
        u1: 1.0,
        v0: 0.0,
        v1: 1.0,
    };

    /// Quadrant sub-rectangle, indexed lower-left, lower-right, upper-left,
    /// upper-right to match child ordering.
    pub fn quarter(&self, quadrant: usize) -> TexCoordRect {
        let half_u = self.u0 + (self.u1 - self.u0) * 0.5;
        let half_v = self.v0 + (self.v1 - self.v0) * 0.5;
        match quadrant {
            0 => TexCoordRect {
                u0: self.u0,
                u1: half_u,
                v0: self.v0,
                v1: half_v,
            },
            1 => TexCoordRect {
                u0: half_u,
                u1: self.u1,
                v0: self.v0,
                v1: half_v,
            },
            2 => TexCoordRect {
                u0: self.u0,
                u1: half_u,
                v0: half_v,
                v1: self.v1,
            },
            _ => TexCoordRect {
                u0: half_u,
                u1: self.u1,
                v0: half_v,
                v1: self.v1,
            },
        }
    }
}

/// Build parameters for one tile mesh
pub struct MeshParams<'a> {
    pub rows: u32,
    pub columns: u32,
    pub extents: Extents,
    pub skirt_height: f64,
    /// Emit the four skirt border strips.
    pub skirts: bool,
    pub tex_rect: TexCoordRect,
    pub elevation: Option<&'a ElevationGrid>,
}

/// Immutable built mesh, swapped wholesale into the scene
#[derive(Debug, Clone)]
pub struct TileMesh {
    rows: u32,
    columns: u32,
    origin: DVec3,
    vertices: Vec<SceneVertex>,
    strips: Vec<Vec<u32>>,
    corners: [DVec3; 4],
    bound_center: DVec3,
}

impl TileMesh {
    pub fn build(params: &MeshParams, land: &dyn LandModel) -> EngineResult<TileMesh> {
        let rows = params.rows;
        let columns = params.columns;
        if rows < 2 || columns < 2 {
            return Err(EngineError::invalid_mesh(format!(
                "grid must be at least 2x2, got {}x{}",
                rows, columns
            )));
        }
        if params.extents.is_empty() {
            return Err(EngineError::invalid_mesh("empty extents"));
        }
        if !params.skirt_height.is_finite() || params.skirt_height < 0.0 {
            return Err(EngineError::invalid_mesh(format!(
                "bad skirt height {}",
                params.skirt_height
            )));
        }

        let num_vertices = (rows * columns) as usize;
        let mut points = vec![DVec3::ZERO; num_vertices * 2];
        let mut normals = vec![DVec3::ZERO; num_vertices * 2];
        let mut texcoords = vec![[0.0f32; 2]; num_vertices * 2];

        let mn = params.extents.minimum();
        let mx = params.extents.maximum();
        let delta_u = params.tex_rect.u1 - params.tex_rect.u0;
        let delta_v = params.tex_rect.v1 - params.tex_rect.v0;

        let mut lo = DVec3::splat(f64::INFINITY);
        let mut hi = DVec3::splat(f64::NEG_INFINITY);

        for i in 0..rows {
            let u = 1.0 - i as f64 / (rows - 1) as f64;
            for j in 0..columns {
                let v = j as f64 / (columns - 1) as f64;

                let lon = mn.x + u * (mx.x - mn.x);
                let lat = mn.y + v * (mx.y - mn.y);

                let elevation = params
                    .elevation
                    .map(|grid| grid.sample(lat, lon) as f64)
                    .unwrap_or(0.0);

                // Lower-left corner of the sub-rectangle is (u0, v0).
                let s = (params.tex_rect.u0 + u * delta_u).clamp(0.0, 1.0) as f32;
                let t = (params.tex_rect.v0 + v * delta_v).clamp(0.0, 1.0) as f32;

                let index = (i * columns + j) as usize;
                let p = land.lat_lon_height_to_xyz(lat, lon, elevation);
                let n = land.surface_normal(p);
                points[index] = p;
                normals[index] = n;
                texcoords[index] = [s, t];
                lo = lo.min(p);
                hi = hi.max(p);

                // Skirt twin: same normal and texcoord, dropped elevation.
                let p_skirt =
                    land.lat_lon_height_to_xyz(lat, lon, elevation - params.skirt_height);
                points[index + num_vertices] = p_skirt;
                normals[index + num_vertices] = n;
                texcoords[index + num_vertices] = [s, t];
                lo = lo.min(p_skirt);
                hi = hi.max(p_skirt);
            }
        }

        // Anchor everything to the first skirt point so the f32 vertex
        // stream stays small relative to its origin.
        let origin = points[num_vertices];
        let vertices: Vec<SceneVertex> = points
            .iter()
            .zip(normals.iter())
            .zip(texcoords.iter())
            .map(|((p, n), t)| SceneVertex {
                position: (*p - origin).as_vec3().to_array(),
                normal: n.as_vec3().to_array(),
                texcoord: *t,
            })
            .collect();

        // One strip per adjacent row pair.
        let mut strips: Vec<Vec<u32>> = Vec::with_capacity((rows - 1) as usize + 4);
        for i in 0..rows - 1 {
            let mut strip = Vec::with_capacity((columns * 2) as usize);
            for j in 0..columns {
                strip.push((i + 1) * columns + j);
                strip.push(i * columns + j);
            }
            strips.push(strip);
        }

        // Border skirts, one strip per edge, alternating twin and surface.
        if params.skirts {
            let nv = num_vertices as u32;
            let mut ab = Vec::with_capacity((columns * 2) as usize);
            let mut cd = Vec::with_capacity((columns * 2) as usize);
            for j in 0..columns {
                ab.push((rows - 1) * columns + j + nv);
                ab.push((rows - 1) * columns + j);
                cd.push(j + nv);
                cd.push(j);
            }
            let mut bc = Vec::with_capacity((rows * 2) as usize);
            let mut da = Vec::with_capacity((rows * 2) as usize);
            for i in 0..rows {
                bc.push(i * columns + (columns - 1) + nv);
                bc.push(i * columns + (columns - 1));
                da.push(i * columns + nv);
                da.push(i * columns);
            }
            strips.push(ab);
            strips.push(bc);
            strips.push(cd);
            strips.push(da);
        }

        let corners = [
            points[0],
            points[(columns - 1) as usize],
            points[((rows - 1) * columns) as usize],
            points[((rows - 1) * columns + columns - 1) as usize],
        ];
        let bound_center = (lo + hi) * 0.5;

        Ok(TileMesh {
            rows,
            columns,
            origin,
            vertices,
            strips,
            corners,
            bound_center,
        })
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    pub fn vertices(&self) -> &[SceneVertex] {
        &self.vertices
    }

    pub fn strips(&self) -> &[Vec<u32>] {
        &self.strips
    }

    /// Squared distance from `eye` to the nearest of the four corners and
    /// the bounding center; drives the split decision.
    pub fn smallest_distance_squared(&self, eye: DVec3) -> f64 {
        let mut best = (self.bound_center - eye).length_squared();
        for corner in &self.corners {
            best = best.min((*corner - eye).length_squared());
        }
        best
    }

    /// Package for the scene sink.
    pub fn bundle(&self, image: Option<image::RgbaImage>) -> GeometryBundle {
        GeometryBundle {
            origin: self.origin,
            vertices: self.vertices.clone(),
            strips: self.strips.clone(),
            image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::land::{FlatLandModel, SphereLandModel};

    fn extents() -> Extents {
        Extents::new(0.0, 0.0, 10.0, 10.0).unwrap()
    }

    fn params(extents: Extents) -> MeshParams<'static> {
        MeshParams {
            rows: 3,
            columns: 4,
            extents,
            skirt_height: 100.0,
            skirts: true,
            tex_rect: TexCoordRect::FULL,
            elevation: None,
        }
    }

    #[test]
    fn test_vertex_and_strip_counts() {
        let mesh = TileMesh::build(&params(extents()), &FlatLandModel).unwrap();
        // Doubled for skirt twins.
        assert_eq!(mesh.vertices().len(), 3 * 4 * 2);
        // rows-1 surface strips plus 4 skirts.
        assert_eq!(mesh.strips().len(), 2 + 4);
        assert_eq!(mesh.strips()[0].len(), 4 * 2);
        // Every index is in range.
        for strip in mesh.strips() {
            for &index in strip {
                assert!((index as usize) < mesh.vertices().len());
            }
        }
    }

    #[test]
    fn test_degenerate_grid_rejected() {
        let mut p = params(extents());
        p.rows = 1;
        assert!(TileMesh::build(&p, &FlatLandModel).is_err());
    }

    #[test]
    fn test_zero_elevation_zero_skirt_is_flat() {
        let mut p = params(extents());
        p.skirt_height = 0.0;
        let mesh = TileMesh::build(&p, &FlatLandModel).unwrap();
        // Flat model maps elevation to world Z; origin Z is zero too, so
        // every relative Z must be exactly zero.
        assert_eq!(mesh.origin().z, 0.0);
        for vertex in mesh.vertices() {
            assert_eq!(vertex.position[2], 0.0);
        }
    }

    #[test]
    fn test_skirt_twin_shares_normal_and_texcoord() {
        let mesh = TileMesh::build(&params(extents()), &FlatLandModel).unwrap();
        let num_vertices = mesh.vertices().len() / 2;
        for index in 0..num_vertices {
            let surface = &mesh.vertices()[index];
            let skirt = &mesh.vertices()[index + num_vertices];
            assert_eq!(surface.normal, skirt.normal);
            assert_eq!(surface.texcoord, skirt.texcoord);
            assert!((surface.position[2] - skirt.position[2] - 100.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_texcoords_cover_sub_rectangle_clamped() {
        let mut p = params(extents());
        p.tex_rect = TexCoordRect {
            u0: 0.5,
            u1: 1.0,
            v0: 0.0,
            v1: 0.5,
        };
        let mesh = TileMesh::build(&p, &FlatLandModel).unwrap();
        for vertex in mesh.vertices() {
            assert!(vertex.texcoord[0] >= 0.5 && vertex.texcoord[0] <= 1.0);
            assert!(vertex.texcoord[1] >= 0.0 && vertex.texcoord[1] <= 0.5);
        }
    }

    #[test]
    fn test_quarter_rects_partition() {
        let full = TexCoordRect::FULL;
        assert_eq!(
            full.quarter(0),
            TexCoordRect {
                u0: 0.0,
                u1: 0.5,
                v0: 0.0,
                v1: 0.5
            }
        );
        assert_eq!(
            full.quarter(3),
            TexCoordRect {
                u0: 0.5,
                u1: 1.0,
                v0: 0.5,
                v1: 1.0
            }
        );
        // Quartering a quarter keeps nesting.
        let ll = full.quarter(0).quarter(1);
        assert_eq!(
            ll,
            TexCoordRect {
                u0: 0.25,
                u1: 0.5,
                v0: 0.0,
                v1: 0.25
            }
        );
    }

    #[test]
    fn test_deterministic() {
        let grid = ElevationGrid::zero(3, 4, extents());
        let mut p = params(extents());
        p.elevation = Some(&grid);
        let a = TileMesh::build(&p, &SphereLandModel::earth()).unwrap();
        let b = TileMesh::build(&p, &SphereLandModel::earth()).unwrap();
        assert_eq!(
            bytemuck::cast_slice::<_, u8>(a.vertices()),
            bytemuck::cast_slice::<_, u8>(b.vertices())
        );
        assert_eq!(a.strips(), b.strips());
    }

    #[test]
    fn test_distance_metric_at_corner() {
        let mesh = TileMesh::build(&params(extents()), &FlatLandModel).unwrap();
        let eye = DVec3::new(0.0, 0.0, 0.0);
        assert!(mesh.smallest_distance_squared(eye) < 1e-9);
        let far = DVec3::new(1000.0, 1000.0, 0.0);
        assert!(mesh.smallest_distance_squared(far) > 1e5);
    }

    #[test]
    fn test_skirts_can_be_disabled() {
        let mut p = params(extents());
        p.skirts = false;
        let mesh = TileMesh::build(&p, &FlatLandModel).unwrap();
        assert_eq!(mesh.strips().len(), 2);
        // Twins are still allocated so indexing stays uniform.
        assert_eq!(mesh.vertices().len(), 3 * 4 * 2);
    }
}

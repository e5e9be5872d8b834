//! Land model capability
//!
//! Maps geographic coordinates (degrees, meters above the reference
//! surface) to model-space XYZ and back. The full ellipsoid geodesy lives
//! in the render host; the engine only needs the mapping seam, so the
//! bundled implementations are a sphere and a flat plane.

use glam::{DMat4, DVec3};

/// Coordinate mapping between (lat, lon, elevation) and model XYZ
pub trait LandModel: Send + Sync {
    /// Model-space position for a geographic coordinate.
    fn lat_lon_height_to_xyz(&self, lat: f64, lon: f64, elevation: f64) -> DVec3;

    /// Geographic coordinate for a model-space position.
    fn xyz_to_lat_lon_height(&self, point: DVec3) -> (f64, f64, f64);

    /// Outward surface normal at a model-space position.
    fn surface_normal(&self, point: DVec3) -> DVec3;

    /// Local east-north-up frame at a geographic coordinate, translated to
    /// the model-space point at `height` and post-rotated by `heading`
    /// degrees about the local up axis.
    fn rotation_matrix_at(&self, lat: f64, lon: f64, height: f64, heading: f64) -> DMat4;
}

/// Spherical globe of a fixed radius
pub struct SphereLandModel {
    radius: f64,
}

impl SphereLandModel {
    pub const EARTH_RADIUS: f64 = 6_378_137.0;

    pub fn new(radius: f64) -> Self {
        Self { radius }
    }

    pub fn earth() -> Self {
        Self::new(Self::EARTH_RADIUS)
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }
}

impl LandModel for SphereLandModel {
    fn lat_lon_height_to_xyz(&self, lat: f64, lon: f64, elevation: f64) -> DVec3 {
        let lat = lat.to_radians();
        let lon = lon.to_radians();
        let r = self.radius + elevation;
        DVec3::new(
            r * lat.cos() * lon.cos(),
            r * lat.cos() * lon.sin(),
            r * lat.sin(),
        )
    }

    fn xyz_to_lat_lon_height(&self, point: DVec3) -> (f64, f64, f64) {
        let r = point.length();
        if r == 0.0 {
            return (0.0, 0.0, -self.radius);
        }
        let lat = (point.z / r).asin().to_degrees();
        let lon = point.y.atan2(point.x).to_degrees();
        (lat, lon, r - self.radius)
    }

    fn surface_normal(&self, point: DVec3) -> DVec3 {
        point.normalize_or_zero()
    }

    fn rotation_matrix_at(&self, lat: f64, lon: f64, height: f64, heading: f64) -> DMat4 {
        let point = self.lat_lon_height_to_xyz(lat, lon, height);
        let up = self.lat_lon_height_to_xyz(lat, lon, 0.0).normalize_or_zero();
        let east = DVec3::Z.cross(up).normalize_or_zero();
        // At the poles "east" degenerates; any tangent frame will do there.
        let east = if east.length_squared() == 0.0 {
            DVec3::X
        } else {
            east
        };
        let north = up.cross(east);
        let frame = DMat4::from_cols(
            east.extend(0.0),
            north.extend(0.0),
            up.extend(0.0),
            point.extend(1.0),
        );
        // Up is the frame's local Z, so the heading spin composes on the
        // right.
        frame * DMat4::from_rotation_z(heading.to_radians())
    }
}

/// Planar model: lon maps to X, lat to Y, elevation to Z
pub struct FlatLandModel;

impl LandModel for FlatLandModel {
    fn lat_lon_height_to_xyz(&self, lat: f64, lon: f64, elevation: f64) -> DVec3 {
        DVec3::new(lon, lat, elevation)
    }

    fn xyz_to_lat_lon_height(&self, point: DVec3) -> (f64, f64, f64) {
        (point.y, point.x, point.z)
    }

    fn surface_normal(&self, _point: DVec3) -> DVec3 {
        DVec3::Z
    }

    fn rotation_matrix_at(&self, lat: f64, lon: f64, height: f64, heading: f64) -> DMat4 {
        DMat4::from_translation(DVec3::new(lon, lat, height))
            * DMat4::from_rotation_z(heading.to_radians())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sphere_round_trip() {
        let model = SphereLandModel::earth();
        let xyz = model.lat_lon_height_to_xyz(45.0, 90.0, 1000.0);
        let (lat, lon, h) = model.xyz_to_lat_lon_height(xyz);
        assert!((lat - 45.0).abs() < 1e-9);
        assert!((lon - 90.0).abs() < 1e-9);
        assert!((h - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_sphere_equator_positions() {
        let model = SphereLandModel::new(1.0);
        let p = model.lat_lon_height_to_xyz(0.0, 0.0, 0.0);
        assert!((p - DVec3::X).length() < 1e-12);
        let p = model.lat_lon_height_to_xyz(90.0, 0.0, 0.0);
        assert!((p - DVec3::Z).length() < 1e-12);
    }

    #[test]
    fn test_sphere_normal_is_radial() {
        let model = SphereLandModel::new(1.0);
        let p = model.lat_lon_height_to_xyz(30.0, 60.0, 0.5);
        let n = model.surface_normal(p);
        assert!((n.length() - 1.0).abs() < 1e-12);
        assert!((n - p.normalize()).length() < 1e-12);
    }

    #[test]
    fn test_flat_model() {
        let model = FlatLandModel;
        let p = model.lat_lon_height_to_xyz(2.0, 3.0, 4.0);
        assert_eq!(p, DVec3::new(3.0, 2.0, 4.0));
        assert_eq!(model.surface_normal(p), DVec3::Z);
        assert_eq!(model.xyz_to_lat_lon_height(p), (2.0, 3.0, 4.0));
    }

    #[test]
    fn test_rotation_frame_is_orthonormal() {
        let model = SphereLandModel::earth();
        let m = model.rotation_matrix_at(45.0, 45.0, 0.0, 0.0);
        let east = m.x_axis.truncate();
        let north = m.y_axis.truncate();
        let up = m.z_axis.truncate();
        assert!((east.length() - 1.0).abs() < 1e-12);
        assert!(east.dot(north).abs() < 1e-12);
        assert!((east.cross(north) - up).length() < 1e-12);
    }

    #[test]
    fn test_rotation_frame_translates_to_height() {
        let model = SphereLandModel::earth();
        let m = model.rotation_matrix_at(30.0, -60.0, 2500.0, 0.0);
        let expected = model.lat_lon_height_to_xyz(30.0, -60.0, 2500.0);
        assert!((m.w_axis.truncate() - expected).length() < 1e-6);
    }

    #[test]
    fn test_heading_spins_about_up() {
        let model = FlatLandModel;
        let m = model.rotation_matrix_at(2.0, 3.0, 4.0, 90.0);
        assert!((m.w_axis.truncate() - DVec3::new(3.0, 2.0, 4.0)).length() < 1e-12);
        // A quarter turn carries the frame's X onto world Y.
        assert!((m.x_axis.truncate() - DVec3::Y).length() < 1e-12);
        assert!((m.z_axis.truncate() - DVec3::Z).length() < 1e-12);
    }
}

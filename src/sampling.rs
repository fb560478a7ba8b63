use std::f32::consts::PI;

use glam::{Quat, Vec2, Vec3};
use rand::rngs::SmallRng;

/// Random stream owned by a single pixel for the whole render
pub type PixelRng = SmallRng;

pub const UNIFORM_SPHERE_PDF: f32 = 1.0 / (4.0 * PI);

/// Rotates a direction given around +z so that +z maps onto `axis`
pub fn to_world(local: Vec3, axis: Vec3) -> Vec3 {
    Quat::from_rotation_arc(Vec3::Z, axis).mul_vec3(local)
}

/// Builds a unit vector from its cosine to `axis` and the azimuth around it
pub fn direction_around(axis: Vec3, cos_theta: f32, phi: f32) -> Vec3 {
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    to_world(
        Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta),
        axis,
    )
}

/// Cosine-weighted hemisphere sample around the normal, pdf cos / pi
pub fn cosine_hemisphere(normal: Vec3, u: Vec2) -> Vec3 {
    let r = u.x.sqrt();
    let theta = 2.0 * PI * u.y;

    let x = r * theta.cos();
    let y = r * theta.sin();
    let z = (1.0 - x * x - y * y).max(0.0).sqrt();

    to_world(Vec3::new(x, y, z), normal)
}

pub fn uniform_sphere(u: Vec2) -> Vec3 {
    direction_around(Vec3::Z, 1.0 - 2.0 * u.x, 2.0 * PI * u.y)
}

/// Azimuth of a direction around +z, in [0, 2pi)
pub fn azimuth(direction: Vec3) -> f32 {
    let phi = direction.y.atan2(direction.x);
    if phi < 0.0 {
        phi + 2.0 * PI
    } else {
        phi
    }
}

pub fn luminance(rgb: Vec3) -> f32 {
    rgb.dot(Vec3::new(0.2126, 0.7152, 0.0722))
}

pub fn power_heuristic(pdf: f32, other_pdf: f32) -> f32 {
    let pdf_sq = pdf * pdf;
    let sum = pdf_sq + other_pdf * other_pdf;
    if sum > 0.0 {
        pdf_sq / sum
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn cosine_samples_stay_above_surface() {
        let mut rng = PixelRng::seed_from_u64(3);
        let normal = Vec3::new(0.3, -0.9, 0.1).normalize();
        for _ in 0..1000 {
            let direction = cosine_hemisphere(normal, Vec2::new(rng.gen(), rng.gen()));
            assert!(direction.dot(normal) >= -1e-5);
            assert!((direction.length() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn rotation_handles_opposite_axis() {
        let direction = to_world(Vec3::Z, -Vec3::Z);
        assert!((direction + Vec3::Z).length() < 1e-5);
    }

    #[test]
    fn azimuth_wraps_to_positive_range() {
        let phi = azimuth(Vec3::new(0.0, -1.0, 0.0));
        assert!((phi - 1.5 * PI).abs() < 1e-5);
    }
}

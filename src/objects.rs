use std::f32::consts::{FRAC_1_PI, PI};

use glam::{Vec2, Vec3};

use crate::sampling::{cosine_hemisphere, direction_around};

const FLOAT_ERROR: f32 = 0.0001;

pub trait Object: Sync {
    fn intersect(&self, ray: &Ray) -> Option<Hit>;
    fn bounds(&self) -> Bounds;
    fn material(&self) -> &dyn Material;
    fn area(&self) -> f32;
    /// Uniformly samples a point and its normal on the surface
    fn sample_surface(&self, u: Vec2) -> (Vec3, Vec3);
}

pub trait Material: Sync {
    /// Samples an incoming direction for light leaving along `outgoing`
    fn sample_direction(&self, normal: Vec3, outgoing: Vec3, u: Vec2) -> Option<BsdfSample>;
    /// Solid angle density of `sample_direction` producing `incoming`
    fn direction_pdf(&self, incoming: Vec3, outgoing: Vec3, normal: Vec3) -> f32;
    /// BSDF times the cosine of the incoming direction
    fn bsdf_multiplier(&self, incoming: Vec3, outgoing: Vec3, normal: Vec3) -> Vec3;
    fn emitted(&self) -> Vec3;

    fn is_specular(&self) -> bool {
        false
    }

    fn supports_guiding(&self) -> bool {
        !self.is_specular()
    }
}

pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

/// Surface hit; the normal always faces the side the ray came from
#[derive(Clone, Copy, Debug)]
pub struct Hit {
    pub distance: f32,
    pub point: Vec3,
    pub normal: Vec3,
    pub id: usize,
}

pub struct BsdfSample {
    pub direction: Vec3,
    pub pdf: f32,
    /// BSDF times cosine over pdf
    pub weight: Vec3,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

pub struct DiffuseMaterial {
    reflectance: Vec3,
    emission: Vec3,
}

/// Normalized Phong lobe around the mirror direction
pub struct GlossyMaterial {
    reflectance: Vec3,
    exponent: f32,
    emission: Vec3,
}

pub struct MirrorMaterial {
    reflectance: Vec3,
    emission: Vec3,
}

pub struct Sphere {
    center: Vec3,
    radius: f32,
    material: Box<dyn Material>,
}

pub struct Triangle {
    point1: Vec3,
    point2: Vec3,
    point3: Vec3,
    material: Box<dyn Material>,
}

pub struct Quad {
    corner: Vec3,
    u: Vec3,
    v: Vec3,
    material: Box<dyn Material>,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Ray {
            origin,
            direction: direction.normalize(),
        }
    }

    pub fn at(&self, distance: f32) -> Vec3 {
        self.origin + distance * self.direction
    }
}

impl Bounds {
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }
}

fn reflect(outgoing: Vec3, normal: Vec3) -> Vec3 {
    2.0 * outgoing.dot(normal) * normal - outgoing
}

fn face_towards(normal: Vec3, ray: &Ray) -> Vec3 {
    if normal.dot(ray.direction) > 0.0 {
        -normal
    } else {
        normal
    }
}

impl DiffuseMaterial {
    pub fn new(reflectance: Vec3, emission: Vec3) -> Self {
        DiffuseMaterial {
            reflectance,
            emission,
        }
    }
}

impl Material for DiffuseMaterial {
    fn sample_direction(&self, normal: Vec3, _outgoing: Vec3, u: Vec2) -> Option<BsdfSample> {
        let direction = cosine_hemisphere(normal, u);
        let pdf = direction.dot(normal).max(0.0) * FRAC_1_PI;
        if pdf <= 0.0 {
            return None;
        }

        Some(BsdfSample {
            direction,
            pdf,
            weight: self.reflectance,
        })
    }

    fn direction_pdf(&self, incoming: Vec3, _outgoing: Vec3, normal: Vec3) -> f32 {
        incoming.dot(normal).max(0.0) * FRAC_1_PI
    }

    fn bsdf_multiplier(&self, incoming: Vec3, _outgoing: Vec3, normal: Vec3) -> Vec3 {
        self.reflectance * FRAC_1_PI * incoming.dot(normal).max(0.0)
    }

    fn emitted(&self) -> Vec3 {
        self.emission
    }
}

impl GlossyMaterial {
    pub fn new(reflectance: Vec3, exponent: f32, emission: Vec3) -> Self {
        GlossyMaterial {
            reflectance,
            exponent: exponent.max(0.0),
            emission,
        }
    }

    fn lobe_cosine(&self, incoming: Vec3, outgoing: Vec3, normal: Vec3) -> f32 {
        reflect(outgoing, normal).dot(incoming).max(0.0)
    }
}

impl Material for GlossyMaterial {
    fn sample_direction(&self, normal: Vec3, outgoing: Vec3, u: Vec2) -> Option<BsdfSample> {
        let cos_alpha = u.x.powf(1.0 / (self.exponent + 1.0));
        let direction = direction_around(reflect(outgoing, normal), cos_alpha, 2.0 * PI * u.y);

        // Lobe mass below the surface is absorbed
        if direction.dot(normal) <= 0.0 {
            return None;
        }

        let pdf = self.direction_pdf(direction, outgoing, normal);
        if pdf <= 0.0 {
            return None;
        }

        Some(BsdfSample {
            direction,
            pdf,
            weight: self.bsdf_multiplier(direction, outgoing, normal) / pdf,
        })
    }

    fn direction_pdf(&self, incoming: Vec3, outgoing: Vec3, normal: Vec3) -> f32 {
        if incoming.dot(normal) <= 0.0 {
            return 0.0;
        }

        let cos_alpha = self.lobe_cosine(incoming, outgoing, normal);
        (self.exponent + 1.0) / (2.0 * PI) * cos_alpha.powf(self.exponent)
    }

    fn bsdf_multiplier(&self, incoming: Vec3, outgoing: Vec3, normal: Vec3) -> Vec3 {
        let cos_theta = incoming.dot(normal);
        if cos_theta <= 0.0 {
            return Vec3::ZERO;
        }

        let cos_alpha = self.lobe_cosine(incoming, outgoing, normal);
        self.reflectance * (self.exponent + 2.0) / (2.0 * PI)
            * cos_alpha.powf(self.exponent)
            * cos_theta
    }

    fn emitted(&self) -> Vec3 {
        self.emission
    }
}

impl MirrorMaterial {
    pub fn new(reflectance: Vec3, emission: Vec3) -> Self {
        MirrorMaterial {
            reflectance,
            emission,
        }
    }
}

impl Material for MirrorMaterial {
    fn sample_direction(&self, normal: Vec3, outgoing: Vec3, _u: Vec2) -> Option<BsdfSample> {
        Some(BsdfSample {
            direction: reflect(outgoing, normal),
            pdf: 1.0,
            weight: self.reflectance,
        })
    }

    fn direction_pdf(&self, _incoming: Vec3, _outgoing: Vec3, _normal: Vec3) -> f32 {
        0.0
    }

    fn bsdf_multiplier(&self, _incoming: Vec3, _outgoing: Vec3, _normal: Vec3) -> Vec3 {
        Vec3::ZERO
    }

    fn emitted(&self) -> Vec3 {
        self.emission
    }

    fn is_specular(&self) -> bool {
        true
    }
}

impl Sphere {
    pub fn new(center: Vec3, radius: f32, material: Box<dyn Material>) -> Self {
        Sphere {
            center,
            radius,
            material,
        }
    }
}

impl Object for Sphere {
    fn intersect(&self, ray: &Ray) -> Option<Hit> {
        let b = (2.0 * ray.direction).dot(ray.origin - self.center);
        let c = (ray.origin - self.center).length_squared() - self.radius * self.radius;
        let discriminant = b * b - 4.0 * c;

        if discriminant < 0.0 {
            return None;
        }

        let sqrt_discriminant = discriminant.sqrt();
        let first_hit = (-b - sqrt_discriminant) / 2.0;
        let second_hit = (-b + sqrt_discriminant) / 2.0;

        let distance = if first_hit > FLOAT_ERROR {
            first_hit
        } else if second_hit > FLOAT_ERROR {
            second_hit
        } else {
            return None;
        };

        let point = ray.at(distance);
        Some(Hit {
            distance,
            point,
            normal: face_towards((point - self.center).normalize(), ray),
            id: 0,
        })
    }

    fn bounds(&self) -> Bounds {
        Bounds {
            min: self.center - Vec3::splat(self.radius),
            max: self.center + Vec3::splat(self.radius),
        }
    }

    fn material(&self) -> &dyn Material {
        &*self.material
    }

    fn area(&self) -> f32 {
        4.0 * PI * self.radius * self.radius
    }

    fn sample_surface(&self, u: Vec2) -> (Vec3, Vec3) {
        let normal = direction_around(Vec3::Z, 1.0 - 2.0 * u.x, 2.0 * PI * u.y);
        (self.center + self.radius * normal, normal)
    }
}

impl Triangle {
    pub fn new(point1: Vec3, point2: Vec3, point3: Vec3, material: Box<dyn Material>) -> Self {
        Triangle {
            point1,
            point2,
            point3,
            material,
        }
    }
}

impl Object for Triangle {
    fn intersect(&self, ray: &Ray) -> Option<Hit> {
        intersect_triangle(ray, self.point1, self.point2, self.point3).map(|(distance, normal)| {
            Hit {
                distance,
                point: ray.at(distance),
                normal: face_towards(normal, ray),
                id: 0,
            }
        })
    }

    fn bounds(&self) -> Bounds {
        Bounds {
            min: self.point1.min(self.point2.min(self.point3)),
            max: self.point1.max(self.point2.max(self.point3)),
        }
    }

    fn material(&self) -> &dyn Material {
        &*self.material
    }

    fn area(&self) -> f32 {
        0.5 * (self.point2 - self.point1)
            .cross(self.point3 - self.point1)
            .length()
    }

    fn sample_surface(&self, u: Vec2) -> (Vec3, Vec3) {
        let root = u.x.sqrt();
        let b1 = 1.0 - root;
        let b2 = u.y * root;
        let point = b1 * self.point1 + b2 * self.point2 + (1.0 - b1 - b2) * self.point3;
        let normal = (self.point3 - self.point1)
            .cross(self.point2 - self.point1)
            .normalize();
        (point, normal)
    }
}

impl Quad {
    pub fn new(corner: Vec3, u: Vec3, v: Vec3, material: Box<dyn Material>) -> Self {
        Quad {
            corner,
            u,
            v,
            material,
        }
    }
}

impl Object for Quad {
    fn intersect(&self, ray: &Ray) -> Option<Hit> {
        let normal = self.u.cross(self.v);
        let denominator = normal.dot(ray.direction);
        if denominator.abs() < FLOAT_ERROR {
            return None;
        }

        let distance = normal.dot(self.corner - ray.origin) / denominator;
        if distance < FLOAT_ERROR {
            return None;
        }

        let point = ray.at(distance);
        let planar = point - self.corner;
        let w = normal / normal.length_squared();
        let alpha = w.dot(planar.cross(self.v));
        let beta = w.dot(self.u.cross(planar));
        if !(0.0..=1.0).contains(&alpha) || !(0.0..=1.0).contains(&beta) {
            return None;
        }

        Some(Hit {
            distance,
            point,
            normal: face_towards(normal.normalize(), ray),
            id: 0,
        })
    }

    fn bounds(&self) -> Bounds {
        let far = self.corner + self.u + self.v;
        let points = [self.corner + self.u, self.corner + self.v, far];
        points.iter().fold(
            Bounds {
                min: self.corner,
                max: self.corner,
            },
            |bounds, point| Bounds {
                min: bounds.min.min(*point),
                max: bounds.max.max(*point),
            },
        )
    }

    fn material(&self) -> &dyn Material {
        &*self.material
    }

    fn area(&self) -> f32 {
        self.u.cross(self.v).length()
    }

    fn sample_surface(&self, u: Vec2) -> (Vec3, Vec3) {
        (
            self.corner + u.x * self.u + u.y * self.v,
            self.u.cross(self.v).normalize(),
        )
    }
}

fn intersect_triangle(ray: &Ray, p1: Vec3, p2: Vec3, p3: Vec3) -> Option<(f32, Vec3)> {
    let side1 = p2 - p1;
    let side2 = p3 - p1;

    let ray_cross_side2 = ray.direction.cross(side2);
    let denominator = side1.dot(ray_cross_side2);
    if denominator.abs() < FLOAT_ERROR {
        return None;
    }

    let fraction = denominator.recip();
    let p1_to_origin = ray.origin - p1;
    let u = fraction * p1_to_origin.dot(ray_cross_side2);
    if u < 0.0 {
        return None;
    }

    let p1_to_origin_cross_side1 = p1_to_origin.cross(side1);
    let v = fraction * ray.direction.dot(p1_to_origin_cross_side1);
    let hit_distance = fraction * side2.dot(p1_to_origin_cross_side1);
    let normal = side2.cross(side1).normalize();

    if v < 0.0 || u + v > 1.0 || hit_distance < FLOAT_ERROR {
        None
    } else {
        Some((hit_distance, normal))
    }
}

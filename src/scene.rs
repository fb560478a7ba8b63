use glam::{Vec2, Vec3};

use crate::objects::{Bounds, Hit, Object, Ray};

pub struct Camera {
    pub world_origin: Vec3,
    pub world_width: f32,
    pub world_height: f32,
    pub world_position: Vec3,
    pub world_u: Vec3,
    pub world_v: Vec3,
}

pub struct Scene {
    pub cameras: Vec<Camera>,
    pub objects: Vec<Box<dyn Object>>,
    pub lights: Vec<usize>,
    pub environment: Vec3,
}

/// A point sampled on an emitter, as seen from a shading point
pub struct LightSample {
    pub ray: Ray,
    pub pdf: f32,
    pub emission: Vec3,
}

impl Camera {
    pub fn new(
        film_dimensions: [u32; 2],
        origin: Vec3,
        look_at: Vec3,
        up: Vec3,
        field_of_view: f32,
    ) -> Self {
        let world_width = 2.0;
        let world_height = world_width * (film_dimensions[1] as f32) / (film_dimensions[0] as f32);
        let focal_length = (field_of_view / 2.0).to_radians().tan().recip();

        let world_forwards = (look_at - origin).normalize();
        let world_left = world_forwards.cross(up).normalize();
        let world_up = world_left.cross(world_forwards).normalize();

        let world_u = world_up.cross(world_forwards);
        let world_v = world_up;

        let world_position = origin
            + (-world_width * world_u / 2.0)
            + (-world_height * world_v / 2.0)
            + focal_length * world_forwards;

        Camera {
            world_origin: origin,
            world_width,
            world_height,
            world_position,
            world_u,
            world_v,
        }
    }

    /// Image size for a given vertical resolution, keeping the film aspect ratio
    pub fn image_size(&self, resolution: u32) -> (u32, u32) {
        let aspect = self.world_width / self.world_height;
        let width = ((resolution as f32) * aspect).round().max(1.0) as u32;
        (width, resolution)
    }

    /// Ray through film coordinates in [0, 1]^2, with (0, 0) at the top left
    pub fn ray(&self, film: Vec2) -> Ray {
        let film_point = self.world_position
            + film.x * self.world_width * self.world_u
            + (1.0 - film.y) * self.world_height * self.world_v;
        Ray::new(self.world_origin, film_point - self.world_origin)
    }
}

impl Scene {
    pub fn new(cameras: Vec<Camera>, objects: Vec<Box<dyn Object>>, environment: Vec3) -> Self {
        let lights = objects
            .iter()
            .enumerate()
            .filter(|(_, object)| {
                object.material().emitted().max_element() > 0.0 && object.area() > 0.0
            })
            .map(|(id, _)| id)
            .collect();

        Scene {
            cameras,
            objects,
            lights,
            environment,
        }
    }

    pub fn object_id(&self, id: usize) -> &dyn Object {
        &*self.objects[id]
    }

    pub fn trace_ray(&self, ray: &Ray) -> Option<Hit> {
        let mut closest: Option<Hit> = None;
        for (id, object) in self.objects.iter().enumerate() {
            let Some(mut hit) = object.intersect(ray) else {
                continue;
            };

            if closest.map_or(true, |best| hit.distance < best.distance) {
                hit.id = id;
                closest = Some(hit);
            }
        }

        closest
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.objects
            .iter()
            .map(|object| object.bounds())
            .reduce(|total, bounds| total.union(&bounds))
    }

    /// Picks an emitter uniformly and a point on it uniformly by area
    pub fn sample_lights(&self, point: Vec3, u_light: f32, u_surface: Vec2) -> Option<LightSample> {
        if self.lights.is_empty() {
            return None;
        }

        let index = ((u_light * self.lights.len() as f32) as usize).min(self.lights.len() - 1);
        let light = self.object_id(self.lights[index]);
        let (light_point, light_normal) = light.sample_surface(u_surface);

        let to_light = light_point - point;
        let distance = to_light.length();
        if distance <= 0.0 {
            return None;
        }

        let ray = Ray::new(point, to_light);
        let cos_light = light_normal.dot(ray.direction).abs();
        if cos_light <= 0.0 {
            return None;
        }

        let pdf = distance * distance / (cos_light * light.area() * self.lights.len() as f32);
        if !pdf.is_finite() {
            return None;
        }

        // Shadow test stops just short of the sampled point
        if let Some(blocker) = self.trace_ray(&ray) {
            if blocker.distance < distance * (1.0 - 1e-3) {
                return None;
            }
        }

        Some(LightSample {
            ray,
            pdf,
            emission: light.material().emitted(),
        })
    }

    /// Solid angle density with which `sample_lights` from `point` would produce `hit`
    pub fn light_pdf(&self, point: Vec3, hit: &Hit) -> f32 {
        if !self.lights.contains(&hit.id) {
            return 0.0;
        }

        let to_hit = hit.point - point;
        let distance_sq = to_hit.length_squared();
        let cos_light = hit.normal.dot(to_hit.normalize()).abs();
        if cos_light <= 0.0 {
            return 0.0;
        }

        distance_sq / (cos_light * self.object_id(hit.id).area() * self.lights.len() as f32)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::objects::{DiffuseMaterial, Quad, Sphere};

    fn diffuse(reflectance: Vec3) -> Box<DiffuseMaterial> {
        Box::new(DiffuseMaterial::new(reflectance, Vec3::ZERO))
    }

    /// Closed box with a small ceiling light, open towards the camera
    pub fn cornell_box() -> Scene {
        let white = Vec3::splat(0.7);
        let walls: Vec<Box<dyn Object>> = vec![
            Box::new(Quad::new(
                Vec3::new(-1.0, -1.0, -1.0),
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(0.0, 0.0, 2.0),
                diffuse(white),
            )),
            Box::new(Quad::new(
                Vec3::new(-1.0, 1.0, -1.0),
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(0.0, 0.0, 2.0),
                diffuse(white),
            )),
            Box::new(Quad::new(
                Vec3::new(-1.0, -1.0, 1.0),
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(0.0, 2.0, 0.0),
                diffuse(white),
            )),
            Box::new(Quad::new(
                Vec3::new(-1.0, -1.0, -1.0),
                Vec3::new(0.0, 2.0, 0.0),
                Vec3::new(0.0, 0.0, 2.0),
                diffuse(Vec3::new(0.7, 0.1, 0.1)),
            )),
            Box::new(Quad::new(
                Vec3::new(1.0, -1.0, -1.0),
                Vec3::new(0.0, 2.0, 0.0),
                Vec3::new(0.0, 0.0, 2.0),
                diffuse(Vec3::new(0.1, 0.7, 0.1)),
            )),
            Box::new(Quad::new(
                Vec3::new(-0.25, 0.99, -0.25),
                Vec3::new(0.5, 0.0, 0.0),
                Vec3::new(0.0, 0.0, 0.5),
                Box::new(DiffuseMaterial::new(Vec3::ZERO, Vec3::splat(12.0))),
            )),
            Box::new(Sphere::new(
                Vec3::new(-0.4, -0.6, 0.2),
                0.4,
                diffuse(white),
            )),
        ];

        let camera = Camera::new(
            [1, 1],
            Vec3::new(0.0, 0.0, -3.5),
            Vec3::ZERO,
            Vec3::Y,
            40.0,
        );
        Scene::new(vec![camera], walls, Vec3::ZERO)
    }

    /// Single grey sphere lit by a uniform white environment
    pub fn furnace(albedo: f32) -> Scene {
        let objects: Vec<Box<dyn Object>> = vec![Box::new(Sphere::new(
            Vec3::new(0.0, 0.0, 3.0),
            1.0,
            diffuse(Vec3::splat(albedo)),
        ))];
        let camera = Camera::new([1, 1], Vec3::ZERO, Vec3::Z, Vec3::Y, 60.0);
        Scene::new(vec![camera], objects, Vec3::ONE)
    }

    #[test]
    fn emitters_become_lights() {
        let scene = cornell_box();
        assert_eq!(scene.lights, vec![5]);
        assert!(furnace(0.5).lights.is_empty());
    }

    #[test]
    fn center_ray_looks_forward() {
        let scene = furnace(0.5);
        let ray = scene.cameras[0].ray(Vec2::splat(0.5));
        assert!((ray.direction - Vec3::Z).length() < 1e-5);
        assert_eq!(scene.cameras[0].image_size(64), (64, 64));
    }

    #[test]
    fn light_pdf_matches_sampled_pdf() {
        let scene = cornell_box();
        let point = Vec3::new(0.2, -0.99, 0.3);
        let sample = scene
            .sample_lights(point, 0.5, Vec2::new(0.3, 0.6))
            .expect("light visible from the floor");
        let hit = scene.trace_ray(&sample.ray).unwrap();
        assert_eq!(hit.id, 5);
        let pdf = scene.light_pdf(point, &hit);
        assert!((pdf - sample.pdf).abs() < 1e-2 * sample.pdf);
    }

    #[test]
    fn bounds_cover_every_object() {
        let bounds = cornell_box().bounds().unwrap();
        assert!(bounds.min.cmple(Vec3::splat(-1.0)).all());
        assert!(bounds.max.cmpge(Vec3::splat(1.0)).all());
    }
}

use glam::{Vec2, Vec3};
use rand::Rng;

use crate::{
    guiding::{
        adjust_pdf_for_guiding, combine_pdf, GuidingDecision, GuidingField, RadianceSample,
        SurfaceSamplingDistribution,
    },
    objects::{Hit, Material, Ray},
    sampling::{power_heuristic, PixelRng},
    scene::Scene,
};

const ROULETTE_START: u32 = 3;
const ROULETTE_MAX_CONTINUE: f32 = 0.9;

/// Vertex whose incident radiance is reported to the guiding field once the path ends
struct GuidedVertex {
    position: Vec3,
    direction: Vec3,
    pdf: f32,
    incident_before: Vec3,
    throughput_after: Vec3,
}

/// Next direction chosen at a vertex, with the throughput multiplier it implies
struct Scattering {
    direction: Vec3,
    pdf: f32,
    weight: Vec3,
    specular: bool,
}

/// Estimates the radiance arriving along a camera ray. Vertices that can be guided
/// append their incident radiance to `recorded` while the field is still training.
///
/// Recorded radiance comes from a separate sum of what the scattered rays found,
/// with emitter hits counted at full strength and light samples left out, so the
/// field learns unweighted incident radiance.
pub fn radiance(
    ray: Ray,
    scene: &Scene,
    guiding: Option<&GuidingField>,
    max_bounces: u32,
    rng: &mut PixelRng,
    recorded: &mut Vec<RadianceSample>,
) -> Vec3 {
    // Traces the first bounce from the camera ray
    let Some(mut hit) = scene.trace_ray(&ray) else {
        return scene.environment;
    };

    let mut outgoing = -ray.direction;
    let mut radiance = scene.object_id(hit.id).material().emitted();
    let mut incident = Vec3::ZERO;
    let mut throughput = Vec3::ONE;
    let mut distribution = guiding.map(GuidingField::create_distribution);
    let mut vertices: Vec<GuidedVertex> = Vec::new();

    for bounce in 1..=max_bounces {
        let material = scene.object_id(hit.id).material();

        // Guiding is only on the table where the field has trained data for this point
        let guided = match (guiding, distribution.as_mut()) {
            (Some(guiding), Some(distribution)) if material.supports_guiding() => {
                guiding.init_distribution(distribution, hit.point, rng.gen())
                    && distribution.validate()
            }
            _ => false,
        };
        let guide = if guided {
            distribution.as_ref().zip(guiding)
        } else {
            None
        };

        // Next event estimation, weighted against the mixture that scatters the path
        radiance += throughput * sample_direct(&hit, outgoing, material, guide, scene, rng);

        let decision = match guide {
            None => GuidingDecision::Unused,
            Some((_, guiding)) => {
                if rng.gen::<f32>() < guiding.config().guiding_probability {
                    GuidingDecision::InUse
                } else {
                    GuidingDecision::Tentative
                }
            }
        };

        let Some(scattering) = scatter(&hit, outgoing, material, guide, decision, rng) else {
            break;
        };

        let throughput_after = throughput * scattering.weight;
        if guiding.is_some_and(GuidingField::should_train) && material.supports_guiding() {
            vertices.push(GuidedVertex {
                position: hit.point,
                direction: scattering.direction,
                pdf: scattering.pdf,
                incident_before: incident,
                throughput_after,
            });
        }

        throughput = throughput_after;
        if throughput.max_element() <= 0.0 {
            break;
        }

        let next_ray = Ray::new(hit.point, scattering.direction);
        let Some(next_hit) = scene.trace_ray(&next_ray) else {
            radiance += throughput * scene.environment;
            incident += throughput * scene.environment;
            break;
        };

        // Emission found by scattering, weighted against light sampling
        let emission = scene.object_id(next_hit.id).material().emitted();
        if emission.max_element() > 0.0 {
            let weight = if scattering.specular {
                1.0
            } else {
                power_heuristic(scattering.pdf, scene.light_pdf(hit.point, &next_hit))
            };
            radiance += throughput * emission * weight;
            incident += throughput * emission;
        }

        hit = next_hit;
        outgoing = -next_ray.direction;

        // Decides whether to continue or break early with Russian roulette
        if bounce >= ROULETTE_START {
            let continue_prob = throughput.max_element().min(ROULETTE_MAX_CONTINUE);
            if rng.gen::<f32>() < continue_prob {
                throughput /= continue_prob;
            } else {
                break;
            }
        }
    }

    // Radiance gathered after each recorded vertex, divided by the throughput that carried it
    for vertex in vertices {
        let arriving = ((incident - vertex.incident_before) / vertex.throughput_after).max(Vec3::ZERO);
        let arriving = Vec3::select(vertex.throughput_after.cmpgt(Vec3::ZERO), arriving, Vec3::ZERO);
        recorded.push(RadianceSample {
            position: vertex.position,
            direction: vertex.direction,
            radiance: arriving,
            pdf: vertex.pdf,
        });
    }

    radiance
}

/// Chooses the next direction according to the vertex's guiding decision
fn scatter(
    hit: &Hit,
    outgoing: Vec3,
    material: &dyn Material,
    guide: Option<(&SurfaceSamplingDistribution, &GuidingField)>,
    decision: GuidingDecision,
    rng: &mut PixelRng,
) -> Option<Scattering> {
    let u = Vec2::new(rng.gen(), rng.gen());
    let probability = guide.map_or(0.0, |(_, guiding)| guiding.config().guiding_probability);

    let (direction, pdf) = match (decision, guide) {
        (GuidingDecision::InUse, Some((distribution, _))) => {
            let (direction, guide_pdf) = distribution.sample_pdf(u);
            let bsdf_pdf = material.direction_pdf(direction, outgoing, hit.normal);
            (direction, combine_pdf(bsdf_pdf, guide_pdf, decision, probability))
        }
        (GuidingDecision::Tentative, Some((distribution, _))) => {
            let sample = material.sample_direction(hit.normal, outgoing, u)?;
            let pdf = adjust_pdf_for_guiding(sample.pdf, sample.direction, distribution, decision, probability);
            (sample.direction, pdf)
        }
        _ => {
            let sample = material.sample_direction(hit.normal, outgoing, u)?;
            return Some(Scattering {
                direction: sample.direction,
                pdf: sample.pdf,
                weight: sample.weight,
                specular: material.is_specular(),
            });
        }
    };

    if !(pdf.is_finite() && pdf > 0.0) {
        return None;
    }

    Some(Scattering {
        direction,
        pdf,
        weight: material.bsdf_multiplier(direction, outgoing, hit.normal) / pdf,
        specular: false,
    })
}

/// Estimates direct illumination at a hit by sampling a point on a light
fn sample_direct(
    hit: &Hit,
    outgoing: Vec3,
    material: &dyn Material,
    guide: Option<(&SurfaceSamplingDistribution, &GuidingField)>,
    scene: &Scene,
    rng: &mut PixelRng,
) -> Vec3 {
    let u_light = rng.gen::<f32>();
    let u_surface = Vec2::new(rng.gen(), rng.gen());
    if material.is_specular() {
        return Vec3::ZERO;
    }

    let Some(light) = scene.sample_lights(hit.point, u_light, u_surface) else {
        return Vec3::ZERO;
    };

    let direction = light.ray.direction;
    let multiplier = material.bsdf_multiplier(direction, outgoing, hit.normal);
    if multiplier.max_element() <= 0.0 {
        return Vec3::ZERO;
    }

    let bsdf_pdf = material.direction_pdf(direction, outgoing, hit.normal);
    let scatter_pdf = match guide {
        Some((distribution, guiding)) => adjust_pdf_for_guiding(
            bsdf_pdf,
            direction,
            distribution,
            GuidingDecision::Tentative,
            guiding.config().guiding_probability,
        ),
        None => bsdf_pdf,
    };

    let weight = power_heuristic(light.pdf, scatter_pdf);
    multiplier * light.emission * weight / light.pdf
}

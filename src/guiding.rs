use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use glam::{Vec2, Vec3};
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::distribution::{CellDistribution, DirectionalDistribution};
use crate::field::{DirectionalField, FieldArguments};

/// Probability of sampling a guidable vertex from the learned field
pub const GUIDING_PROBABILITY: f32 = 0.5;
pub const MAX_TRAINING_ITERATIONS: u32 = 128;
/// Buffered samples needed before a training iteration runs
pub const MIN_TRAINING_SAMPLES: usize = 1024;

/// Incident radiance observed at a path vertex
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RadianceSample {
    pub position: Vec3,
    pub direction: Vec3,
    pub radiance: Vec3,
    pub pdf: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GuidingConfig {
    pub guiding_probability: f32,
    pub min_training_samples: usize,
    pub max_training_iterations: u32,
}

/// Append-only sample buffer, emptied by training
#[derive(Default)]
pub struct SampleStorage {
    surface: Mutex<Vec<RadianceSample>>,
}

/// Owns the directional field and its sample storage for one render
pub struct GuidingField {
    config: GuidingConfig,
    field: RwLock<DirectionalField>,
    storage: SampleStorage,
    train: AtomicBool,
    iterations: AtomicU32,
}

/// Per-path view into one trained cell of the field
#[derive(Default)]
pub struct SurfaceSamplingDistribution {
    distribution: Option<Arc<CellDistribution>>,
}

/// How a path vertex chose its next direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuidingDecision {
    /// Sampled from the guiding distribution
    InUse,
    /// Guiding was available but the BSDF was sampled
    Tentative,
    /// Guiding unavailable at this vertex
    Unused,
}

impl RadianceSample {
    pub fn is_valid(&self) -> bool {
        self.position.is_finite()
            && self.direction.is_finite()
            && self.radiance.is_finite()
            && self.radiance.min_element() >= 0.0
            && self.pdf.is_finite()
            && self.pdf > 0.0
    }
}

impl Default for GuidingConfig {
    fn default() -> Self {
        GuidingConfig {
            guiding_probability: GUIDING_PROBABILITY,
            min_training_samples: MIN_TRAINING_SAMPLES,
            max_training_iterations: MAX_TRAINING_ITERATIONS,
        }
    }
}

impl SampleStorage {
    /// Moves the valid samples of a worker's local buffer into storage
    pub fn append(&self, samples: &mut Vec<RadianceSample>) {
        samples.retain(RadianceSample::is_valid);
        if samples.is_empty() {
            return;
        }

        self.surface.lock().append(samples);
    }

    pub fn size_surface(&self) -> usize {
        self.surface.lock().len()
    }

    /// Always zero: the renderer has no participating media
    pub fn size_volume(&self) -> usize {
        0
    }

    fn take(&self) -> Vec<RadianceSample> {
        std::mem::take(&mut *self.surface.lock())
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<RadianceSample> {
        self.surface.lock().clone()
    }
}

impl GuidingField {
    pub fn new(arguments: FieldArguments, config: GuidingConfig) -> Self {
        GuidingField {
            config,
            field: RwLock::new(DirectionalField::new(arguments)),
            storage: SampleStorage::default(),
            train: AtomicBool::new(config.max_training_iterations > 0),
            iterations: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &GuidingConfig {
        &self.config
    }

    pub fn storage(&self) -> &SampleStorage {
        &self.storage
    }

    /// Runs one training iteration if enough samples are buffered; returns whether it did
    pub fn update(&self) -> bool {
        let mut field = self.field.write();
        if !self.should_train() {
            return false;
        }

        let sample_count = self.storage.size_surface() + self.storage.size_volume();
        if sample_count < self.config.min_training_samples {
            return false;
        }

        let samples = self.storage.take();
        let consumed = samples.len();
        field.update(samples);

        let iteration = field.iteration();
        self.iterations.store(iteration, Ordering::Release);
        if iteration >= self.config.max_training_iterations {
            self.train.store(false, Ordering::Release);
        }

        debug!(
            "guiding iteration {} trained on {} samples, {} cells trained",
            iteration,
            consumed,
            field.trained_cells()
        );
        true
    }

    pub fn create_distribution(&self) -> SurfaceSamplingDistribution {
        SurfaceSamplingDistribution::default()
    }

    /// Binds `distribution` to the field near `position`; false when no trained data exists there
    pub fn init_distribution(
        &self,
        distribution: &mut SurfaceSamplingDistribution,
        position: Vec3,
        random: f32,
    ) -> bool {
        let field = self.field.read();
        distribution.distribution = field.distribution_at(position, random);
        distribution.distribution.is_some()
    }

    pub fn iterations(&self) -> u32 {
        self.iterations.load(Ordering::Acquire)
    }

    pub fn should_train(&self) -> bool {
        self.train.load(Ordering::Acquire)
    }
}

impl SurfaceSamplingDistribution {
    pub fn pdf(&self, direction: Vec3) -> f32 {
        self.distribution
            .as_ref()
            .map_or(0.0, |distribution| distribution.pdf(direction))
    }

    pub fn sample_pdf(&self, u: Vec2) -> (Vec3, f32) {
        match &self.distribution {
            Some(distribution) => distribution.sample_pdf(u),
            None => (Vec3::ZERO, 0.0),
        }
    }

    pub fn validate(&self) -> bool {
        self.distribution
            .as_ref()
            .is_some_and(|distribution| distribution.validate())
    }
}

/// Density of the BSDF/guiding mixture in effect at a vertex. A degenerate guiding
/// density contributes nothing to the mixture.
pub fn combine_pdf(bsdf_pdf: f32, guide_pdf: f32, decision: GuidingDecision, probability: f32) -> f32 {
    match decision {
        GuidingDecision::InUse | GuidingDecision::Tentative => {
            let guide_pdf = if guide_pdf.is_finite() && guide_pdf > 0.0 {
                guide_pdf
            } else {
                0.0
            };
            (1.0 - probability) * bsdf_pdf + probability * guide_pdf
        }
        GuidingDecision::Unused => bsdf_pdf,
    }
}

/// Mixes the BSDF density of `direction` with the guiding density when guiding was possible
pub fn adjust_pdf_for_guiding(
    bsdf_pdf: f32,
    direction: Vec3,
    distribution: &SurfaceSamplingDistribution,
    decision: GuidingDecision,
    probability: f32,
) -> f32 {
    let guide_pdf = match decision {
        GuidingDecision::Unused => 0.0,
        GuidingDecision::InUse | GuidingDecision::Tentative => distribution.pdf(direction),
    };

    combine_pdf(bsdf_pdf, guide_pdf, decision, probability)
}

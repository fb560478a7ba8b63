//! Parametric directional distributions stored in the cells of the guiding field.
//!
//! Each backend learns incident radiance over the full sphere of directions from
//! the radiance samples that landed in its cell. Sample weights are the sample
//! luminance divided by the density it was drawn with, so training estimates the
//! radiance distribution itself rather than the distribution that produced it.

use std::f32::consts::PI;

use glam::{Vec2, Vec3};

use crate::guiding::RadianceSample;
use crate::sampling::{azimuth, direction_around, luminance, uniform_sphere, UNIFORM_SPHERE_PDF};

const THETA_BINS: usize = 8;
const PHI_BINS: usize = 16;
const HISTOGRAM_BINS: usize = THETA_BINS * PHI_BINS;
/// Share of the histogram spread uniformly over the sphere
const HISTOGRAM_UNIFORM_MIX: f32 = 0.1;

const VMM_LOBES: usize = 6;
const VMM_INITIAL_KAPPA: f32 = 2.0;
const VMM_MIN_KAPPA: f32 = 1e-3;
const VMM_MAX_KAPPA: f32 = 5e3;
const VMM_MAX_MEAN_COSINE: f32 = 0.9999;

/// Capability set shared by every directional backend
pub trait DirectionalDistribution {
    /// Refines the distribution with samples from its cell
    fn train(&mut self, samples: &[RadianceSample]);
    fn sample(&self, u: Vec2) -> Vec3;
    fn pdf(&self, direction: Vec3) -> f32;

    fn sample_pdf(&self, u: Vec2) -> (Vec3, f32) {
        let direction = self.sample(u);
        (direction, self.pdf(direction))
    }

    /// Whether the distribution holds trained, finite parameters
    fn validate(&self) -> bool;
    fn clear(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributionKind {
    Histogram,
    Vmm,
}

/// Backend chosen once for the whole field
#[derive(Clone, Debug)]
pub enum CellDistribution {
    Histogram(DirectionalHistogram),
    Vmm(VonMisesFisherMixture),
}

/// Equal-area histogram over (cos theta, phi)
#[derive(Clone, Debug)]
pub struct DirectionalHistogram {
    energy: Vec<f32>,
    cdf: Vec<f32>,
}

#[derive(Clone, Copy, Debug)]
struct Lobe {
    weight: f32,
    mean: Vec3,
    kappa: f32,
}

#[derive(Clone, Copy, Debug, Default)]
struct LobeStatistics {
    weight: f32,
    direction: Vec3,
}

/// Mixture of von Mises-Fisher lobes fitted by online weighted expectation maximization
#[derive(Clone, Debug)]
pub struct VonMisesFisherMixture {
    lobes: [Lobe; VMM_LOBES],
    statistics: [LobeStatistics; VMM_LOBES],
    trained: bool,
}

fn sample_weight(sample: &RadianceSample) -> f32 {
    let weight = luminance(sample.radiance) / sample.pdf;
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

impl CellDistribution {
    pub fn new(kind: DistributionKind) -> Self {
        match kind {
            DistributionKind::Histogram => CellDistribution::Histogram(DirectionalHistogram::new()),
            DistributionKind::Vmm => CellDistribution::Vmm(VonMisesFisherMixture::new()),
        }
    }
}

impl DirectionalDistribution for CellDistribution {
    fn train(&mut self, samples: &[RadianceSample]) {
        match self {
            CellDistribution::Histogram(histogram) => histogram.train(samples),
            CellDistribution::Vmm(mixture) => mixture.train(samples),
        }
    }

    fn sample(&self, u: Vec2) -> Vec3 {
        match self {
            CellDistribution::Histogram(histogram) => histogram.sample(u),
            CellDistribution::Vmm(mixture) => mixture.sample(u),
        }
    }

    fn pdf(&self, direction: Vec3) -> f32 {
        match self {
            CellDistribution::Histogram(histogram) => histogram.pdf(direction),
            CellDistribution::Vmm(mixture) => mixture.pdf(direction),
        }
    }

    fn validate(&self) -> bool {
        match self {
            CellDistribution::Histogram(histogram) => histogram.validate(),
            CellDistribution::Vmm(mixture) => mixture.validate(),
        }
    }

    fn clear(&mut self) {
        match self {
            CellDistribution::Histogram(histogram) => histogram.clear(),
            CellDistribution::Vmm(mixture) => mixture.clear(),
        }
    }
}

impl DirectionalHistogram {
    pub fn new() -> Self {
        DirectionalHistogram {
            energy: vec![0.0; HISTOGRAM_BINS],
            cdf: Vec::new(),
        }
    }

    fn bin(direction: Vec3) -> usize {
        let theta_bin = ((direction.z + 1.0) * 0.5 * THETA_BINS as f32) as usize;
        let phi_bin = (azimuth(direction) / (2.0 * PI) * PHI_BINS as f32) as usize;
        theta_bin.min(THETA_BINS - 1) * PHI_BINS + phi_bin.min(PHI_BINS - 1)
    }

    fn bin_probability(&self, bin: usize) -> f32 {
        if bin == 0 {
            self.cdf[0]
        } else {
            self.cdf[bin] - self.cdf[bin - 1]
        }
    }

    fn rebuild_cdf(&mut self) {
        let total: f32 = self.energy.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            self.cdf.clear();
            return;
        }

        let uniform = HISTOGRAM_UNIFORM_MIX / HISTOGRAM_BINS as f32;
        let mut running = 0.0;
        self.cdf = self
            .energy
            .iter()
            .map(|energy| {
                running += (1.0 - HISTOGRAM_UNIFORM_MIX) * energy / total + uniform;
                running
            })
            .collect();

        // Absorb rounding so the last entry is exactly one
        let last = running;
        self.cdf.iter_mut().for_each(|value| *value /= last);
    }
}

impl Default for DirectionalHistogram {
    fn default() -> Self {
        DirectionalHistogram::new()
    }
}

impl DirectionalDistribution for DirectionalHistogram {
    fn train(&mut self, samples: &[RadianceSample]) {
        for sample in samples {
            self.energy[Self::bin(sample.direction)] += sample_weight(sample);
        }

        self.rebuild_cdf();
    }

    fn sample(&self, u: Vec2) -> Vec3 {
        if self.cdf.is_empty() {
            return uniform_sphere(u);
        }

        let bin = self.cdf.partition_point(|&value| value <= u.x).min(HISTOGRAM_BINS - 1);
        let start = if bin == 0 { 0.0 } else { self.cdf[bin - 1] };
        let probability = self.bin_probability(bin);
        let u_theta = if probability > 0.0 {
            ((u.x - start) / probability).clamp(0.0, 1.0)
        } else {
            0.5
        };

        let theta_bin = bin / PHI_BINS;
        let phi_bin = bin % PHI_BINS;
        let cos_theta = -1.0 + 2.0 * (theta_bin as f32 + u_theta) / THETA_BINS as f32;
        let phi = 2.0 * PI * (phi_bin as f32 + u.y) / PHI_BINS as f32;
        direction_around(Vec3::Z, cos_theta.clamp(-1.0, 1.0), phi)
    }

    fn pdf(&self, direction: Vec3) -> f32 {
        if self.cdf.is_empty() {
            return 0.0;
        }

        self.bin_probability(Self::bin(direction)) * HISTOGRAM_BINS as f32 * UNIFORM_SPHERE_PDF
    }

    fn validate(&self) -> bool {
        self.cdf.len() == HISTOGRAM_BINS
            && self.cdf.iter().all(|value| value.is_finite())
            && self.cdf[HISTOGRAM_BINS - 1] > 0.0
    }

    fn clear(&mut self) {
        self.energy.iter_mut().for_each(|energy| *energy = 0.0);
        self.cdf.clear();
    }
}

impl Lobe {
    fn pdf(&self, direction: Vec3) -> f32 {
        if self.kappa < VMM_MIN_KAPPA {
            return UNIFORM_SPHERE_PDF;
        }

        let normalization = self.kappa / (2.0 * PI * (1.0 - (-2.0 * self.kappa).exp()));
        normalization * (self.kappa * (self.mean.dot(direction) - 1.0)).exp()
    }

    fn sample(&self, u: Vec2) -> Vec3 {
        let cos_theta = if self.kappa < VMM_MIN_KAPPA {
            1.0 - 2.0 * u.x
        } else {
            let tail = (-2.0 * self.kappa).exp();
            1.0 + (u.x + (1.0 - u.x) * tail).ln() / self.kappa
        };

        direction_around(self.mean, cos_theta.clamp(-1.0, 1.0), 2.0 * PI * u.y)
    }
}

impl VonMisesFisherMixture {
    pub fn new() -> Self {
        let axes = [Vec3::X, -Vec3::X, Vec3::Y, -Vec3::Y, Vec3::Z, -Vec3::Z];
        let lobes = axes.map(|mean| Lobe {
            weight: 1.0 / VMM_LOBES as f32,
            mean,
            kappa: VMM_INITIAL_KAPPA,
        });

        VonMisesFisherMixture {
            lobes,
            statistics: [LobeStatistics::default(); VMM_LOBES],
            trained: false,
        }
    }

    fn maximize(&mut self) {
        let total: f32 = self.statistics.iter().map(|stats| stats.weight).sum();
        if !(total.is_finite() && total > 0.0) {
            return;
        }

        for (lobe, stats) in self.lobes.iter_mut().zip(self.statistics.iter()) {
            lobe.weight = stats.weight / total;
            if stats.weight <= 0.0 {
                continue;
            }

            let length = stats.direction.length();
            if length <= 0.0 {
                lobe.kappa = 0.0;
                continue;
            }

            lobe.mean = stats.direction / length;
            let mean_cosine = (length / stats.weight).min(VMM_MAX_MEAN_COSINE);
            lobe.kappa = (mean_cosine * (3.0 - mean_cosine * mean_cosine)
                / (1.0 - mean_cosine * mean_cosine))
                .clamp(0.0, VMM_MAX_KAPPA);
        }

        self.trained = true;
    }
}

impl Default for VonMisesFisherMixture {
    fn default() -> Self {
        VonMisesFisherMixture::new()
    }
}

impl DirectionalDistribution for VonMisesFisherMixture {
    fn train(&mut self, samples: &[RadianceSample]) {
        for sample in samples {
            let weight = sample_weight(sample);
            if weight <= 0.0 {
                continue;
            }

            let densities = self
                .lobes
                .map(|lobe| lobe.weight * lobe.pdf(sample.direction));
            let total: f32 = densities.iter().sum();
            if !(total.is_finite() && total > 0.0) {
                continue;
            }

            for (stats, density) in self.statistics.iter_mut().zip(densities) {
                let responsibility = weight * density / total;
                stats.weight += responsibility;
                stats.direction += responsibility * sample.direction;
            }
        }

        self.maximize();
    }

    fn sample(&self, u: Vec2) -> Vec3 {
        let mut u_lobe = u.x;
        for lobe in &self.lobes {
            if u_lobe < lobe.weight {
                return lobe.sample(Vec2::new(u_lobe / lobe.weight, u.y));
            }
            u_lobe -= lobe.weight;
        }

        // Rounding left u past the last lobe
        let last = self
            .lobes
            .iter()
            .rev()
            .find(|lobe| lobe.weight > 0.0)
            .unwrap_or(&self.lobes[VMM_LOBES - 1]);
        last.sample(Vec2::new(1.0 - f32::EPSILON, u.y))
    }

    fn pdf(&self, direction: Vec3) -> f32 {
        if !self.trained {
            return 0.0;
        }

        self.lobes
            .iter()
            .filter(|lobe| lobe.weight > 0.0)
            .map(|lobe| lobe.weight * lobe.pdf(direction))
            .sum()
    }

    fn validate(&self) -> bool {
        let total: f32 = self.lobes.iter().map(|lobe| lobe.weight).sum();
        self.trained
            && total > 0.0
            && self.lobes.iter().all(|lobe| {
                lobe.weight.is_finite() && lobe.kappa.is_finite() && lobe.mean.is_finite()
            })
    }

    fn clear(&mut self) {
        *self = VonMisesFisherMixture::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::PixelRng;
    use rand::{Rng, SeedableRng};

    fn uniform_u(rng: &mut PixelRng) -> Vec2 {
        Vec2::new(rng.gen(), rng.gen())
    }

    /// Samples arriving around `peak`, drawn uniformly over the sphere
    fn peaked_samples(peak: Vec3, count: usize, seed: u64) -> Vec<RadianceSample> {
        let mut rng = PixelRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let direction = uniform_sphere(uniform_u(&mut rng));
                let radiance = if direction.dot(peak) > 0.9 { 10.0 } else { 0.1 };
                RadianceSample {
                    position: Vec3::ZERO,
                    direction,
                    radiance: Vec3::splat(radiance),
                    pdf: UNIFORM_SPHERE_PDF,
                }
            })
            .collect()
    }

    fn integrate_pdf(distribution: &dyn DirectionalDistribution) -> f32 {
        let mut rng = PixelRng::seed_from_u64(11);
        let count = 200_000;
        let sum: f32 = (0..count)
            .map(|_| distribution.pdf(uniform_sphere(uniform_u(&mut rng))))
            .sum();
        sum / count as f32 / UNIFORM_SPHERE_PDF
    }

    fn trained(kind: DistributionKind) -> CellDistribution {
        let mut distribution = CellDistribution::new(kind);
        distribution.train(&peaked_samples(Vec3::Y, 4000, 7));
        distribution
    }

    #[test]
    fn untrained_distributions_do_not_validate() {
        for kind in [DistributionKind::Histogram, DistributionKind::Vmm] {
            let distribution = CellDistribution::new(kind);
            assert!(!distribution.validate());
            assert_eq!(distribution.pdf(Vec3::Y), 0.0);
        }
    }

    #[test]
    fn trained_pdfs_integrate_to_one() {
        for kind in [DistributionKind::Histogram, DistributionKind::Vmm] {
            let distribution = trained(kind);
            assert!(distribution.validate());
            let integral = integrate_pdf(&distribution);
            assert!((integral - 1.0).abs() < 0.05, "{kind:?} integrates to {integral}");
        }
    }

    #[test]
    fn training_concentrates_towards_bright_directions() {
        for kind in [DistributionKind::Histogram, DistributionKind::Vmm] {
            let distribution = trained(kind);
            assert!(distribution.pdf(Vec3::Y) > 4.0 * distribution.pdf(-Vec3::Y), "{kind:?}");
        }
    }

    #[test]
    fn sampled_pdf_matches_pdf_query() {
        let mut rng = PixelRng::seed_from_u64(2);
        for kind in [DistributionKind::Histogram, DistributionKind::Vmm] {
            let distribution = trained(kind);
            for _ in 0..500 {
                let (direction, pdf) = distribution.sample_pdf(uniform_u(&mut rng));
                assert!((direction.length() - 1.0).abs() < 1e-3);
                assert!(pdf > 0.0);
                assert_eq!(pdf, distribution.pdf(direction));
            }
        }
    }

    #[test]
    fn clear_forgets_training() {
        for kind in [DistributionKind::Histogram, DistributionKind::Vmm] {
            let mut distribution = trained(kind);
            distribution.clear();
            assert!(!distribution.validate());
        }
    }

    #[test]
    fn invalid_samples_carry_no_weight() {
        let mut histogram = DirectionalHistogram::new();
        histogram.train(&[RadianceSample {
            position: Vec3::ZERO,
            direction: Vec3::Z,
            radiance: Vec3::splat(f32::NAN),
            pdf: 1.0,
        }]);
        assert!(!histogram.validate());
    }
}

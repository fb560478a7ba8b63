use std::{cmp::Ordering, sync::Arc};

use glam::{UVec3, Vec3};
use rayon::prelude::*;

use crate::distribution::{CellDistribution, DirectionalDistribution, DistributionKind};
use crate::guiding::RadianceSample;
use crate::objects::Bounds;

pub const DEFAULT_GRID_RESOLUTION: u32 = 8;
const MIN_CELL_SIZE: f32 = 1e-3;
const BOUNDS_PADDING: f32 = 1e-3;

/// Construction-time choices for a directional field
#[derive(Clone, Copy, Debug)]
pub struct FieldArguments {
    pub kind: DistributionKind,
    pub resolution: u32,
    pub bounds: Bounds,
}

#[derive(Clone)]
struct Cell {
    distribution: Arc<CellDistribution>,
    trained: bool,
}

/// Uniform grid over the scene bounds with one directional distribution per cell
pub struct DirectionalField {
    cells: Vec<Cell>,
    resolution: u32,
    origin: Vec3,
    cell_size: Vec3,
    iteration: u32,
}

impl FieldArguments {
    pub fn new(kind: DistributionKind, bounds: Bounds) -> Self {
        FieldArguments {
            kind,
            resolution: DEFAULT_GRID_RESOLUTION,
            bounds,
        }
    }
}

fn compare_vec3(a: Vec3, b: Vec3) -> Ordering {
    a.x.total_cmp(&b.x)
        .then(a.y.total_cmp(&b.y))
        .then(a.z.total_cmp(&b.z))
}

/// Total order over samples so a training batch is consumed the same way whatever
/// order the workers appended it in
fn compare_samples(a: &RadianceSample, b: &RadianceSample) -> Ordering {
    compare_vec3(a.position, b.position)
        .then(compare_vec3(a.direction, b.direction))
        .then(compare_vec3(a.radiance, b.radiance))
        .then(a.pdf.total_cmp(&b.pdf))
}

impl DirectionalField {
    pub fn new(arguments: FieldArguments) -> Self {
        let resolution = arguments.resolution.max(1);
        let origin = arguments.bounds.min - Vec3::splat(BOUNDS_PADDING);
        let extent = arguments.bounds.extent() + Vec3::splat(2.0 * BOUNDS_PADDING);
        let cell_size = (extent / resolution as f32).max(Vec3::splat(MIN_CELL_SIZE));

        let cell = Cell {
            distribution: Arc::new(CellDistribution::new(arguments.kind)),
            trained: false,
        };

        DirectionalField {
            cells: vec![cell; resolution.pow(3) as usize],
            resolution,
            origin,
            cell_size,
            iteration: 0,
        }
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    fn flat_index(&self, coordinates: UVec3) -> usize {
        let coordinates = coordinates.min(UVec3::splat(self.resolution - 1));
        ((coordinates.z * self.resolution + coordinates.y) * self.resolution + coordinates.x)
            as usize
    }

    fn cell_index(&self, position: Vec3) -> usize {
        let continuous = ((position - self.origin) / self.cell_size).max(Vec3::ZERO);
        self.flat_index(continuous.as_uvec3())
    }

    /// Stochastic trilinear lookup: picks one of the eight cells around `position`
    /// with probability equal to its interpolation weight, reusing `random` per axis
    fn jittered_cell_index(&self, position: Vec3, mut random: f32) -> usize {
        let continuous = (position - self.origin) / self.cell_size - Vec3::splat(0.5);
        let base = continuous.floor();
        let fraction = continuous - base;

        let mut chosen = base;
        for axis in 0..3 {
            let fraction = fraction[axis];
            if fraction <= 0.0 || fraction >= 1.0 {
                continue;
            }

            if random < fraction {
                chosen[axis] += 1.0;
                random /= fraction;
            } else {
                random = (random - fraction) / (1.0 - fraction);
            }
        }

        let max = (self.resolution - 1) as f32;
        self.flat_index(chosen.clamp(Vec3::ZERO, Vec3::splat(max)).as_uvec3())
    }

    /// Shared handle to a trained cell distribution near `position`
    pub fn distribution_at(&self, position: Vec3, random: f32) -> Option<Arc<CellDistribution>> {
        let cell = &self.cells[self.jittered_cell_index(position, random)];
        cell.trained.then(|| Arc::clone(&cell.distribution))
    }

    /// One training iteration over a flushed batch of samples
    pub fn update(&mut self, mut samples: Vec<RadianceSample>) {
        samples.sort_by(compare_samples);

        let mut buckets: Vec<Vec<RadianceSample>> = vec![Vec::new(); self.cells.len()];
        for sample in samples {
            buckets[self.cell_index(sample.position)].push(sample);
        }

        self.cells
            .par_iter_mut()
            .zip(buckets.par_iter())
            .filter(|(_, bucket)| !bucket.is_empty())
            .for_each(|(cell, bucket)| {
                let distribution = Arc::make_mut(&mut cell.distribution);
                distribution.train(bucket);
                cell.trained = distribution.validate();
                if !cell.trained {
                    distribution.clear();
                }
            });

        self.iteration += 1;
    }

    pub fn trained_cells(&self) -> usize {
        self.cells.iter().filter(|cell| cell.trained).count()
    }
}

//! Random projections from D-space into independent 8-d point spaces.
//!
//! Each basis is an 8 x D matrix of standard normal samples. Projecting a
//! vector yields one 8-d point per basis, which is indexed in its own point
//! tree. Bases are derived from a seed so that the projector used at query
//! time is identical to the one used at index time.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use crate::vector::codec::dot_product;
use crate::vector::types::{POINT_DIMS, ProjectedPoint, VectorDimension, VectorError};

/// A fixed ensemble of random projection bases.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomProjector {
    dimension: VectorDimension,
    num_projections: usize,
    seed: u64,
    /// Rows of every basis, `num_projections * POINT_DIMS` rows of `dimension` values.
    rows: Vec<f32>,
}

impl RandomProjector {
    /// Creates a projector from fresh entropy.
    ///
    /// The chosen seed is available through [`RandomProjector::seed`]; it must
    /// be persisted if projections are to be reproduced later.
    #[must_use]
    pub fn create(dimension: VectorDimension, num_projections: usize) -> Self {
        Self::with_seed(dimension, num_projections, rand::random())
    }

    /// Creates a deterministic projector.
    #[must_use]
    pub fn with_seed(dimension: VectorDimension, num_projections: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let dims = dimension.get();
        let rows = (0..num_projections * POINT_DIMS * dims)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();

        Self {
            dimension,
            num_projections,
            seed,
            rows,
        }
    }

    /// Number of bases.
    #[must_use]
    pub fn num_projections(&self) -> usize {
        self.num_projections
    }

    /// Input dimension.
    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    /// Seed the bases were drawn from.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Returns row `row` of basis `projection`.
    #[must_use]
    pub fn basis_row(&self, projection: usize, row: usize) -> &[f32] {
        let dims = self.dimension.get();
        let start = (projection * POINT_DIMS + row) * dims;
        &self.rows[start..start + dims]
    }

    /// Projects a vector through every basis.
    pub fn project(&self, vector: &[f32]) -> Result<Vec<ProjectedPoint>, VectorError> {
        self.dimension.validate_vector(vector)?;
        Ok((0..self.num_projections)
            .map(|projection| self.project_one(vector, projection))
            .collect())
    }

    fn project_one(&self, vector: &[f32], projection: usize) -> ProjectedPoint {
        let mut point = [0.0f32; POINT_DIMS];
        for (row, component) in point.iter_mut().enumerate() {
            *component = dot_product(vector, self.basis_row(projection, row));
        }
        point
    }
}

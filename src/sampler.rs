// Uniform random species selection over disjoint id ranges.
//
// Counts are read from the store on every draw, so the candidate set always
// reflects what exists at that moment. The random source is seeded once.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::db::{Database, Species};
use crate::error::{ServiceError, ServiceResult};

/// A closed range of species ids, `lo..=hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub lo: i64,
    pub hi: i64,
}

impl IdRange {
    pub fn new(lo: i64, hi: i64) -> Self {
        Self { lo, hi }
    }

    pub fn overlaps(&self, other: &IdRange) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.lo, self.hi)
    }
}

/// How a random offset inside a range becomes a concrete record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// Take the offset-th record of the range in id order. Tolerates gaps.
    Counted,
    /// Look up id `lo + offset`. Assumes the range has no gaps.
    Dense,
}

/// Anything that can hand out one random species per call.
#[async_trait]
pub trait SpeciesSampler: Send + Sync {
    async fn sample(&self) -> ServiceResult<Species>;
}

pub struct Sampler {
    db: Arc<Database>,
    ranges: Vec<IdRange>,
    strategy: SamplingStrategy,
    rng: Mutex<StdRng>,
}

impl Sampler {
    pub fn new(db: Arc<Database>, ranges: Vec<IdRange>, strategy: SamplingStrategy) -> Self {
        Self::with_rng(db, ranges, strategy, StdRng::from_entropy())
    }

    /// Deterministic sampler, for tests and reproducible runs.
    pub fn with_seed(
        db: Arc<Database>,
        ranges: Vec<IdRange>,
        strategy: SamplingStrategy,
        seed: u64,
    ) -> Self {
        Self::with_rng(db, ranges, strategy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        db: Arc<Database>,
        ranges: Vec<IdRange>,
        strategy: SamplingStrategy,
        rng: StdRng,
    ) -> Self {
        Self {
            db,
            ranges,
            strategy,
            rng: Mutex::new(rng),
        }
    }

    fn describe_ranges(&self) -> String {
        self.ranges
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn draw(&self, total: i64) -> i64 {
        // A poisoned lock only means another draw panicked; the generator state is still usable.
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(0..total)
    }
}

#[async_trait]
impl SpeciesSampler for Sampler {
    async fn sample(&self) -> ServiceResult<Species> {
        let mut counts = Vec::with_capacity(self.ranges.len());
        for range in &self.ranges {
            counts.push(self.db.count_species_in_range(*range).await?);
        }

        let total: i64 = counts.iter().sum();
        if total == 0 {
            let ranges = self.describe_ranges();
            tracing::error!(
                "Sampler found no species in ranges {ranges} (strategy {:?})",
                self.strategy
            );
            return Err(ServiceError::EmptyDataset { ranges });
        }

        let r = self.draw(total);
        let (range, offset) =
            locate(&self.ranges, &counts, r).ok_or_else(|| ServiceError::EmptyDataset {
                ranges: self.describe_ranges(),
            })?;

        let species = match self.strategy {
            SamplingStrategy::Counted => self.db.species_at_offset(range, offset).await?,
            SamplingStrategy::Dense => self.db.get_species(range.lo + offset).await?,
        };

        species.ok_or_else(|| {
            ServiceError::NotFound(format!(
                "no species at offset {offset} of range {range} ({:?} sampling)",
                self.strategy
            ))
        })
    }
}

/// Map a draw `r` in `[0, Σ counts)` to a range and an offset inside it,
/// walking ranges in declaration order. Ranges with a zero count are skipped.
pub fn locate(ranges: &[IdRange], counts: &[i64], mut r: i64) -> Option<(IdRange, i64)> {
    for (range, &count) in ranges.iter().zip(counts) {
        if r < count {
            return Some((*range, r));
        }
        r -= count;
    }
    None
}

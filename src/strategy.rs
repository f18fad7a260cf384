use crate::dirichlet;
use crate::instruction::{max_ids_per_cell, Instruction};
use crate::subcirc_list::SubcircList;
use crate::{SubcircId, MAX_SUBCIRCS};
use core::fmt;
use rand::Rng;
use std::str::FromStr;

/// Shortest run of cells kept on one sub-circuit by the batched strategy.
pub const C_MIN: usize = 50;

/// Longest run of cells kept on one sub-circuit by the batched strategy.
pub const C_MAX: usize = 70;

/// Number of buckets the Dirichlet weights are scaled into.
const NUM_BUCKETS: usize = 100;

/// Rule by which split instructions are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Always schedule the base sub-circuit.
    MinId,
    /// Always schedule the sub-circuit with the highest ID.
    MaxId,
    /// Cycle through the existing sub-circuits in ascending ID order.
    #[default]
    RoundRobin,
    /// Pick uniformly at random among the existing sub-circuits.
    RandomUniform,
    /// Pick at random, biased by Dirichlet-drawn per-sub-circuit weights.
    WeightedRandom,
    /// Like [`Strategy::WeightedRandom`], but each drawn sub-circuit is kept
    /// for a random run of `C_MIN..=C_MAX` cells before re-drawing.
    BatchedWeightedRandom,
}

impl Strategy {
    /// The configuration name of this strategy.
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::MinId => "MIN_ID",
            Strategy::MaxId => "MAX_ID",
            Strategy::RoundRobin => "ROUND_ROBIN",
            Strategy::RandomUniform => "RANDOM_UNIFORM",
            Strategy::WeightedRandom => "WEIGHTED_RANDOM",
            Strategy::BatchedWeightedRandom => "BATCHED_WEIGHTED_RANDOM",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MIN_ID" => Ok(Strategy::MinId),
            "MAX_ID" => Ok(Strategy::MaxId),
            "ROUND_ROBIN" => Ok(Strategy::RoundRobin),
            "RANDOM_UNIFORM" => Ok(Strategy::RandomUniform),
            "WEIGHTED_RANDOM" => Ok(Strategy::WeightedRandom),
            "BATCHED_WEIGHTED_RANDOM" => Ok(Strategy::BatchedWeightedRandom),
            _ => Err(UnknownStrategy),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownStrategy;

impl fmt::Display for UnknownStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        "unknown split strategy name".fmt(f)
    }
}

/// Dirichlet weights cached across instruction generations of one page load.
#[derive(Debug, Clone)]
pub(crate) struct WeightCache {
    pub(crate) weights: [f64; MAX_SUBCIRCS],
    /// When set, [`generate`] reuses the cached weights instead of drawing.
    pub(crate) use_prev: bool,
}

impl Default for WeightCache {
    fn default() -> Self {
        Self {
            weights: [0.0; MAX_SUBCIRCS],
            use_prev: false,
        }
    }
}

/// Produce one full-payload instruction over the sub-circuits in `subcircs`.
///
/// Only IDs present in the list are ever scheduled. The stateful strategies
/// read and update `cache` according to its `use_prev` flag.
pub(crate) fn generate<R, T>(
    strategy: Strategy,
    subcircs: &SubcircList<T>,
    rng: &mut R,
    cache: &mut WeightCache,
) -> Instruction
where
    R: Rng,
{
    debug_assert!(!subcircs.is_empty());

    match strategy {
        Strategy::MinId => min_id(subcircs),
        Strategy::MaxId => max_id(subcircs),
        Strategy::RoundRobin => round_robin(subcircs),
        Strategy::RandomUniform => random_uniform(subcircs, rng),
        Strategy::WeightedRandom => weighted_random(subcircs, rng, cache),
        Strategy::BatchedWeightedRandom => batched_weighted_random(subcircs, rng, cache),
    }
}

fn min_id<T>(subcircs: &SubcircList<T>) -> Instruction {
    // a non-empty list always holds the base at index 0
    debug_assert!(subcircs.contains(SubcircId::BASE));

    let num = max_ids_per_cell(SubcircId::BASE);

    Instruction::new(vec![SubcircId::BASE; num])
}

fn max_id<T>(subcircs: &SubcircList<T>) -> Instruction {
    let max = highest_id(subcircs);
    let num = max_ids_per_cell(max);

    Instruction::new(vec![max; num])
}

fn round_robin<T>(subcircs: &SubcircList<T>) -> Instruction {
    let max = highest_id(subcircs);
    let num = max_ids_per_cell(max);

    let mut ids = Vec::with_capacity(num);
    let mut current = SubcircId::BASE;
    debug_assert!(subcircs.contains(current));

    for _ in 0..num {
        ids.push(current);
        loop {
            current = SubcircId::new((current.value() + 1) % (max.value() + 1));
            if subcircs.contains(current) {
                break;
            }
        }
    }

    Instruction::new(ids)
}

fn random_uniform<R, T>(subcircs: &SubcircList<T>, rng: &mut R) -> Instruction
where
    R: Rng,
{
    let max = highest_id(subcircs);
    let num = max_ids_per_cell(max);

    let ids = (0..num)
        .map(|_| sample_existing(subcircs, rng, max))
        .collect();

    Instruction::new(ids)
}

fn weighted_random<R, T>(
    subcircs: &SubcircList<T>,
    rng: &mut R,
    cache: &mut WeightCache,
) -> Instruction
where
    R: Rng,
{
    let max = highest_id(subcircs);
    let num = max_ids_per_cell(max);
    let buckets = weighted_buckets(rng, cache, max);

    let ids = (0..num)
        .map(|_| sample_bucket(subcircs, rng, &buckets))
        .collect();

    Instruction::new(ids)
}

fn batched_weighted_random<R, T>(
    subcircs: &SubcircList<T>,
    rng: &mut R,
    cache: &mut WeightCache,
) -> Instruction
where
    R: Rng,
{
    let max = highest_id(subcircs);
    let num = max_ids_per_cell(max);
    let buckets = weighted_buckets(rng, cache, max);

    let mut ids = Vec::with_capacity(num);
    let mut current = sample_bucket(subcircs, rng, &buckets);
    let mut run = rng.gen_range(C_MIN..=C_MAX);

    for _ in 0..num {
        if run == 0 {
            current = sample_bucket(subcircs, rng, &buckets);
            run = rng.gen_range(C_MIN..=C_MAX);
        }

        ids.push(current);
        run -= 1;
    }

    Instruction::new(ids)
}

fn highest_id<T>(subcircs: &SubcircList<T>) -> SubcircId {
    debug_assert!(!subcircs.is_empty());

    subcircs.max_index().unwrap_or(SubcircId::BASE)
}

/// Rejection-sample an ID in `0..=max` that is present in the list.
fn sample_existing<R, T>(subcircs: &SubcircList<T>, rng: &mut R, max: SubcircId) -> SubcircId
where
    R: Rng,
{
    loop {
        let candidate = SubcircId::new(rng.gen_range(0..=max.value()));

        if subcircs.contains(candidate) {
            return candidate;
        }
    }
}

fn sample_bucket<R, T>(subcircs: &SubcircList<T>, rng: &mut R, buckets: &[SubcircId]) -> SubcircId
where
    R: Rng,
{
    loop {
        let candidate = buckets[rng.gen_range(0..buckets.len())];

        if subcircs.contains(candidate) {
            return candidate;
        }
    }
}

/// Scale θ to [`NUM_BUCKETS`] integer buckets of sub-circuit IDs.
///
/// Rounding can over- or undershoot the bucket count; filling saturates at
/// the end of the array and any shortfall keeps the highest ID, so an
/// overshooting last weight can never write out of bounds.
fn weighted_buckets<R>(rng: &mut R, cache: &mut WeightCache, max: SubcircId) -> Vec<SubcircId>
where
    R: Rng,
{
    let dimension = usize::from(max.value()) + 1;

    if !cache.use_prev {
        let theta = dirichlet::sample(rng, dimension);
        cache.weights[..dimension].copy_from_slice(&theta);

        tracing::info!(
            "Drew fresh split weights {:?}",
            &cache.weights[..dimension]
        );
    } else {
        tracing::debug!(
            "Reusing split weights {:?} for the current page load",
            &cache.weights[..dimension]
        );
    }

    let mut buckets = vec![SubcircId::new(max.value()); NUM_BUCKETS];
    let mut filled = 0;

    for (j, weight) in cache.weights[..dimension].iter().enumerate() {
        let count = (NUM_BUCKETS as f64 * weight).round() as usize;

        for _ in 0..count {
            if filled >= NUM_BUCKETS {
                break;
            }
            buckets[filled] = SubcircId::new(j as u8);
            filled += 1;
        }
    }

    buckets
}

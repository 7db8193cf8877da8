//! Randomized search for kernels: a weighted random walk over [get_primitive_applies].

use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::common::Range;
use crate::count::{evaluate, CountError, Verdict};
use crate::factory::{get_primitive_applies, rescale_possibilities, DeltaWidth, PrimitiveOptions};
use crate::graph::{GraphError, KernelGraph};
use crate::netspecs::{HeuristicPreferences, NetFills, NetSpecs};
use crate::primitive::Primitive;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SampleOptions {
    pub primitive_options: PrimitiveOptions,
    /// Bounds on the number of primitives besides Input and Output.
    pub num_primitive_range: Range<usize>,
    /// Bounds on the width cap drawn for each walk. A walk never grows wider than its cap, but
    /// need not reach it.
    pub num_max_width_range: Range<usize>,
    pub num_fc_range: Range<usize>,
    /// `None` to keep sampling until a kernel is found.
    pub timeout: Option<Duration>,
    pub preferences: HeuristicPreferences,
}

/// An accepted kernel.
#[derive(Debug, Clone)]
pub struct Sample {
    pub graph: KernelGraph,
    /// Minimum fills per layer, when sampled against a reference network.
    pub fills: Option<NetFills>,
    pub verdict: Option<Verdict>,
    pub attempts: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum SampleError {
    #[error("No kernel found in {attempts} attempts within {timeout:?}")]
    Timeout { timeout: Duration, attempts: usize },
    #[error("Empty or inverted range in sample options: {0}")]
    InvalidRange(&'static str),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Count(#[from] CountError),
}

impl Default for SampleOptions {
    fn default() -> Self {
        SampleOptions {
            primitive_options: PrimitiveOptions::default(),
            num_primitive_range: Range::new(3, 25),
            num_max_width_range: Range::new(2, 8),
            num_fc_range: Range::new(1, 8),
            timeout: None,
            preferences: HeuristicPreferences::default(),
        }
    }
}

impl SampleOptions {
    fn validate(&self) -> Result<(), SampleError> {
        let ranges = [
            ("primitive count", self.num_primitive_range),
            ("max width", self.num_max_width_range),
            ("FC count", self.num_fc_range),
        ];
        for (name, range) in ranges {
            if range.min > range.max || range.max == 0 {
                return Err(SampleError::InvalidRange(name));
            }
        }
        Ok(())
    }

    /// Options for every step of a walk, specialized to the reference network.
    fn walk_options(&self, net: Option<&NetSpecs>) -> PrimitiveOptions {
        let mut options = self.primitive_options.clone();
        if let Some(net) = net {
            options.algebra_specs = net.layer_static_specs(&self.preferences);
            options.group_factors.extend(&net.c_gcd_factors);
            options.group_factors.sort_unstable();
            options.group_factors.dedup();
            if net.no_neighbor_involved {
                options.forbidden_filter.push("unfold".to_string());
                options.forbidden_filter.push("shift".to_string());
            }
        }
        options
    }
}

fn is_fc(p: &Primitive) -> bool {
    matches!(p, Primitive::FC(_))
}

/// Samples kernels until one is accepted or the timeout passes.
///
/// Accepted kernels are recorded in `seen` and never returned twice.
pub fn sample<R: Rng>(
    net: Option<&NetSpecs>,
    options: &SampleOptions,
    rng: &mut R,
    seen: &Mutex<HashSet<u64>>,
) -> Result<Sample, SampleError> {
    options.validate()?;
    let walk_options = options.walk_options(net);
    let start = Instant::now();
    let mut attempts = 0;
    loop {
        if let Some(timeout) = options.timeout {
            if start.elapsed() >= timeout {
                log::warn!("Sampling timed out after {attempts} attempts");
                return Err(SampleError::Timeout { timeout, attempts });
            }
        }
        attempts += 1;
        let Some(graph) = random_walk(options, &walk_options, rng)? else {
            continue;
        };
        if let Some(mut accepted) = check(net, options, graph, seen)? {
            accepted.attempts = attempts;
            log::info!(
                "Accepted kernel {:#018x} with {} primitives after {} attempts",
                accepted.graph.hash(),
                accepted.graph.primitives().len(),
                attempts
            );
            return Ok(accepted);
        }
    }
}

/// Samples `count` distinct kernels on the rayon thread pool, one seeded walker per kernel.
pub fn sample_parallel(
    net: Option<&NetSpecs>,
    options: &SampleOptions,
    seed: u64,
    count: usize,
) -> Vec<Result<Sample, SampleError>> {
    let seen = Mutex::new(HashSet::new());
    (0..count)
        .into_par_iter()
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            sample(net, options, &mut rng, &seen)
        })
        .collect()
}

/// Builds one finished graph, or returns `None` when the walk reaches a dead end.
fn random_walk<R: Rng>(
    options: &SampleOptions,
    walk_options: &PrimitiveOptions,
    rng: &mut R,
) -> Result<Option<KernelGraph>, GraphError> {
    let (primitives, widths) = (options.num_primitive_range, options.num_max_width_range);
    let budget = rng.gen_range(primitives.min..=primitives.max);
    let max_width = rng.gen_range(widths.min..=widths.max);
    log::debug!("Walking with budget {budget} and max width {max_width}");

    let mut graph = KernelGraph::new();
    while !graph.is_finished() {
        let placed = graph.primitives().len() - 1;
        let width = graph.width();
        let mut step = walk_options.clone();
        if graph.count_primitives(is_fc) >= options.num_fc_range.max {
            step.forbidden_filter.push("fc".to_string());
        }
        if placed >= budget {
            if width > 1 {
                step.max_delta_width = DeltaWidth::Reduce;
            } else {
                step.output_filter = true;
            }
        }

        let mut applies = get_primitive_applies(&graph, &step, None);
        applies.retain(|pa| {
            let delta = pa.delta_width(&graph);
            let grows_too_wide = delta > 0 && width as i32 + delta > max_width as i32;
            let early_output = pa.op.is_output() && placed < budget;
            !grows_too_wide && !early_output
        });
        let weighted = rescale_possibilities(&graph, applies, &step.algebra_specs);
        if weighted.is_empty() {
            log::trace!("Walk reached a dead end after {placed} primitives");
            return Ok(None);
        }
        let Ok(dist) = WeightedIndex::new(weighted.iter().map(|(_, w)| *w)) else {
            return Ok(None);
        };
        let Some((pa, _)) = weighted.into_iter().nth(dist.sample(rng)) else {
            return Ok(None);
        };
        graph.apply(pa)?;
    }
    Ok(Some(graph))
}

/// Accepts or rejects a finished graph.
fn check(
    net: Option<&NetSpecs>,
    options: &SampleOptions,
    graph: KernelGraph,
    seen: &Mutex<HashSet<u64>>,
) -> Result<Option<Sample>, SampleError> {
    graph.legality_check();
    let placed = graph.count_primitives(|p| !p.is_input() && !p.is_output());
    if !options.num_primitive_range.contains(placed) {
        log::trace!("Rejected: {placed} primitives");
        return Ok(None);
    }
    let fc_count = graph.count_primitives(is_fc);
    if !options.num_fc_range.contains(fc_count) {
        log::trace!("Rejected: {fc_count} FCs");
        return Ok(None);
    }
    let hash = graph.hash();
    if seen.lock().contains(&hash) {
        log::trace!("Rejected: {hash:#018x} was already sampled");
        return Ok(None);
    }

    let (fills, verdict) = match net {
        None => (None, None),
        Some(net) => {
            let Some(fills) = NetFills::minimum(net, &graph, &options.preferences) else {
                log::trace!("Rejected: no valid fills");
                return Ok(None);
            };
            let verdict = evaluate(net, &graph, &options.preferences, Some(&fills))?;
            if !verdict.accepted() {
                log::trace!("Rejected: {verdict}");
                return Ok(None);
            }
            (Some(fills), Some(verdict))
        }
    };

    // Another worker may have accepted the same kernel meanwhile.
    if !seen.lock().insert(hash) {
        return Ok(None);
    }
    Ok(Some(Sample {
        graph,
        fills,
        verdict,
        attempts: 0,
    }))
}

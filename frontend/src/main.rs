#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use std::time::{Duration, Instant};

use canvas::common::Range;
use canvas::factory::{DeltaWidth, PrimitiveOptions};
use canvas::netspecs::{HeuristicPreferences, NetSpecs};
use canvas::pprint::{pprint, GraphPrintStyle};
use canvas::sample::{sample_parallel, SampleOptions};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Reference network, e.g. `0.1, 1.0, 0.1, 1.0, [1, [64,64,3,1,32,32]]`
    #[arg(long)]
    net: Option<String>,

    /// Seed of the first sampler; sampler `i` uses `seed + i`
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Number of parallel jobs
    #[arg(long, short)]
    jobs: Option<usize>,

    /// Number of distinct kernels to sample
    #[arg(long, short = 'n', default_value_t = 1)]
    count: usize,

    /// Comma-separated primitive names to allow (all when empty)
    #[arg(long, default_value = "")]
    allowed: String,

    /// Comma-separated primitive names to forbid
    #[arg(long, default_value = "")]
    forbidden: String,

    #[arg(long, value_delimiter = ',', default_values_t = [3, 5, 7])]
    kernel_sizes: Vec<u32>,

    #[arg(long, value_delimiter = ',', default_values_t = [1, 2, 3])]
    dilated_sizes: Vec<u32>,

    #[arg(long, value_delimiter = ',', default_values_t = [1, 2, 3])]
    shift_sizes: Vec<u32>,

    #[arg(long, default_value_t = 3)]
    min_primitives: usize,

    #[arg(long, default_value_t = 25)]
    max_primitives: usize,

    #[arg(long, default_value_t = 2)]
    min_width: usize,

    #[arg(long, default_value_t = 8)]
    max_width: usize,

    #[arg(long, default_value_t = 1)]
    min_fcs: usize,

    #[arg(long, default_value_t = 8)]
    max_fcs: usize,

    /// Limit on the width change of a single step
    #[arg(long, value_enum, default_value_t = DeltaWidth::Unlimited)]
    delta_width: DeltaWidth,

    /// Per-kernel timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Fuse BatchNorm and ReLU into every FC
    #[arg(long, default_value_t = false)]
    fc_bn_relu: bool,

    /// Group count assumed for `G`
    #[arg(short, default_value_t = 2)]
    g: u64,

    /// Reduction factor assumed for `R`
    #[arg(short, default_value_t = 2)]
    r: u64,

    #[arg(long, value_enum, default_value_t = GraphPrintStyle::Full)]
    style: GraphPrintStyle,
}

impl Args {
    fn sample_options(&self) -> SampleOptions {
        let primitive_options = PrimitiveOptions {
            kernel_sizes: self.kernel_sizes.clone(),
            dilated_sizes: self.dilated_sizes.clone(),
            shift_sizes: self.shift_sizes.clone(),
            max_delta_width: self.delta_width,
            add_relu_bn_after_fc: self.fc_bn_relu,
            ..PrimitiveOptions::with_filters(&self.allowed, &self.forbidden)
        };
        SampleOptions {
            primitive_options,
            num_primitive_range: Range::new(self.min_primitives, self.max_primitives),
            num_max_width_range: Range::new(self.min_width, self.max_width),
            num_fc_range: Range::new(self.min_fcs, self.max_fcs),
            timeout: self.timeout.map(Duration::from_secs),
            preferences: HeuristicPreferences {
                g: self.g,
                r: self.r,
            },
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(jobs) = args.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()
            .context("Failed to configure the thread pool")?;
    }

    let net = args
        .net
        .as_deref()
        .map(NetSpecs::parse)
        .transpose()
        .context("Invalid network specification")?;
    if let Some(net) = &net {
        info!("Sampling against {net}");
        info!(
            "FLOPs budget {}, params budget {}",
            net.flops_range, net.ps_range
        );
    }

    let options = args.sample_options();
    let start_time = Instant::now();
    let results = sample_parallel(net.as_ref(), &options, args.seed, args.count);
    info!(
        "Sampled {} kernels in {:?}",
        results.len(),
        start_time.elapsed()
    );

    let mut failures = 0;
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(sampled) => {
                println!("Kernel {i} ({:#018x}):", sampled.graph.hash());
                pprint(&sampled.graph, args.style);
                if let Some(fills) = &sampled.fills {
                    println!("Fills: {fills}");
                }
                if let Some(verdict) = &sampled.verdict {
                    println!("{verdict}");
                }
                println!();
            }
            Err(e) => {
                warn!("Sampler {i} failed: {e}");
                failures += 1;
            }
        }
    }
    if failures == args.count && args.count > 0 {
        anyhow::bail!("No kernel could be sampled");
    }
    Ok(())
}

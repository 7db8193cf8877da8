use iai_callgrind::{library_benchmark, library_benchmark_group, main, LibraryBenchmarkConfig};
use std::hint::black_box;

use canvas::expr::StaticVar;
use canvas::factory::{get_primitive_applies, PrimitiveOptions};
use canvas::graph::KernelGraph;
use canvas::netspecs::{HeuristicPreferences, NetSpecs};
use canvas::primitive::{Unfold, FC};
use canvas::shape::SpatialDims;

fn two_tensor_graph() -> KernelGraph {
    let mut g = KernelGraph::new();
    let unfold = g
        .apply_primitive(
            Unfold {
                dims: SpatialDims::HW,
                k: 3,
                d: 1,
            }
            .into(),
            &[g.input()],
        )
        .unwrap();
    let t = g.primitive(unfold).outs[0];
    g.apply_primitive(FC::new(StaticVar::C.into()).into(), &[t])
        .unwrap();
    g
}

#[library_benchmark]
fn enumerate_applies() {
    let g = two_tensor_graph();
    let options = PrimitiveOptions::default();
    black_box(get_primitive_applies(&g, &options, None));
}

#[library_benchmark]
fn enumerate_applies_with_algebra_check() {
    let net = NetSpecs::parse("0.1, 1.0, 0.1, 1.0, [1, [64,64,3,1,32,32]]").unwrap();
    let options = PrimitiveOptions {
        algebra_specs: net.layer_static_specs(&HeuristicPreferences::default()),
        ..Default::default()
    };
    let g = two_tensor_graph();
    black_box(get_primitive_applies(&g, &options, None));
}

#[library_benchmark]
fn hash_graph() {
    let g = two_tensor_graph();
    black_box(g.hash());
}

library_benchmark_group!(
    name = primitive_applies_group;
    benchmarks = enumerate_applies, enumerate_applies_with_algebra_check, hash_graph
);

main!(
    config = LibraryBenchmarkConfig::default()
                .raw_callgrind_args([
                    "--simulate-wb=no", "--simulate-hwpref=yes",
                    "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64",
                ]);
    library_benchmark_groups = primitive_applies_group
);

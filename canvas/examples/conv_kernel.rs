//! This example builds a standard 3x3 convolution by hand and costs it against a network.

use canvas::count::{evaluate, kernel_flops_count, kernel_ps_count};
use canvas::expr::{DynamicFills, StaticVar};
use canvas::graph::KernelGraph;
use canvas::netspecs::{HeuristicPreferences, NetSpecs};
use canvas::pprint::{pprint, GraphPrintStyle};
use canvas::primitive::{Unfold, FC};
use canvas::shape::SpatialDims;

const NET: &str = "0.1, 1.0, 0.1, 1.0, [2, [16,16,3,1,8,8], [32,32,3,1,4,4]]";

fn main() {
    // A convolution is an unfold of every 3x3 neighborhood followed by a fully-connected layer
    // over the unfolded channels.
    let mut graph = KernelGraph::new();
    let unfold = graph
        .apply_primitive(
            Unfold {
                dims: SpatialDims::HW,
                k: 3,
                d: 1,
            }
            .into(),
            &[graph.input()],
        )
        .unwrap();
    let unfolded = graph.primitive(unfold).outs[0];
    graph
        .apply_primitive(FC::new(StaticVar::C.into()).into(), &[unfolded])
        .unwrap();
    graph.apply_output().unwrap();
    pprint(&graph, GraphPrintStyle::Full);

    // Every layer of the network is replaced by the same kernel.
    let net = NetSpecs::parse(NET).unwrap();
    let preferences = HeuristicPreferences::default();
    for (i, specs) in net.layer_static_specs(&preferences).iter().enumerate() {
        let fills = DynamicFills::default();
        println!(
            "Layer {i}: {} params, {} FLOPs",
            kernel_ps_count(&graph, specs, &fills).unwrap(),
            kernel_flops_count(&graph, specs, &fills).unwrap()
        );
    }

    // No dynamic variables were introduced, so no fills are needed.
    let verdict = evaluate(&net, &graph, &preferences, None).unwrap();
    println!("{verdict}");
    assert!(verdict.accepted());
}

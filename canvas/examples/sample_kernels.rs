//! This example samples a few distinct kernels for a small network.

use canvas::common::Range;
use canvas::netspecs::NetSpecs;
use canvas::pprint::{pprint, GraphPrintStyle};
use canvas::sample::{sample_parallel, SampleOptions};

use std::time::Duration;

const NET: &str = "0.05, 0.5, 0.05, 0.5, [2, [32,32,3,1,16,16], [32,64,3,2,16,16]]";

fn main() {
    let net = NetSpecs::parse(NET).unwrap();
    println!("Network: {net}");

    let options = SampleOptions {
        num_primitive_range: Range::new(3, 12),
        num_max_width_range: Range::new(1, 4),
        timeout: Some(Duration::from_secs(30)),
        ..SampleOptions::default()
    };
    for result in sample_parallel(Some(&net), &options, 42, 3) {
        match result {
            Ok(sampled) => {
                pprint(&sampled.graph, GraphPrintStyle::Compact);
                if let Some(verdict) = sampled.verdict {
                    println!("{verdict}\n");
                }
            }
            Err(e) => println!("{e}"),
        }
    }
}

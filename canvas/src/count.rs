//! Static cost estimates of a kernel, per layer and across a reference network.

use smallvec::SmallVec;

use std::fmt::{self, Display};

use crate::common::{MAX_BATCH_SIZE, MAX_TENSOR_ELEMENTS};
use crate::expr::{DynamicFills, FillError, StaticSpecs};
use crate::graph::{KernelGraph, PrimitiveNode, TensorId};
use crate::netspecs::{merge_into_static_specs, HeuristicPreferences, NetFills, NetSpecs};
use crate::shape::Shape;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CountError {
    #[error("Graph has {0} unsolved dynamic variables, but no fills were given")]
    MissingFills(usize),
    #[error("Expected fills for {expected} layers, but got {got}")]
    FillCount { expected: usize, got: usize },
    #[error("Layer {layer}: {source}")]
    Fill {
        layer: usize,
        #[source]
        source: FillError,
    },
}

/// The outcome of checking a kernel against a reference network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub flops: u64,
    pub ps: u64,
    pub flops_in_range: bool,
    pub ps_in_range: bool,
    /// Whether every tensor of every layer fits the batched size limit.
    pub fits: bool,
}

fn node_shapes(
    graph: &KernelGraph,
    node: &PrimitiveNode,
) -> (SmallVec<[Shape; 2]>, SmallVec<[Shape; 1]>) {
    let shape = |&t: &TensorId| graph.tensor(t).shape;
    let ins = node.ins.iter().map(shape).collect();
    let outs = node.outs.iter().map(shape).collect();
    (ins, outs)
}

pub fn kernel_ps_count(
    graph: &KernelGraph,
    specs: &StaticSpecs,
    fills: &DynamicFills,
) -> Result<u64, FillError> {
    graph.primitives().iter().try_fold(0u64, |acc, node| {
        let (ins, outs) = node_shapes(graph, node);
        let ps = node.op.ps_count(&ins, &outs, specs, fills)?;
        acc.checked_add(ps).ok_or(FillError::Overflow)
    })
}

pub fn kernel_flops_count(
    graph: &KernelGraph,
    specs: &StaticSpecs,
    fills: &DynamicFills,
) -> Result<u64, FillError> {
    graph.primitives().iter().try_fold(0u64, |acc, node| {
        let (ins, outs) = node_shapes(graph, node);
        let flops = node.op.flops_count(&ins, &outs, specs, fills)?;
        acc.checked_add(flops).ok_or(FillError::Overflow)
    })
}

/// Returns `true` if every tensor, batched, stays within the runtime's element limit.
///
/// Tensors which cannot be evaluated do not fit.
pub fn kernel_check_tensor_size_overflow(
    graph: &KernelGraph,
    specs: &StaticSpecs,
    fills: &DynamicFills,
) -> bool {
    graph.tensors().iter().all(|t| {
        t.shape
            .pi()
            .fill_to_integer(specs, fills)
            .ok()
            .and_then(|size| size.checked_mul(MAX_BATCH_SIZE))
            .map_or(false, |batched| batched <= MAX_TENSOR_ELEMENTS)
    })
}

/// Pairs every layer's static specs with its fills, checking the fill preconditions.
fn layer_inputs(
    net: &NetSpecs,
    graph: &KernelGraph,
    preferences: &HeuristicPreferences,
    fills: Option<&NetFills>,
) -> Result<Vec<(StaticSpecs, DynamicFills)>, CountError> {
    let specs = net
        .layers
        .iter()
        .map(|l| merge_into_static_specs(preferences, l));
    match fills {
        None => {
            let unsolved = graph.dynamic_var_count();
            if unsolved > 0 {
                return Err(CountError::MissingFills(unsolved));
            }
            Ok(specs.map(|s| (s, DynamicFills::default())).collect())
        }
        Some(fills) => {
            if fills.len() != net.layers.len() {
                return Err(CountError::FillCount {
                    expected: net.layers.len(),
                    got: fills.len(),
                });
            }
            Ok(specs.zip(fills.iter().copied()).collect())
        }
    }
}

fn net_sum(
    net: &NetSpecs,
    graph: &KernelGraph,
    preferences: &HeuristicPreferences,
    fills: Option<&NetFills>,
    count: fn(&KernelGraph, &StaticSpecs, &DynamicFills) -> Result<u64, FillError>,
) -> Result<u64, CountError> {
    let mut sum = 0u64;
    for (layer, (specs, layer_fills)) in layer_inputs(net, graph, preferences, fills)?
        .into_iter()
        .enumerate()
    {
        let fill_error = |source| CountError::Fill { layer, source };
        let value = count(graph, &specs, &layer_fills).map_err(fill_error)?;
        sum = sum
            .checked_add(value)
            .ok_or(FillError::Overflow)
            .map_err(fill_error)?;
    }
    Ok(sum)
}

pub fn net_ps_count(
    net: &NetSpecs,
    graph: &KernelGraph,
    preferences: &HeuristicPreferences,
    fills: Option<&NetFills>,
) -> Result<u64, CountError> {
    net_sum(net, graph, preferences, fills, kernel_ps_count)
}

pub fn net_flops_count(
    net: &NetSpecs,
    graph: &KernelGraph,
    preferences: &HeuristicPreferences,
    fills: Option<&NetFills>,
) -> Result<u64, CountError> {
    net_sum(net, graph, preferences, fills, kernel_flops_count)
}

pub fn net_check_tensor_size_overflow(
    net: &NetSpecs,
    graph: &KernelGraph,
    preferences: &HeuristicPreferences,
    fills: Option<&NetFills>,
) -> Result<bool, CountError> {
    Ok(layer_inputs(net, graph, preferences, fills)?
        .iter()
        .all(|(specs, layer_fills)| kernel_check_tensor_size_overflow(graph, specs, layer_fills)))
}

impl NetFills {
    /// The minimum fills of every layer, or `None` if some layer has no valid fill.
    pub fn minimum(
        net: &NetSpecs,
        graph: &KernelGraph,
        preferences: &HeuristicPreferences,
    ) -> Option<NetFills> {
        net.layer_static_specs(preferences)
            .iter()
            .map(|specs| graph.get_minimum_fills(specs))
            .collect::<Option<Vec<_>>>()
            .map(NetFills)
    }
}

/// Costs `graph` as the block of every layer of `net` and compares against its budgets.
pub fn evaluate(
    net: &NetSpecs,
    graph: &KernelGraph,
    preferences: &HeuristicPreferences,
    fills: Option<&NetFills>,
) -> Result<Verdict, CountError> {
    let flops = net_flops_count(net, graph, preferences, fills)?;
    let ps = net_ps_count(net, graph, preferences, fills)?;
    let fits = net_check_tensor_size_overflow(net, graph, preferences, fills)?;
    Ok(Verdict {
        flops,
        ps,
        flops_in_range: net.flops_range.contains(flops),
        ps_in_range: net.ps_range.contains(ps),
        fits,
    })
}

impl Verdict {
    pub fn accepted(&self) -> bool {
        self.flops_in_range && self.ps_in_range && self.fits
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |ok: bool| if ok { "ok" } else { "out of range" };
        write!(
            f,
            "FLOPs {} ({}), params {} ({}), tensors {}",
            self.flops,
            mark(self.flops_in_range),
            self.ps,
            mark(self.ps_in_range),
            if self.fits { "fit" } else { "overflow" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{StaticVar, Variable};
    use crate::primitive::test_utils::small_specs;
    use crate::primitive::{Group, Norm, NormType, FC};
    use proptest::prelude::*;

    const NET: &str = "0.1, 1.0, 0.1, 1.0, [2, [4,4,3,1,8,8],[4,4,3,1,8,8]]";

    fn fc_graph(out_channels: Variable) -> KernelGraph {
        let mut g = KernelGraph::new();
        let fc = g
            .apply_primitive(FC::new(out_channels).into(), &[g.input()])
            .unwrap();
        let t = g.primitive(fc).outs[0];
        g.apply_primitive(Group::new(StaticVar::G.into()).into(), &[t])
            .unwrap();
        g
    }

    #[test]
    fn test_kernel_counts() {
        let mut g = KernelGraph::new();
        g.apply_primitive(FC::new(StaticVar::C.into()).into(), &[g.input()])
            .unwrap();
        let fills = DynamicFills::default();
        assert_eq!(kernel_ps_count(&g, &small_specs(), &fills), Ok(64));
        assert_eq!(kernel_flops_count(&g, &small_specs(), &fills), Ok(64 * 16));
    }

    #[test]
    fn test_tensor_size_overflow() {
        let g = KernelGraph::new();
        let (specs, fills) = (small_specs(), DynamicFills::default());
        assert!(kernel_check_tensor_size_overflow(&g, &specs, &fills));
        let huge = StaticSpecs {
            g: 1,
            r: 1,
            c: 1024,
            h: 128,
            w: 128,
        };
        // 1024 * 128 * 128 * 512 = 2^33
        assert!(!kernel_check_tensor_size_overflow(&g, &huge, &fills));
    }

    #[test]
    fn test_net_counts_require_fills() {
        let net: NetSpecs = NET.parse().unwrap();
        let g = fc_graph(Variable::dynamic(0));
        let prefs = HeuristicPreferences::default();
        assert_eq!(
            net_ps_count(&net, &g, &prefs, None),
            Err(CountError::MissingFills(1))
        );
        assert_eq!(
            net_ps_count(&net, &g, &prefs, Some(&NetFills::default())),
            Err(CountError::FillCount {
                expected: 2,
                got: 0
            })
        );
        let fills = NetFills::minimum(&net, &g, &prefs).unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills.get(0).and_then(|f| f.get(0)), Some(2));
        // C=4 channels in, two channels out, twice.
        assert_eq!(net_ps_count(&net, &g, &prefs, Some(&fills)), Ok(2 * 4 * 2));
    }

    #[test]
    fn test_evaluate_static_kernel() {
        let net: NetSpecs = NET.parse().unwrap();
        let mut g = fc_graph(StaticVar::C.into());
        g.apply_primitive(Norm(NormType::BatchNorm).into(), &[g.out().unwrap()])
            .unwrap();
        let verdict = evaluate(&net, &g, &HeuristicPreferences::default(), None).unwrap();
        // Per layer: FC 4*4 params and 16*64 FLOPs, BatchNorm 2*4 params and 2*256 FLOPs.
        assert_eq!(verdict.ps, 2 * (16 + 8));
        assert_eq!(verdict.flops, 2 * (16 * 64 + 512));
        assert!(!verdict.flops_in_range);
        assert!(verdict.ps_in_range);
        assert!(verdict.fits);
        assert!(!verdict.accepted());
    }

    proptest! {
        #[test]
        fn test_empty_kernel_is_free(
            g in 1u64..64, r in 1u64..64, c in 1u64..4096, h in 1u64..512, w in 1u64..512
        ) {
            let specs = StaticSpecs { g, r, c, h, w };
            let mut graph = KernelGraph::new();
            graph.apply_output().unwrap();
            let fills = DynamicFills::default();
            prop_assert_eq!(kernel_ps_count(&graph, &specs, &fills), Ok(0));
            prop_assert_eq!(kernel_flops_count(&graph, &specs, &fills), Ok(0));
        }
    }
}

//! Enumeration of the legal next steps from a partial [KernelGraph].

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use strum::IntoEnumIterator;

use std::collections::{HashMap, HashSet};

use crate::expr::{DynamicFills, FillError, StaticSpecs, StaticVar, Variable};
use crate::graph::{KernelGraph, PrimitiveApply, TensorId};
use crate::primitive::softmax::SOFTMAX_DIMS;
use crate::primitive::{
    Activation, ActivationType, Broadcast, BroadcastType, ChannelShuffle, ElementWise,
    ElementWiseType, Fold, FoldType, Group, Norm, NormType, Output, Pool, PoolType, Primitive,
    PrimitiveT, Shift, Softmax, Transpose, Unfold, FC,
};
use crate::shape::{Shape, SpatialDims, SHAPE_RANK};

/// Which changes to the number of sink tensors a candidate may make.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum DeltaWidth {
    /// Only candidates which consume more sinks than they produce.
    Reduce,
    /// Only candidates which leave the sink count unchanged.
    Retain,
    #[default]
    Unlimited,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Width delta policy must be -1, 0 or 1, not {0}")]
pub struct InvalidDeltaWidth(pub i32);

/// Hyperparameter candidates and policy for [get_primitive_applies].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PrimitiveOptions {
    pub kernel_sizes: Vec<u32>,
    pub dilated_sizes: Vec<u32>,
    pub shift_sizes: Vec<u32>,
    /// Literal group factors tried in addition to `G` and a fresh dynamic variable.
    pub group_factors: Vec<u64>,
    /// Only propose Output.
    pub output_filter: bool,
    /// Canonical-name prefixes; when non-empty, candidates must match one.
    pub allowed_filter: Vec<String>,
    /// Canonical-name prefixes which candidates must not match.
    pub forbidden_filter: Vec<String>,
    pub max_delta_width: DeltaWidth,
    /// Fuse a BatchNorm and ReLU into every generated FC.
    pub add_relu_bn_after_fc: bool,
    /// Also expand from tensors which already have consumers, growing the graph's width.
    pub fan_out: bool,
    /// Layers the resulting graph must stay solvable for.
    pub algebra_specs: Vec<StaticSpecs>,
}

impl DeltaWidth {
    pub fn allows(&self, delta: i32) -> bool {
        match self {
            DeltaWidth::Reduce => delta < 0,
            DeltaWidth::Retain => delta == 0,
            DeltaWidth::Unlimited => true,
        }
    }
}

impl TryFrom<i32> for DeltaWidth {
    type Error = InvalidDeltaWidth;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(DeltaWidth::Reduce),
            0 => Ok(DeltaWidth::Retain),
            1 => Ok(DeltaWidth::Unlimited),
            _ => Err(InvalidDeltaWidth(value)),
        }
    }
}

impl Default for PrimitiveOptions {
    fn default() -> Self {
        PrimitiveOptions {
            kernel_sizes: vec![3, 5, 7],
            dilated_sizes: vec![1, 2, 3],
            shift_sizes: vec![1, 2, 3],
            group_factors: vec![],
            output_filter: false,
            allowed_filter: vec![],
            forbidden_filter: vec![],
            max_delta_width: DeltaWidth::Unlimited,
            add_relu_bn_after_fc: false,
            fan_out: true,
            algebra_specs: vec![],
        }
    }
}

impl PrimitiveOptions {
    /// Builds options from comma-separated allowed and forbidden name filters.
    pub fn with_filters(allowed: &str, forbidden: &str) -> Self {
        PrimitiveOptions {
            allowed_filter: parse_name_filter(allowed),
            forbidden_filter: parse_name_filter(forbidden),
            ..Default::default()
        }
    }

    pub fn with_delta_width(max_delta_width: DeltaWidth) -> Self {
        PrimitiveOptions {
            max_delta_width,
            ..Default::default()
        }
    }

    /// Returns `true` if the primitive's canonical name passes the allowed and forbidden filters.
    /// Input and Output always pass.
    pub fn name_allowed(&self, op: &Primitive) -> bool {
        if op.is_input() || op.is_output() {
            return true;
        }
        let name = canonical_name(&op.name());
        let family = canonical_name(op.family());
        let matches =
            |token: &String| name.starts_with(token.as_str()) || family.starts_with(token.as_str());
        if self.forbidden_filter.iter().any(matches) {
            return false;
        }
        self.allowed_filter.is_empty() || self.allowed_filter.iter().any(matches)
    }

    /// Returns `true` if the candidate should be kept.
    ///
    /// Policy checks run first; the candidate is only applied to a copy of `graph` when a hash
    /// exclusion set or algebra specs make that necessary.
    pub fn filter(
        &self,
        graph: &KernelGraph,
        pa: &PrimitiveApply,
        excluded: Option<&HashSet<u64>>,
    ) -> bool {
        if self.output_filter && !pa.op.is_output() {
            return false;
        }
        if !self.name_allowed(&pa.op) {
            return false;
        }
        if !self.max_delta_width.allows(pa.delta_width(graph)) {
            return false;
        }
        let excluded = excluded.filter(|e| !e.is_empty());
        if excluded.is_none() && self.algebra_specs.is_empty() {
            return true;
        }
        let Ok((next, _)) = graph.copy_and_apply(pa.clone()) else {
            return false;
        };
        if excluded.map_or(false, |e| e.contains(&next.hash())) {
            return false;
        }
        self.algebra_specs
            .iter()
            .all(|specs| next.get_minimum_fills(specs).is_some())
    }
}

/// Lowercase ASCII alphanumerics of a primitive name, as matched by name filters.
pub fn canonical_name(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn parse_name_filter(s: &str) -> Vec<String> {
    s.split(',')
        .map(canonical_name)
        .filter(|token| !token.is_empty())
        .collect()
}

/// Enumerates every legal [PrimitiveApply] for `graph` which passes `options`.
///
/// Trials which do not apply are dropped silently. Candidates whose resulting graph hashes into
/// `excluded` are dropped as well.
pub fn get_primitive_applies(
    graph: &KernelGraph,
    options: &PrimitiveOptions,
    excluded: Option<&HashSet<u64>>,
) -> Vec<PrimitiveApply> {
    if graph.is_finished() {
        return vec![];
    }
    let mut applies = Vec::new();
    if let Some(out) = graph.out() {
        applies.extend(output_apply(graph, out));
    }

    if !options.output_filter {
        let sinks = graph.outs();
        let expansion_points = if options.fan_out {
            graph.tensor_ids().collect::<Vec<_>>()
        } else {
            sinks.clone()
        };
        let fresh_var = graph.next_unused_dynamic_var_index();
        for &t in &expansion_points {
            for op in single_input_trials(options, fresh_var) {
                applies.extend(PrimitiveApply::new(graph, op, &[t]).ok());
            }
        }
        for (&lhs, &rhs) in sinks.iter().tuple_combinations() {
            applies.extend(two_input_applies(graph, lhs, rhs));
        }
    }

    let total = applies.len();
    applies.retain(|pa| options.filter(graph, pa, excluded));
    log::trace!(
        "{} of {} candidates passed filters for graph {:#018x}",
        applies.len(),
        total,
        graph.hash()
    );
    applies
}

fn output_apply(graph: &KernelGraph, out: TensorId) -> Option<PrimitiveApply> {
    let shape = graph.tensor(out).shape;
    if shape.is_standard() {
        return PrimitiveApply::new(graph, Output.into(), &[out]).ok();
    }
    let solution = shape.solve_to(&Shape::standard())?;
    PrimitiveApply::with_solution(graph, Output.into(), &[out], solution).ok()
}

/// Every single-input primitive parameterization worth trying.
fn single_input_trials(options: &PrimitiveOptions, fresh_var: Option<usize>) -> Vec<Primitive> {
    let mut trials: Vec<Primitive> = Vec::new();
    trials.extend(ActivationType::iter().map(|t| Activation(t).into()));
    trials.extend(NormType::iter().map(|t| Norm(t).into()));
    trials.extend(
        PoolType::iter()
            .cartesian_product(SpatialDims::iter())
            .map(|(typ, dims)| Pool { typ, dims }.into()),
    );
    trials.extend(SOFTMAX_DIMS.iter().map(|&d| Softmax(d).into()));

    let c = Variable::from(StaticVar::C);
    let mut widths = vec![c, c / Variable::from(StaticVar::R)];
    widths.extend(fresh_var.map(Variable::dynamic));
    trials.extend(widths.into_iter().map(|out_channels| {
        FC {
            out_channels,
            with_norm_relu: options.add_relu_bn_after_fc,
        }
        .into()
    }));

    for dims in SpatialDims::iter() {
        for (&k, &d) in options
            .kernel_sizes
            .iter()
            .cartesian_product(&options.dilated_sizes)
        {
            trials.push(Unfold { dims, k, d }.into());
        }
        trials.extend(FoldType::iter().map(|typ| Fold { dims, typ }.into()));
        for &k in &options.shift_sizes {
            trials.push(Shift { dims, k }.into());
        }
    }

    let mut factors = vec![Variable::from(StaticVar::G)];
    factors.extend(fresh_var.map(Variable::dynamic));
    factors.extend(
        options
            .group_factors
            .iter()
            .filter(|&&f| f > 1)
            .map(|&f| Variable::number(f)),
    );
    trials.extend(factors.into_iter().map(|f| Group::new(f).into()));
    trials.push(Transpose.into());
    trials.push(ChannelShuffle.into());
    trials
}

fn two_input_applies(graph: &KernelGraph, lhs: TensorId, rhs: TensorId) -> Vec<PrimitiveApply> {
    let mut applies = Vec::new();
    let (lhs_shape, rhs_shape) = (graph.tensor(lhs).shape, graph.tensor(rhs).shape);
    let solution = if lhs_shape == rhs_shape {
        None
    } else {
        lhs_shape
            .solve_to(&rhs_shape)
            .or_else(|| rhs_shape.solve_to(&lhs_shape))
    };
    for typ in ElementWiseType::iter() {
        let op: Primitive = ElementWise(typ).into();
        let pa = match solution {
            Some(s) => PrimitiveApply::with_solution(graph, op, &[lhs, rhs], s),
            None => PrimitiveApply::new(graph, op, &[lhs, rhs]),
        };
        applies.extend(pa.ok());
    }
    for typ in BroadcastType::iter() {
        for ins in [[lhs, rhs], [rhs, lhs]] {
            applies.extend(PrimitiveApply::new(graph, Broadcast(typ).into(), &ins).ok());
        }
    }
    applies
}

#[derive(PartialEq, Eq, Hash)]
enum Signature {
    Numeric {
        kind: Primitive,
        ins: SmallVec<[TensorId; 2]>,
        per_layer: Vec<(SmallVec<[[u64; SHAPE_RANK]; 1]>, u64, u64)>,
    },
    Symbolic(PrimitiveApply),
}

/// Removes candidates which are numerically indistinguishable under every layer in `specs`, and
/// weighs the survivors so each primitive family has equal total probability.
pub fn rescale_possibilities(
    graph: &KernelGraph,
    applies: Vec<PrimitiveApply>,
    specs: &[StaticSpecs],
) -> Vec<(PrimitiveApply, f64)> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(applies.len());
    for pa in applies {
        if seen.insert(signature(graph, &pa, specs)) {
            unique.push(pa);
        }
    }

    let mut family_sizes: HashMap<&'static str, usize> = HashMap::new();
    for pa in &unique {
        *family_sizes.entry(pa.op.family()).or_default() += 1;
    }
    let family_count = family_sizes.len() as f64;
    unique
        .into_iter()
        .map(|pa| {
            let weight = 1.0 / (family_count * family_sizes[pa.op.family()] as f64);
            (pa, weight)
        })
        .collect()
}

fn signature(graph: &KernelGraph, pa: &PrimitiveApply, specs: &[StaticSpecs]) -> Signature {
    let op = &pa.op;
    let in_shapes = pa
        .ins
        .iter()
        .map(|&t| {
            let shape = graph.tensor(t).shape;
            pa.solution.as_ref().map_or(shape, |s| shape.subs(s))
        })
        .collect::<SmallVec<[_; 2]>>();
    let fills = DynamicFills::default();
    let per_layer = specs
        .iter()
        .map(|layer| {
            let outs = pa
                .out_shapes
                .iter()
                .map(|s| s.fill_to_integers(layer, &fills))
                .collect::<Result<SmallVec<[_; 1]>, _>>()?;
            let ps = op.ps_count(&in_shapes, &pa.out_shapes, layer, &fills)?;
            let flops = op.flops_count(&in_shapes, &pa.out_shapes, layer, &fills)?;
            Ok((outs, ps, flops))
        })
        .collect::<Result<Vec<_>, FillError>>();
    match per_layer {
        Ok(per_layer) if !specs.is_empty() => Signature::Numeric {
            kind: numeric_erased(op),
            ins: pa.ins.clone(),
            per_layer,
        },
        _ => Signature::Symbolic(pa.clone()),
    }
}

/// `op` with its numeric hyperparameters cleared, so that only kernel sizes, shift distances,
/// group factors and widths may merge in [rescale_possibilities].
fn numeric_erased(op: &Primitive) -> Primitive {
    match op.clone() {
        Primitive::Unfold(u) => Unfold { k: 0, d: 0, ..u }.into(),
        Primitive::Shift(s) => Shift { k: 0, ..s }.into(),
        Primitive::Group(_) => Group::new(Variable::number(1)).into(),
        Primitive::FC(fc) => FC {
            out_channels: Variable::number(1),
            ..fc
        }
        .into(),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::test_utils::small_specs;
    use proptest::prelude::*;

    fn relu() -> Primitive {
        Activation(ActivationType::ReLU).into()
    }

    fn branched_graph() -> KernelGraph {
        let mut g = KernelGraph::new();
        g.apply_primitive(relu(), &[g.input()]).unwrap();
        g.apply_primitive(Norm(NormType::BatchNorm).into(), &[g.input()])
            .unwrap();
        g
    }

    #[test]
    fn test_delta_width_from_int() {
        assert_eq!(DeltaWidth::try_from(-1), Ok(DeltaWidth::Reduce));
        assert_eq!(DeltaWidth::try_from(0), Ok(DeltaWidth::Retain));
        assert_eq!(DeltaWidth::try_from(1), Ok(DeltaWidth::Unlimited));
        assert_eq!(DeltaWidth::try_from(2), Err(InvalidDeltaWidth(2)));
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("Unfold_H_K3_D1"), "unfoldhk3d1");
        assert_eq!(
            parse_name_filter(" ReLU, fc ,,"),
            vec!["relu".to_string(), "fc".to_string()]
        );
    }

    #[test]
    fn test_new_graph_applies() {
        let g = KernelGraph::new();
        let applies = get_primitive_applies(&g, &PrimitiveOptions::default(), None);
        assert!(applies.iter().any(|pa| pa.op.is_output()));
        assert!(applies.iter().any(|pa| matches!(pa.op, Primitive::FC(_))));
        // Nothing is pooled, grouped or unfolded yet.
        assert!(!applies.iter().any(|pa| matches!(pa.op, Primitive::Fold(_))));
        assert!(!applies
            .iter()
            .any(|pa| matches!(pa.op, Primitive::ChannelShuffle(_))));
        for pa in applies {
            let (next, _) = g.copy_and_apply(pa).unwrap();
            next.legality_check();
        }
    }

    #[test]
    fn test_finished_graph_has_no_applies() {
        let mut g = KernelGraph::new();
        g.apply_output().unwrap();
        assert!(get_primitive_applies(&g, &PrimitiveOptions::default(), None).is_empty());
    }

    #[test]
    fn test_output_filter() {
        let options = PrimitiveOptions {
            output_filter: true,
            ..Default::default()
        };
        let applies = get_primitive_applies(&KernelGraph::new(), &options, None);
        assert_eq!(applies.len(), 1);
        assert!(applies[0].op.is_output());
        assert!(get_primitive_applies(&branched_graph(), &options, None).is_empty());
    }

    #[test]
    fn test_output_solves_dynamic_channels() {
        let mut g = KernelGraph::new();
        g.apply_primitive(FC::new(Variable::dynamic(0)).into(), &[g.input()])
            .unwrap();
        let options = PrimitiveOptions {
            output_filter: true,
            ..Default::default()
        };
        let applies = get_primitive_applies(&g, &options, None);
        assert_eq!(applies.len(), 1);
        assert!(applies[0].solution.is_some());
    }

    #[test]
    fn test_name_filters() {
        let options = PrimitiveOptions::with_filters("fc", "");
        let applies = get_primitive_applies(&KernelGraph::new(), &options, None);
        assert!(applies
            .iter()
            .all(|pa| matches!(pa.op, Primitive::FC(_) | Primitive::Output(_))));

        let options = PrimitiveOptions::with_filters("", "relu,unfold");
        let applies = get_primitive_applies(&KernelGraph::new(), &options, None);
        assert!(!applies.is_empty());
        assert!(applies.iter().all(|pa| !matches!(
            pa.op,
            Primitive::Unfold(_) | Primitive::Activation(Activation(ActivationType::ReLU))
        )));
    }

    #[test]
    fn test_two_input_candidates_need_two_sinks() {
        let options = PrimitiveOptions::with_delta_width(DeltaWidth::Reduce);
        let g = branched_graph();
        let applies = get_primitive_applies(&g, &options, None);
        assert!(!applies.is_empty());
        assert!(applies.iter().all(|pa| pa.op.input_count() == 2));
        let add = applies
            .iter()
            .filter(|pa| pa.op == Primitive::from(ElementWise(ElementWiseType::Add)))
            .count();
        assert_eq!(add, 1);
    }

    #[test]
    fn test_excluded_hashes() {
        let g = KernelGraph::new();
        let options = PrimitiveOptions::default();
        let all = get_primitive_applies(&g, &options, None);
        let (next, _) = g.copy_and_apply(all[0].clone()).unwrap();
        let excluded = HashSet::from([next.hash()]);
        let remaining = get_primitive_applies(&g, &options, Some(&excluded));
        assert_eq!(remaining.len(), all.len() - 1);
        assert!(!remaining.contains(&all[0]));
    }

    #[test]
    fn test_algebra_specs_reject_unsolvable() {
        // C = 6 cannot be split into G = 4 groups.
        let specs = StaticSpecs {
            g: 4,
            r: 2,
            c: 6,
            h: 4,
            w: 4,
        };
        let options = PrimitiveOptions {
            algebra_specs: vec![specs],
            ..Default::default()
        };
        let g = KernelGraph::new();
        let applies = get_primitive_applies(&g, &options, None);
        let group_g: Primitive = Group::new(StaticVar::G.into()).into();
        assert!(!applies.iter().any(|pa| pa.op == group_g));
        assert!(applies
            .iter()
            .any(|pa| matches!(pa.op, Primitive::Group(_))));
        for pa in applies {
            let (next, _) = g.copy_and_apply(pa).unwrap();
            let fills = next.get_minimum_fills(&specs).unwrap();
            assert!(next.algebra_check(&specs, &fills));
        }
    }

    #[test]
    fn test_rescale_dedups_and_balances_families() {
        let g = KernelGraph::new();
        let options = PrimitiveOptions {
            shift_sizes: vec![1, 2],
            allowed_filter: vec!["shift".to_string(), "relu".to_string()],
            fan_out: false,
            ..Default::default()
        };
        let applies = get_primitive_applies(&g, &options, None);
        // Shift by 1 or 2 over H, W and HW, ReLU, and Output.
        assert_eq!(applies.len(), 8);
        let weighted = rescale_possibilities(&g, applies, &[small_specs()]);
        // Both shift sizes look identical numerically.
        assert_eq!(weighted.len(), 5);
        let total: f64 = weighted.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-9);
        let shift_mass: f64 = weighted
            .iter()
            .filter(|(pa, _)| pa.op.family() == "Shift")
            .map(|(_, w)| w)
            .sum();
        assert!((shift_mass - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rescale_keeps_distinct_activations() {
        let g = KernelGraph::new();
        let options = PrimitiveOptions {
            allowed_filter: vec!["relu".into(), "sigmoid".into(), "gelu".into()],
            fan_out: false,
            ..Default::default()
        };
        let applies = get_primitive_applies(&g, &options, None);
        assert_eq!(applies.len(), 4);
        let weighted = rescale_possibilities(&g, applies, &[small_specs()]);
        let mut names = weighted
            .iter()
            .map(|(pa, _)| pa.op.name())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["GeLU", "Output", "ReLU", "Sigmoid"]);
        for (pa, w) in &weighted {
            let expected = if pa.op.is_output() { 0.5 } else { 1.0 / 6.0 };
            assert!((w - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rescale_keeps_pool_types_and_dims() {
        let g = KernelGraph::new();
        let options = PrimitiveOptions {
            allowed_filter: vec!["pool".into()],
            fan_out: false,
            ..Default::default()
        };
        let applies = get_primitive_applies(&g, &options, None);
        let before = applies.len();
        assert!(before > 2);
        let weighted = rescale_possibilities(&g, applies, &[small_specs()]);
        assert_eq!(weighted.len(), before);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_walk_respects_policies(
            choices in proptest::collection::vec(any::<prop::sample::Index>(), 1..10),
            policy in prop_oneof![
                Just(DeltaWidth::Reduce),
                Just(DeltaWidth::Retain),
                Just(DeltaWidth::Unlimited),
            ],
        ) {
            let specs = small_specs();
            let mut g = KernelGraph::new();
            let walk_options = PrimitiveOptions {
                kernel_sizes: vec![3],
                dilated_sizes: vec![1],
                shift_sizes: vec![1],
                algebra_specs: vec![specs],
                ..Default::default()
            };
            for choice in choices {
                let checked = PrimitiveOptions {
                    max_delta_width: policy,
                    ..walk_options.clone()
                };
                let width = g.width() as i32;
                for pa in get_primitive_applies(&g, &checked, None) {
                    prop_assert!(policy.allows(pa.delta_width(&g)));
                    let (next, _) = g.copy_and_apply(pa).unwrap();
                    prop_assert!(policy.allows(next.width() as i32 - width));
                    let fills = next.get_minimum_fills(&specs);
                    prop_assert!(fills.is_some());
                    prop_assert!(next.algebra_check(&specs, &fills.unwrap()));
                }

                let applies = get_primitive_applies(&g, &walk_options, None);
                if applies.is_empty() {
                    break;
                }
                let pa = choice.get(&applies).clone();
                g.apply(pa).unwrap();
                g.legality_check();
            }
        }
    }
}

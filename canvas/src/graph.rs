use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use crate::expr::{DynamicFills, StaticSpecs, VarSolution, Variable, MAX_DYNAMIC_VARS};
use crate::primitive::{ApplyError, Input, OutShapes, Output, Primitive, PrimitiveT};
use crate::shape::Shape;
use crate::utils::hash_combine;

const GRAPH_HASH_SEED: u64 = 0x6b65_726e_656c_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct TensorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct PrimitiveId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Tensor {
    pub shape: Shape,
    pub producer: PrimitiveId,
    pub consumers: SmallVec<[PrimitiveId; 2]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PrimitiveNode {
    pub op: Primitive,
    pub ins: SmallVec<[TensorId; 2]>,
    pub outs: SmallVec<[TensorId; 1]>,
}

/// A primitive bound to tensors of a particular graph, with its outputs already inferred.
///
/// Building a [PrimitiveApply] never mutates the graph. If `solution` is set, applying commits
/// it to the graph before the primitive is attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PrimitiveApply {
    pub op: Primitive,
    pub ins: SmallVec<[TensorId; 2]>,
    pub out_shapes: OutShapes,
    pub solution: Option<VarSolution>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cannot apply to a finished graph")]
    Finished,
    #[error("Tensor {0:?} does not belong to this graph")]
    DanglingTensor(TensorId),
    #[error("A graph has exactly one Input primitive")]
    ExtraInput,
    #[error("Output would attach to no tensor")]
    NoSinks,
    #[error("Output must consume the only sink of the graph")]
    OutputNotLast,
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// A kernel: a DAG of tensors and primitives rooted at a single input tensor.
///
/// Tensors and primitives live in per-graph arenas and refer to each other by index, so
/// [Clone] is a complete, independent copy. Primitives are stored in topological order.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KernelGraph {
    input: TensorId,
    tensors: Vec<Tensor>,
    primitives: Vec<PrimitiveNode>,
    /// Bitmask of dynamic variable indices which were solved and may not be reused.
    retired_vars: u8,
    #[serde(skip)]
    hash_cache: OnceLock<u64>,
}

impl PrimitiveApply {
    /// Binds `op` to `ins` and infers its outputs, or returns why it does not apply.
    ///
    /// Panics if any of `ins` does not belong to `graph`.
    pub fn new(graph: &KernelGraph, op: Primitive, ins: &[TensorId]) -> Result<Self, ApplyError> {
        let in_shapes = ins
            .iter()
            .map(|&t| graph.tensor(t).shape)
            .collect::<SmallVec<[_; 2]>>();
        let out_shapes = op.check_and_infer(&in_shapes)?;
        Ok(PrimitiveApply {
            op,
            ins: ins.into(),
            out_shapes,
            solution: None,
        })
    }

    /// Like [PrimitiveApply::new], but infers outputs as if `solution` had already been
    /// committed to the graph.
    pub fn with_solution(
        graph: &KernelGraph,
        mut op: Primitive,
        ins: &[TensorId],
        solution: VarSolution,
    ) -> Result<Self, ApplyError> {
        op.substitute(&solution);
        let in_shapes = ins
            .iter()
            .map(|&t| graph.tensor(t).shape.subs(&solution))
            .collect::<SmallVec<[_; 2]>>();
        let out_shapes = op.check_and_infer(&in_shapes)?;
        Ok(PrimitiveApply {
            op,
            ins: ins.into(),
            out_shapes,
            solution: Some(solution),
        })
    }

    /// The change in the number of sink tensors if this were applied to `graph`.
    pub fn delta_width(&self, graph: &KernelGraph) -> i32 {
        let mut consumed_sinks = SmallVec::<[TensorId; 2]>::new();
        for &t in &self.ins {
            if graph.tensor(t).consumers.is_empty() && !consumed_sinks.contains(&t) {
                consumed_sinks.push(t);
            }
        }
        self.out_shapes.len() as i32 - consumed_sinks.len() as i32
    }
}

impl Display for PrimitiveApply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ins = self
            .ins
            .iter()
            .map(|t| format!("t{}", t.0))
            .collect::<Vec<_>>();
        write!(f, "{}({})", self.op, ins.join(", "))?;
        if let Some(solution) = &self.solution {
            write!(f, " with {solution}")?;
        }
        Ok(())
    }
}

impl KernelGraph {
    /// Creates a graph holding only the Input primitive and the input tensor.
    pub fn new() -> Self {
        let input = TensorId(0);
        KernelGraph {
            input,
            tensors: vec![Tensor {
                shape: Shape::standard(),
                producer: PrimitiveId(0),
                consumers: SmallVec::new(),
            }],
            primitives: vec![PrimitiveNode {
                op: Input.into(),
                ins: SmallVec::new(),
                outs: smallvec::smallvec![input],
            }],
            retired_vars: 0,
            hash_cache: OnceLock::new(),
        }
    }

    pub fn input(&self) -> TensorId {
        self.input
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0]
    }

    pub fn primitive(&self, id: PrimitiveId) -> &PrimitiveNode {
        &self.primitives[id.0]
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    /// All primitives, in topological order.
    pub fn primitives(&self) -> &[PrimitiveNode] {
        &self.primitives
    }

    pub fn tensor_ids(&self) -> impl Iterator<Item = TensorId> {
        (0..self.tensors.len()).map(TensorId)
    }

    /// Returns `true` once an Output primitive has been attached.
    pub fn is_finished(&self) -> bool {
        self.primitives.iter().any(|p| p.op.is_output())
    }

    /// The single tensor without consumers, or `None` if there are zero or several.
    pub fn out(&self) -> Option<TensorId> {
        let mut outs = self.outs().into_iter();
        match (outs.next(), outs.next()) {
            (Some(t), None) => Some(t),
            _ => None,
        }
    }

    /// Tensors without consumers, in creation order.
    pub fn outs(&self) -> Vec<TensorId> {
        self.tensor_ids()
            .filter(|&t| self.tensor(t).consumers.is_empty())
            .collect()
    }

    pub fn width(&self) -> usize {
        self.tensors
            .iter()
            .filter(|t| t.consumers.is_empty())
            .count()
    }

    /// Returns `true` if the graph is not finished but has a single standard-shaped sink, so
    /// only an Output is missing.
    pub fn is_topological_finished(&self) -> bool {
        !self.is_finished()
            && self
                .out()
                .map(|t| self.tensor(t).shape.is_standard())
                .unwrap_or(false)
    }

    pub fn count_primitives(&self, pred: impl Fn(&Primitive) -> bool) -> usize {
        self.primitives.iter().filter(|p| pred(&p.op)).count()
    }

    /// Dynamic variable indices occurring in any shape or hyperparameter, ascending.
    pub fn dynamic_vars(&self) -> BTreeSet<usize> {
        let mut vars = BTreeSet::new();
        for t in &self.tensors {
            vars.extend(t.shape.dynamic_vars());
        }
        for p in &self.primitives {
            for v in p.op.variables() {
                vars.extend(v.dynamic_vars());
            }
        }
        vars
    }

    pub fn dynamic_var_count(&self) -> usize {
        self.dynamic_vars().len()
    }

    /// The lowest dynamic variable index which is neither in use nor already solved.
    pub fn next_unused_dynamic_var_index(&self) -> Option<usize> {
        let used = self.dynamic_vars();
        (0..MAX_DYNAMIC_VARS).find(|i| !used.contains(i) && self.retired_vars & (1 << i) == 0)
    }

    pub fn apply_primitive(
        &mut self,
        op: Primitive,
        ins: &[TensorId],
    ) -> Result<PrimitiveId, GraphError> {
        self.check_ins(ins)?;
        let pa = PrimitiveApply::new(self, op, ins)?;
        self.apply(pa)
    }

    /// Appends a primitive and its output tensors, first committing the attached solution.
    ///
    /// Nothing is mutated if an error is returned.
    pub fn apply(&mut self, pa: PrimitiveApply) -> Result<PrimitiveId, GraphError> {
        if self.is_finished() {
            return Err(GraphError::Finished);
        }
        if pa.op.is_input() {
            return Err(GraphError::ExtraInput);
        }
        self.check_ins(&pa.ins)?;
        if pa.op.is_output() && (self.width() != 1 || pa.delta_width(self) != -1) {
            return Err(GraphError::OutputNotLast);
        }

        let mut op = pa.op;
        let in_shapes = pa
            .ins
            .iter()
            .map(|&t| {
                let shape = self.tensor(t).shape;
                pa.solution.as_ref().map_or(shape, |s| shape.subs(s))
            })
            .collect::<SmallVec<[_; 2]>>();
        if let Some(solution) = &pa.solution {
            op.substitute(solution);
        }
        let out_shapes = op.check_and_infer(&in_shapes)?;
        debug_assert_eq!(out_shapes, pa.out_shapes);

        if let Some(solution) = &pa.solution {
            self.solve_dynamic_var(solution);
        }
        let id = PrimitiveId(self.primitives.len());
        let mut outs = SmallVec::new();
        for shape in out_shapes {
            outs.push(TensorId(self.tensors.len()));
            self.tensors.push(Tensor {
                shape,
                producer: id,
                consumers: SmallVec::new(),
            });
        }
        for &t in &pa.ins {
            self.tensors[t.0].consumers.push(id);
        }
        log::trace!("Applied {} as primitive {}", op, id.0);
        self.primitives.push(PrimitiveNode {
            op,
            ins: pa.ins,
            outs,
        });
        self.hash_cache.take();
        Ok(id)
    }

    /// Attaches an Output primitive to every sink, finishing the graph.
    pub fn apply_output(&mut self) -> Result<(), GraphError> {
        if self.is_finished() {
            return Err(GraphError::Finished);
        }
        let sinks = self.outs();
        if sinks.is_empty() {
            return Err(GraphError::NoSinks);
        }
        let applies = sinks
            .into_iter()
            .map(|t| PrimitiveApply::new(self, Output.into(), &[t]))
            .collect::<Result<Vec<_>, _>>()?;
        for pa in applies {
            let id = PrimitiveId(self.primitives.len());
            self.tensors[pa.ins[0].0].consumers.push(id);
            self.primitives.push(PrimitiveNode {
                op: pa.op,
                ins: pa.ins,
                outs: SmallVec::new(),
            });
        }
        self.hash_cache.take();
        Ok(())
    }

    /// Returns a copy of the graph with `pa` applied, and the id of the new primitive.
    pub fn copy_and_apply(
        &self,
        pa: PrimitiveApply,
    ) -> Result<(KernelGraph, PrimitiveId), GraphError> {
        let mut copy = self.clone();
        let id = copy.apply(pa)?;
        Ok((copy, id))
    }

    /// Resolves a primitive of `self` to the equivalent primitive in `other`, a graph copied
    /// from `self` (possibly extended since).
    ///
    /// Copies preserve arena positions, so this is a lookup plus a structural check.
    pub fn remap_primitive(&self, other: &KernelGraph, id: PrimitiveId) -> Option<PrimitiveId> {
        let ours = self.primitives.get(id.0)?;
        let theirs = other.primitives.get(id.0)?;
        let same_producer = |&t: &TensorId| self.tensor(t).producer == other.tensor(t).producer;
        let same_ins = ours.ins == theirs.ins && ours.ins.iter().all(same_producer);
        let same_op = std::mem::discriminant(&ours.op) == std::mem::discriminant(&theirs.op);
        (same_ins && same_op && ours.outs == theirs.outs).then_some(id)
    }

    /// Replaces a dynamic variable everywhere it occurs. The index is never handed out again.
    pub fn solve_dynamic_var(&mut self, solution: &VarSolution) {
        log::trace!("Solving {solution}");
        for t in &mut self.tensors {
            t.shape = t.shape.subs(solution);
        }
        for p in &mut self.primitives {
            p.op.substitute(solution);
        }
        self.retired_vars |= 1 << solution.index;
        self.hash_cache.take();
    }

    /// Checks that every expression whose dynamic variables are all filled is a positive integer,
    /// and that every primitive's numeric constraints hold.
    pub fn algebra_check(&self, specs: &StaticSpecs, fills: &DynamicFills) -> bool {
        let fails = |v: &Variable| v.check_filled(specs, fills) == Some(false);
        if self
            .tensors
            .iter()
            .any(|t| t.shape.dims().iter().any(fails))
        {
            return false;
        }
        self.primitives.iter().all(|p| {
            let in_shapes = p
                .ins
                .iter()
                .map(|&t| self.tensor(t).shape)
                .collect::<SmallVec<[_; 2]>>();
            !p.op.variables().iter().any(fails)
                && !p.op.constraint_expressions(&in_shapes).iter().any(fails)
                && p.op.satisfies_constraints(&in_shapes, specs, fills)
        })
    }

    /// Finds the lexicographically smallest positive fill of every dynamic variable for which
    /// [KernelGraph::algebra_check] holds, searching values up to the largest static spec.
    pub fn get_minimum_fills(&self, specs: &StaticSpecs) -> Option<DynamicFills> {
        let vars = self.dynamic_vars().into_iter().collect::<Vec<_>>();
        let bound = [specs.g, specs.r, specs.c, specs.h, specs.w]
            .into_iter()
            .max()
            .unwrap_or(1);
        let mut fills = DynamicFills::default();
        if self.fill_from(&vars, specs, bound, &mut fills) {
            Some(fills)
        } else {
            None
        }
    }

    fn fill_from(
        &self,
        vars: &[usize],
        specs: &StaticSpecs,
        bound: u64,
        fills: &mut DynamicFills,
    ) -> bool {
        let Some((&var, rest)) = vars.split_first() else {
            return self.algebra_check(specs, fills);
        };
        for value in 1..=bound {
            fills.set(var, value);
            if self.algebra_check(specs, fills) && self.fill_from(rest, specs, bound, fills) {
                return true;
            }
        }
        fills.clear(var);
        false
    }

    /// The structural hash, computed on first use after each mutation.
    pub fn hash(&self) -> u64 {
        *self.hash_cache.get_or_init(|| self.calculate_hash())
    }

    fn calculate_hash(&self) -> u64 {
        let mut memo = vec![None; self.tensors.len()];
        let mut roots = Vec::new();
        for t in self.tensor_ids() {
            if self.tensor(t).consumers.is_empty() {
                roots.push(self.tensor_hash(t, &mut memo));
            }
        }
        for p in &self.primitives {
            if p.outs.is_empty() {
                roots.push(self.node_hash(p, &mut memo));
            }
        }
        roots.sort_unstable();
        roots.into_iter().fold(GRAPH_HASH_SEED, hash_combine)
    }

    fn tensor_hash(&self, t: TensorId, memo: &mut [Option<u64>]) -> u64 {
        if let Some(h) = memo[t.0] {
            return h;
        }
        let producer = self.primitive(self.tensor(t).producer);
        let position = producer.outs.iter().position(|&o| o == t).unwrap_or(0);
        let h = hash_combine(self.node_hash(producer, memo), position as u64);
        memo[t.0] = Some(h);
        h
    }

    fn node_hash(&self, node: &PrimitiveNode, memo: &mut [Option<u64>]) -> u64 {
        let mut children = node
            .ins
            .iter()
            .map(|&t| self.tensor_hash(t, memo))
            .collect::<SmallVec<[_; 2]>>();
        if node.op.is_commutative() {
            children.sort_unstable();
        }
        children.into_iter().fold(op_hash(&node.op), hash_combine)
    }

    fn check_ins(&self, ins: &[TensorId]) -> Result<(), GraphError> {
        match ins.iter().find(|t| t.0 >= self.tensors.len()) {
            Some(&t) => Err(GraphError::DanglingTensor(t)),
            None => Ok(()),
        }
    }

    /// Asserts the structural invariants of the graph. Panics on violation.
    pub fn legality_check(&self) {
        assert!(!self.primitives.is_empty(), "graph has no Input primitive");
        assert!(
            self.primitives[0].op.is_input(),
            "first primitive is not Input"
        );
        assert_eq!(self.primitives[0].outs.as_slice(), &[self.input]);
        assert_eq!(
            self.count_primitives(Primitive::is_input),
            1,
            "graph has more than one Input"
        );

        let mut owners = vec![0usize; self.tensors.len()];
        for (idx, p) in self.primitives.iter().enumerate() {
            let id = PrimitiveId(idx);
            assert_eq!(p.ins.len(), p.op.input_count(), "{} has wrong arity", p.op);
            for &t in &p.ins {
                let tensor = &self.tensors[t.0];
                assert!(
                    tensor.producer < id,
                    "{} consumes tensor {} before it is produced",
                    p.op,
                    t.0
                );
                let uses = p.ins.iter().filter(|&&u| u == t).count();
                let edges = tensor.consumers.iter().filter(|&&c| c == id).count();
                assert_eq!(
                    uses, edges,
                    "consumer edges of tensor {} are inconsistent",
                    t.0
                );
            }
            for &t in &p.outs {
                assert_eq!(
                    self.tensors[t.0].producer, id,
                    "tensor {} has wrong producer",
                    t.0
                );
                owners[t.0] += 1;
            }
        }
        for (idx, tensor) in self.tensors.iter().enumerate() {
            assert_eq!(owners[idx], 1, "tensor {idx} is not produced exactly once");
            for &c in &tensor.consumers {
                assert!(
                    self.primitives[c.0].ins.contains(&TensorId(idx)),
                    "tensor {idx} lists a consumer which does not read it"
                );
            }
        }
        if self.is_finished() {
            assert_eq!(self.width(), 0, "finished graph has unconsumed tensors");
        }
    }
}

impl Default for KernelGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for KernelGraph {
    fn eq(&self, other: &Self) -> bool {
        self.input == other.input
            && self.tensors == other.tensors
            && self.primitives == other.primitives
    }
}

impl Eq for KernelGraph {}

fn op_hash(op: &Primitive) -> u64 {
    let mut hasher = DefaultHasher::new();
    op.hash(&mut hasher);
    hasher.finish()
}

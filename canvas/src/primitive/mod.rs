use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use std::fmt::{self, Display};

use crate::expr::{DynamicFills, FillError, StaticSpecs, VarSolution, Variable};
use crate::shape::{Dim, Shape};

pub use activation::{Activation, ActivationType};
pub use broadcast::{Broadcast, BroadcastType};
pub use channel_shuffle::ChannelShuffle;
pub use element_wise::{ElementWise, ElementWiseType};
pub use fc::FC;
pub use fold::{Fold, FoldType, Unfold};
pub use group::Group;
pub use input::Input;
pub use norm::{Norm, NormType};
pub use output::Output;
pub use pool::{Pool, PoolType};
pub use shift::Shift;
pub use softmax::Softmax;
pub use transpose::Transpose;

pub mod activation;
pub mod broadcast;
pub mod channel_shuffle;
pub mod element_wise;
pub mod fc;
pub mod fold;
pub mod group;
pub mod input;
pub mod norm;
pub mod output;
pub mod pool;
pub mod shift;
pub mod softmax;
pub mod transpose;

/// Output shapes of a primitive. Every primitive in the vocabulary has at most one output.
pub type OutShapes = SmallVec<[Shape; 1]>;

/// A sum of monomials, used for parameter and FLOP counts.
pub type Terms = SmallVec<[Variable; 2]>;

#[enum_dispatch]
pub trait PrimitiveT {
    /// The name of the primitive including its hyperparameters, e.g. `Unfold_H_K3_D1`.
    fn name(&self) -> String;

    /// The name of the primitive's family, shared by all hyperparameter choices.
    fn family(&self) -> &'static str;

    fn input_count(&self) -> usize {
        1
    }

    /// Whether the inputs play interchangeable roles.
    fn is_commutative(&self) -> bool {
        false
    }

    /// Computes output shapes, or rejects the input shapes.
    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError>;

    /// Expressions, beyond tensor dimensions, which must be positive integers.
    fn constraint_expressions(&self, _ins: &[Shape]) -> Terms {
        Terms::new()
    }

    /// Numeric constraints which can only be decided for a concrete layer. Constraints over
    /// unfilled dynamic variables are treated as satisfied.
    fn satisfies_constraints(
        &self,
        _ins: &[Shape],
        _specs: &StaticSpecs,
        _fills: &DynamicFills,
    ) -> bool {
        true
    }

    fn ps_terms(&self, _ins: &[Shape], _outs: &[Shape]) -> Terms {
        Terms::new()
    }

    fn flops_terms(&self, _ins: &[Shape], _outs: &[Shape]) -> Terms {
        Terms::new()
    }

    /// Symbolic hyperparameters, which may mention dynamic variables.
    fn variables(&self) -> Terms {
        Terms::new()
    }

    fn substitute(&mut self, _solution: &VarSolution) {}
}

/// An operation in the kernel vocabulary, holding its own hyperparameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[enum_dispatch(PrimitiveT)]
pub enum Primitive {
    Input(Input),
    Output(Output),
    Activation(Activation),
    Norm(Norm),
    Pool(Pool),
    Softmax(Softmax),
    FC(FC),
    Unfold(Unfold),
    Fold(Fold),
    Group(Group),
    Shift(Shift),
    Transpose(Transpose),
    ChannelShuffle(ChannelShuffle),
    ElementWise(ElementWise),
    Broadcast(Broadcast),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Primitive does not apply to these tensors: {0}")]
    NotApplicable(NotApplicableReason),
    #[error("Primitive takes {expected} inputs, but {got} were given")]
    InputCount { expected: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotApplicableReason {
    ShapeMismatch,
    DimIsOne(Dim),
    DimIsNotOne(Dim),
    NotStandardShape,
    NoOp,
    Other(Option<&'static str>),
}

impl Primitive {
    pub fn is_output(&self) -> bool {
        matches!(self, Primitive::Output(_))
    }

    pub fn is_input(&self) -> bool {
        matches!(self, Primitive::Input(_))
    }

    /// Checks the input count, then infers outputs.
    pub fn check_and_infer(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        if ins.len() != self.input_count() {
            return Err(ApplyError::InputCount {
                expected: self.input_count(),
                got: ins.len(),
            });
        }
        self.infer_outputs(ins)
    }

    pub fn ps_count(
        &self,
        ins: &[Shape],
        outs: &[Shape],
        specs: &StaticSpecs,
        fills: &DynamicFills,
    ) -> Result<u64, FillError> {
        sum_terms(&self.ps_terms(ins, outs), specs, fills)
    }

    pub fn flops_count(
        &self,
        ins: &[Shape],
        outs: &[Shape],
        specs: &StaticSpecs,
        fills: &DynamicFills,
    ) -> Result<u64, FillError> {
        sum_terms(&self.flops_terms(ins, outs), specs, fills)
    }
}

impl Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Display for NotApplicableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotApplicableReason::ShapeMismatch => write!(f, "Operand shapes are incompatible"),
            NotApplicableReason::DimIsOne(d) => write!(f, "Dimension {d:?} has size one"),
            NotApplicableReason::DimIsNotOne(d) => write!(f, "Dimension {d:?} is not size one"),
            NotApplicableReason::NotStandardShape => {
                write!(f, "Tensor does not have the kernel's output shape")
            }
            NotApplicableReason::NoOp => write!(f, "Primitive would not change the tensor"),
            NotApplicableReason::Other(Some(reason_string)) => write!(f, "{reason_string}"),
            NotApplicableReason::Other(None) => write!(f, "Unknown reason"),
        }
    }
}

pub(crate) fn not_applicable(reason: NotApplicableReason) -> ApplyError {
    ApplyError::NotApplicable(reason)
}

/// Rejects unless every dimension in `dims` is known to be larger than one.
pub(crate) fn require_not_one(shape: &Shape, dims: &[Dim]) -> Result<(), ApplyError> {
    match dims.iter().find(|&&d| shape[d].is_one()) {
        Some(&d) => Err(not_applicable(NotApplicableReason::DimIsOne(d))),
        None => Ok(()),
    }
}

/// Rejects unless every dimension in `dims` is exactly one.
pub(crate) fn require_one(shape: &Shape, dims: &[Dim]) -> Result<(), ApplyError> {
    match dims.iter().find(|&&d| !shape[d].is_one()) {
        Some(&d) => Err(not_applicable(NotApplicableReason::DimIsNotOne(d))),
        None => Ok(()),
    }
}

pub fn sum_terms(
    terms: &[Variable],
    specs: &StaticSpecs,
    fills: &DynamicFills,
) -> Result<u64, FillError> {
    terms.iter().try_fold(0u64, |acc, t| {
        acc.checked_add(t.fill_to_integer(specs, fills)?)
            .ok_or(FillError::Overflow)
    })
}

/// Evaluates `value` and checks `pred`, treating unfilled dynamic variables as satisfied.
pub(crate) fn check_value(
    value: Variable,
    specs: &StaticSpecs,
    fills: &DynamicFills,
    pred: impl FnOnce(u64) -> bool,
) -> bool {
    match value.fill_to_integer(specs, fills) {
        Ok(v) => pred(v),
        Err(FillError::Unfilled(_)) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use crate::expr::StaticSpecs;

    pub fn small_specs() -> StaticSpecs {
        StaticSpecs {
            g: 2,
            r: 2,
            c: 8,
            h: 4,
            w: 4,
        }
    }
}

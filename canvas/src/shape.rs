use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter, IntoEnumIterator};

use std::fmt::{self, Display};
use std::ops::{Index, IndexMut};

use crate::expr::{DynamicFills, FillError, StaticSpecs, StaticVar, VarSolution, Variable};
use crate::utils::join_into_string;

pub const SHAPE_RANK: usize = Dim::COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumCount, EnumIter)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dim {
    G,
    C,
    KH,
    KW,
    H,
    W,
}

/// Which spatial dimensions a primitive acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumIter)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum SpatialDims {
    H,
    W,
    HW,
}

/// A tensor shape in `[G, C, KH, KW, H, W]` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Shape([Variable; SHAPE_RANK]);

impl Shape {
    /// The shape of a kernel's input and output: `[1, C, 1, 1, H, W]`.
    pub fn standard() -> Self {
        let mut shape = Shape([Variable::one(); SHAPE_RANK]);
        shape[Dim::C] = StaticVar::C.into();
        shape[Dim::H] = StaticVar::H.into();
        shape[Dim::W] = StaticVar::W.into();
        shape
    }

    pub fn is_standard(&self) -> bool {
        *self == Self::standard()
    }

    pub fn dims(&self) -> &[Variable; SHAPE_RANK] {
        &self.0
    }

    /// The total element count.
    pub fn pi(&self) -> Variable {
        self.0.iter().fold(Variable::one(), |acc, &d| acc * d)
    }

    /// The product of every non-spatial dimension.
    pub fn channel(&self) -> Variable {
        self[Dim::G] * self[Dim::C] * self[Dim::KH] * self[Dim::KW]
    }

    pub fn spatial(&self) -> Variable {
        self[Dim::H] * self[Dim::W]
    }

    pub fn subs(&self, solution: &VarSolution) -> Self {
        Shape(self.0.map(|d| d.subs(solution)))
    }

    pub fn dynamic_vars(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().flat_map(|d| d.dynamic_vars())
    }

    /// Evaluates every dimension, failing on the first non-positive-integer one.
    pub fn fill_to_integers(
        &self,
        specs: &StaticSpecs,
        fills: &DynamicFills,
    ) -> Result<[u64; SHAPE_RANK], FillError> {
        let mut result = [0; SHAPE_RANK];
        for (out, d) in result.iter_mut().zip(&self.0) {
            *out = d.fill_to_integer(specs, fills)?;
        }
        Ok(result)
    }

    /// Finds a single dynamic-variable assignment under which `self` and `target` become equal.
    ///
    /// Returns `None` if the shapes are already equal or no single substitution suffices.
    pub fn solve_to(&self, target: &Shape) -> Option<VarSolution> {
        for dim in Dim::iter() {
            if self[dim] == target[dim] {
                continue;
            }
            let ratio = self[dim] / target[dim];
            for index in ratio.dynamic_vars().collect::<Vec<_>>() {
                let power = ratio.dynamic_power(index);
                if power.abs() != 1 {
                    continue;
                }
                let mut rest = ratio;
                rest /= Variable::dynamic(index).powi(power);
                let substitution = if power > 0 {
                    Variable::one() / rest
                } else {
                    rest
                };
                let solution = VarSolution::new(index, substitution);
                if self.subs(&solution) == target.subs(&solution) {
                    return Some(solution);
                }
            }
            // Any solution has to reconcile the first differing dimension.
            return None;
        }
        None
    }
}

impl Index<Dim> for Shape {
    type Output = Variable;

    fn index(&self, dim: Dim) -> &Self::Output {
        &self.0[dim as usize]
    }
}

impl IndexMut<Dim> for Shape {
    fn index_mut(&mut self, dim: Dim) -> &mut Self::Output {
        &mut self.0[dim as usize]
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", join_into_string(self.0.iter(), ", "))
    }
}

impl SpatialDims {
    pub fn dims(&self) -> &'static [Dim] {
        match self {
            SpatialDims::H => &[Dim::H],
            SpatialDims::W => &[Dim::W],
            SpatialDims::HW => &[Dim::H, Dim::W],
        }
    }

    /// The kernel dimension paired with each spatial dimension.
    pub fn kernel_dims(&self) -> &'static [Dim] {
        match self {
            SpatialDims::H => &[Dim::KH],
            SpatialDims::W => &[Dim::KW],
            SpatialDims::HW => &[Dim::KH, Dim::KW],
        }
    }
}

impl Display for SpatialDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::expr::{DynamicFills, StaticSpecs, Variable};
use crate::primitive::{
    check_value, not_applicable, require_not_one, require_one, ApplyError, NotApplicableReason,
    OutShapes, PrimitiveT, Terms,
};
use crate::shape::{Shape, SpatialDims};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumIter, strum::Display)]
pub enum FoldType {
    Avg,
    Max,
}

/// Gathers each pixel's `k`-neighborhood (with dilation `d`) into kernel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Unfold {
    pub dims: SpatialDims,
    pub k: u32,
    pub d: u32,
}

/// Reduces kernel dimensions back to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Fold {
    pub dims: SpatialDims,
    pub typ: FoldType,
}

impl Unfold {
    /// The smallest spatial extent the receptive field fits in.
    pub fn receptive_field(&self) -> u64 {
        u64::from(self.d) * u64::from(self.k - 1) + 1
    }
}

impl PrimitiveT for Unfold {
    fn name(&self) -> String {
        format!("Unfold_{}_K{}_D{}", self.dims, self.k, self.d)
    }

    fn family(&self) -> &'static str {
        "Unfold"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        if self.k <= 1 || self.d == 0 {
            return Err(not_applicable(NotApplicableReason::NoOp));
        }
        require_one(&ins[0], self.dims.kernel_dims())?;
        require_not_one(&ins[0], self.dims.dims())?;
        let mut out = ins[0];
        for &kd in self.dims.kernel_dims() {
            out[kd] = Variable::number(self.k.into());
        }
        Ok(smallvec::smallvec![out])
    }

    fn satisfies_constraints(
        &self,
        ins: &[Shape],
        specs: &StaticSpecs,
        fills: &DynamicFills,
    ) -> bool {
        let field = self.receptive_field();
        self.dims
            .dims()
            .iter()
            .all(|&d| check_value(ins[0][d], specs, fills, |extent| extent >= field))
    }
}

impl PrimitiveT for Fold {
    fn name(&self) -> String {
        format!("Fold_{}_{}", self.dims, self.typ)
    }

    fn family(&self) -> &'static str {
        "Fold"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        require_not_one(&ins[0], self.dims.kernel_dims())?;
        let mut out = ins[0];
        for &kd in self.dims.kernel_dims() {
            out[kd] = Variable::one();
        }
        Ok(smallvec::smallvec![out])
    }

    fn flops_terms(&self, ins: &[Shape], _outs: &[Shape]) -> Terms {
        smallvec::smallvec![ins[0].pi()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::test_utils::small_specs;
    use crate::shape::Dim;

    #[test]
    fn test_unfold_then_fold_restores_shape() {
        let unfold = Unfold {
            dims: SpatialDims::HW,
            k: 3,
            d: 1,
        };
        let unfolded = unfold.infer_outputs(&[Shape::standard()]).unwrap()[0];
        assert_eq!(unfolded[Dim::KH].as_constant(), Some(3));
        assert_eq!(unfolded[Dim::KW].as_constant(), Some(3));
        assert_eq!(
            unfold.infer_outputs(&[unfolded]),
            Err(not_applicable(NotApplicableReason::DimIsNotOne(Dim::KH)))
        );
        let fold = Fold {
            dims: SpatialDims::HW,
            typ: FoldType::Avg,
        };
        assert!(fold.infer_outputs(&[unfolded]).unwrap()[0].is_standard());
    }

    #[test]
    fn test_unfold_receptive_field_must_fit() {
        let ins = [Shape::standard()];
        let fits = Unfold {
            dims: SpatialDims::H,
            k: 3,
            d: 1,
        };
        let too_wide = Unfold {
            dims: SpatialDims::H,
            k: 3,
            d: 2,
        };
        let (specs, fills) = (small_specs(), DynamicFills::default());
        // H = 4
        assert!(fits.satisfies_constraints(&ins, &specs, &fills));
        assert!(!too_wide.satisfies_constraints(&ins, &specs, &fills));
    }
}

use serde::{Deserialize, Serialize};

use crate::expr::{DynamicFills, StaticSpecs};
use crate::primitive::{
    check_value, not_applicable, require_not_one, ApplyError, NotApplicableReason, OutShapes,
    PrimitiveT,
};
use crate::shape::{Shape, SpatialDims};

/// Rolls the spatial dimensions by `k` pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Shift {
    pub dims: SpatialDims,
    pub k: u32,
}

impl PrimitiveT for Shift {
    fn name(&self) -> String {
        format!("Shift_{}_K{}", self.dims, self.k)
    }

    fn family(&self) -> &'static str {
        "Shift"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        if self.k == 0 {
            return Err(not_applicable(NotApplicableReason::NoOp));
        }
        require_not_one(&ins[0], self.dims.dims())?;
        Ok(smallvec::smallvec![ins[0]])
    }

    fn satisfies_constraints(
        &self,
        ins: &[Shape],
        specs: &StaticSpecs,
        fills: &DynamicFills,
    ) -> bool {
        let k = u64::from(self.k);
        self.dims
            .dims()
            .iter()
            .all(|&d| check_value(ins[0][d], specs, fills, |extent| extent > k))
    }
}

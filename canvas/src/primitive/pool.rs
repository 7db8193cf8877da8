use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::expr::Variable;
use crate::primitive::{require_not_one, ApplyError, OutShapes, PrimitiveT, Terms};
use crate::shape::{Shape, SpatialDims};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumIter, strum::Display)]
pub enum PoolType {
    Avg,
    Max,
}

/// Global pooling over one or both spatial dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Pool {
    pub typ: PoolType,
    pub dims: SpatialDims,
}

impl PrimitiveT for Pool {
    fn name(&self) -> String {
        format!("{}Pool_{}", self.typ, self.dims)
    }

    fn family(&self) -> &'static str {
        "Pool"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        require_not_one(&ins[0], self.dims.dims())?;
        let mut out = ins[0];
        for &d in self.dims.dims() {
            out[d] = Variable::one();
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
    use crate::primitive::{not_applicable, NotApplicableReason};
    use crate::shape::Dim;

    #[test]
    fn test_pool_cannot_reapply() {
        let pool = Pool {
            typ: PoolType::Max,
            dims: SpatialDims::HW,
        };
        let pooled = pool.infer_outputs(&[Shape::standard()]).unwrap()[0];
        assert!(pooled[Dim::H].is_one() && pooled[Dim::W].is_one());
        assert_eq!(
            pool.infer_outputs(&[pooled]),
            Err(not_applicable(NotApplicableReason::DimIsOne(Dim::H)))
        );
    }
}

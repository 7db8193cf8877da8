use serde::{Deserialize, Serialize};

use crate::primitive::{require_not_one, ApplyError, OutShapes, PrimitiveT, Terms};
use crate::shape::{Dim, Shape};

/// Softmax along a single dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Softmax(pub Dim);

/// Dimensions a [Softmax] may normalize over.
pub const SOFTMAX_DIMS: [Dim; 3] = [Dim::C, Dim::H, Dim::W];

impl PrimitiveT for Softmax {
    fn name(&self) -> String {
        format!("Softmax_{:?}", self.0)
    }

    fn family(&self) -> &'static str {
        "Softmax"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        require_not_one(&ins[0], &[self.0])?;
        Ok(smallvec::smallvec![ins[0]])
    }

    fn flops_terms(&self, ins: &[Shape], _outs: &[Shape]) -> Terms {
        // exp, sum, divide
        smallvec::smallvec![ins[0].pi() * 3]
    }
}

use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::primitive::{ApplyError, OutShapes, PrimitiveT, Terms};
use crate::shape::Shape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumIter, strum::Display)]
pub enum NormType {
    BatchNorm,
    LayerNorm,
}

/// Normalization with a learned scale and bias per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Norm(pub NormType);

impl PrimitiveT for Norm {
    fn name(&self) -> String {
        self.0.to_string()
    }

    fn family(&self) -> &'static str {
        "Norm"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        Ok(smallvec::smallvec![ins[0]])
    }

    fn ps_terms(&self, ins: &[Shape], _outs: &[Shape]) -> Terms {
        smallvec::smallvec![ins[0].channel() * 2]
    }

    fn flops_terms(&self, ins: &[Shape], _outs: &[Shape]) -> Terms {
        smallvec::smallvec![ins[0].pi() * 2]
    }
}

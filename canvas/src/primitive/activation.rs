use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::primitive::{ApplyError, OutShapes, PrimitiveT, Terms};
use crate::shape::Shape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumIter, strum::Display)]
pub enum ActivationType {
    ReLU,
    GeLU,
    Sigmoid,
    TanH,
    Abs,
    Exp,
    Neg,
    Sin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Activation(pub ActivationType);

impl PrimitiveT for Activation {
    fn name(&self) -> String {
        self.0.to_string()
    }

    fn family(&self) -> &'static str {
        "Activation"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        Ok(smallvec::smallvec![ins[0]])
    }

    fn flops_terms(&self, ins: &[Shape], _outs: &[Shape]) -> Terms {
        smallvec::smallvec![ins[0].pi()]
    }
}

use serde::{Deserialize, Serialize};

use crate::primitive::{ApplyError, OutShapes, PrimitiveT};
use crate::shape::Shape;

/// Produces the kernel's input tensor.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Input;

impl PrimitiveT for Input {
    fn name(&self) -> String {
        "Input".to_string()
    }

    fn family(&self) -> &'static str {
        "Input"
    }

    fn input_count(&self) -> usize {
        0
    }

    fn infer_outputs(&self, _ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        Ok(smallvec::smallvec![Shape::standard()])
    }
}

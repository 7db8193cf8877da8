use serde::{Deserialize, Serialize};

use crate::primitive::{not_applicable, ApplyError, NotApplicableReason, OutShapes, PrimitiveT};
use crate::shape::Shape;

/// Marks a tensor as a kernel output. The tensor must have the kernel's input shape.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Output;

impl PrimitiveT for Output {
    fn name(&self) -> String {
        "Output".to_string()
    }

    fn family(&self) -> &'static str {
        "Output"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        if !ins[0].is_standard() {
            return Err(not_applicable(NotApplicableReason::NotStandardShape));
        }
        Ok(OutShapes::new())
    }
}

use serde::{Deserialize, Serialize};

use crate::primitive::{not_applicable, ApplyError, NotApplicableReason, OutShapes, PrimitiveT};
use crate::shape::{Dim, Shape};

/// Swaps the spatial dimensions along with their kernel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Transpose;

impl PrimitiveT for Transpose {
    fn name(&self) -> String {
        "Transpose".to_string()
    }

    fn family(&self) -> &'static str {
        "Transpose"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        let mut out = ins[0];
        out[Dim::H] = ins[0][Dim::W];
        out[Dim::W] = ins[0][Dim::H];
        out[Dim::KH] = ins[0][Dim::KW];
        out[Dim::KW] = ins[0][Dim::KH];
        if out == ins[0] {
            return Err(not_applicable(NotApplicableReason::NoOp));
        }
        Ok(smallvec::smallvec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_is_involution() {
        let once = Transpose.infer_outputs(&[Shape::standard()]).unwrap()[0];
        let twice = Transpose.infer_outputs(&[once]).unwrap()[0];
        assert!(twice.is_standard());
    }

    #[test]
    fn test_transpose_of_square_is_noop() {
        let mut square = Shape::standard();
        square[Dim::W] = square[Dim::H];
        assert_eq!(
            Transpose.infer_outputs(&[square]),
            Err(not_applicable(NotApplicableReason::NoOp))
        );
    }
}

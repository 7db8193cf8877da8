use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::primitive::{
    not_applicable, ApplyError, NotApplicableReason, OutShapes, PrimitiveT, Terms,
};
use crate::shape::Shape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumIter, strum::Display)]
pub enum BroadcastType {
    Add,
    Mul,
    Sub,
}

/// Broadcasts the first operand up to the shape of the second.
///
/// Every dimension of the first operand must either match the second or be one, and at least
/// one dimension must actually broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Broadcast(pub BroadcastType);

impl PrimitiveT for Broadcast {
    fn name(&self) -> String {
        format!("B{}", self.0)
    }

    fn family(&self) -> &'static str {
        "Broadcast"
    }

    fn input_count(&self) -> usize {
        2
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        let (lhs, rhs) = (&ins[0], &ins[1]);
        if lhs == rhs {
            return Err(not_applicable(NotApplicableReason::Other(Some(
                "Operands already have equal shapes",
            ))));
        }
        let compatible = lhs
            .dims()
            .iter()
            .zip(rhs.dims())
            .all(|(l, r)| l == r || l.is_one());
        if !compatible {
            return Err(not_applicable(NotApplicableReason::ShapeMismatch));
        }
        Ok(smallvec::smallvec![*rhs])
    }

    fn flops_terms(&self, _ins: &[Shape], outs: &[Shape]) -> Terms {
        smallvec::smallvec![outs[0].pi()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Variable;
    use crate::shape::Dim;

    #[test]
    fn test_broadcast_direction() {
        let mut pooled = Shape::standard();
        pooled[Dim::H] = Variable::one();
        pooled[Dim::W] = Variable::one();
        let mul = Broadcast(BroadcastType::Mul);
        let out = mul.infer_outputs(&[pooled, Shape::standard()]).unwrap();
        assert!(out[0].is_standard());
        assert_eq!(
            mul.infer_outputs(&[Shape::standard(), pooled]),
            Err(not_applicable(NotApplicableReason::ShapeMismatch))
        );
    }
}

use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::primitive::{
    not_applicable, ApplyError, NotApplicableReason, OutShapes, PrimitiveT, Terms,
};
use crate::shape::Shape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumIter, strum::Display)]
pub enum ElementWiseType {
    Add,
    Mul,
    Max,
}

/// A binary operation over two tensors of identical shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ElementWise(pub ElementWiseType);

impl PrimitiveT for ElementWise {
    fn name(&self) -> String {
        self.0.to_string()
    }

    fn family(&self) -> &'static str {
        "ElementWise"
    }

    fn input_count(&self) -> usize {
        2
    }

    fn is_commutative(&self) -> bool {
        true
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        if ins[0] != ins[1] {
            return Err(not_applicable(NotApplicableReason::ShapeMismatch));
        }
        Ok(smallvec::smallvec![ins[0]])
    }

    fn flops_terms(&self, ins: &[Shape], _outs: &[Shape]) -> Terms {
        smallvec::smallvec![ins[0].pi()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Variable;
    use crate::primitive::Primitive;
    use crate::shape::Dim;

    #[test]
    fn test_element_wise_requires_equal_shapes() {
        let add = Primitive::from(ElementWise(ElementWiseType::Add));
        let mut pooled = Shape::standard();
        pooled[Dim::H] = Variable::one();
        let standard = [Shape::standard(), Shape::standard()];
        assert!(add.check_and_infer(&standard).is_ok());
        assert_eq!(
            add.check_and_infer(&[Shape::standard(), pooled]),
            Err(not_applicable(NotApplicableReason::ShapeMismatch))
        );
        assert_eq!(
            add.check_and_infer(&[Shape::standard()]),
            Err(ApplyError::InputCount {
                expected: 2,
                got: 1
            })
        );
    }
}

use serde::{Deserialize, Serialize};

use crate::expr::{VarSolution, Variable};
use crate::primitive::{
    not_applicable, require_not_one, require_one, ApplyError, NotApplicableReason, OutShapes,
    PrimitiveT, Terms,
};
use crate::shape::{Dim, Shape};

/// Splits the channel dimension into `factor` groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Group {
    pub factor: Variable,
}

impl Group {
    pub fn new(factor: Variable) -> Self {
        Group { factor }
    }
}

impl PrimitiveT for Group {
    fn name(&self) -> String {
        format!("Group_{}", self.factor)
    }

    fn family(&self) -> &'static str {
        "Group"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        if self.factor.is_one() {
            return Err(not_applicable(NotApplicableReason::NoOp));
        }
        require_one(&ins[0], &[Dim::G])?;
        require_not_one(&ins[0], &[Dim::C])?;
        let mut out = ins[0];
        out[Dim::G] = self.factor;
        out[Dim::C] = ins[0][Dim::C] / self.factor;
        Ok(smallvec::smallvec![out])
    }

    fn variables(&self) -> Terms {
        smallvec::smallvec![self.factor]
    }

    fn substitute(&mut self, solution: &VarSolution) {
        self.factor = self.factor.subs(solution);
    }
}

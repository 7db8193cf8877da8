use serde::{Deserialize, Serialize};

use crate::expr::{VarSolution, Variable};
use crate::primitive::{ApplyError, OutShapes, PrimitiveT, Terms};
use crate::shape::{Dim, Shape};

/// A fully-connected (1x1 convolution) layer over every non-spatial dimension.
///
/// A grouped input is connected group-wise: each of the `g` input groups feeds `oc / g`
/// output channels. The output is ungrouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct FC {
    pub out_channels: Variable,
    /// Whether a BatchNorm and ReLU are fused after the FC.
    pub with_norm_relu: bool,
}

impl FC {
    pub fn new(out_channels: Variable) -> Self {
        FC {
            out_channels,
            with_norm_relu: false,
        }
    }

    fn group_input(ins: &[Shape]) -> Variable {
        ins[0][Dim::C] * ins[0][Dim::KH] * ins[0][Dim::KW]
    }
}

impl PrimitiveT for FC {
    fn name(&self) -> String {
        let suffix = if self.with_norm_relu { "_BN_ReLU" } else { "" };
        format!("FC_{}{suffix}", self.out_channels)
    }

    fn family(&self) -> &'static str {
        "FC"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        let mut out = Shape::standard();
        out[Dim::C] = self.out_channels;
        out[Dim::H] = ins[0][Dim::H];
        out[Dim::W] = ins[0][Dim::W];
        Ok(smallvec::smallvec![out])
    }

    fn constraint_expressions(&self, ins: &[Shape]) -> Terms {
        smallvec::smallvec![self.out_channels / ins[0][Dim::G]]
    }

    fn ps_terms(&self, ins: &[Shape], _outs: &[Shape]) -> Terms {
        let mut terms: Terms = smallvec::smallvec![Self::group_input(ins) * self.out_channels];
        if self.with_norm_relu {
            terms.push(self.out_channels * 2);
        }
        terms
    }

    fn flops_terms(&self, ins: &[Shape], outs: &[Shape]) -> Terms {
        let spatial = outs[0].spatial();
        let mut terms: Terms =
            smallvec::smallvec![Self::group_input(ins) * self.out_channels * spatial];
        if self.with_norm_relu {
            terms.push(self.out_channels * spatial * 3);
        }
        terms
    }

    fn variables(&self) -> Terms {
        smallvec::smallvec![self.out_channels]
    }

    fn substitute(&mut self, solution: &VarSolution) {
        self.out_channels = self.out_channels.subs(solution);
    }
}

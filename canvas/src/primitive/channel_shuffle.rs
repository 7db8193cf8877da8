use serde::{Deserialize, Serialize};

use crate::primitive::{require_not_one, ApplyError, OutShapes, PrimitiveT};
use crate::shape::{Dim, Shape};

/// Interleaves channels across groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ChannelShuffle;

impl PrimitiveT for ChannelShuffle {
    fn name(&self) -> String {
        "ChannelShuffle".to_string()
    }

    fn family(&self) -> &'static str {
        "ChannelShuffle"
    }

    fn infer_outputs(&self, ins: &[Shape]) -> Result<OutShapes, ApplyError> {
        require_not_one(&ins[0], &[Dim::G, Dim::C])?;
        Ok(smallvec::smallvec![ins[0]])
    }
}

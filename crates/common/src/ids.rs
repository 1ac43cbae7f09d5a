//! Identifiers attached to metrics reports and spilled blocks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operator instance, assigned by the host pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorId(pub u64);

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phase of an operator that a metrics report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageId(pub u32);

impl StageId {
    /// Input consumption, including the join build side.
    pub const BUILD: StageId = StageId(0);
    /// Join probe side.
    pub const PROBE: StageId = StageId(1);
    /// Output production.
    pub const OUTPUT: StageId = StageId(2);

    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::BUILD => Some("build"),
            Self::PROBE => Some("probe"),
            Self::OUTPUT => Some("output"),
            _ => None,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "stage{}", self.0),
        }
    }
}

/// Block written by one storage manager; ids increase per manager and are
/// never reused.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl BlockId {
    /// Id handed out after this one.
    pub fn next(self) -> BlockId {
        BlockId(self.0 + 1)
    }

    /// Object or file name the block is stored under.
    pub fn file_name(self) -> String {
        format!("{:016x}.block", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

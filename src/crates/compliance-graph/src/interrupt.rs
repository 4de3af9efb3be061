//! Human-in-the-loop breakpoints
//!
//! A breakpoint names a node the engine must not enter without human confirmation.
//! Whether a breakpoint actually pauses a run depends on the run's
//! [`AutonomyLevel`]:
//!
//! | Autonomy     | Pauses before                          |
//! |--------------|----------------------------------------|
//! | `Manual`     | every node                             |
//! | `Supervised` | nodes listed in `interrupt_before`     |
//! | `Autonomous` | nothing                                |
//!
//! A paused run is stored with status `INTERRUPTED` and `interrupted_node` set. It
//! continues through [`CompiledGraph::resume`](crate::CompiledGraph::resume), which
//! re-enters that node without checking the breakpoint again.

use crate::state::{AutonomyLevel, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Configuration for graph interrupts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptConfig {
    /// Nodes to interrupt before execution
    pub interrupt_before: BTreeSet<NodeId>,
}

impl InterruptConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add nodes to interrupt before
    pub fn with_interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.interrupt_before.extend(nodes.into_iter().map(Into::into));
        self
    }

    pub fn is_breakpoint(&self, node: &str) -> bool {
        self.interrupt_before.contains(node)
    }

    /// Check if a run at `level` must pause before `node`
    pub fn should_interrupt_before(&self, node: &str, level: AutonomyLevel) -> bool {
        match level {
            AutonomyLevel::Manual => true,
            AutonomyLevel::Supervised => self.is_breakpoint(node),
            AutonomyLevel::Autonomous => false,
        }
    }
}

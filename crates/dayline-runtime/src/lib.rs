//! Orchestration: the decision-loop state machine that writes a photo diary,
//! and the fault-tolerant pipeline that compresses a day into one line.
//!
//! Both drive capability services through a [`ServiceRegistry`] built per run
//! by a [`ServiceLauncher`].

pub mod collect;
pub mod conversation;
pub mod machine;
pub mod plan;
pub mod registry;
pub mod resilient;
pub mod tools;
pub mod types;

#[cfg(test)]
mod testing;

pub use machine::{MachineSettings, Phase, StateMachine};
pub use plan::CapabilityPlan;
pub use registry::{ProcessLauncher, ServiceLauncher, ServiceRegistry};
pub use resilient::{Gender, Persona, ResilientOrchestrator, SummaryInputs};
pub use tools::ToolCatalog;
pub use types::*;

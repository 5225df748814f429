#![forbid(unsafe_code)]

//! Checkpointed execution of resumable flows.
//!
//! A flow is an explicit state machine ([`FlowLogic`]) whose steps run
//! between suspension points. The [`FlowScheduler`] owns the step
//! pipeline: it runs a step under a per-flow mutex and a worker permit,
//! persists the resulting checkpoint, and only then releases the step's
//! staged effects (outbound session frames, notarisation submissions,
//! timers). Failed steps are re-run from the last durable checkpoint
//! within a retry budget, after which the flow is hospitalized for
//! operator attention. On restart, [`FlowScheduler::recover`] adopts
//! every live flow the node owns and re-arms its suspension.

pub mod config;
pub mod context;
pub mod logic;
pub mod registry;
pub mod scheduler;

pub use config::EngineConfig;
pub use context::FlowContext;
pub use logic::{FlowEvent, FlowLogic, Transition};
pub use registry::FlowRegistry;
pub use scheduler::FlowScheduler;

//! # Stepline Core
//!
//! Domain types, collaborator traits, and error definitions for the Stepline
//! orchestration runtime. This crate has **no framework dependencies**; it
//! defines the model every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (planner, retriever, tool invoker, guardrail
//! policy, clock) is a trait here. Implementations live in their respective
//! crates, or in tests as scripted stubs, and are composed at construction
//! as `Arc<dyn Trait>`.

pub mod clock;
pub mod error;
pub mod event;
pub mod guardrail;
pub mod message;
pub mod plan;
pub mod retriever;
pub mod session;
pub mod step;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CollaboratorError, PlanningError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use guardrail::{AllowAll, GuardContext, GuardStage, GuardrailPolicy, GuardrailVerdict};
pub use message::{Message, Role, SessionId};
pub use plan::{Plan, Planner, Proposal};
pub use retriever::{Passage, Retriever};
pub use session::{Session, SessionStatus};
pub use step::{ActionType, ErrorKind, Step, StepError, StepStatus};
pub use tool::{Tool, ToolDefinition, ToolInvoker, ToolRegistry};

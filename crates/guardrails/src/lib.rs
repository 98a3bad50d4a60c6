//! Guardrail contracts: declarative rules for gated outputs.
//!
//! Contracts are written in TOML and evaluated at the two checkpoints the
//! orchestration loop exposes: a tool result from an `act` step, and the
//! final reply from a `respond` step. Each contract can deny the output,
//! warn, explicitly allow it, or redact parts of it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌─────────────────┐
//! │ Step executor │───▶│ Contract     │───▶│ allow / deny /   │
//! │ (act/respond) │    │ Policy       │    │ modify           │
//! └──────────────┘    └──────────────┘    └─────────────────┘
//!                           │
//!                     ┌─────┴──────┐
//!                     │  Contract  │
//!                     │  Engine    │
//!                     └────────────┘
//! ```
//!
//! # Example Contract
//!
//! ```toml
//! [[contracts]]
//! name = "no-external-mail"
//! trigger = "tool:send_email"
//! condition = 'args.to NOT ENDS_WITH "@example.com"'
//! action = "deny"
//! message = "external recipients are not allowed"
//!
//! [[contracts]]
//! name = "mask-api-keys"
//! trigger = "*"
//! action = "redact"
//! pattern = "sk-[A-Za-z0-9]+"
//! ```

mod engine;
mod model;
mod parser;
mod policy;

pub use engine::{ContractEngine, Verdict};
pub use model::{Action, Contract, ContractSet, Trigger};
pub use parser::{Condition, EvalContext, parse_condition};
pub use policy::ContractPolicy;

pub type ContractResult<T> = std::result::Result<T, ContractError>;

/// Errors from the contract subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("invalid contract '{name}': {reason}")]
    InvalidContract { name: String, reason: String },

    #[error("condition parse error in contract '{name}': {detail}")]
    ConditionParseError { name: String, detail: String },

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

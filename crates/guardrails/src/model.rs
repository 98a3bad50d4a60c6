//! Contract data model: declarative guardrail rules.

use serde::{Deserialize, Serialize};

use crate::ContractError;

/// A set of contracts loaded from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractSet {
    #[serde(default)]
    pub contracts: Vec<Contract>,
}

impl ContractSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load contracts from a TOML string (`[[contracts]]` tables).
    pub fn from_toml(toml_str: &str) -> Result<Self, ContractError> {
        let set: ContractSet = toml::from_str(toml_str)?;
        set.validate()?;
        Ok(set)
    }

    pub fn add(&mut self, contract: Contract) {
        self.contracts.push(contract);
    }

    /// Append every contract from `other`.
    pub fn extend(&mut self, other: ContractSet) {
        self.contracts.extend(other.contracts);
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        for contract in &self.contracts {
            contract.validate()?;
        }
        Ok(())
    }

    /// Redaction rules for common personal data in tool results and replies.
    pub fn pii_redaction() -> Self {
        let rule = |name: &str, description: &str, pattern: &str, replacement: &str| Contract {
            name: name.into(),
            description: description.into(),
            trigger: Trigger::Any,
            condition: String::new(),
            action: Action::Redact,
            message: description.into(),
            pattern: Some(pattern.into()),
            replacement: replacement.into(),
            enabled: true,
            priority: -100,
        };
        Self {
            contracts: vec![
                rule(
                    "pii-email",
                    "Mask e-mail addresses",
                    r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
                    "[EMAIL]",
                ),
                rule(
                    "pii-phone",
                    "Mask phone numbers",
                    r"\b\d{3}[-.\s]?\d{3}[-.\s]?\d{4}\b",
                    "[PHONE]",
                ),
                rule(
                    "pii-card",
                    "Mask payment card numbers",
                    r"\b(?:\d[ -]?){13,16}\b",
                    "[CARD]",
                ),
            ],
        }
    }

    /// Deny any reply that mentions one of `terms` (case-insensitive).
    pub fn blocked_terms(terms: &[String]) -> Self {
        let contracts = terms
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|term| Contract {
                name: format!("blocked-term-{}", term.to_lowercase()),
                description: format!("Block replies mentioning '{term}'"),
                trigger: Trigger::Response,
                condition: format!(
                    "content MATCHES \"(?i){}\"",
                    regex_lite::escape(term).replace('\\', "\\\\").replace('"', "\\\"")
                ),
                action: Action::Deny,
                message: "response mentions a blocked term".into(),
                pattern: None,
                replacement: String::new(),
                enabled: true,
                priority: 100,
            })
            .collect();
        Self { contracts }
    }
}

/// A single guardrail contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    /// Unique name for this contract.
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// What triggers this contract (e.g. "tool:send_email", "tool:*", "response").
    pub trigger: Trigger,

    /// The condition expression. Empty fires on every matching trigger.
    #[serde(default)]
    pub condition: String,

    #[serde(default)]
    pub action: Action,

    /// Message reported when the contract fires.
    #[serde(default)]
    pub message: String,

    /// Regex whose matches are replaced, for [`Action::Redact`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default = "default_replacement")]
    pub replacement: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Priority (higher = evaluated first). Ties broken by insertion order.
    #[serde(default)]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

fn default_replacement() -> String {
    "[REDACTED]".into()
}

impl Contract {
    /// Validate that the contract is well-formed.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.name.is_empty() {
            return Err(ContractError::InvalidContract {
                name: "(empty)".into(),
                reason: "contract name cannot be empty".into(),
            });
        }
        self.trigger.validate(&self.name)?;
        crate::parse_condition(&self.condition).map_err(|detail| {
            ContractError::ConditionParseError {
                name: self.name.clone(),
                detail,
            }
        })?;
        if self.action == Action::Redact {
            let pattern = self.pattern.as_deref().ok_or_else(|| ContractError::InvalidContract {
                name: self.name.clone(),
                reason: "redact contracts need a pattern".into(),
            })?;
            regex_lite::Regex::new(pattern).map_err(|e| ContractError::InvalidContract {
                name: self.name.clone(),
                reason: format!("invalid redaction pattern: {e}"),
            })?;
        }
        Ok(())
    }
}

impl From<&stepline_config::ContractConfig> for Contract {
    fn from(cc: &stepline_config::ContractConfig) -> Self {
        Contract {
            name: cc.name.clone(),
            description: cc.description.clone(),
            trigger: cc.trigger.clone().into(),
            condition: cc.condition.clone(),
            action: match cc.action.as_str() {
                "allow" => Action::Allow,
                "warn" => Action::Warn,
                "redact" => Action::Redact,
                _ => Action::Deny,
            },
            message: cc.message.clone(),
            pattern: cc.pattern.clone(),
            replacement: cc.replacement.clone(),
            enabled: cc.enabled,
            priority: cc.priority,
        }
    }
}

/// Which checkpoint a contract applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Trigger {
    /// The result of a specific tool (`tool:send_email`).
    Tool(String),
    /// The result of any tool (`tool:*`).
    AnyTool,
    /// The final reply before it is emitted.
    Response,
    /// Both checkpoints.
    Any,
}

impl Trigger {
    /// Does this trigger match the given concrete trigger?
    pub fn matches(&self, other: &Trigger) -> bool {
        match (self, other) {
            (Trigger::Any, _) => true,
            (Trigger::AnyTool, Trigger::Tool(_) | Trigger::AnyTool) => true,
            (Trigger::Tool(a), Trigger::Tool(b)) => a == b,
            (Trigger::Response, Trigger::Response) => true,
            _ => false,
        }
    }

    fn validate(&self, contract_name: &str) -> Result<(), ContractError> {
        if let Trigger::Tool(name) = self
            && name.is_empty()
        {
            return Err(ContractError::InvalidContract {
                name: contract_name.into(),
                reason: "tool trigger name cannot be empty".into(),
            });
        }
        Ok(())
    }
}

impl From<String> for Trigger {
    fn from(s: String) -> Self {
        match s.as_str() {
            "*" | "any" => Trigger::Any,
            "tool:*" => Trigger::AnyTool,
            "response" | "respond" => Trigger::Response,
            other => Trigger::Tool(other.strip_prefix("tool:").unwrap_or(other).to_string()),
        }
    }
}

impl From<Trigger> for String {
    fn from(t: Trigger) -> Self {
        match t {
            Trigger::Tool(name) => format!("tool:{name}"),
            Trigger::AnyTool => "tool:*".into(),
            Trigger::Response => "response".into(),
            Trigger::Any => "*".into(),
        }
    }
}

/// What happens when a contract's condition is satisfied.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Explicit pass; stops evaluation of lower-priority contracts.
    Allow,
    /// The output is rejected.
    #[default]
    Deny,
    /// Log a warning and keep evaluating.
    Warn,
    /// Replace `pattern` matches in every string of the output.
    Redact,
}

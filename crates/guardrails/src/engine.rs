//! Contract enforcement engine.
//!
//! The engine evaluates contracts against a gated output (a tool result or
//! the final reply) and returns a [`Verdict`]. Contracts are visited in
//! priority order: the first `deny` or `allow` ends evaluation, `warn` and
//! `redact` accumulate.

use crate::model::{Action, Contract, ContractSet, Trigger};
use crate::parser::{Condition, EvalContext};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// The outcome of evaluating contracts against an output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    /// The strongest action that fired (`Allow` when nothing fired).
    pub action: Action,
    /// Contract that decided a deny/allow/warn, if any.
    pub contract_name: Option<String>,
    pub message: String,
    /// Redaction contracts to apply, in evaluation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redactions: Vec<String>,
}

impl Verdict {
    /// No contract fired.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            action: Action::Allow,
            contract_name: None,
            message: String::new(),
            redactions: Vec::new(),
        }
    }

    fn from_contract(contract: &Contract) -> Self {
        Self {
            allowed: contract.action != Action::Deny,
            action: contract.action,
            contract_name: Some(contract.name.clone()),
            message: if contract.message.is_empty() {
                format!("Contract '{}' triggered", contract.name)
            } else {
                contract.message.clone()
            },
            redactions: Vec::new(),
        }
    }
}

struct Compiled {
    contract: Contract,
    condition: Condition,
    redaction: Option<(Regex, String)>,
}

/// Holds a compiled [`ContractSet`] and evaluates it against gated outputs.
///
/// Conditions and redaction patterns are compiled once, in [`ContractEngine::new`];
/// the engine is immutable afterwards and shared between sessions.
pub struct ContractEngine {
    compiled: Vec<Compiled>,
}

impl ContractEngine {
    pub fn new(contract_set: ContractSet) -> Result<Self, crate::ContractError> {
        let mut compiled = contract_set
            .contracts
            .into_iter()
            .map(compile)
            .collect::<Result<Vec<_>, _>>()?;
        // Stable: ties keep declaration order
        compiled.sort_by(|a, b| b.contract.priority.cmp(&a.contract.priority));
        Ok(Self { compiled })
    }

    pub fn empty() -> Self {
        Self {
            compiled: Vec::new(),
        }
    }

    /// Evaluate contracts for a concrete trigger, highest priority first.
    pub fn check(&self, trigger: &Trigger, ctx: &EvalContext<'_>) -> Verdict {
        let matching = self
            .compiled
            .iter()
            .filter(|k| k.contract.enabled && k.contract.trigger.matches(trigger));

        let mut outcome = Verdict::allow();
        for entry in matching {
            if !entry.condition.evaluate(ctx) {
                continue;
            }
            let contract = &entry.contract;

            match contract.action {
                Action::Deny => {
                    warn!(contract = %contract.name, tool = ?ctx.tool_name, "Contract denied output");
                    let mut verdict = Verdict::from_contract(contract);
                    verdict.redactions = outcome.redactions;
                    return verdict;
                }
                Action::Allow => {
                    debug!(contract = %contract.name, tool = ?ctx.tool_name, "Contract explicitly allowed output");
                    let mut verdict = Verdict::from_contract(contract);
                    verdict.redactions = outcome.redactions;
                    if !verdict.redactions.is_empty() {
                        verdict.action = Action::Redact;
                    }
                    return verdict;
                }
                Action::Warn => {
                    warn!(contract = %contract.name, tool = ?ctx.tool_name, "Contract warning: {}", contract.message);
                    if outcome.contract_name.is_none() {
                        let redactions = std::mem::take(&mut outcome.redactions);
                        outcome = Verdict::from_contract(contract);
                        outcome.redactions = redactions;
                    }
                }
                Action::Redact => {
                    debug!(contract = %contract.name, tool = ?ctx.tool_name, "Contract redacting output");
                    outcome.redactions.push(contract.name.clone());
                }
            }
        }

        if !outcome.redactions.is_empty() {
            outcome.action = Action::Redact;
        }
        outcome
    }

    /// Apply a verdict's redactions to every string inside `value`.
    pub fn redact(&self, verdict: &Verdict, value: &Value) -> Value {
        let rules: Vec<&(Regex, String)> = verdict
            .redactions
            .iter()
            .filter_map(|name| self.compiled.iter().find(|k| &k.contract.name == name))
            .filter_map(|k| k.redaction.as_ref())
            .collect();
        redact_value(value, &rules)
    }

    pub fn active_count(&self) -> usize {
        self.compiled.iter().filter(|k| k.contract.enabled).count()
    }
}

fn compile(contract: Contract) -> Result<Compiled, crate::ContractError> {
    contract.validate()?;
    let condition = crate::parse_condition(&contract.condition).map_err(|detail| {
        crate::ContractError::ConditionParseError {
            name: contract.name.clone(),
            detail,
        }
    })?;
    let redaction = match (&contract.action, &contract.pattern) {
        (Action::Redact, Some(pattern)) => {
            let re = Regex::new(pattern).map_err(|e| crate::ContractError::InvalidContract {
                name: contract.name.clone(),
                reason: e.to_string(),
            })?;
            Some((re, contract.replacement.clone()))
        }
        _ => None,
    };
    Ok(Compiled {
        contract,
        condition,
        redaction,
    })
}

fn redact_value(value: &Value, rules: &[&(Regex, String)]) -> Value {
    match value {
        Value::String(s) => {
            let mut text = s.clone();
            for (re, replacement) in rules {
                text = re.replace_all(&text, replacement.as_str()).into_owned();
            }
            Value::String(text)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_value(v, rules)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_value(v, rules)))
                .collect(),
        ),
        other => other.clone(),
    }
}

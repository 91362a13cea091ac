//! Override verification: do the values we inject survive the descriptor's
//! own assignment logic?

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OverrideEntry {
    /// What the orchestrator injects; `None` when it leaves the variable alone.
    pub intended: Option<String>,
    /// The descriptor's `:=` default, from static inspection.
    pub declared_default: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OverrideDescriptor {
    pub entries: BTreeMap<String, OverrideEntry>,
}

impl OverrideDescriptor {
    pub fn new(
        intended: &BTreeMap<String, String>,
        declared_defaults: &BTreeMap<String, String>,
    ) -> Self {
        let mut entries: BTreeMap<String, OverrideEntry> = BTreeMap::new();
        for (k, v) in intended {
            entries.entry(k.clone()).or_default().intended = Some(v.clone());
        }
        for (k, v) in declared_defaults {
            entries.entry(k.clone()).or_default().declared_default = Some(v.clone());
        }
        Self { entries }
    }

    pub fn intended(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.intended.clone().map(|v| (k.clone(), v)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    OverrideActive,
    DefaultUsed,
    Mismatch {
        intended: String,
        resolved: Option<String>,
    },
    /// Not injected and the descriptor leaves it empty.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationOutcome {
    pub variable: String,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

impl VerificationOutcome {
    pub fn is_mismatch(&self) -> bool {
        matches!(self.status, OutcomeStatus::Mismatch { .. })
    }

    pub fn describe(&self) -> String {
        match &self.status {
            OutcomeStatus::OverrideActive => format!("{}: override active", self.variable),
            OutcomeStatus::DefaultUsed => format!("{}: descriptor default in effect", self.variable),
            OutcomeStatus::Mismatch { intended, resolved } => format!(
                "{}: MISMATCH injected '{intended}' but descriptor resolves {}",
                self.variable,
                resolved
                    .as_deref()
                    .map(|r| format!("'{r}'"))
                    .unwrap_or_else(|| "nothing".into())
            ),
            OutcomeStatus::Unresolved => format!(
                "{}: not injected and descriptor leaves it empty",
                self.variable
            ),
        }
    }
}

/// Compares intended assignments against what the descriptor resolved, in variable-name order.
pub fn verify(
    desc: &OverrideDescriptor,
    resolved: &BTreeMap<String, String>,
) -> Vec<VerificationOutcome> {
    desc.entries
        .iter()
        .map(|(name, entry)| {
            let got = resolved.get(name);
            let status = match &entry.intended {
                Some(want) if got == Some(want) => {
                    if entry.declared_default.as_ref() == Some(want) {
                        OutcomeStatus::DefaultUsed
                    } else {
                        OutcomeStatus::OverrideActive
                    }
                }
                Some(want) => OutcomeStatus::Mismatch {
                    intended: want.clone(),
                    resolved: got.cloned(),
                },
                None if got.is_some_and(|v| !v.is_empty()) => OutcomeStatus::DefaultUsed,
                None => OutcomeStatus::Unresolved,
            };
            VerificationOutcome {
                variable: name.clone(),
                status,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub evaluator: String,
    pub outcomes: Vec<VerificationOutcome>,
    /// Problems seen while evaluating the descriptor; never fatal on their own.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub descriptor_warnings: Vec<String>,
}

impl VerificationReport {
    pub fn mismatches(&self) -> impl Iterator<Item = &VerificationOutcome> {
        self.outcomes.iter().filter(|o| o.is_mismatch())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &VerificationOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Unresolved)
    }

    pub fn has_mismatch(&self) -> bool {
        self.mismatches().next().is_some()
    }

    pub fn count(&self, pred: fn(&OutcomeStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

use marmot_domain::RuleKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub kind: RuleKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub kind: RuleKind,
    pub rules_swept: usize,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn new(kind: RuleKind) -> Self {
        Self { kind, rules_swept: 0, errors: Vec::new() }
    }
}

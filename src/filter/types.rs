//! Declarative record filters.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How clauses inside one stage combine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchLogic {
    #[default]
    And,
    Or,
}

/// Relational comparison used by condition clauses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "isNull")]
    IsNull,
    #[serde(rename = "isNotNull")]
    IsNotNull,
}

/// Field value must be one of `values`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExactMatchClause {
    pub field: String,
    pub values: Vec<Value>,
    /// Under OR logic, a strict clause must still hold.
    #[serde(default)]
    pub strict: bool,
}

/// Case-insensitive substring match against any of several fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainsClause {
    pub fields: Vec<String>,
    pub value: String,
}

/// Ordered comparison of a field against a value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionClause {
    pub field: String,
    pub comparison: Comparison,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub strict: bool,
}

/// A filter over records, made of three independently optional stages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    pub exact_match: Vec<ExactMatchClause>,
    pub exact_match_logic: MatchLogic,
    pub contains: Vec<ContainsClause>,
    pub condition_match: Vec<ConditionClause>,
    pub condition_logic: MatchLogic,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.exact_match.is_empty() && self.contains.is_empty() && self.condition_match.is_empty()
    }

    /// Add an exact clause.
    pub fn exact(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.exact_match.push(ExactMatchClause {
            field: field.into(),
            values,
            strict: false,
        });
        self
    }

    /// Add an exact clause that must hold even under OR logic.
    pub fn exact_strict(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.exact_match.push(ExactMatchClause {
            field: field.into(),
            values,
            strict: true,
        });
        self
    }

    pub fn contains(mut self, fields: Vec<String>, value: impl Into<String>) -> Self {
        self.contains.push(ContainsClause {
            fields,
            value: value.into(),
        });
        self
    }

    pub fn condition(
        mut self,
        field: impl Into<String>,
        comparison: Comparison,
        value: Value,
    ) -> Self {
        self.condition_match.push(ConditionClause {
            field: field.into(),
            comparison,
            value,
            strict: false,
        });
        self
    }

    pub fn with_exact_logic(mut self, logic: MatchLogic) -> Self {
        self.exact_match_logic = logic;
        self
    }

    pub fn with_condition_logic(mut self, logic: MatchLogic) -> Self {
        self.condition_logic = logic;
        self
    }
}

//! Declarative record filters.
//!
//! A [`FilterSpec`] has three optional stages that must all pass: exact
//! membership, case-insensitive "contains", and relational conditions.

mod evaluate;
mod types;

pub use evaluate::{compare_values, filter_items, matches};
pub use types::{
    Comparison, ConditionClause, ContainsClause, ExactMatchClause, FilterSpec, MatchLogic,
};

//! Domain layer - entity builders and predicate filters
//!
//! Pure code with no I/O: the planner, reconciler and admission rules are
//! written in terms of these builders and predicates.

pub mod builder;
pub mod predicate;

pub use builder::*;
pub use predicate::{Filter, Predicate};

pub mod decision;
pub mod expense;
pub mod org;
pub mod rule;

pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod workflow;

pub use connection::{connect_with_config, connect_with_settings, DbPool};
pub use repositories::{
    DecisionLogRepository, ExpenseRepository, InMemoryDecisionLogRepository,
    InMemoryExpenseRepository, InMemoryRuleRepository, RepositoryError, RuleRepository,
    SqlDecisionLogRepository, SqlExpenseRepository, SqlRuleRepository,
};
pub use workflow::{ApprovalWorkflowService, SubmittedExpense};

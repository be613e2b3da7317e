pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod extraction;
pub mod notify;
pub mod workflow;

pub use chrono;
pub use rust_decimal;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use domain::decision::{ApproverDecisionLog, Decision, DecisionEntry, DecisionError};
pub use domain::expense::{
    ExpenseCategory, ExpenseDraft, ExpenseRequest, ExpenseStatus, RequestId,
};
pub use domain::org::{Member, Role, UserId};
pub use domain::rule::{
    ApproverSlot, EffectiveApprover, RuleDefinition, RuleId, RuleSpec, RuleValidationError,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use extraction::{ExtractedExpense, ExtractionError, ReceiptExtractor, ReceiptImage};
pub use notify::{Notifier, RoutingNotice};
pub use workflow::{
    Evaluation, RequestRouter, Resolution, RoutingMode, RoutingPlan, WorkflowEvaluator,
    WorkflowStatus,
};

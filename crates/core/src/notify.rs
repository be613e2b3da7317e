use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::domain::expense::RequestId;
use crate::workflow::{RoutingPlan, WorkflowStatus};

/// Sent whenever a request's status or its routed approver set changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingNotice {
    pub request_id: RequestId,
    pub previous: Option<WorkflowStatus>,
    pub current: WorkflowStatus,
    pub plan: RoutingPlan,
}

impl RoutingNotice {
    pub fn status_changed(&self) -> bool {
        self.previous != Some(self.current)
    }
}

/// Delivery is the implementor's concern; the workflow only hands notices over.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: RoutingNotice);
}

#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    notices: Arc<Mutex<Vec<RoutingNotice>>>,
}

impl InMemoryNotifier {
    pub fn notices(&self) -> Vec<RoutingNotice> {
        match self.notices.lock() {
            Ok(notices) => notices.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Notifier for InMemoryNotifier {
    fn notify(&self, notice: RoutingNotice) {
        match self.notices.lock() {
            Ok(mut notices) => notices.push(notice),
            Err(poisoned) => poisoned.into_inner().push(notice),
        }
    }
}

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromiseStatus {
    Pending,
    Fulfilled,
    Rejected,
}

impl PromiseStatus {
    pub fn is_resolved(self) -> bool {
        self != PromiseStatus::Pending
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunnerSnapshot {
    pub current_task_index: usize,
    pub task_count: usize,
    pub is_running: bool,
    pub run_status: Option<PromiseStatus>,
}

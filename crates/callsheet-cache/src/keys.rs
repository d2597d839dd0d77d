//! Key namespace helpers.
//!
//! All cache keys are built here so the layout in one place matches the
//! persisted-state contract: `session:{id}`, `permissions:user:{id}`,
//! `roles:user:{id}`, `conversation:{thread}`, `memory_context:{thread}`,
//! `checkpoint:{thread}:{step}`, `memory:background_tasks`,
//! `performance:metrics:{name}`, `performance:alerts`.

pub const BACKGROUND_TASKS: &str = "memory:background_tasks";
pub const PERFORMANCE_ALERTS: &str = "performance:alerts";

/// Cap for each `performance:metrics:{name}` list.
pub const METRICS_LIST_CAP: usize = 1000;
/// Cap for the `performance:alerts` list.
pub const ALERTS_LIST_CAP: usize = 100;

pub fn session(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub fn user_permissions(user_id: &str) -> String {
    format!("permissions:user:{user_id}")
}

pub fn user_roles(user_id: &str) -> String {
    format!("roles:user:{user_id}")
}

pub fn conversation(thread_id: &str) -> String {
    format!("conversation:{thread_id}")
}

pub fn memory_context(thread_id: &str) -> String {
    format!("memory_context:{thread_id}")
}

pub fn checkpoint(thread_id: &str, step: u32) -> String {
    format!("checkpoint:{thread_id}:{step}")
}

/// Index of the latest checkpoint step for a thread.
pub fn checkpoint_latest(thread_id: &str) -> String {
    format!("checkpoint:{thread_id}:latest")
}

pub fn metric(name: &str) -> String {
    format!("performance:metrics:{name}")
}

pub fn lock(name: &str) -> String {
    format!("lock:{name}")
}

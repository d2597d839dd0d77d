//! Shared foundation for the Callsheet orchestration core.
//!
//! Everything that more than one subsystem needs lives here: the error
//! taxonomy, the turn/message model, principals and the RBAC gate, typed
//! environment configuration, and the in-process metrics capability.
//!
//! This crate deliberately has no IO dependencies. Storage-backed concerns
//! (the permission cache, metric persistence) are expressed as traits that
//! the storage crates implement, so every component receives its
//! collaborators explicitly at construction.

pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod principal;
pub mod rbac;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use message::{
    AgentKind, ChatMessage, MessageRole, TokenUsage, ToolCall, ToolDefinition, ToolResult, Turn,
};
pub use principal::{Principal, Role};
pub use rbac::{PermissionGate, PermissionSet, PermissionStore, SensitivityPolicy, ToolPolicy};

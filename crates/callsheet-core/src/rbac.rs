//! Role-based access control and field-level redaction.
//!
//! The gate answers two questions: may this principal perform an action
//! (`can`), and which fields of a record must be masked before it leaves the
//! trust boundary (`redact`). Redaction is applied at tool-output egress and
//! again defensively before a response is finalized, so it must be
//! idempotent.
//!
//! Permission sets are derived from the role table below and cached through
//! the injected [`PermissionStore`]. On any store failure the gate fails
//! closed: the action is denied until a refresh succeeds.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::principal::{Principal, Role};

/// Sentinel substituted for masked string fields.
pub const REDACTED: &str = "[redacted]";

/// Action slugs grantable to roles. The relational layer that authors these
/// lives outside the core; this table is the core's source of truth for
/// role-derived permissions.
pub fn base_permissions(role: Role) -> &'static [&'static str] {
    match role {
        Role::CreativeDirector => &["read:projects", "read:concepts", "read:documents"],
        Role::Salesperson => &[
            "read:projects",
            "read:concepts",
            "read:documents",
            "read:people",
            "read:organizations",
            "read:deals",
        ],
        Role::Director => &[
            "read:projects",
            "read:concepts",
            "read:documents",
            "read:people",
            "read:organizations",
            "read:deals",
            "read:budgets",
        ],
        Role::Leadership => &[
            "read:projects",
            "read:concepts",
            "read:documents",
            "read:people",
            "read:organizations",
            "read:deals",
            "read:budgets",
            "admin:users",
            "admin:metrics",
        ],
    }
}

/// A resolved, cacheable permission set for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub slugs: HashSet<String>,
    pub roles: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl PermissionSet {
    pub fn from_role(role: Role) -> Self {
        Self {
            slugs: base_permissions(role).iter().map(|s| (*s).to_string()).collect(),
            roles: vec![role.as_str().to_string()],
            computed_at: Utc::now(),
        }
    }

    pub fn allows(&self, slug: &str) -> bool {
        self.slugs.contains(slug)
    }
}

/// Storage seam for cached permission sets; implemented by the cache crate.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<PermissionSet>>;
    async fn put(&self, user_id: &str, set: &PermissionSet, ttl_secs: u64) -> Result<()>;
    async fn invalidate(&self, user_id: &str) -> Result<()>;
}

/// Field-level sensitivity annotations for one record shape.
///
/// Keys are field names, values are the minimum `data_access_level` needed
/// to see the field unmasked. Fields are matched recursively so the same
/// policy covers a record and lists of embedded records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensitivityPolicy {
    fields: BTreeMap<String, u8>,
}

impl SensitivityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, min_level: u8) -> Self {
        self.fields.insert(name.into(), min_level);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Mask every annotated field the principal may not see.
    ///
    /// Strings become [`REDACTED`]; numbers and structured values become
    /// null. The walk covers nested objects and arrays, and the result is
    /// stable under repeated application.
    pub fn redact(&self, value: &mut Value, principal: &Principal) {
        if self.is_empty() {
            return;
        }
        self.redact_inner(value, principal);
    }

    fn redact_inner(&self, value: &mut Value, principal: &Principal) {
        match value {
            Value::Object(map) => {
                for (key, entry) in map.iter_mut() {
                    if let Some(&level) = self.fields.get(key) {
                        if !principal.can_see_level(level) {
                            *entry = mask_for(entry);
                            continue;
                        }
                    }
                    self.redact_inner(entry, principal);
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.redact_inner(item, principal);
                }
            }
            _ => {}
        }
    }
}

fn mask_for(value: &Value) -> Value {
    match value {
        Value::String(_) => Value::String(REDACTED.to_string()),
        // already-masked strings stay strings; everything else nulls out
        _ => Value::Null,
    }
}

/// Access policy attached to a registered tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPolicy {
    /// Minimum role allowed to invoke the tool at all.
    pub min_role: Role,
    /// Permission slug checked through the gate.
    pub permission: &'static str,
    /// Field-level masking applied to the tool's output.
    pub sensitivity: SensitivityPolicy,
}

impl ToolPolicy {
    pub fn open(permission: &'static str) -> Self {
        Self {
            min_role: Role::CreativeDirector,
            permission,
            sensitivity: SensitivityPolicy::new(),
        }
    }

    pub fn with_min_role(mut self, role: Role) -> Self {
        self.min_role = role;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: SensitivityPolicy) -> Self {
        self.sensitivity = sensitivity;
        self
    }
}

/// The RBAC gate. Cheaply cloneable; holds only the store handle.
#[derive(Clone)]
pub struct PermissionGate {
    store: Arc<dyn PermissionStore>,
    cache_ttl_secs: u64,
}

impl PermissionGate {
    pub fn new(store: Arc<dyn PermissionStore>, cache_ttl_secs: u64) -> Self {
        Self {
            store,
            cache_ttl_secs,
        }
    }

    /// Resolve the principal's permission set, computing and caching it on
    /// miss. Store failures deny by returning `None`.
    async fn resolve(&self, principal: &Principal) -> Option<PermissionSet> {
        match self.store.get(&principal.id).await {
            Ok(Some(set)) => return Some(set),
            Ok(None) => {}
            Err(e) => {
                warn!(user_id = %principal.id, error = %e, "permission cache read failed; failing closed");
                return None;
            }
        }

        let set = PermissionSet::from_role(principal.role);
        if let Err(e) = self.store.put(&principal.id, &set, self.cache_ttl_secs).await {
            warn!(user_id = %principal.id, error = %e, "permission cache refresh failed; failing closed");
            return None;
        }
        Some(set)
    }

    /// Whether the principal may perform the action named by `slug`.
    pub async fn can(&self, principal: &Principal, slug: &str) -> bool {
        match self.resolve(principal).await {
            Some(set) => set.allows(slug),
            None => false,
        }
    }

    /// Role + permission check for a tool invocation.
    pub async fn permits_tool(&self, principal: &Principal, policy: &ToolPolicy) -> bool {
        if !principal.role.dominates(policy.min_role) {
            return false;
        }
        self.can(principal, policy.permission).await
    }

    /// Apply a tool's field-masking policy to an output record.
    pub fn redact(&self, value: &mut Value, policy: &ToolPolicy, principal: &Principal) {
        policy.sensitivity.redact(value, principal);
    }

    /// Drop the cached set for a user, forcing recomputation on next use.
    /// Called on role-change events.
    pub async fn invalidate(&self, user_id: &str) -> Result<()> {
        self.store.invalidate(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory store double; can be switched into a failing mode.
    #[derive(Default)]
    struct MemoryStore {
        entries: Mutex<HashMap<String, PermissionSet>>,
        failing: Mutex<bool>,
    }

    #[async_trait]
    impl PermissionStore for MemoryStore {
        async fn get(&self, user_id: &str) -> Result<Option<PermissionSet>> {
            if *self.failing.lock() {
                return Err(Error::connection("cache down"));
            }
            Ok(self.entries.lock().get(user_id).cloned())
        }

        async fn put(&self, user_id: &str, set: &PermissionSet, _ttl_secs: u64) -> Result<()> {
            if *self.failing.lock() {
                return Err(Error::connection("cache down"));
            }
            self.entries.lock().insert(user_id.to_string(), set.clone());
            Ok(())
        }

        async fn invalidate(&self, user_id: &str) -> Result<()> {
            self.entries.lock().remove(user_id);
            Ok(())
        }
    }

    fn principal(role: Role, level: u8) -> Principal {
        Principal::new("u1", role, level).unwrap()
    }

    #[tokio::test]
    async fn gate_computes_and_caches_on_miss() {
        let store = Arc::new(MemoryStore::default());
        let gate = PermissionGate::new(Arc::clone(&store) as Arc<dyn PermissionStore>, 900);

        let p = principal(Role::Salesperson, 3);
        assert!(gate.can(&p, "read:deals").await);
        assert!(!gate.can(&p, "read:budgets").await);
        assert!(store.entries.lock().contains_key("u1"));
    }

    #[tokio::test]
    async fn gate_fails_closed_when_store_is_down() {
        let store = Arc::new(MemoryStore::default());
        let gate = PermissionGate::new(Arc::clone(&store) as Arc<dyn PermissionStore>, 900);

        *store.failing.lock() = true;
        let p = principal(Role::Leadership, 6);
        assert!(!gate.can(&p, "read:projects").await);

        // recovery: once the store answers again, access resumes
        *store.failing.lock() = false;
        assert!(gate.can(&p, "read:projects").await);
    }

    #[tokio::test]
    async fn permits_tool_requires_role_floor() {
        let store = Arc::new(MemoryStore::default());
        let gate = PermissionGate::new(store as Arc<dyn PermissionStore>, 900);

        let policy = ToolPolicy::open("read:deals").with_min_role(Role::Salesperson);
        assert!(!gate.permits_tool(&principal(Role::CreativeDirector, 6), &policy).await);
        assert!(gate.permits_tool(&principal(Role::Salesperson, 1), &policy).await);
        assert!(gate.permits_tool(&principal(Role::Leadership, 1), &policy).await);
    }

    #[test]
    fn redaction_masks_by_type() {
        let policy = SensitivityPolicy::new()
            .field("budget", 4)
            .field("union_status", 3);
        let mut record = serde_json::json!({
            "title": "Nike Air Max Campaign",
            "budget": 500_000,
            "crew": [
                {"name": "Jane Doe", "union_status": "DGA Member"},
                {"name": "John Smith", "union_status": "Non-union"}
            ]
        });

        policy.redact(&mut record, &principal(Role::Salesperson, 2));

        assert_eq!(record["budget"], Value::Null);
        assert_eq!(record["crew"][0]["union_status"], REDACTED);
        assert_eq!(record["crew"][1]["union_status"], REDACTED);
        assert_eq!(record["title"], "Nike Air Max Campaign");
    }

    #[test]
    fn redaction_is_idempotent() {
        let policy = SensitivityPolicy::new().field("budget", 4).field("notes", 5);
        let mut record = serde_json::json!({"budget": 100, "notes": "quiet deal"});
        let p = principal(Role::Salesperson, 1);

        policy.redact(&mut record, &p);
        let once = record.clone();
        policy.redact(&mut record, &p);
        assert_eq!(record, once);
    }

    #[test]
    fn redaction_monotonic_over_access_levels() {
        // every field visible at level n stays visible at n+1
        let policy = SensitivityPolicy::new()
            .field("budget", 4)
            .field("email", 2)
            .field("notes", 6);
        let original = serde_json::json!({
            "budget": 1, "email": "a@b.c", "notes": "n", "title": "t"
        });

        let mut previous_visible = 0usize;
        for level in 1..=6u8 {
            let mut record = original.clone();
            policy.redact(&mut record, &principal(Role::Leadership, level));
            let visible = record
                .as_object()
                .unwrap()
                .values()
                .filter(|v| !matches!(v, Value::Null) && **v != Value::String(REDACTED.into()))
                .count();
            assert!(visible >= previous_visible, "visibility regressed at level {level}");
            previous_visible = visible;
        }
        assert_eq!(previous_visible, 4);
    }

    #[test]
    fn base_permissions_grow_with_rank() {
        let mut previous: HashSet<&str> = HashSet::new();
        for role in Role::all() {
            let current: HashSet<&str> = base_permissions(role).iter().copied().collect();
            assert!(
                previous.is_subset(&current),
                "{role:?} lost permissions held by a junior role"
            );
            previous = current;
        }
    }
}

use crate::enforcement::ContractMap;
use crate::error::Result;
use crate::events::EventKind;
use crate::journal::AuditJournal;
use crate::pipeline::Pipeline;
use crate::types::{Permission, Role, User};
use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Request to create a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NewUser {
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: None,
            metadata: HashMap::new(),
        }
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Partial update applied to an existing user. Absent fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub email: Option<String>,
    pub is_active: Option<bool>,
    pub is_verified: Option<bool>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Direction of a role change reported to registered callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    Assigned,
    Revoked,
}

impl RoleChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleChange::Assigned => "assigned",
            RoleChange::Revoked => "revoked",
        }
    }
}

/// Callback invoked after a role assignment or revocation with
/// `(user_id, change, role_name)`. Failures are logged and suppressed;
/// they never revert the role change.
pub type RoleChangeCallback = Arc<dyn Fn(&str, RoleChange, &str) -> Result<()> + Send + Sync>;

/// Hook fired when a user is deleted, used to cascade removal of the
/// user's sessions and credentials.
pub type CascadeHook = Arc<dyn Fn(String) -> BoxFuture<'static, Result<u64>> + Send + Sync>;

/// Pipelines each audited operation must satisfy.
pub static CONTRACT: Lazy<ContractMap> = Lazy::new(|| {
    let mut table = ContractMap::new();
    table.insert("create_user", Pipeline::event(EventKind::UserCreate));
    table.insert("update_user", Pipeline::event(EventKind::UserUpdate));
    table.insert("delete_user", Pipeline::event(EventKind::UserDelete));
    table.insert("check_permission", Pipeline::event(EventKind::PermissionCheck));
    table
});

/// User, role and permission management.
///
/// Usernames and emails are indexed case-insensitively; uniqueness
/// violations are validation errors. Deleting a user cascades to the
/// user's sessions and credentials through registered hooks.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Must record `user.create`.
    async fn create_user(&self, request: NewUser, journal: &AuditJournal) -> Result<User>;

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Must record `user.update`.
    async fn update_user(
        &self,
        user_id: &str,
        updates: UserUpdate,
        journal: &AuditJournal,
    ) -> Result<User>;

    /// Delete a user and cascade to dependent sessions and credentials.
    ///
    /// Must record `user.delete`.
    async fn delete_user(&self, user_id: &str, journal: &AuditJournal) -> Result<()>;

    async fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<User>>;

    /// Create or replace a role definition.
    async fn define_role(&self, role: Role) -> Result<Role>;

    /// Assign a role. Idempotent. Unknown roles are auto-created with empty
    /// permissions when the directory is configured to do so; in strict
    /// mode the assignment fails instead.
    async fn assign_role(&self, user_id: &str, role_name: &str) -> Result<()>;

    /// Revoke a role. Returns whether the user had it.
    async fn revoke_role(&self, user_id: &str, role_name: &str) -> Result<bool>;

    async fn get_user_roles(&self, user_id: &str) -> Result<Vec<Role>>;

    /// Effective permission set: the union of all role permissions
    /// (inherited roles included) and direct grants.
    async fn get_user_permissions(&self, user_id: &str) -> Result<BTreeSet<String>>;

    /// Register a permission definition.
    async fn define_permission(&self, permission: Permission) -> Result<Permission>;

    /// Check whether a user holds a permission, honoring `prefix:*` and
    /// `*:*` wildcards.
    ///
    /// Must record `permission.check`.
    async fn check_permission(
        &self,
        user_id: &str,
        permission: &str,
        journal: &AuditJournal,
    ) -> Result<bool>;

    /// Register a role-change callback.
    fn add_role_change_callback(&self, callback: RoleChangeCallback);

    /// Register a deletion cascade hook.
    fn add_delete_cascade(&self, hook: CascadeHook);
}

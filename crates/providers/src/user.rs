use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;
use warden_core::enforcement::enforce;
use warden_core::error::{Error, Result};
use warden_core::events::EventKind;
use warden_core::journal::{AuditJournal, EventContext};
use warden_core::providers::user::{
    CascadeHook, NewUser, RoleChange, RoleChangeCallback, UserDirectory, UserUpdate, CONTRACT,
};
use warden_core::types::{reject_sensitive_keys, Decision, Permission, Role, User};

/// Configuration for the in-memory user directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserDirectoryConfig {
    /// Assigning an unknown role creates it with empty permissions; when
    /// false the directory is strict and the assignment fails
    pub auto_create_roles: bool,
    pub allow_duplicate_emails: bool,
    /// Roles granted to every new user
    pub default_roles: Vec<String>,
}

impl Default for UserDirectoryConfig {
    fn default() -> Self {
        Self {
            auto_create_roles: true,
            allow_duplicate_emails: false,
            default_roles: Vec::new(),
        }
    }
}

/// In-memory user directory with role-based access control, wildcard
/// permission checks, role-change callbacks and deletion cascades.
pub struct MemoryUserDirectory {
    users: DashMap<String, User>,
    /// Lowercased username -> user id
    username_index: DashMap<String, String>,
    /// Lowercased email -> user id
    email_index: DashMap<String, String>,
    roles: DashMap<String, Role>,
    permissions: DashMap<String, Permission>,
    /// Permissions granted directly to a user, outside any role
    direct_grants: DashMap<String, BTreeSet<String>>,
    role_callbacks: RwLock<Vec<RoleChangeCallback>>,
    cascade_hooks: RwLock<Vec<CascadeHook>>,
    config: UserDirectoryConfig,
}

impl MemoryUserDirectory {
    pub fn new(config: UserDirectoryConfig) -> Self {
        Self {
            users: DashMap::new(),
            username_index: DashMap::new(),
            email_index: DashMap::new(),
            roles: DashMap::new(),
            permissions: DashMap::new(),
            direct_grants: DashMap::new(),
            role_callbacks: RwLock::new(Vec::new()),
            cascade_hooks: RwLock::new(Vec::new()),
            config,
        }
    }

    pub fn from_config(value: &serde_json::Value) -> Result<Self> {
        let config: UserDirectoryConfig = serde_json::from_value(value.clone())?;
        Ok(Self::new(config))
    }

    /// Grant a permission directly to a user, outside any role.
    pub fn grant_permission(&self, user_id: &str, permission: impl Into<String>) {
        self.direct_grants
            .entry(user_id.to_string())
            .or_default()
            .insert(permission.into());
    }

    fn notify_role_change(&self, user_id: &str, change: RoleChange, role_name: &str) {
        let callbacks = self
            .role_callbacks
            .read()
            .expect("role callback lock poisoned");
        for callback in callbacks.iter() {
            if let Err(e) = callback(user_id, change, role_name) {
                // Callback failures never revert the role change.
                warn!(
                    user_id = %user_id,
                    role = %role_name,
                    change = change.as_str(),
                    error = %e,
                    "Role change callback failed"
                );
            }
        }
    }

    /// Resolve a role name plus everything it inherits, cycle-safe.
    fn collect_role_permissions(&self, role_name: &str, into: &mut BTreeSet<String>) {
        let mut queue: VecDeque<String> = VecDeque::from([role_name.to_string()]);
        let mut visited: BTreeSet<String> = BTreeSet::new();
        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            if let Some(role) = self.roles.get(&name) {
                into.extend(role.permissions.iter().cloned());
                queue.extend(role.inherits.iter().cloned());
            }
        }
    }

    fn permission_set(&self, user_id: &str) -> BTreeSet<String> {
        let mut permissions = BTreeSet::new();
        if let Some(user) = self.users.get(user_id) {
            for role_name in user.roles.iter() {
                self.collect_role_permissions(role_name, &mut permissions);
            }
        }
        if let Some(direct) = self.direct_grants.get(user_id) {
            permissions.extend(direct.iter().cloned());
        }
        permissions
    }

    /// Exact match, then `prefix:*` wildcards, then `*:*`.
    fn permission_matches(permissions: &BTreeSet<String>, requested: &str) -> bool {
        if permissions.contains(requested) {
            return true;
        }
        let parts: Vec<&str> = requested.split(':').collect();
        for prefix_len in 1..=parts.len() {
            let wildcard = format!("{}:*", parts[..prefix_len].join(":"));
            if permissions.contains(&wildcard) {
                return true;
            }
        }
        permissions.contains("*:*")
    }

    /// Provider counters for diagnostics.
    pub fn statistics(&self) -> HashMap<String, serde_json::Value> {
        let active = self.users.iter().filter(|u| u.is_active).count();
        let mut stats = HashMap::new();
        stats.insert("total_users".to_string(), serde_json::json!(self.users.len()));
        stats.insert("active_users".to_string(), serde_json::json!(active));
        stats.insert("total_roles".to_string(), serde_json::json!(self.roles.len()));
        stats.insert(
            "total_permissions".to_string(),
            serde_json::json!(self.permissions.len()),
        );
        stats
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn create_user(&self, request: NewUser, journal: &AuditJournal) -> Result<User> {
        enforce::<Self, _, _>(&CONTRACT, "create_user", journal, async {
            reject_sensitive_keys(&request.metadata)?;

            let username_key = request.username.to_lowercase();
            if username_key.trim().is_empty() {
                return Err(Error::validation("Username cannot be empty"));
            }
            if self.username_index.contains_key(&username_key) {
                return Err(Error::conflict(format!(
                    "Username '{}' is already taken",
                    request.username
                )));
            }
            if let Some(email) = &request.email {
                if !self.config.allow_duplicate_emails
                    && self.email_index.contains_key(&email.to_lowercase())
                {
                    return Err(Error::conflict(format!(
                        "Email '{}' is already registered",
                        email
                    )));
                }
            }

            let mut user = User::new(Uuid::new_v4().to_string(), request.username.clone())?;
            user.email = request.email.clone();
            user.metadata = request.metadata;
            user.roles = self.config.default_roles.iter().cloned().collect();

            self.username_index
                .insert(username_key, user.id.clone());
            if let Some(email) = &request.email {
                self.email_index
                    .insert(email.to_lowercase(), user.id.clone());
            }
            self.users.insert(user.id.clone(), user.clone());

            journal
                .record(EventKind::UserCreate, EventContext::new().user(&user.id))
                .await?;
            debug!(user_id = %user.id, username = %user.username, "User created");
            Ok(user)
        })
        .await
    }

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.users.get(user_id).map(|user| user.clone()))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let Some(user_id) = self
            .username_index
            .get(&username.to_lowercase())
            .map(|id| id.clone())
        else {
            return Ok(None);
        };
        Ok(self.users.get(&user_id).map(|user| user.clone()))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let Some(user_id) = self
            .email_index
            .get(&email.to_lowercase())
            .map(|id| id.clone())
        else {
            return Ok(None);
        };
        Ok(self.users.get(&user_id).map(|user| user.clone()))
    }

    async fn update_user(
        &self,
        user_id: &str,
        updates: UserUpdate,
        journal: &AuditJournal,
    ) -> Result<User> {
        enforce::<Self, _, _>(&CONTRACT, "update_user", journal, async {
            if let Some(metadata) = &updates.metadata {
                reject_sensitive_keys(metadata)?;
            }

            // Uniqueness checks before mutation
            if let Some(username) = &updates.username {
                if let Some(existing) = self.username_index.get(&username.to_lowercase()) {
                    if existing.value() != user_id {
                        return Err(Error::conflict(format!(
                            "Username '{}' is already taken",
                            username
                        )));
                    }
                }
            }
            if let Some(email) = &updates.email {
                if !self.config.allow_duplicate_emails {
                    if let Some(existing) = self.email_index.get(&email.to_lowercase()) {
                        if existing.value() != user_id {
                            return Err(Error::conflict(format!(
                                "Email '{}' is already registered",
                                email
                            )));
                        }
                    }
                }
            }

            let updated = {
                let Some(mut entry) = self.users.get_mut(user_id) else {
                    return Err(Error::not_found(format!("User '{}' not found", user_id)));
                };
                let user = entry.value_mut();
                let old_username = user.username.clone();
                let old_email = user.email.clone();

                if let Some(username) = updates.username {
                    user.username = username;
                }
                if let Some(email) = updates.email {
                    user.email = Some(email);
                }
                if let Some(is_active) = updates.is_active {
                    user.is_active = is_active;
                }
                if let Some(is_verified) = updates.is_verified {
                    user.is_verified = is_verified;
                }
                if let Some(metadata) = updates.metadata {
                    user.metadata.extend(metadata);
                }
                user.touch();
                (user.clone(), old_username, old_email)
            };
            let (user, old_username, old_email) = updated;

            if user.username != old_username {
                self.username_index.remove(&old_username.to_lowercase());
                self.username_index
                    .insert(user.username.to_lowercase(), user.id.clone());
            }
            if user.email != old_email {
                if let Some(old_email) = old_email {
                    self.email_index.remove(&old_email.to_lowercase());
                }
                if let Some(email) = &user.email {
                    self.email_index.insert(email.to_lowercase(), user.id.clone());
                }
            }

            journal
                .record(EventKind::UserUpdate, EventContext::new().user(user_id))
                .await?;
            Ok(user)
        })
        .await
    }

    async fn delete_user(&self, user_id: &str, journal: &AuditJournal) -> Result<()> {
        enforce::<Self, _, _>(&CONTRACT, "delete_user", journal, async {
            let Some((_, user)) = self.users.remove(user_id) else {
                return Err(Error::not_found(format!("User '{}' not found", user_id)));
            };

            self.username_index.remove(&user.username.to_lowercase());
            if let Some(email) = &user.email {
                self.email_index.remove(&email.to_lowercase());
            }
            self.direct_grants.remove(user_id);

            // Cascade to sessions and credentials
            let hooks: Vec<CascadeHook> = self
                .cascade_hooks
                .read()
                .expect("cascade hook lock poisoned")
                .clone();
            let mut cascaded = 0u64;
            for hook in hooks {
                cascaded += hook(user_id.to_string()).await?;
            }

            journal
                .record(
                    EventKind::UserDelete,
                    EventContext::new()
                        .user(user_id)
                        .meta("cascaded_artifacts", serde_json::json!(cascaded)),
                )
                .await?;
            debug!(user_id = %user_id, cascaded = cascaded, "User deleted");
            Ok(())
        })
        .await
    }

    async fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.users.iter().map(|user| user.clone()).collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(users.into_iter().skip(offset).take(limit).collect())
    }

    async fn define_role(&self, role: Role) -> Result<Role> {
        self.roles.insert(role.name.clone(), role.clone());
        Ok(role)
    }

    async fn assign_role(&self, user_id: &str, role_name: &str) -> Result<()> {
        if !self.roles.contains_key(role_name) {
            if self.config.auto_create_roles {
                let mut role = Role::new(role_name)?;
                role.metadata
                    .insert("auto_created".to_string(), serde_json::json!(true));
                self.roles.insert(role_name.to_string(), role);
            } else {
                return Err(Error::validation(format!(
                    "Role '{}' does not exist",
                    role_name
                )));
            }
        }

        let newly_assigned = {
            let Some(mut entry) = self.users.get_mut(user_id) else {
                return Err(Error::not_found(format!("User '{}' not found", user_id)));
            };
            let user = entry.value_mut();
            let inserted = user.roles.insert(role_name.to_string());
            if inserted {
                user.touch();
            }
            inserted
        };

        if newly_assigned {
            self.notify_role_change(user_id, RoleChange::Assigned, role_name);
        }
        Ok(())
    }

    async fn revoke_role(&self, user_id: &str, role_name: &str) -> Result<bool> {
        let removed = {
            let Some(mut entry) = self.users.get_mut(user_id) else {
                return Ok(false);
            };
            let user = entry.value_mut();
            let removed = user.roles.remove(role_name);
            if removed {
                user.touch();
            }
            removed
        };

        if removed {
            self.notify_role_change(user_id, RoleChange::Revoked, role_name);
        }
        Ok(removed)
    }

    async fn get_user_roles(&self, user_id: &str) -> Result<Vec<Role>> {
        let Some(user) = self.users.get(user_id).map(|user| user.clone()) else {
            return Ok(Vec::new());
        };
        Ok(user
            .roles
            .iter()
            .filter_map(|name| self.roles.get(name).map(|role| role.clone()))
            .collect())
    }

    async fn get_user_permissions(&self, user_id: &str) -> Result<BTreeSet<String>> {
        Ok(self.permission_set(user_id))
    }

    async fn define_permission(&self, permission: Permission) -> Result<Permission> {
        if self.permissions.contains_key(&permission.name) {
            return Err(Error::conflict(format!(
                "Permission '{}' already exists",
                permission.name
            )));
        }
        self.permissions
            .insert(permission.name.clone(), permission.clone());
        Ok(permission)
    }

    async fn check_permission(
        &self,
        user_id: &str,
        permission: &str,
        journal: &AuditJournal,
    ) -> Result<bool> {
        enforce::<Self, _, _>(&CONTRACT, "check_permission", journal, async {
            let permissions = self.permission_set(user_id);
            let granted = Self::permission_matches(&permissions, permission);

            journal
                .record(
                    EventKind::PermissionCheck,
                    EventContext::new()
                        .user(user_id)
                        .action(permission)
                        .result(if granted { Decision::Allow } else { Decision::Deny }),
                )
                .await?;
            Ok(granted)
        })
        .await
    }

    fn add_role_change_callback(&self, callback: RoleChangeCallback) {
        self.role_callbacks
            .write()
            .expect("role callback lock poisoned")
            .push(callback);
    }

    fn add_delete_cascade(&self, hook: CascadeHook) {
        self.cascade_hooks
            .write()
            .expect("cascade hook lock poisoned")
            .push(hook);
    }
}

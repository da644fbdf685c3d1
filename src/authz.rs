//! Authorization evaluation: resource ACLs + group membership (spec §4.7).
//!
//! Mirrors the table-driven shape of `clawd::policy::rbac` (match a role
//! against a static table of permitted operations) but generalized from
//! "static role → tool list" to "principal identifiers + group
//! membership → role, evaluated against a per-resource ACL."

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Role granted to a principal on a resource. Ordered by rank — `reader
/// < writer < owner` (spec §4.7 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Writer,
    Owner,
}

/// An authenticated (or anonymous) caller, as injected by the upstream
/// identity layer onto the WebSocket upgrade request (spec §6).
///
/// Two different real users whose string identifiers happen to collide
/// (e.g. one user's email equals another's provider_id) would both match
/// an ACL entry keyed on that string — this is the documented soft spot
/// in spec §9, preserved here rather than silently fixed. See
/// DESIGN.md's Open Questions for the (type, provider)-scoped redesign
/// this flags for a future rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub internal_uuid: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Principal {
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_empty()
    }

    /// The principal's own identifiers under its provider, used to match
    /// ownership and user-scoped ACL entries (spec §4.7 steps 2–3).
    fn identifiers(&self) -> HashSet<&str> {
        let mut ids = HashSet::new();
        ids.insert(self.user_id.as_str());
        if let Some(e) = &self.email {
            ids.insert(e.as_str());
        }
        if let Some(p) = &self.provider_id {
            ids.insert(p.as_str());
        }
        if let Some(u) = &self.internal_uuid {
            ids.insert(u.as_str());
        }
        ids
    }

    fn is_member_of(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Principal type of an ACL entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "principal_type")]
pub enum AclPrincipal {
    User { provider: Option<String>, id: String },
    Group { provider: Option<String>, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    #[serde(flatten)]
    pub principal: AclPrincipal,
    pub role: Role,
}

/// Owner descriptor: a provider plus a provider-scoped identifier or
/// email (spec §3 AuthorizationData).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub provider: Option<String>,
    pub id: String,
}

/// The resource marker an [`AuthorizationData`] describes. The
/// authorizer refuses to evaluate a resource whose marker it does not
/// recognize (spec §4.7 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    ThreatModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationData {
    pub resource_type: ResourceType,
    pub owner: Owner,
    pub acl: Vec<AclEntry>,
}

/// Pseudo-groups recognized regardless of the principal's own `groups`
/// list (spec §3, §4.7 step 3).
const PSEUDO_GROUP_EVERYONE: &str = "everyone";
const PSEUDO_GROUP_ADMINISTRATORS: &str = "administrators";

/// Resolves whether a principal belongs to `administrators`. Kept as a
/// trait so the hub can inject a real admin directory without the
/// authorizer depending on how that directory is stored — the same
/// seam `clawd::session::Runner` draws between policy and execution.
#[async_trait::async_trait]
pub trait AdminDirectory: Send + Sync {
    async fn is_administrator(&self, principal: &Principal) -> bool;
}

/// An administrator directory with no members — the default when the
/// deployment does not configure one.
pub struct NoAdministrators;

#[async_trait::async_trait]
impl AdminDirectory for NoAdministrators {
    async fn is_administrator(&self, _principal: &Principal) -> bool {
        false
    }
}

/// Evaluates principals against [`AuthorizationData`] (spec §4.7).
pub struct Authorizer {
    admins: std::sync::Arc<dyn AdminDirectory>,
}

impl Default for Authorizer {
    fn default() -> Self {
        Self::new(std::sync::Arc::new(NoAdministrators))
    }
}

impl Authorizer {
    pub fn new(admins: std::sync::Arc<dyn AdminDirectory>) -> Self {
        Self { admins }
    }

    /// `check(principal, required, resource)` — true iff the principal's
    /// highest applicable role on `resource` meets or exceeds `required`.
    pub async fn check(&self, principal: &Principal, required: Role, resource: &AuthorizationData) -> bool {
        self.resolve_role(principal, resource).await >= required
    }

    /// The highest role `principal` holds on `resource`, or `None` if no
    /// ownership or ACL entry applies.
    pub async fn resolve_role(&self, principal: &Principal, resource: &AuthorizationData) -> RoleOrNone {
        if resource.resource_type != ResourceType::ThreatModel {
            return RoleOrNone::None;
        }

        // Ownership short-circuits to Owner regardless of ACL entries
        // (spec §4.7 tie-break).
        if self.owns(principal, &resource.owner) {
            return RoleOrNone::Some(Role::Owner);
        }

        let mut best: Option<Role> = None;
        for entry in &resource.acl {
            if self.entry_applies(principal, entry).await {
                best = Some(best.map_or(entry.role, |b| b.max(entry.role)));
            }
        }

        match best {
            Some(role) => RoleOrNone::Some(role),
            // Anonymous/empty principals never receive an implicit grant;
            // everyone else with no applicable entry also gets none.
            None => RoleOrNone::None,
        }
    }

    fn owns(&self, principal: &Principal, owner: &Owner) -> bool {
        if provider_mismatch(owner.provider.as_deref(), principal.provider.as_deref()) {
            return false;
        }
        principal.identifiers().contains(owner.id.as_str())
    }

    async fn entry_applies(&self, principal: &Principal, entry: &AclEntry) -> bool {
        match &entry.principal {
            AclPrincipal::User { provider, id } => {
                !provider_mismatch(provider.as_deref(), principal.provider.as_deref())
                    && principal.identifiers().contains(id.as_str())
            }
            AclPrincipal::Group { provider, name } => {
                if provider_mismatch(provider.as_deref(), principal.provider.as_deref()) {
                    return false;
                }
                if name == PSEUDO_GROUP_EVERYONE {
                    return !principal.is_anonymous();
                }
                if name == PSEUDO_GROUP_ADMINISTRATORS {
                    return self.admins.is_administrator(principal).await;
                }
                principal.is_member_of(name)
            }
        }
    }
}

/// Helper enum distinguishing "no applicable grant" from "reader" when a
/// caller cares about which is which (e.g. audit logging); ordinary
/// checks go through [`Authorizer::check`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOrNone {
    None,
    Some(Role),
}

impl PartialOrd<Role> for RoleOrNone {
    fn partial_cmp(&self, other: &Role) -> Option<std::cmp::Ordering> {
        match self {
            RoleOrNone::None => Some(std::cmp::Ordering::Less),
            RoleOrNone::Some(r) => r.partial_cmp(other),
        }
    }
}

impl PartialEq<Role> for RoleOrNone {
    fn eq(&self, other: &Role) -> bool {
        matches!(self, RoleOrNone::Some(r) if r == other)
    }
}

/// `None` provider (wildcard) matches anything; otherwise providers must
/// be equal.
fn provider_mismatch(entry_provider: Option<&str>, principal_provider: Option<&str>) -> bool {
    match entry_provider {
        None => false,
        Some(p) => Some(p) != principal_provider,
    }
}

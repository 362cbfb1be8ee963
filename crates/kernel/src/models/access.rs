//! Per-request authorization facts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Internal identity that bypasses every restriction.
pub const SYSTEM_USER_ID: &str = "6a4b11e1-90ca-4e42-ba42-db7bc7f7d505";

/// Capability that lifts marking and organization restrictions.
pub const BYPASS: &str = "BYPASS";

/// Member-access marker granting visibility to everyone.
pub const MEMBER_ACCESS_ALL: &str = "ALL";

/// One marking definition a caller may see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkingRef {
    pub id: String,
    /// Marking family, e.g. `TLP` or `PAP`.
    pub definition_type: String,
}

/// The caller's authorization facts, supplied per request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessContext {
    pub user_id: String,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub markings_allowed: Vec<MarkingRef>,

    /// Every marking id on the platform, grouped by marking type.
    #[serde(default)]
    pub all_markings_by_type: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub organizations_allowed: Vec<String>,

    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Set when the caller was granted the bypass capability upstream.
    #[serde(default)]
    pub bypass: bool,

    /// Individual identity the user maps to, if any.
    #[serde(default)]
    pub individual_id: Option<String>,
}

impl AccessContext {
    /// Context of the internal system identity.
    pub fn system() -> Self {
        Self {
            user_id: SYSTEM_USER_ID.to_string(),
            capabilities: vec![BYPASS.to_string()],
            bypass: true,
            ..Default::default()
        }
    }

    /// Whether this is the internal system identity.
    pub fn is_system(&self) -> bool {
        self.user_id == SYSTEM_USER_ID
    }

    /// Whether the caller holds the bypass capability.
    pub fn is_bypass(&self) -> bool {
        self.bypass || self.capabilities.iter().any(|c| c == BYPASS)
    }

    /// Ids matched against `authorized_members`.
    pub fn access_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(1 + self.groups.len() + self.organizations_allowed.len());
        ids.push(self.user_id.clone());
        ids.extend(self.groups.iter().cloned());
        ids.extend(self.organizations_allowed.iter().cloned());
        ids
    }

    /// Allowed marking ids grouped by marking type.
    pub fn allowed_markings_by_type(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for marking in &self.markings_allowed {
            grouped
                .entry(marking.definition_type.clone())
                .or_default()
                .push(marking.id.clone());
        }
        grouped
    }
}

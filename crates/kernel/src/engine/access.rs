//! Access restriction compiler.
//!
//! Turns an [`AccessContext`] into the mandatory clauses every read carries.
//! Each restriction category is one `should` clause (any branch grants
//! visibility) and categories are ANDed by landing in `must`.

use serde_json::{Value, json};

use super::dsl::{any_of, exists, keyword, missing, not, strings, term, terms};
use super::settings::PlatformSettings;
use crate::models::access::MEMBER_ACCESS_ALL;
use crate::models::{AccessContext, rel_field};

/// Field holding the member ids allowed to see a restricted document.
pub const AUTHORIZED_MEMBERS: &str = "authorized_members";

/// Field holding capabilities/roles that also grant visibility.
pub const AUTHORIZED_AUTHORITIES: &str = "authorized_authorities";

/// Entity types visible to everyone on an organization-restricted platform.
pub const ORGANIZATION_UNRESTRICTED_TYPES: &[&str] = &[
    "Identity",
    "Location",
    "Marking-Definition",
    "Label",
    "Kill-Chain-Phase",
    "External-Reference",
    "Vocabulary",
    "Status",
    "Settings",
];

/// Mandatory clauses for one caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessRestrictions {
    pub must: Vec<Value>,
    pub must_not: Vec<Value>,
}

impl AccessRestrictions {
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.must_not.is_empty()
    }
}

/// Build the restrictions for `ctx`.
pub fn build_access_restrictions(
    ctx: &AccessContext,
    settings: &PlatformSettings,
    include_authorities: bool,
) -> AccessRestrictions {
    let mut restrictions = AccessRestrictions::default();
    if ctx.is_system() {
        return restrictions;
    }

    restrictions
        .must
        .push(member_access_clause(ctx, include_authorities));

    if ctx.is_bypass() {
        return restrictions;
    }

    match marking_clause(ctx) {
        MarkingClause::None => {}
        MarkingClause::MustNot(clause) => restrictions.must_not.push(clause),
        MarkingClause::Must(clause) => restrictions.must.push(clause),
    }

    if let Some(clause) = organization_clause(ctx, settings) {
        restrictions.must.push(clause);
    }

    restrictions
}

fn member_access_clause(ctx: &AccessContext, include_authorities: bool) -> Value {
    let mut member_ids = vec![MEMBER_ACCESS_ALL.to_string()];
    member_ids.extend(ctx.access_ids());

    let mut clauses = vec![
        missing(AUTHORIZED_MEMBERS),
        terms(
            &keyword(&format!("{AUTHORIZED_MEMBERS}.id")),
            strings(&member_ids),
        ),
    ];

    if include_authorities && !ctx.is_bypass() {
        let mut authorities = ctx.capabilities.clone();
        authorities.extend(ctx.roles.iter().cloned());
        if !authorities.is_empty() {
            clauses.push(terms(&keyword(AUTHORIZED_AUTHORITIES), strings(&authorities)));
        }
    }

    any_of(clauses)
}

enum MarkingClause {
    None,
    MustNot(Value),
    Must(Value),
}

fn marking_clause(ctx: &AccessContext) -> MarkingClause {
    let marking_field = rel_field("object-marking");

    if ctx.markings_allowed.is_empty() {
        return MarkingClause::MustNot(exists(&marking_field));
    }

    let allowed = ctx.allowed_markings_by_type();
    let mut forbidden: Vec<String> = Vec::new();
    for (marking_type, all_ids) in &ctx.all_markings_by_type {
        let allowed_ids = allowed.get(marking_type);
        forbidden.extend(
            all_ids
                .iter()
                .filter(|id| !allowed_ids.is_some_and(|ids| ids.contains(id)))
                .cloned(),
        );
    }

    if forbidden.is_empty() {
        return MarkingClause::None;
    }

    MarkingClause::Must(any_of(vec![
        missing(&marking_field),
        not(terms(&keyword(&marking_field), strings(&forbidden))),
    ]))
}

fn individual_clauses(ctx: &AccessContext) -> Vec<Value> {
    match ctx.individual_id {
        Some(ref individual) => vec![
            term(&keyword("internal_id"), json!(individual)),
            term(&keyword(&rel_field("created-by")), json!(individual)),
        ],
        None => Vec::new(),
    }
}

fn organization_clause(ctx: &AccessContext, settings: &PlatformSettings) -> Option<Value> {
    let granted_field = rel_field("granted");
    let organizations = strings(&ctx.organizations_allowed);

    let mut clauses = match settings.platform_organization {
        Some(ref platform_org) => {
            if ctx.organizations_allowed.contains(platform_org) {
                return None;
            }
            let unrestricted: Vec<Value> = ORGANIZATION_UNRESTRICTED_TYPES
                .iter()
                .map(|t| json!(t))
                .collect();
            vec![
                terms(&keyword("entity_type"), unrestricted.clone()),
                terms(&keyword("parent_types"), unrestricted),
            ]
        }
        None => vec![missing(&granted_field)],
    };

    if !organizations.is_empty() {
        clauses.push(terms(&keyword(&granted_field), organizations));
    }
    clauses.extend(individual_clauses(ctx));

    Some(any_of(clauses))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::MarkingRef;
    use crate::models::access::BYPASS;
    use std::collections::BTreeMap;

    fn user() -> AccessContext {
        AccessContext {
            user_id: "user-1".into(),
            groups: vec!["group-1".into()],
            roles: vec!["role-1".into()],
            capabilities: vec!["KNOWLEDGE".into()],
            organizations_allowed: vec!["org-1".into()],
            ..Default::default()
        }
    }

    fn tlp_user() -> AccessContext {
        let mut ctx = user();
        ctx.markings_allowed = vec![MarkingRef {
            id: "tlp-green".into(),
            definition_type: "TLP".into(),
        }];
        let mut all = BTreeMap::new();
        all.insert(
            "TLP".to_string(),
            vec!["tlp-green".to_string(), "tlp-red".to_string()],
        );
        all.insert("PAP".to_string(), vec!["pap-red".to_string()]);
        ctx.all_markings_by_type = all;
        ctx
    }

    #[test]
    fn system_has_no_restrictions() {
        let restrictions = build_access_restrictions(
            &AccessContext::system(),
            &PlatformSettings::default(),
            true,
        );
        assert!(restrictions.is_empty());
    }

    #[test]
    fn bypass_keeps_member_clause_only() {
        let mut ctx = user();
        ctx.capabilities.push(BYPASS.into());
        let restrictions = build_access_restrictions(&ctx, &PlatformSettings::default(), true);
        assert_eq!(restrictions.must.len(), 1);
        assert!(restrictions.must_not.is_empty());

        let should = restrictions.must[0]["bool"]["should"].as_array().unwrap();
        assert_eq!(should.len(), 2, "no authorities branch for bypass holders");
    }

    #[test]
    fn member_clause_lists_access_ids() {
        let restrictions = build_access_restrictions(&user(), &PlatformSettings::default(), true);
        let member = &restrictions.must[0];
        assert_eq!(member["bool"]["minimum_should_match"], json!(1));
        let ids = &member["bool"]["should"][1]["terms"]["authorized_members.id.keyword"];
        assert_eq!(ids, &json!(["ALL", "user-1", "group-1", "org-1"]));
        let authorities = &member["bool"]["should"][2]["terms"]["authorized_authorities.keyword"];
        assert_eq!(authorities, &json!(["KNOWLEDGE", "role-1"]));
    }

    #[test]
    fn no_markings_forbids_marked_documents() {
        let restrictions = build_access_restrictions(&user(), &PlatformSettings::default(), false);
        assert_eq!(
            restrictions.must_not,
            vec![json!({ "exists": { "field": "rel_object-marking.internal_id" } })]
        );
    }

    #[test]
    fn missing_markings_are_forbidden() {
        let restrictions =
            build_access_restrictions(&tlp_user(), &PlatformSettings::default(), false);
        assert!(restrictions.must_not.is_empty());
        let marking = &restrictions.must[1];
        let forbidden =
            &marking["bool"]["should"][1]["bool"]["must_not"][0]["terms"]["rel_object-marking.internal_id.keyword"];
        assert_eq!(forbidden, &json!(["pap-red", "tlp-red"]));
    }

    #[test]
    fn all_markings_allowed_adds_nothing() {
        let mut ctx = tlp_user();
        ctx.all_markings_by_type.remove("PAP");
        ctx.markings_allowed.push(MarkingRef {
            id: "tlp-red".into(),
            definition_type: "TLP".into(),
        });
        let restrictions = build_access_restrictions(&ctx, &PlatformSettings::default(), false);
        // member + organization
        assert_eq!(restrictions.must.len(), 2);
    }

    #[test]
    fn unrestricted_platform_allows_ungranted_documents() {
        let mut ctx = user();
        ctx.individual_id = Some("individual-1".into());
        let restrictions = build_access_restrictions(&ctx, &PlatformSettings::default(), false);
        let organization = restrictions.must.last().unwrap();
        let should = organization["bool"]["should"].as_array().unwrap();
        assert_eq!(should[0], missing("rel_granted.internal_id"));
        assert_eq!(
            should[1],
            terms("rel_granted.internal_id.keyword", vec![json!("org-1")])
        );
        assert_eq!(should.len(), 4, "individual exceptions");
    }

    #[test]
    fn restricted_platform() {
        let settings = PlatformSettings {
            platform_organization: Some("platform-org".into()),
        };
        let restrictions = build_access_restrictions(&user(), &settings, false);
        let organization = restrictions.must.last().unwrap();
        let should = organization["bool"]["should"].as_array().unwrap();
        assert!(should[0]["terms"]["entity_type.keyword"].is_array());
        assert!(should[1]["terms"]["parent_types.keyword"].is_array());
        assert_eq!(should.len(), 3);

        let mut member = user();
        member.organizations_allowed.push("platform-org".into());
        let restrictions = build_access_restrictions(&member, &settings, false);
        // member + marking, organization skipped
        assert_eq!(restrictions.must.len(), 1);
        assert_eq!(restrictions.must_not.len(), 1);
    }
}

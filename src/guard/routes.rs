//!
//! Protected-route table
//! ---------------------
//! Route protection is data: a list of path prefixes, each tagged with the
//! surface kind (page navigation or JSON API) and the role set that grants
//! entry. Both guard tiers classify against this one table, so adding a
//! protected area is a table edit, not new middleware. Matching respects
//! segment boundaries and the longest matching prefix wins.

use serde::Serialize;

use crate::roles::Role;

/// How a denial is delivered: pages redirect, APIs answer with status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    Page,
    Api,
}

/// One protection rule. An empty `required` set means any authenticated
/// user may enter.
#[derive(Debug, Clone, Serialize)]
pub struct RouteRule {
    pub prefix: String,
    pub kind: RouteKind,
    pub required: Vec<Role>,
}

impl RouteRule {
    pub fn new(prefix: &str, kind: RouteKind, required: &[Role]) -> Self {
        RouteRule {
            prefix: prefix.to_string(),
            kind,
            required: required.to_vec(),
        }
    }
}

/// Outcome of classifying a request path.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteClass {
    Public,
    Protected { kind: RouteKind, required: Vec<Role> },
}

/// `/manage` protects `/manage` and `/manage/slots` but never `/managed`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/'
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        RouteTable { rules }
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// The almsgate protection table. Anything not listed is public.
    pub fn default_table() -> Self {
        use Role::{MonasteryAdmin, SuperAdmin};
        RouteTable::new(vec![
            RouteRule::new("/profile", RouteKind::Page, &[]),
            RouteRule::new("/bookings", RouteKind::Page, &[]),
            RouteRule::new("/donate", RouteKind::Page, &[]),
            RouteRule::new("/manage", RouteKind::Page, &[MonasteryAdmin, SuperAdmin]),
            RouteRule::new("/admin", RouteKind::Page, &[SuperAdmin]),
            RouteRule::new("/api/bookings", RouteKind::Api, &[]),
            RouteRule::new("/api/manage", RouteKind::Api, &[MonasteryAdmin, SuperAdmin]),
            RouteRule::new("/api/admin", RouteKind::Api, &[SuperAdmin]),
        ])
    }

    /// Classify a request path. Longest matching prefix wins so a nested
    /// rule can tighten a broader one.
    pub fn classify(&self, path: &str) -> RouteClass {
        let mut best: Option<&RouteRule> = None;
        for rule in &self.rules {
            if prefix_matches(&rule.prefix, path) {
                let longer = best
                    .map(|b| rule.prefix.len() > b.prefix.len())
                    .unwrap_or(true);
                if longer {
                    best = Some(rule);
                }
            }
        }
        match best {
            Some(rule) => RouteClass::Protected {
                kind: rule.kind,
                required: rule.required.clone(),
            },
            None => RouteClass::Public,
        }
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::default_table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlisted_paths_are_public() {
        let table = RouteTable::default_table();
        assert_eq!(table.classify("/"), RouteClass::Public);
        assert_eq!(table.classify("/monasteries"), RouteClass::Public);
        assert_eq!(table.classify("/monasteries/12"), RouteClass::Public);
        assert_eq!(table.classify("/healthz"), RouteClass::Public);
        assert_eq!(table.classify("/auth/sign-in"), RouteClass::Public);
    }

    #[test]
    fn prefixes_match_whole_segments_only() {
        let table = RouteTable::default_table();
        assert!(matches!(
            table.classify("/manage"),
            RouteClass::Protected { .. }
        ));
        assert!(matches!(
            table.classify("/manage/slots"),
            RouteClass::Protected { .. }
        ));
        // a longer first segment is a different route entirely
        assert_eq!(table.classify("/managed"), RouteClass::Public);
        assert_eq!(table.classify("/administrivia"), RouteClass::Public);
    }

    #[test]
    fn role_tiers_come_from_the_table() {
        let table = RouteTable::default_table();
        match table.classify("/admin") {
            RouteClass::Protected { kind, required } => {
                assert_eq!(kind, RouteKind::Page);
                assert_eq!(required, vec![Role::SuperAdmin]);
            }
            other => panic!("unexpected class: {other:?}"),
        }
        match table.classify("/api/manage/slots") {
            RouteClass::Protected { kind, required } => {
                assert_eq!(kind, RouteKind::Api);
                assert_eq!(required, vec![Role::MonasteryAdmin, Role::SuperAdmin]);
            }
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn authenticated_only_routes_have_empty_role_sets() {
        let table = RouteTable::default_table();
        for path in ["/profile", "/bookings", "/donate", "/api/bookings"] {
            match table.classify(path) {
                RouteClass::Protected { required, .. } => {
                    assert!(required.is_empty(), "{path} must not require a role");
                }
                other => panic!("{path} unexpectedly {other:?}"),
            }
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::new(vec![
            RouteRule::new("/api", RouteKind::Api, &[]),
            RouteRule::new("/api/admin", RouteKind::Api, &[Role::SuperAdmin]),
        ]);
        match table.classify("/api/admin/overview") {
            RouteClass::Protected { required, .. } => {
                assert_eq!(required, vec![Role::SuperAdmin]);
            }
            other => panic!("unexpected class: {other:?}"),
        }
        match table.classify("/api/bookings") {
            RouteClass::Protected { required, .. } => assert!(required.is_empty()),
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn table_serializes_for_audit() {
        let table = RouteTable::default_table();
        let json = serde_json::to_value(&table).unwrap();
        let rules = json.get("rules").and_then(|r| r.as_array()).unwrap();
        assert_eq!(rules.len(), 8);
        assert_eq!(rules[0]["prefix"], "/profile");
        assert_eq!(rules[3]["required"][0], "monastery_admin");
    }
}

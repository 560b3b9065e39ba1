//! NodeClass selector terms over inventory resources.
//!
//! Terms are ORed. Within a term, `id` is an exact match on its own;
//! otherwise every listed tag must match (`*` matches any value) and `name`
//! and `owner` must match when set. Names may use `*` wildcards.

use crate::inventory::{Image, SecurityGroup, Subnet};
use nodeplan_api::SelectorTerm;
use regex::Regex;
use std::collections::BTreeMap;

/// Something a selector term can pick.
pub trait Selectable {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn owner(&self) -> &str {
        ""
    }
    fn tags(&self) -> &BTreeMap<String, String>;
}

impl Selectable for Subnet {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        self.tags.get("Name").map(String::as_str).unwrap_or("")
    }
    fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }
}

impl Selectable for SecurityGroup {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }
}

impl Selectable for Image {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn owner(&self) -> &str {
        &self.owner
    }
    fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", escaped.join(".*")))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Whether `term` picks `item`. An empty term picks nothing.
pub fn term_matches<T: Selectable>(term: &SelectorTerm, item: &T) -> bool {
    if let Some(id) = &term.id {
        return id == item.id();
    }
    if term.tags.is_empty() && term.name.is_none() && term.owner.is_none() {
        return false;
    }
    let tags_match = term.tags.iter().all(|(key, want)| {
        item.tags()
            .get(key)
            .is_some_and(|have| want == "*" || want == have)
    });
    tags_match
        && term.name.as_deref().is_none_or(|n| glob_matches(n, item.name()))
        && term.owner.as_deref().is_none_or(|o| o == item.owner())
}

/// Items picked by any of `terms`, in input order.
pub fn select<'a, T: Selectable>(terms: &[SelectorTerm], items: &'a [T]) -> Vec<&'a T> {
    items
        .iter()
        .filter(|item| terms.iter().any(|t| term_matches(t, *item)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(id: &str, tags: &[(&str, &str)]) -> Subnet {
        Subnet {
            id: id.to_string(),
            zone: "us-west-2a".to_string(),
            zone_id: "usw2-az1".to_string(),
            available_ips: 100,
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn id_term_is_exact() {
        let subnets = [subnet("subnet-1", &[]), subnet("subnet-2", &[])];
        let picked = select(&[SelectorTerm::id("subnet-2")], &subnets);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "subnet-2");
    }

    #[test]
    fn all_tags_must_match_and_wildcard_matches_any_value() {
        let subnets = [
            subnet("a", &[("karpenter.sh/discovery", "prod"), ("tier", "private")]),
            subnet("b", &[("karpenter.sh/discovery", "prod")]),
            subnet("c", &[("karpenter.sh/discovery", "staging"), ("tier", "public")]),
        ];
        let exact = SelectorTerm::tags(&[("karpenter.sh/discovery", "prod"), ("tier", "private")]);
        let ids: Vec<_> = select(&[exact], &subnets).iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a"]);

        let any_tier = SelectorTerm::tags(&[("tier", "*")]);
        let ids: Vec<_> = select(&[any_tier], &subnets).iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "c"]);
    }

    #[test]
    fn terms_are_ored() {
        let subnets = [subnet("a", &[("x", "1")]), subnet("b", &[("y", "2")]), subnet("c", &[])];
        let terms = [SelectorTerm::tags(&[("x", "1")]), SelectorTerm::id("b")];
        assert_eq!(select(&terms, &subnets).len(), 2);
        assert!(select(&[SelectorTerm::default()], &subnets).is_empty());
    }

    #[test]
    fn image_name_glob_and_owner() {
        let image = Image {
            id: "ami-1".into(),
            name: "al2023-ami-2024.03".into(),
            owner: "amazon".into(),
            architecture: nodeplan_catalog::Arch::Amd64,
            creation_date: "2024-03-01T00:00:00Z".into(),
            tags: BTreeMap::new(),
        };
        let mut term = SelectorTerm {
            name: Some("al2023-ami-*".into()),
            ..Default::default()
        };
        assert!(term_matches(&term, &image));
        term.owner = Some("self".into());
        assert!(!term_matches(&term, &image));
        term.owner = None;
        term.name = Some("al2023-ami".into());
        assert!(!term_matches(&term, &image));
    }
}

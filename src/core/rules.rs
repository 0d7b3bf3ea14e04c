//! Declarative business-context rules: hierarchical group definitions and
//! dynamic tag definitions, each carrying typed match rules evaluated against
//! an asset's attributes.
//!
//! The document is parsed in two stages (raw TOML, then per-rule
//! compilation) so a single malformed rule is skipped with a warning instead
//! of poisoning the whole configuration. Evaluation is a pure function with
//! union semantics: an asset may match any number of groups and tags, and
//! re-applying a match is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Deserialize;

use crate::core::groups::GroupArena;
use crate::core::types::{AttributeBag, Severity};

#[derive(Debug, Clone)]
pub enum MatchRule {
    IpRange(Vec<Cidr>),
    HostnameGlob(Vec<Regex>),
    TagMatch(Vec<String>),
    OsPattern(Vec<Regex>),
    NameContains(Vec<String>),
    CloudProvider(Vec<String>),
    OpenVulnSeverity(BTreeSet<Severity>),
}

#[derive(Debug, Clone)]
pub struct GroupDef {
    pub name: String,
    pub parent: Option<String>,
    pub rules: Vec<MatchRule>,
}

#[derive(Debug, Clone)]
pub struct TagDef {
    pub name: String,
    pub criticality: Option<u8>,
    pub rule: Option<MatchRule>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub groups: Vec<GroupDef>,
    pub tags: Vec<TagDef>,
    pub arena: GroupArena,
}

impl RuleSet {
    pub fn tag_scores(&self) -> BTreeMap<String, u8> {
        self.tags
            .iter()
            .filter_map(|t| t.criticality.map(|c| (t.name.clone(), c)))
            .collect()
    }
}

/// Everything a rule may look at for one asset.
pub struct EvalContext<'a> {
    pub attributes: &'a AttributeBag,
    pub tags: &'a BTreeSet<String>,
    pub open_severities: &'a BTreeSet<Severity>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RuleSetRaw {
    #[serde(default)]
    groups: Vec<GroupRaw>,
    #[serde(default)]
    tags: Vec<TagRaw>,
}

#[derive(Debug, Clone, Deserialize)]
struct GroupRaw {
    name: String,
    parent: Option<String>,
    #[serde(default)]
    rules: Vec<RuleRaw>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagRaw {
    name: String,
    criticality: Option<u8>,
    rule: Option<RuleRaw>,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleRaw {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    ranges: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    substrings: Vec<String>,
    #[serde(default)]
    providers: Vec<String>,
    #[serde(default)]
    severities: Vec<String>,
}

pub fn load_rules(path: &Path) -> Result<RuleSet> {
    let data = std::fs::read_to_string(path)?;
    let raw: RuleSetRaw = toml::from_str(&data)?;
    Ok(compile(raw))
}

pub fn empty_rules() -> RuleSet {
    RuleSet::default()
}

fn compile(raw: RuleSetRaw) -> RuleSet {
    let mut groups = Vec::new();
    for group in raw.groups {
        let mut rules = Vec::new();
        for rule in group.rules {
            match compile_rule(&rule) {
                Ok(compiled) => rules.push(compiled),
                Err(err) => {
                    tracing::warn!(group = %group.name, rule = %rule.kind, "skipping rule: {}", err)
                }
            }
        }
        groups.push(GroupDef {
            name: group.name,
            parent: group.parent,
            rules,
        });
    }

    let mut tags = Vec::new();
    for tag in raw.tags {
        let rule = match tag.rule {
            Some(rule) => match compile_rule(&rule) {
                Ok(compiled) => Some(compiled),
                Err(err) => {
                    tracing::warn!(tag = %tag.name, rule = %rule.kind, "skipping rule: {}", err);
                    None
                }
            },
            None => None,
        };
        tags.push(TagDef {
            name: tag.name,
            criticality: tag.criticality,
            rule,
        });
    }

    let arena = build_arena(&groups);
    RuleSet {
        groups,
        tags,
        arena,
    }
}

/// Parents may be declared in any order; a parent that is never declared
/// demotes the child to a root group, matching how manual assignment tools
/// behave when a hierarchy is partially imported.
fn build_arena(groups: &[GroupDef]) -> GroupArena {
    let mut arena = GroupArena::new();
    let mut pending: Vec<&GroupDef> = groups.iter().collect();
    loop {
        let before = pending.len();
        pending.retain(|g| match &g.parent {
            None => arena.insert(&g.name, None).is_err(),
            Some(parent) if arena.get(parent).is_some() => {
                arena.insert(&g.name, Some(parent)).is_err()
            }
            Some(_) => true,
        });
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }
    for group in pending {
        tracing::warn!(
            group = %group.name,
            parent = %group.parent.as_deref().unwrap_or(""),
            "parent group not defined; attaching at root"
        );
        let _ = arena.insert(&group.name, None);
    }
    arena
}

fn compile_rule(raw: &RuleRaw) -> Result<MatchRule> {
    match raw.kind.as_str() {
        "ip_range" => {
            let cidrs = raw
                .ranges
                .iter()
                .map(|r| Cidr::parse(r))
                .collect::<Result<Vec<_>>>()?;
            if cidrs.is_empty() {
                return Err(anyhow!("ip_range rule without ranges"));
            }
            Ok(MatchRule::IpRange(cidrs))
        }
        "hostname_glob" => Ok(MatchRule::HostnameGlob(compile_globs(&raw.patterns)?)),
        "os_pattern" => Ok(MatchRule::OsPattern(compile_globs(&raw.patterns)?)),
        "tag_match" => {
            if raw.tags.is_empty() {
                return Err(anyhow!("tag_match rule without tags"));
            }
            Ok(MatchRule::TagMatch(raw.tags.clone()))
        }
        "name_contains" => {
            if raw.substrings.is_empty() {
                return Err(anyhow!("name_contains rule without substrings"));
            }
            Ok(MatchRule::NameContains(
                raw.substrings.iter().map(|s| s.to_lowercase()).collect(),
            ))
        }
        "cloud_provider" => {
            if raw.providers.is_empty() {
                return Err(anyhow!("cloud_provider rule without providers"));
            }
            Ok(MatchRule::CloudProvider(
                raw.providers.iter().map(|p| p.to_lowercase()).collect(),
            ))
        }
        "open_vuln_severity" => {
            let mut severities = BTreeSet::new();
            for value in &raw.severities {
                let sev = Severity::parse(value)
                    .ok_or_else(|| anyhow!("unknown severity: {}", value))?;
                severities.insert(sev);
            }
            if severities.is_empty() {
                return Err(anyhow!("open_vuln_severity rule without severities"));
            }
            Ok(MatchRule::OpenVulnSeverity(severities))
        }
        other => Err(anyhow!("unsupported rule type: {}", other)),
    }
}

fn compile_globs(patterns: &[String]) -> Result<Vec<Regex>> {
    if patterns.is_empty() {
        return Err(anyhow!("glob rule without patterns"));
    }
    patterns.iter().map(|p| glob_to_regex(p)).collect()
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut regex = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c if "\\.+()[]{}^$|".contains(c) => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
    }
    regex.push('$');
    Regex::new(&format!("(?i){}", regex)).map_err(|e| anyhow!("bad pattern {}: {}", pattern, e))
}

pub fn rule_matches(rule: &MatchRule, ctx: &EvalContext) -> bool {
    match rule {
        MatchRule::IpRange(cidrs) => attr(ctx.attributes, "ip_address")
            .and_then(|v| v.parse::<IpAddr>().ok())
            .map(|ip| cidrs.iter().any(|c| c.contains(&ip)))
            .unwrap_or(false),
        MatchRule::HostnameGlob(globs) => ["hostname", "fqdn"]
            .iter()
            .filter_map(|key| attr(ctx.attributes, key))
            .any(|value| globs.iter().any(|g| g.is_match(value))),
        MatchRule::TagMatch(tags) => tags.iter().any(|t| ctx.tags.contains(t)),
        MatchRule::OsPattern(globs) => attr(ctx.attributes, "operating_system")
            .map(|os| globs.iter().any(|g| g.is_match(os)))
            .unwrap_or(false),
        MatchRule::NameContains(needles) => ["name", "hostname"]
            .iter()
            .filter_map(|key| attr(ctx.attributes, key))
            .any(|value| {
                let hay = value.to_lowercase();
                needles.iter().any(|n| hay.contains(n))
            }),
        MatchRule::CloudProvider(providers) => attr(ctx.attributes, "cloud_provider")
            .or_else(|| attr(ctx.attributes, "provider"))
            .map(|p| providers.iter().any(|want| want == &p.to_lowercase()))
            .unwrap_or(false),
        MatchRule::OpenVulnSeverity(severities) => {
            severities.iter().any(|s| ctx.open_severities.contains(s))
        }
    }
}

/// All groups whose rule list has at least one matching rule.
pub fn matching_groups<'a>(set: &'a RuleSet, ctx: &EvalContext) -> Vec<&'a GroupDef> {
    set.groups
        .iter()
        .filter(|g| g.rules.iter().any(|r| rule_matches(r, ctx)))
        .collect()
}

pub fn matching_tags<'a>(set: &'a RuleSet, ctx: &EvalContext) -> Vec<&'a TagDef> {
    set.tags
        .iter()
        .filter(|t| {
            t.rule
                .as_ref()
                .map(|r| rule_matches(r, ctx))
                .unwrap_or(false)
        })
        .collect()
}

fn attr<'a>(attrs: &'a AttributeBag, key: &str) -> Option<&'a str> {
    attrs
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// CIDR block over either address family, matched by prefix bits. The pack
/// carries no network crate, so the mask math lives here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    bits: u128,
    prefix: u8,
    v4: bool,
}

impl Cidr {
    pub fn parse(value: &str) -> Result<Self> {
        let (addr_str, prefix_str) = match value.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (value, None),
        };
        let addr: IpAddr = addr_str
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid address in range: {}", value))?;
        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
        let prefix: u8 = match prefix_str {
            Some(p) => p
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid prefix in range: {}", value))?,
            None => max_prefix,
        };
        if prefix > max_prefix {
            return Err(anyhow!("prefix out of range: {}", value));
        }
        Ok(Self {
            bits: ip_bits(&addr),
            prefix,
            v4: addr.is_ipv4(),
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        if ip.is_ipv4() != self.v4 {
            return false;
        }
        let width: u8 = if self.v4 { 32 } else { 128 };
        if self.prefix == 0 {
            return true;
        }
        let shift = width - self.prefix;
        (ip_bits(ip) >> shift) == (self.bits >> shift)
    }
}

fn ip_bits(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(pairs: &[(&str, &str)]) -> AttributeBag {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ctx<'a>(
        attrs: &'a AttributeBag,
        tags: &'a BTreeSet<String>,
        sevs: &'a BTreeSet<Severity>,
    ) -> EvalContext<'a> {
        EvalContext {
            attributes: attrs,
            tags,
            open_severities: sevs,
        }
    }

    #[test]
    fn cidr_membership() {
        let cidr = Cidr::parse("10.1.0.0/16").unwrap();
        assert!(cidr.contains(&"10.1.200.7".parse().unwrap()));
        assert!(!cidr.contains(&"10.2.0.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));

        let single = Cidr::parse("192.0.2.1").unwrap();
        assert!(single.contains(&"192.0.2.1".parse().unwrap()));
        assert!(!single.contains(&"192.0.2.2".parse().unwrap()));

        assert!(Cidr::parse("10.0.0.0/33").is_err());
        assert!(Cidr::parse("not-an-ip/8").is_err());
    }

    #[test]
    fn hostname_glob_matches_case_insensitive() {
        let rule = compile_rule(&RuleRaw {
            kind: "hostname_glob".into(),
            patterns: vec!["prod-*".into(), "*-prd".into()],
            ranges: vec![],
            tags: vec![],
            substrings: vec![],
            providers: vec![],
            severities: vec![],
        })
        .unwrap();
        let attrs = bag(&[("hostname", "PROD-web-01")]);
        let tags = BTreeSet::new();
        let sevs = BTreeSet::new();
        assert!(rule_matches(&rule, &ctx(&attrs, &tags, &sevs)));

        let attrs = bag(&[("hostname", "staging-web")]);
        assert!(!rule_matches(&rule, &ctx(&attrs, &tags, &sevs)));
    }

    #[test]
    fn open_vuln_severity_consults_finding_set() {
        let rule = compile_rule(&RuleRaw {
            kind: "open_vuln_severity".into(),
            severities: vec!["Critical".into()],
            ranges: vec![],
            patterns: vec![],
            tags: vec![],
            substrings: vec![],
            providers: vec![],
        })
        .unwrap();
        let attrs = bag(&[]);
        let tags = BTreeSet::new();
        let mut sevs = BTreeSet::new();
        assert!(!rule_matches(&rule, &ctx(&attrs, &tags, &sevs)));
        sevs.insert(Severity::Critical);
        assert!(rule_matches(&rule, &ctx(&attrs, &tags, &sevs)));
    }

    #[test]
    fn malformed_rule_is_skipped_not_fatal() {
        let raw: RuleSetRaw = toml::from_str(
            r#"
            [[groups]]
            name = "Lab"
            [[groups.rules]]
            type = "ip_range"
            ranges = ["10.0.0.0/99"]
            [[groups.rules]]
            type = "hostname_glob"
            patterns = ["lab-*"]
            "#,
        )
        .unwrap();
        let set = compile(raw);
        assert_eq!(set.groups.len(), 1);
        assert_eq!(set.groups[0].rules.len(), 1);
    }

    #[test]
    fn unsupported_rule_type_is_skipped() {
        let raw: RuleSetRaw = toml::from_str(
            r##"
            [[tags]]
            name = "#odd"
            [tags.rule]
            type = "astrology"
            "##,
        )
        .unwrap();
        let set = compile(raw);
        assert_eq!(set.tags.len(), 1);
        assert!(set.tags[0].rule.is_none());
    }

    #[test]
    fn union_semantics_across_groups() {
        let raw: RuleSetRaw = toml::from_str(
            r#"
            [[groups]]
            name = "Web"
            [[groups.rules]]
            type = "hostname_glob"
            patterns = ["web-*"]

            [[groups]]
            name = "Internal"
            [[groups.rules]]
            type = "ip_range"
            ranges = ["10.0.0.0/8"]
            "#,
        )
        .unwrap();
        let set = compile(raw);
        let attrs = bag(&[("hostname", "web-01"), ("ip_address", "10.4.4.4")]);
        let tags = BTreeSet::new();
        let sevs = BTreeSet::new();
        let matched = matching_groups(&set, &ctx(&attrs, &tags, &sevs));
        let names: Vec<&str> = matched.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["Web", "Internal"]);
    }

    #[test]
    fn arena_resolves_out_of_order_parents() {
        let raw: RuleSetRaw = toml::from_str(
            r#"
            [[groups]]
            name = "Production"
            parent = "Environments"

            [[groups]]
            name = "Environments"
            "#,
        )
        .unwrap();
        let set = compile(raw);
        assert_eq!(
            set.arena.get("Production").unwrap().path,
            "/Environments/Production/"
        );
    }

    #[test]
    fn tag_scores_expose_criticality_contributions() {
        let raw: RuleSetRaw = toml::from_str(
            r##"
            [[tags]]
            name = "#external-facing"
            criticality = 5
            [tags.rule]
            type = "name_contains"
            substrings = ["edge"]

            [[tags]]
            name = "#plain"
            "##,
        )
        .unwrap();
        let set = compile(raw);
        let scores = set.tag_scores();
        assert_eq!(scores.get("#external-facing"), Some(&5));
        assert!(!scores.contains_key("#plain"));
    }
}

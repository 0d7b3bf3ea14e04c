//! Derives the canonical identity key for a raw asset observation.
//!
//! Fingerprinting is a pure function: no I/O, identical input always yields
//! the identical string, which is what makes re-ingesting the same scan file
//! idempotent. Each asset class has a strict priority-ordered chain of
//! identity strategies; the first strategy whose required fields are present
//! and valid wins.

use std::net::IpAddr;

use crate::core::error::LedgerError;
use crate::core::hash::sha256_hex;
use crate::core::types::{AssetClass, AttributeBag};

/// MAC prefixes assigned by hypervisors and container runtimes. These churn
/// per VM clone, so they never anchor a host identity.
const VIRTUAL_MAC_PREFIXES: &[&str] = &[
    "00:05:69", "00:0c:29", "00:1c:14", "00:50:56", // VMware
    "08:00:27", // VirtualBox
    "52:54:00", // QEMU/KVM
    "00:15:5d", // Hyper-V
    "02:42",    // Docker bridge
];

pub fn resolve(class: AssetClass, attrs: &AttributeBag) -> Result<String, LedgerError> {
    let fp = match class {
        AssetClass::Host => host_fingerprint(attrs),
        AssetClass::CodeProject => code_project_fingerprint(attrs),
        AssetClass::Website => website_fingerprint(attrs),
        AssetClass::Image => image_fingerprint(attrs),
        AssetClass::CloudResource => cloud_resource_fingerprint(attrs),
        AssetClass::Unknown => unknown_fingerprint(attrs),
    };
    fp.ok_or_else(|| {
        LedgerError::Identity(format!(
            "no identity-bearing fields for class {}",
            class.as_str()
        ))
    })
}

fn host_fingerprint(attrs: &AttributeBag) -> Option<String> {
    if let Some(id) = attr(attrs, "cloud_instance_id") {
        return Some(format!("host:cloud:{}", id.to_lowercase()));
    }
    if let Some(mac) = attr(attrs, "mac_address").and_then(stable_mac) {
        return Some(format!("host:mac:{}", mac));
    }
    let ip = attr(attrs, "ip_address").filter(|v| valid_ip(v));
    let hostname = attr(attrs, "hostname").map(|v| v.to_lowercase());
    let fqdn = attr(attrs, "fqdn").map(|v| v.to_lowercase());
    match (&ip, &hostname, &fqdn) {
        (Some(ip), Some(host), Some(fqdn)) => Some(format!("host:net:{}|{}|{}", ip, host, fqdn)),
        (Some(ip), Some(host), None) => Some(format!("host:net:{}|{}", ip, host)),
        (None, Some(host), Some(fqdn)) => Some(format!("host:dns:{}|{}", host, fqdn)),
        (None, Some(host), None) => Some(format!("host:name:{}", host)),
        (Some(ip), None, _) => Some(format!("host:ip:{}", ip)),
        _ => None,
    }
}

fn code_project_fingerprint(attrs: &AttributeBag) -> Option<String> {
    if let Some(url) = attr(attrs, "repository_url") {
        return Some(format!("code:url:{}", normalize_url(url)));
    }
    let name = attr(attrs, "repository_name").map(|v| v.to_lowercase());
    let provider = attr(attrs, "provider")
        .or_else(|| attr(attrs, "source_provider"))
        .map(|v| v.to_lowercase());
    match (&name, &provider) {
        (Some(name), Some(provider)) => Some(format!("code:repo:{}|{}", name, provider)),
        (Some(name), None) => Some(format!("code:name:{}", name)),
        _ => None,
    }
}

fn website_fingerprint(attrs: &AttributeBag) -> Option<String> {
    attr(attrs, "url").map(|url| format!("site:url:{}", normalize_url(url)))
}

fn image_fingerprint(attrs: &AttributeBag) -> Option<String> {
    if let Some(digest) = attr(attrs, "image_digest") {
        return Some(format!("image:digest:{}", digest.to_lowercase()));
    }
    let repo = attr(attrs, "image_repository")?.to_lowercase();
    let tag = attr(attrs, "image_tag")
        .map(|v| v.to_lowercase())
        .unwrap_or_else(|| "latest".to_string());
    Some(format!("image:tag:{}:{}", repo, tag))
}

fn cloud_resource_fingerprint(attrs: &AttributeBag) -> Option<String> {
    let provider = attr(attrs, "cloud_provider")
        .or_else(|| attr(attrs, "provider"))?
        .to_lowercase();
    if let Some(id) = attr(attrs, "resource_id") {
        return Some(format!("cloud:{}:id:{}", provider, id.to_lowercase()));
    }
    if let Some(arn) = attr(attrs, "arn") {
        return Some(format!("cloud:{}:arn:{}", provider, arn.to_lowercase()));
    }
    let name = attr(attrs, "name").map(|v| v.to_lowercase());
    let region = attr(attrs, "region").map(|v| v.to_lowercase());
    match (&region, &name) {
        (Some(region), Some(name)) => Some(format!("cloud:{}:loc:{}|{}", provider, region, name)),
        (None, Some(name)) => Some(format!("cloud:{}:name:{}", provider, name)),
        _ => None,
    }
}

/// Field-selective fallback for unrecognized classes: a native id wins, then
/// a name, then a digest of the sorted whole bag. The bag is a BTreeMap, so
/// even the last resort is insensitive to observation field ordering.
fn unknown_fingerprint(attrs: &AttributeBag) -> Option<String> {
    if let Some(id) = attr(attrs, "id") {
        return Some(format!("unknown:id:{}", id.to_lowercase()));
    }
    if let Some(name) = attr(attrs, "name") {
        return Some(format!("unknown:name:{}", name.to_lowercase()));
    }
    if attrs.values().all(|v| v.trim().is_empty()) {
        return None;
    }
    let material: Vec<String> = attrs
        .iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(k, v)| format!("{}={}", k, v.trim()))
        .collect();
    Some(format!(
        "unknown:bag:{}",
        sha256_hex(material.join("|").as_bytes())
    ))
}

fn attr<'a>(attrs: &'a AttributeBag, key: &str) -> Option<&'a str> {
    attrs
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn valid_ip(value: &str) -> bool {
    value.parse::<IpAddr>().is_ok()
}

/// Normalizes a MAC to lowercase colon form and rejects virtual or
/// locally-administered addresses.
fn stable_mac(raw: &str) -> Option<String> {
    let mac = raw.trim().to_lowercase().replace('-', ":");
    let octets: Vec<&str> = mac.split(':').collect();
    if octets.len() != 6 || octets.iter().any(|o| o.len() != 2) {
        return None;
    }
    let first = u8::from_str_radix(octets[0], 16).ok()?;
    for octet in &octets {
        u8::from_str_radix(octet, 16).ok()?;
    }
    // Locally-administered bit means a synthetic address.
    if first & 0x02 != 0 {
        return None;
    }
    if VIRTUAL_MAC_PREFIXES.iter().any(|p| mac.starts_with(p)) {
        return None;
    }
    Some(mac)
}

fn normalize_url(raw: &str) -> String {
    let mut url = raw.trim().to_lowercase();
    for scheme in ["https://", "http://", "git@", "ssh://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            url = rest.to_string();
            break;
        }
    }
    url.trim_end_matches('/').trim_end_matches(".git").to_string()
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

    #[test]
    fn fingerprint_is_deterministic() {
        let attrs = bag(&[("ip_address", "10.0.0.5"), ("hostname", "Web-01")]);
        let a = resolve(AssetClass::Host, &attrs).unwrap();
        let b = resolve(AssetClass::Host, &attrs).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "host:net:10.0.0.5|web-01");
    }

    #[test]
    fn cloud_instance_id_beats_mac_and_ip() {
        let attrs = bag(&[
            ("cloud_instance_id", "i-0abc123"),
            ("mac_address", "3c:22:fb:aa:bb:cc"),
            ("ip_address", "10.0.0.5"),
            ("hostname", "web-01"),
        ]);
        assert_eq!(
            resolve(AssetClass::Host, &attrs).unwrap(),
            "host:cloud:i-0abc123"
        );
    }

    #[test]
    fn virtual_mac_falls_through_to_network_identity() {
        let attrs = bag(&[
            ("mac_address", "00:0c:29:12:34:56"),
            ("ip_address", "10.0.0.5"),
            ("hostname", "web-01"),
        ]);
        assert_eq!(
            resolve(AssetClass::Host, &attrs).unwrap(),
            "host:net:10.0.0.5|web-01"
        );
    }

    #[test]
    fn locally_administered_mac_is_rejected() {
        assert!(stable_mac("02:00:4c:aa:bb:cc").is_none());
        assert!(stable_mac("3C-22-FB-AA-BB-CC").is_some());
    }

    #[test]
    fn invalid_ip_is_not_identity_bearing() {
        let attrs = bag(&[("ip_address", "not-an-ip")]);
        assert!(resolve(AssetClass::Host, &attrs).is_err());
    }

    #[test]
    fn website_url_normalization_strips_scheme_and_case() {
        let a = bag(&[("url", "HTTPS://Example.com/app/")]);
        let b = bag(&[("url", "http://example.com/app")]);
        assert_eq!(
            resolve(AssetClass::Website, &a).unwrap(),
            resolve(AssetClass::Website, &b).unwrap()
        );
    }

    #[test]
    fn image_defaults_to_latest_tag() {
        let attrs = bag(&[("image_repository", "registry.local/api")]);
        assert_eq!(
            resolve(AssetClass::Image, &attrs).unwrap(),
            "image:tag:registry.local/api:latest"
        );
    }

    #[test]
    fn cloud_resource_requires_provider() {
        let attrs = bag(&[("resource_id", "vm-123")]);
        assert!(resolve(AssetClass::CloudResource, &attrs).is_err());
        let attrs = bag(&[("resource_id", "vm-123"), ("cloud_provider", "Azure")]);
        assert_eq!(
            resolve(AssetClass::CloudResource, &attrs).unwrap(),
            "cloud:azure:id:vm-123"
        );
    }

    #[test]
    fn unknown_bag_fallback_ignores_field_order() {
        let a = bag(&[("serial", "xyz"), ("vendor", "acme")]);
        let b = bag(&[("vendor", "acme"), ("serial", "xyz")]);
        assert_eq!(
            resolve(AssetClass::Unknown, &a).unwrap(),
            resolve(AssetClass::Unknown, &b).unwrap()
        );
    }

    #[test]
    fn empty_bag_is_rejected() {
        assert!(resolve(AssetClass::Unknown, &AttributeBag::new()).is_err());
    }

    #[test]
    fn repository_url_normalization_matches_clone_variants() {
        let a = bag(&[("repository_url", "https://github.com/acme/api.git")]);
        let b = bag(&[("repository_url", "git@github.com/acme/api")]);
        assert_eq!(
            resolve(AssetClass::CodeProject, &a).unwrap(),
            resolve(AssetClass::CodeProject, &b).unwrap()
        );
    }
}

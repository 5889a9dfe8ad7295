use std::collections::BTreeMap;

use super::{ErrorKind, Result};

/// One source registry and the mirrors that serve its content.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MirrorRule {
    /// Source registry (optionally with a repository path)
    pub source: String,
    /// Mirror registries, in preference order
    pub mirrors: Vec<String>,
    /// Whether mirrors may also resolve tags (not just digests)
    pub resolve_tags: bool,
}

/// Merge digest-mirror and tag-mirror rules into one set keyed by source.
///
/// A source listed in both kinds keeps the union of its mirrors and is marked
/// tag-resolving. Mirror order within a kind is preserved; digest mirrors come
/// first.
pub fn merge_rules(digest: &[MirrorRule], tags: &[MirrorRule]) -> Vec<MirrorRule> {
    let mut merged: BTreeMap<String, MirrorRule> = BTreeMap::new();
    for rule in digest {
        let entry = merged.entry(rule.source.clone()).or_insert_with(|| MirrorRule {
            source: rule.source.clone(),
            ..Default::default()
        });
        for m in &rule.mirrors {
            if !entry.mirrors.contains(m) {
                entry.mirrors.push(m.clone());
            }
        }
    }
    for rule in tags {
        let entry = merged.entry(rule.source.clone()).or_insert_with(|| MirrorRule {
            source: rule.source.clone(),
            ..Default::default()
        });
        entry.resolve_tags = true;
        for m in &rule.mirrors {
            if !entry.mirrors.contains(m) {
                entry.mirrors.push(m.clone());
            }
        }
    }
    merged.into_iter().map(|(_, v)| v).collect()
}

/// Registry host of a source entry: everything before the first slash
fn registry_host(source: &str) -> &str {
    source.split('/').next().unwrap_or(source)
}

/// Generate the container runtime's hosts files for a rule set.
///
/// Returns `{relative path -> content}` suitable for an atomic directory
/// replace: one `<source>/hosts.toml` per rule, containerd host-config
/// layout.
pub fn generate_hosts_files(rules: &[MirrorRule]) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    for rule in rules {
        if rule.mirrors.is_empty() {
            continue;
        }
        let mut body = format!("server = \"https://{}\"\n", registry_host(rule.source.as_str()));
        for mirror in &rule.mirrors {
            body.push_str(&format!("\n[host.\"https://{}\"]\n", mirror));
            let caps = if rule.resolve_tags {
                "[\"pull\", \"resolve\"]"
            } else {
                "[\"pull\"]"
            };
            body.push_str(&format!("  capabilities = {}\n", caps));
            if mirror.contains('/') {
                body.push_str("  override_path = true\n");
            }
        }
        files.insert(format!("{}/hosts.toml", rule.source), body.into_bytes());
    }
    files
}

/// Validate and repack the cluster pull secret for the host.
///
/// The input is the `.dockerconfigjson` payload of the global pull secret;
/// the output pair is the relative path and content of the auth file placed
/// next to the hosts files.
pub fn pull_secret_file(dockerconfigjson: &[u8]) -> Result<(String, Vec<u8>)> {
    let parsed: serde_json::Value = serde_json::from_slice(dockerconfigjson)
        .map_err(|_| ErrorKind::InvalidPullSecret)?;
    let auths = parsed
        .get("auths")
        .and_then(|a| a.as_object())
        .ok_or(ErrorKind::InvalidPullSecret)?;
    if auths.is_empty() {
        bail!(ErrorKind::InvalidPullSecret);
    }
    // re-serialize to strip unknown top level fields
    let repacked = serde_json::to_vec_pretty(&serde_json::json!({ "auths": auths }))?;
    Ok(("config.json".to_string(), repacked))
}

#[cfg(test)]
mod tests {
    use super::{generate_hosts_files, merge_rules, pull_secret_file, MirrorRule};

    fn digest_rule() -> MirrorRule {
        MirrorRule {
            source: "registry.redhat.io/openshift4".into(),
            mirrors: vec!["mirror.internal:5000/openshift4".into()],
            resolve_tags: false,
        }
    }

    #[test]
    fn merge_unions_mirrors_by_source() {
        let tags = vec![MirrorRule {
            source: "registry.redhat.io/openshift4".into(),
            mirrors: vec!["other.internal/openshift4".into()],
            resolve_tags: true,
        }];
        let merged = merge_rules(&[digest_rule()], &tags);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].mirrors.len(), 2);
        assert!(merged[0].resolve_tags);
        assert_eq!(merged[0].mirrors[0], "mirror.internal:5000/openshift4");
    }

    #[test]
    fn hosts_file_layout() {
        let files = generate_hosts_files(&[digest_rule()]);
        let body = String::from_utf8(
            files["registry.redhat.io/openshift4/hosts.toml"].clone(),
        )
        .unwrap();
        assert!(body.starts_with("server = \"https://registry.redhat.io\""));
        assert!(body.contains("[host.\"https://mirror.internal:5000/openshift4\"]"));
        assert!(body.contains("capabilities = [\"pull\"]"));
        assert!(body.contains("override_path = true"));
    }

    #[test]
    fn tag_rules_gain_resolve() {
        let mut rule = digest_rule();
        rule.resolve_tags = true;
        let files = generate_hosts_files(&[rule]);
        let body = String::from_utf8(
            files["registry.redhat.io/openshift4/hosts.toml"].clone(),
        )
        .unwrap();
        assert!(body.contains("capabilities = [\"pull\", \"resolve\"]"));
    }

    #[test]
    fn mirrorless_rules_emit_nothing() {
        let rule = MirrorRule {
            source: "quay.io".into(),
            ..Default::default()
        };
        assert!(generate_hosts_files(&[rule]).is_empty());
    }

    #[test]
    fn pull_secret_validation() {
        let good = br#"{"auths":{"quay.io":{"auth":"dXNlcjpwYXNz"}},"extra":"dropped"}"#;
        let (path, content) = pull_secret_file(good).unwrap();
        assert_eq!(path, "config.json");
        let v: serde_json::Value = serde_json::from_slice(&content).unwrap();
        assert!(v.get("auths").is_some());
        assert!(v.get("extra").is_none());

        assert!(pull_secret_file(b"{}").is_err());
        assert!(pull_secret_file(b"{\"auths\":{}}").is_err());
        assert!(pull_secret_file(b"not json").is_err());
    }
}

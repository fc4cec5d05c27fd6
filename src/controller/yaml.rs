//! Nested lookup and normalization over parsed YAML documents
//!
//! The server and proxy configuration documents are loosely typed YAML. The
//! helpers here let the rest of the controller treat them as a uniform
//! string-keyed tree: [`normalize`] rewrites any non-string mapping keys
//! produced by the parser, and [`lookup`] descends a key path without ever
//! failing — absence is `None`, never an error.

use serde_yaml::{Mapping, Value};

/// Look up the value at `path`, descending one mapping per key.
///
/// Returns `None` if any segment is missing or an intermediate node is not
/// a mapping. An empty path returns the node itself.
pub fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let Some((head, rest)) = path.split_first() else {
        return Some(value);
    };

    let entry = value.as_mapping()?.get(*head)?;

    if rest.is_empty() {
        Some(entry)
    } else {
        lookup(entry, rest)
    }
}

/// Rewrite every mapping in the tree to use string keys, recursing through
/// sequences. Scalar keys (numbers, booleans) become their display form.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Mapping(mapping) => {
            let mut normalized = Mapping::with_capacity(mapping.len());
            for (key, entry) in mapping {
                let key = match key {
                    Value::String(s) => Value::String(s),
                    other => Value::String(scalar_key(&other)),
                };
                normalized.insert(key, normalize(entry));
            }
            Value::Mapping(normalized)
        }
        Value::Sequence(entries) => {
            Value::Sequence(entries.into_iter().map(normalize).collect())
        }
        other => other,
    }
}

fn scalar_key(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        // Tagged or nested keys do not occur in practice; fall back to the
        // serialized form with the trailing newline stripped.
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(doc: &str) -> Value {
        normalize(serde_yaml::from_str(doc).expect("test document parses"))
    }

    #[test]
    fn test_lookup_scalar_round_trip() {
        let body = parse("general:\n  ports:\n    ldap: 9389\n");
        let port = lookup(&body, &["general", "ports", "ldap"]).unwrap();
        assert_eq!(port.as_i64(), Some(9389));
    }

    #[test]
    fn test_lookup_missing_path_is_none_at_any_depth() {
        let body = parse("general:\n  ports:\n    ldap: 9389\n");
        assert!(lookup(&body, &["missing"]).is_none());
        assert!(lookup(&body, &["general", "missing"]).is_none());
        assert!(lookup(&body, &["general", "ports", "ldap", "deeper"]).is_none());
    }

    #[test]
    fn test_lookup_through_non_mapping_is_none() {
        let body = parse("general: scalar\n");
        assert!(lookup(&body, &["general", "ports"]).is_none());
    }

    #[test]
    fn test_normalize_rewrites_numeric_keys() {
        let body = parse("ports:\n  9389: ldap\n  9636: ldaps\n");
        let name = lookup(&body, &["ports", "9389"]).unwrap();
        assert_eq!(name.as_str(), Some("ldap"));
    }

    #[test]
    fn test_normalize_recurses_into_sequences() {
        let body = parse("suffixes:\n  - 1: \"dc=example\"\n");
        let entries = lookup(&body, &["suffixes"]).unwrap().as_sequence().unwrap();
        let dn = lookup(&entries[0], &["1"]).unwrap();
        assert_eq!(dn.as_str(), Some("dc=example"));
    }

    #[test]
    fn test_empty_path_returns_root() {
        let body = parse("a: 1\n");
        assert!(lookup(&body, &[]).is_some());
    }
}

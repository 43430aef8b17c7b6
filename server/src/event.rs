//! The signed event and filter data model.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

pub type Tag = Vec<String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u64,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Canonical serialization whose SHA-256 hash, hex-encoded, must equal `id`.
    ///
    /// `(author, created-at, kind, tags, content)` — note the identifier
    /// deliberately excludes itself and the signature.
    pub fn canonical_payload(&self) -> String {
        let tags_json = serde_json::to_string(&self.tags).unwrap_or_else(|_| "[]".to_string());
        let content_json = serde_json::to_string(&self.content).unwrap_or_else(|_| "\"\"".to_string());
        format!(
            "[\"{}\",{},{},{},{}]",
            self.pubkey, self.created_at, self.kind, tags_json, content_json
        )
    }

    pub fn computed_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_payload().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn id_is_consistent(&self) -> bool {
        self.id == self.computed_id()
    }

    /// First-element-indexed tags, e.g. `#e` -> values of tags `["e", v, ...]`.
    pub fn indexed_tag_values<'a>(&'a self, letter: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags.iter().filter_map(move |tag| {
            if tag.first().map(String::as_str) == Some(letter) {
                tag.get(1).map(String::as_str)
            } else {
                None
            }
        })
    }

    pub fn has_hex_id(&self) -> bool {
        is_lowercase_hex(&self.id, 64)
    }

    pub fn has_hex_pubkey(&self) -> bool {
        is_lowercase_hex(&self.pubkey, 64)
    }

    pub fn has_hex_sig(&self) -> bool {
        is_lowercase_hex(&self.sig, 128)
    }
}

fn is_lowercase_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Conjunctive predicate over event fields. An empty/`None` field is a
/// wildcard that matches anything.
///
/// `tag_constraints` holds the `#x` keys (one per indexed-tag letter); these
/// are flattened as sibling object keys on the wire (`{"#e": [...], "#p": [...]}`),
/// so `Filter` carries hand-written `Serialize`/`Deserialize` impls instead of
/// the derive, which cannot express a dynamic `#`-prefixed key set.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub ids: Option<HashSet<String>>,
    pub authors: Option<HashSet<String>>,
    pub kinds: Option<HashSet<u64>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<u64>,
    pub tag_constraints: std::collections::BTreeMap<String, HashSet<String>>,
}

impl Serialize for Filter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        if let Some(since) = &self.since {
            map.serialize_entry("since", since)?;
        }
        if let Some(until) = &self.until {
            map.serialize_entry("until", until)?;
        }
        if let Some(limit) = &self.limit {
            map.serialize_entry("limit", limit)?;
        }
        for (letter, values) in &self.tag_constraints {
            map.serialize_entry(&format!("#{letter}"), values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut filter = Filter::default();
        for (key, value) in raw {
            match key.as_str() {
                "ids" => filter.ids = serde_json::from_value(value).ok(),
                "authors" => filter.authors = serde_json::from_value(value).ok(),
                "kinds" => filter.kinds = serde_json::from_value(value).ok(),
                "since" => filter.since = value.as_i64(),
                "until" => filter.until = value.as_i64(),
                "limit" => filter.limit = value.as_u64(),
                other if other.starts_with('#') && other.len() == 2 => {
                    let letter = other[1..].to_string();
                    if let Ok(values) = serde_json::from_value::<HashSet<String>>(value) {
                        filter.tag_constraints.insert(letter, values);
                    }
                }
                _ => {}
            }
        }
        Ok(filter)
    }
}

impl Filter {
    /// Every `kind` this filter mentions, used for the query-cache secondary
    /// index and for invalidation.
    pub fn mentioned_kinds(&self) -> impl Iterator<Item = &u64> {
        self.kinds.iter().flatten()
    }

    pub fn mentioned_authors(&self) -> impl Iterator<Item = &str> {
        self.authors.iter().flatten().map(String::as_str)
    }
}

/// Canonical JSON used as the query-cache key component: filters
/// serialized with sorted keys so semantically identical filter lists always
/// produce the same string.
pub fn canonical_filters_json(filters: &[Filter]) -> String {
    let values: Vec<serde_json::Value> = filters
        .iter()
        .map(|f| serde_json::to_value(f).unwrap_or(serde_json::Value::Null))
        .map(canonicalize_value)
        .collect();
    serde_json::Value::Array(values).to_string()
}

fn canonicalize_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, serde_json::Value> = Default::default();
            for (k, v) in map {
                sorted.insert(k, canonicalize_value(v));
            }
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            let mut items: Vec<serde_json::Value> = items.into_iter().map(canonicalize_value).collect();
            // ids/authors/kinds/#x come from HashSet and serialize in an
            // arbitrary order; sort scalar arrays so two semantically
            // identical filters always produce the same cache key.
            if items.iter().all(|v| v.is_string() || v.is_number()) {
                items.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
            }
            serde_json::Value::Array(items)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_payload_matches_spec_shape() {
        let e = Event {
            id: String::new(),
            pubkey: "a".repeat(64),
            created_at: 100,
            kind: 1,
            tags: vec![vec!["e".to_string(), "x".to_string()]],
            content: "hi".to_string(),
            sig: "b".repeat(128),
        };
        let payload = e.canonical_payload();
        assert!(payload.starts_with(&format!("[\"{}\",100,1,", "a".repeat(64))));
        assert!(payload.ends_with("\"hi\"]"));
    }

    #[test]
    fn id_consistency_detects_tampering() {
        let mut e = Event {
            id: String::new(),
            pubkey: "a".repeat(64),
            created_at: 100,
            kind: 1,
            tags: vec![],
            content: "hi".to_string(),
            sig: "b".repeat(128),
        };
        e.id = e.computed_id();
        assert!(e.id_is_consistent());
        e.content = "tampered".to_string();
        assert!(!e.id_is_consistent());
    }

    #[test]
    fn indexed_tag_values_filters_by_first_element() {
        let e = Event {
            id: String::new(),
            pubkey: "a".repeat(64),
            created_at: 1,
            kind: 1,
            tags: vec![
                vec!["e".to_string(), "x".to_string()],
                vec!["p".to_string(), "y".to_string()],
                vec!["e".to_string(), "z".to_string()],
            ],
            content: String::new(),
            sig: "b".repeat(128),
        };
        let evals: Vec<&str> = e.indexed_tag_values("e").collect();
        assert_eq!(evals, vec!["x", "z"]);
    }

    #[test]
    fn canonical_filters_json_is_order_independent_across_object_keys() {
        let mut f1 = Filter::default();
        f1.kinds = Some([1, 2].into_iter().collect());
        f1.authors = Some(["aa".to_string()].into_iter().collect());
        let json = canonical_filters_json(&[f1]);
        assert!(json.contains("\"authors\""));
        assert!(json.contains("\"kinds\""));
    }

    #[test]
    fn filter_round_trips_hash_tag_constraints() {
        let raw = serde_json::json!({"kinds": [1], "#e": ["x", "y"]});
        let filter: Filter = serde_json::from_value(raw).unwrap();
        assert_eq!(filter.kinds, Some([1u64].into_iter().collect()));
        assert_eq!(
            filter.tag_constraints.get("e"),
            Some(&["x".to_string(), "y".to_string()].into_iter().collect())
        );
        let back = serde_json::to_value(&filter).unwrap();
        assert!(back.get("#e").is_some());
    }
}

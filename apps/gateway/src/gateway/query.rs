//! Query parameters captured from the upgrade request URL.

use std::collections::HashMap;

use serde::Serialize;

/// A query parameter value; repeated keys collect into [`QueryValue::Multi`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum QueryValue {
    Single(String),
    Multi(Vec<String>),
}

impl QueryValue {
    /// The first value for this key.
    pub fn first(&self) -> &str {
        match self {
            Self::Single(v) => v,
            Self::Multi(vs) => vs.first().map(String::as_str).unwrap_or_default(),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            Self::Single(existing) => {
                let first = std::mem::take(existing);
                *self = Self::Multi(vec![first, value]);
            }
            Self::Multi(vs) => vs.push(value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryParams(HashMap<String, QueryValue>);

impl QueryParams {
    /// Group decoded `key=value` pairs, preserving the order of repeated keys.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map: HashMap<String, QueryValue> = HashMap::new();
        for (key, value) in pairs {
            match map.get_mut(&key) {
                Some(existing) => existing.push(value),
                None => {
                    map.insert(key, QueryValue::Single(value));
                }
            }
        }
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&QueryValue> {
        self.0.get(key)
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(QueryValue::first)
    }

    pub fn all(&self, key: &str) -> Vec<&str> {
        match self.0.get(key) {
            Some(QueryValue::Single(v)) => vec![v.as_str()],
            Some(QueryValue::Multi(vs)) => vs.iter().map(String::as_str).collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &QueryValue)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn single_values_stay_single() {
        let q = QueryParams::from_pairs(pairs(&[("token", "abc"), ("room", "lobby")]));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get("token"), Some(&QueryValue::Single("abc".into())));
        assert_eq!(q.first("room"), Some("lobby"));
    }

    #[test]
    fn repeated_keys_collect_in_order() {
        let q = QueryParams::from_pairs(pairs(&[("tag", "a"), ("tag", "b"), ("tag", "c")]));
        assert_eq!(
            q.get("tag"),
            Some(&QueryValue::Multi(vec!["a".into(), "b".into(), "c".into()]))
        );
        assert_eq!(q.first("tag"), Some("a"));
        assert_eq!(q.all("tag"), vec!["a", "b", "c"]);
    }

    #[test]
    fn missing_key() {
        let q = QueryParams::default();
        assert!(q.is_empty());
        assert!(q.first("nope").is_none());
        assert!(q.all("nope").is_empty());
    }

    #[test]
    fn serializes_as_plain_map() {
        let q = QueryParams::from_pairs(pairs(&[("a", "1"), ("b", "2"), ("b", "3")]));
        let value = serde_json::to_value(&q).unwrap();
        assert_eq!(value, serde_json::json!({"a": "1", "b": ["2", "3"]}));
    }
}

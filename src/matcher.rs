// Copyright 2020 Joyent, Inc.

//! Path predicates for fetch subscriptions.

use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn is_blank(s: &Option<String>) -> bool {
    s.as_ref().map_or(true, String::is_empty)
}

/// Describes which state and method paths a fetch is interested in.
///
/// Every predicate is optional and all present predicates must hold. A
/// matcher without predicates matches every path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    #[serde(skip_serializing_if = "is_blank", default)]
    contains: Option<String>,
    #[serde(skip_serializing_if = "is_blank", default)]
    starts_with: Option<String>,
    #[serde(skip_serializing_if = "is_blank", default)]
    ends_with: Option<String>,
    #[serde(rename = "equals", skip_serializing_if = "is_blank", default)]
    equals_to: Option<String>,
    #[serde(rename = "equalsNot", skip_serializing_if = "is_blank", default)]
    equals_not_to: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    contains_all_of: Vec<String>,
    #[serde(skip)]
    case_insensitive: bool,
}

impl Matcher {
    pub fn new() -> Matcher {
        Matcher::default()
    }

    pub fn contains(mut self, s: impl Into<String>) -> Matcher {
        self.contains = Some(s.into());
        self
    }

    pub fn starts_with(mut self, s: impl Into<String>) -> Matcher {
        self.starts_with = Some(s.into());
        self
    }

    pub fn ends_with(mut self, s: impl Into<String>) -> Matcher {
        self.ends_with = Some(s.into());
        self
    }

    pub fn equals_to(mut self, s: impl Into<String>) -> Matcher {
        self.equals_to = Some(s.into());
        self
    }

    pub fn equals_not_to(mut self, s: impl Into<String>) -> Matcher {
        self.equals_not_to = Some(s.into());
        self
    }

    pub fn contains_all_of<I, S>(mut self, parts: I) -> Matcher
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contains_all_of = parts.into_iter().map(Into::into).collect();
        self
    }

    pub fn case_insensitive(mut self, case_insensitive: bool) -> Matcher {
        self.case_insensitive = case_insensitive;
        self
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    /// The `path` object of a fetch request, or `None` when the matcher has
    /// no predicates and therefore matches everything.
    pub fn path_filter(&self) -> Option<Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(filter)) if !filter.is_empty() => {
                Some(Value::Object(filter))
            }
            _ => None,
        }
    }

    /// Parameters of the `fetch` request announcing this matcher under
    /// `fetch_id`.
    pub fn fetch_params(&self, fetch_id: u64) -> Value {
        let mut params = Map::new();
        if let Some(path) = self.path_filter() {
            params.insert("path".to_string(), path);
        }
        params.insert(
            "caseInsensitive".to_string(),
            Value::Bool(self.case_insensitive),
        );
        params.insert("id".to_string(), Value::from(fetch_id));
        Value::Object(params)
    }

    /// Evaluate the predicates against `path` locally.
    pub fn is_match(&self, path: &str) -> bool {
        let fold = |s: &str| {
            if self.case_insensitive {
                s.to_lowercase()
            } else {
                s.to_string()
            }
        };
        let path = fold(path);
        let present = |p: &Option<String>| {
            p.as_ref().filter(|s| !s.is_empty()).map(|s| fold(s.as_str()))
        };

        if let Some(s) = present(&self.contains) {
            if !path.contains(&s) {
                return false;
            }
        }
        if let Some(s) = present(&self.starts_with) {
            if !path.starts_with(&s) {
                return false;
            }
        }
        if let Some(s) = present(&self.ends_with) {
            if !path.ends_with(&s) {
                return false;
            }
        }
        if let Some(s) = present(&self.equals_to) {
            if path != s {
                return false;
            }
        }
        if let Some(s) = present(&self.equals_not_to) {
            if path == s {
                return false;
            }
        }
        self.contains_all_of
            .iter()
            .all(|part| path.contains(&fold(part.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_matcher_omits_path() {
        let matcher = Matcher::new();
        assert_eq!(matcher.path_filter(), None);
        assert_eq!(
            matcher.fetch_params(3),
            json!({"caseInsensitive": false, "id": 3})
        );
        assert!(matcher.is_match("anything/at/all"));
    }

    #[test]
    fn blank_predicates_are_not_sent() {
        let matcher = Matcher::new()
            .contains("")
            .starts_with("root/")
            .contains_all_of(Vec::<String>::new());
        assert_eq!(matcher.path_filter(), Some(json!({"startsWith": "root/"})));
    }

    #[test]
    fn all_predicates_use_wire_names() {
        let matcher = Matcher::new()
            .contains("a")
            .starts_with("b")
            .ends_with("c")
            .equals_to("d")
            .equals_not_to("e")
            .contains_all_of(vec!["f", "g"])
            .case_insensitive(true);
        assert_eq!(
            matcher.fetch_params(11),
            json!({
                "path": {
                    "contains": "a",
                    "startsWith": "b",
                    "endsWith": "c",
                    "equals": "d",
                    "equalsNot": "e",
                    "containsAllOf": ["f", "g"]
                },
                "caseInsensitive": true,
                "id": 11
            })
        );
    }

    #[test]
    fn local_evaluation_requires_every_predicate() {
        let matcher = Matcher::new()
            .starts_with("plant/")
            .ends_with("/temp")
            .contains_all_of(vec!["hall"]);
        assert!(matcher.is_match("plant/hall1/temp"));
        assert!(!matcher.is_match("plant/office/temp"));
        assert!(!matcher.is_match("plant/hall1/pressure"));

        let not_root = Matcher::new().equals_not_to("root");
        assert!(!not_root.is_match("root"));
        assert!(not_root.is_match("root/child"));
    }

    #[test]
    fn case_insensitive_evaluation_folds_both_sides() {
        let matcher = Matcher::new().equals_to("The/State");
        assert!(!matcher.is_match("the/state"));
        assert!(matcher.case_insensitive(true).is_match("the/STATE"));
    }
}

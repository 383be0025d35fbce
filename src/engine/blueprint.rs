//! Blueprint model: actor templates and their configurable attributes
//!
//! Blueprints are fetched once from the engine and then cloned, tweaked, and
//! embedded in spawn commands.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::error::{CaptureError, Result};

/// A configurable attribute with the values the engine recommends for it
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlueprintAttribute {
    pub value: String,
    #[serde(default)]
    pub recommended_values: Vec<String>,
}

impl BlueprintAttribute {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            recommended_values: Vec::new(),
        }
    }

    pub fn with_recommended(value: impl Into<String>, recommended: &[&str]) -> Self {
        Self {
            value: value.into(),
            recommended_values: recommended.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        self.value.trim().parse().ok()
    }
}

/// Template for an actor kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, BlueprintAttribute>,
}

impl Blueprint {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_attribute(mut self, key: &str, attribute: BlueprintAttribute) -> Self {
        self.attributes.insert(key.to_string(), attribute);
        self
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn attribute(&self, key: &str) -> Option<&BlueprintAttribute> {
        self.attributes.get(key)
    }

    /// Set an attribute value, creating the attribute if needed
    pub fn set_attribute(&mut self, key: &str, value: impl Into<String>) {
        self.attributes
            .entry(key.to_string())
            .or_default()
            .value = value.into();
    }

    /// True if the pattern matches the id or any tag
    pub fn matches(&self, pattern: &str) -> bool {
        wildcard_match(pattern, &self.id) || self.tags.iter().any(|t| wildcard_match(pattern, t))
    }
}

/// Every blueprint the engine offers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlueprintLibrary {
    blueprints: Vec<Blueprint>,
}

impl BlueprintLibrary {
    pub fn new(blueprints: Vec<Blueprint>) -> Self {
        Self { blueprints }
    }

    pub fn len(&self) -> usize {
        self.blueprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blueprints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Blueprint> {
        self.blueprints.iter()
    }

    /// All blueprints whose id or tags match a shell-style pattern
    pub fn filter(&self, pattern: &str) -> Vec<Blueprint> {
        self.blueprints.iter().filter(|bp| bp.matches(pattern)).cloned().collect()
    }

    /// Exact lookup by id
    pub fn find(&self, id: &str) -> Result<Blueprint> {
        self.blueprints
            .iter()
            .find(|bp| bp.id == id)
            .cloned()
            .ok_or_else(|| CaptureError::BlueprintNotFound(id.to_string()))
    }
}

/// Shell-style matching with `*` (any run) and `?` (any single char)
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` and the text index it was tried at
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("vehicle.*", "vehicle.audi.a2"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("walker.pedestrian.000?", "walker.pedestrian.0003"));
        assert!(wildcard_match("*.isetta", "vehicle.bmw.isetta"));
        assert!(!wildcard_match("vehicle.*", "walker.pedestrian.0001"));
        assert!(!wildcard_match("vehicle.?", "vehicle.ab"));
        assert!(wildcard_match("v*e*e", "vehicle"));
    }

    #[test]
    fn test_filter_matches_tags() {
        let library = BlueprintLibrary::new(vec![
            Blueprint::new("vehicle.audi.a2").with_tags(&["car"]),
            Blueprint::new("walker.pedestrian.0001").with_tags(&["pedestrian"]),
        ]);
        let cars = library.filter("car");
        assert_eq!(cars.len(), 1);
        assert_eq!(cars[0].id, "vehicle.audi.a2");
    }

    #[test]
    fn test_find_missing_blueprint() {
        let library = BlueprintLibrary::default();
        assert!(matches!(
            library.find("controller.ai.walker"),
            Err(CaptureError::BlueprintNotFound(_))
        ));
    }

    #[test]
    fn test_set_attribute_creates_or_updates() {
        let mut bp = Blueprint::new("vehicle.audi.a2")
            .with_attribute("color", BlueprintAttribute::with_recommended("0,0,0", &["1,1,1"]));
        bp.set_attribute("color", "1,1,1");
        bp.set_attribute("role_name", "autopilot");
        assert_eq!(bp.attribute("color").unwrap().value, "1,1,1");
        assert_eq!(bp.attribute("color").unwrap().recommended_values.len(), 1);
        assert_eq!(bp.attribute("role_name").unwrap().value, "autopilot");
    }
}

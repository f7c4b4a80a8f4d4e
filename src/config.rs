use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    Nonrecursive,
    Action,
    Materialized,
    Database,
}

impl Display for PolicyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PolicyKind::Nonrecursive => "nonrecursive",
            PolicyKind::Action => "action",
            PolicyKind::Materialized => "materialized",
            PolicyKind::Database => "database",
        };

        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TheoryConfig {
    pub name: String,
    pub abbreviation: Option<String>,
    pub kind: PolicyKind,
    pub description: String,
    pub owner: String,
    /// Tables traced from construction, `"*"` for all of them.
    pub traced: Vec<String>,
}

impl TheoryConfig {
    pub fn new(name: &str, kind: PolicyKind) -> Self {
        TheoryConfig {
            name: name.to_string(),
            kind,
            ..Default::default()
        }
    }
    pub fn abbreviation(&self) -> String {
        match &self.abbreviation {
            Some(abbreviation) => abbreviation.clone(),
            None => self.name.chars().take(5).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{PolicyKind, TheoryConfig};

    #[test]
    fn test_deserialize_with_defaults() {
        let config: TheoryConfig =
            serde_json::from_str(r#"{"name": "classification", "kind": "materialized"}"#)
                .unwrap();
        assert_eq!(PolicyKind::Materialized, config.kind);
        assert_eq!("class", config.abbreviation());
        assert!(config.traced.is_empty());

        let config: TheoryConfig = serde_json::from_str(r#"{"name": "alpha"}"#).unwrap();
        assert_eq!(PolicyKind::Nonrecursive, config.kind);

        assert!(serde_json::from_str::<TheoryConfig>(r#"{"name": "d", "kind": "delta"}"#).is_err());
    }
}

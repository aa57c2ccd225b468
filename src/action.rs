//! # Action Labels
//!
//! Actions are the outcome of a node's `post` phase and the labels on the
//! edges of a flow graph. After a node runs, the flow looks up the edge
//! registered for `(node, action)`; if there is none, the run ends at that node.
//!
//! An action is either explicit (`Action::simple("retry")`) or unset
//! (`Action::none()`). An unset action resolves to [`DEFAULT_ACTION`], so a
//! node that has nothing to say still follows the node's `"default"` edge.
//!
//! ```rust
//! use pocketgraph::{Action, DEFAULT_ACTION};
//!
//! let next: Action = "approved".into();
//! assert_eq!(next.name(), "approved");
//!
//! let fallthrough = Action::none();
//! assert_eq!(fallthrough.name(), DEFAULT_ACTION);
//! assert_eq!(fallthrough, Action::simple("default"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Label used when a node returns no explicit action.
pub const DEFAULT_ACTION: &str = "default";

/// Outcome label emitted by a node's `post` phase.
///
/// Equality and hashing go through [`Action::name`], so an unset action and an
/// explicit `"default"` are interchangeable as edge keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action(Option<String>);

impl Action {
    /// Create an explicit action from a label
    pub fn simple<S: Into<String>>(name: S) -> Self {
        Action(Some(name.into()))
    }

    /// An unset action; follows the `"default"` edge
    pub fn none() -> Self {
        Action(None)
    }

    /// The label used for edge lookup
    pub fn name(&self) -> &str {
        self.0.as_deref().unwrap_or(DEFAULT_ACTION)
    }

    /// Whether the node set a label itself
    pub fn is_explicit(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_default(&self) -> bool {
        self.name() == DEFAULT_ACTION
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for Action {}

impl Hash for Action {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        Action::simple(s)
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        Action::simple(s)
    }
}

impl From<Option<String>> for Action {
    fn from(label: Option<String>) -> Self {
        Action(label)
    }
}

impl From<Option<&str>> for Action {
    fn from(label: Option<&str>) -> Self {
        Action(label.map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_unset_action_resolves_to_default() {
        let action = Action::none();
        assert_eq!(action.name(), "default");
        assert!(!action.is_explicit());
        assert!(action.is_default());
        assert_eq!(Action::default(), action);
    }

    #[test]
    fn test_explicit_default_matches_unset() {
        let explicit = Action::simple("default");
        assert!(explicit.is_explicit());
        assert_eq!(explicit, Action::none());

        let mut table = HashMap::new();
        table.insert(Action::none(), "next");
        assert_eq!(table.get(&explicit), Some(&"next"));
    }

    #[test]
    fn test_conversions() {
        let from_str: Action = "search".into();
        let from_string: Action = String::from("search").into();
        let from_option: Action = Some("search").into();
        assert_eq!(from_str, from_string);
        assert_eq!(from_str, from_option);

        let unset: Action = Option::<String>::None.into();
        assert!(unset.is_default());
    }

    #[test]
    fn test_display_and_serde() {
        let action = Action::simple("answer");
        assert_eq!(action.to_string(), "answer");

        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json, serde_json::json!("answer"));

        let unset: Action = serde_json::from_value(serde_json::Value::Null).unwrap();
        assert_eq!(unset.name(), DEFAULT_ACTION);
    }
}

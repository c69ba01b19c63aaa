use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identity of a story node. Stable across reconciliation.
    NodeId,
    "story_node"
);
string_id!(SceneId, "scene");
string_id!(BeatId, "beat");
string_id!(ShotId, "shot");
string_id!(CharacterId, "character");
string_id!(AssetId, "asset");
string_id!(ClipId, "clip");
string_id!(TimelineItemId, "timeline_item");
string_id!(
    /// Identity assigned by the generation backend, not by the engine.
    TaskId,
    "task"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_carry_prefix_and_are_unique() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert!(a.as_str().starts_with("story_node_"));
        assert_ne!(a, b);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = BeatId::from("b1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"b1\"");
        let back: BeatId = serde_json::from_str("\"b1\"").unwrap();
        assert_eq!(back, id);
    }
}

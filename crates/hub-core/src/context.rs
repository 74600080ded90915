//! Context type for tracking what caused a state write or event

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Origin and causality of an event or state write
///
/// A coordinator refresh creates one context; every state written as a
/// consequence of that refresh carries a child of it, so the whole fan-out
/// can be traced back to one fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier for this context (ULID)
    pub id: String,

    /// User that initiated the action, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Parent context id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    /// Create a new context with a fresh ULID
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: None,
            parent_id: None,
        }
    }

    /// Create a new context attributed to a user
    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::new()
        }
    }

    /// Create a child context with this context as parent
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: self.user_id.clone(),
            parent_id: Some(self.id.clone()),
        }
    }

    /// True if `other` was derived directly from this context
    pub fn is_parent_of(&self, other: &Context) -> bool {
        other.parent_id.as_deref() == Some(self.id.as_str())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_links_to_parent() {
        let parent = Context::with_user("admin");
        let child = parent.child();

        assert_ne!(parent.id, child.id);
        assert!(parent.is_parent_of(&child));
        assert_eq!(child.user_id.as_deref(), Some("admin"));
        assert!(!child.is_parent_of(&parent));
    }
}

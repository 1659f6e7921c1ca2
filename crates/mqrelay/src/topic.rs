//! Topic namespace derivation.
//!
//! Layout: `<namespace>/<category>/<identity>`, e.g. `arquivo/upload/alice`.
//! The worker subscribes to `<namespace>/upload/#` and parses the identity
//! back out of each inbound topic.

use crate::identity::{Identity, IdentityError};

pub const DEFAULT_NAMESPACE: &str = "arquivo";

/// Direction of a topic relative to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Requests from a client to the worker.
    Upload,
    /// Replies from the worker to a client.
    Download,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("malformed topic '{topic}': {reason}")]
    Malformed { topic: String, reason: &'static str },
}

/// Maps (category, identity) to topic strings and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    namespace: String,
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl TopicLayout {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn topic_for(&self, category: Category, identity: &Identity) -> String {
        format!("{}/{}/{}", self.namespace, category, identity)
    }

    /// Multi-level wildcard matching every identity in `category`.
    pub fn wildcard(&self, category: Category) -> String {
        format!("{}/{}/#", self.namespace, category)
    }

    /// Recover the identity from a concrete topic.
    ///
    /// Topics arriving through a wildcard subscription are untrusted, so
    /// anything other than exactly `<namespace>/<category>/<identity>` is
    /// rejected.
    pub fn identity_from(&self, category: Category, topic: &str) -> Result<Identity, TopicError> {
        let malformed = |reason| TopicError::Malformed {
            topic: topic.to_string(),
            reason,
        };

        let mut parts = topic.split('/');
        let (Some(namespace), Some(cat), Some(identity), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("expected three segments"));
        };

        if namespace != self.namespace {
            return Err(malformed("unexpected namespace"));
        }
        if cat != category.as_str() {
            return Err(malformed("unexpected category"));
        }

        Identity::parse(identity).map_err(|e| match e {
            IdentityError::Empty => malformed("empty identity"),
            IdentityError::InvalidChar(_) => malformed("identity contains wildcard"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_for_uses_namespace_and_category() {
        let layout = TopicLayout::default();
        let alice = Identity::parse("alice").unwrap();

        assert_eq!(layout.topic_for(Category::Upload, &alice), "arquivo/upload/alice");
        assert_eq!(
            layout.topic_for(Category::Download, &alice),
            "arquivo/download/alice"
        );
        assert_eq!(layout.wildcard(Category::Upload), "arquivo/upload/#");
    }

    #[test]
    fn identity_from_inverts_topic_for() {
        let layout = TopicLayout::new("files");
        let id = Identity::allocate();

        let topic = layout.topic_for(Category::Download, &id);
        assert_eq!(layout.identity_from(Category::Download, &topic), Ok(id));
    }

    #[test]
    fn identity_from_rejects_wrong_shapes() {
        let layout = TopicLayout::default();
        for topic in [
            "arquivo/upload",
            "arquivo/upload/",
            "arquivo/upload/a/b",
            "other/upload/alice",
            "arquivo/download/alice",
            "",
        ] {
            assert!(
                matches!(
                    layout.identity_from(Category::Upload, topic),
                    Err(TopicError::Malformed { .. })
                ),
                "accepted {topic:?}"
            );
        }
    }
}

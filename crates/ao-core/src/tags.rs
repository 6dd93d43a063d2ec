use serde::{Deserialize, Serialize};

/// A name/value pair as carried on messages, transactions, and data items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// First value of the named tag, if present.
pub fn tag_value<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.name == name)
        .map(|t| t.value.as_str())
}

pub fn has_tag(tags: &[Tag], name: &str) -> bool {
    tags.iter().any(|t| t.name == name)
}

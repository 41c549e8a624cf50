//! Job and trigger identities

use serde::{Deserialize, Serialize};
use std::fmt;

/// Group used when none is given
pub const DEFAULT_GROUP: &str = "DEFAULT";

macro_rules! scheduler_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            group: String,
            name: String,
        }

        impl $name {
            /// Create a key from group and name
            pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
                Self {
                    group: group.into(),
                    name: name.into(),
                }
            }

            /// Create a key in the default group
            pub fn with_default_group(name: impl Into<String>) -> Self {
                Self::new(DEFAULT_GROUP, name)
            }

            /// Group part
            pub fn group(&self) -> &str {
                &self.group
            }

            /// Name part
            pub fn name(&self) -> &str {
                &self.name
            }

            /// Escaped identity used as a document id
            pub fn document_id(&self, prefix: Option<&str>) -> String {
                let mut id = String::new();
                if let Some(prefix) = prefix {
                    id.push_str(prefix);
                    id.push('.');
                }
                push_escaped(&mut id, &self.group);
                id.push('.');
                push_escaped(&mut id, &self.name);
                id
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.group, self.name)
            }
        }
    };
}

scheduler_key!(
    /// Identity of a job
    JobKey
);

scheduler_key!(
    /// Identity of a trigger
    TriggerKey
);

fn push_escaped(out: &mut String, part: &str) {
    for c in part.chars() {
        if c == '.' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Matches keys by group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupMatcher {
    /// Group equals the value
    Equals(String),
    /// Group starts with the value
    StartsWith(String),
    /// Group ends with the value
    EndsWith(String),
    /// Group contains the value
    Contains(String),
    /// Any group
    Anything,
}

impl GroupMatcher {
    /// Matcher for one exact group
    pub fn group(group: impl Into<String>) -> Self {
        Self::Equals(group.into())
    }

    /// Test a group name
    pub fn matches(&self, group: &str) -> bool {
        match self {
            Self::Equals(v) => group == v,
            Self::StartsWith(v) => group.starts_with(v.as_str()),
            Self::EndsWith(v) => group.ends_with(v.as_str()),
            Self::Contains(v) => group.contains(v.as_str()),
            Self::Anything => true,
        }
    }

    /// The exact group, if this matcher names one
    pub fn exact_group(&self) -> Option<&str> {
        match self {
            Self::Equals(v) => Some(v),
            _ => None,
        }
    }
}

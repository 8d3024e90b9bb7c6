//! Rate limit keys.

use serde::{Serialize, Serializer};
use std::fmt;

/// A key that identifies one rate-limited subject.
///
/// The key is composed of a class name (which selects the configured limit,
/// e.g. `"api"` or `"login"`) and an ordered list of key-value pairs that
/// narrow it down to a subject, e.g. `user=alice` or `user=alice,ip=10.0.0.1`.
/// Two keys are equal only if the class and every entry match in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateLimitKey {
    /// The limit class this key belongs to
    pub class: String,
    /// Key-value pairs identifying the subject
    pub entries: Vec<(String, String)>,
}

impl RateLimitKey {
    /// Create a key with no entries.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            entries: Vec::new(),
        }
    }

    /// Append an entry to the key.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    /// Convert the key to its string representation, `class:k=v,k2=v2`.
    ///
    /// Separator characters (and backslashes) inside the class, names and
    /// values are escaped with a backslash, so distinct keys never render
    /// the same.
    pub fn to_string_key(&self) -> String {
        let mut out = String::with_capacity(self.class.len());
        push_escaped(&mut out, &self.class);

        for (i, (name, value)) in self.entries.iter().enumerate() {
            out.push(if i == 0 { ':' } else { ',' });
            push_escaped(&mut out, name);
            out.push('=');
            push_escaped(&mut out, value);
        }
        out
    }
}

fn push_escaped(out: &mut String, part: &str) {
    for c in part.chars() {
        if matches!(c, '\\' | ':' | '=' | ',') {
            out.push('\\');
        }
        out.push(c);
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

impl From<&str> for RateLimitKey {
    fn from(class: &str) -> Self {
        Self::new(class)
    }
}

impl From<String> for RateLimitKey {
    fn from(class: String) -> Self {
        Self::new(class)
    }
}

impl Serialize for RateLimitKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string_key())
    }
}

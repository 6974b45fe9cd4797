use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Maximum number of labels in a name.
pub const MAX_LABELS: usize = 16;

/// Maximum byte length of a single label.
pub const MAX_LABEL_LEN: usize = 63;

/// Hierarchical VM identifier: an ordered sequence of short labels.
///
/// The canonical flat form is the dotted string (`"vm.a"` is the sequence
/// `["vm", "a"]`). Equality is label-sequence equality. The empty sequence
/// is the root path; it never names a VM but is accepted as an info query
/// matching everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(Vec<String>);

impl Name {
    /// The empty path.
    pub fn root() -> Self {
        Name(Vec::new())
    }

    /// Build a name from pre-split labels, validating each.
    pub fn from_labels(labels: Vec<String>) -> Result<Self, Error> {
        if labels.len() > MAX_LABELS {
            return Err(Error::Decode(format!(
                "name has {} labels, maximum is {MAX_LABELS}",
                labels.len()
            )));
        }
        for label in &labels {
            if !valid_label(label) {
                return Err(Error::Decode(format!("invalid label {label:?}")));
            }
        }
        Ok(Name(labels))
    }

    pub fn labels(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `prefix` is the root or a leading subsequence of `self`
    /// (including `self` itself).
    pub fn starts_with(&self, prefix: &Name) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl FromStr for Name {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::Decode("empty name".into()));
        }
        Name::from_labels(s.split('.').map(str::to_string).collect())
    }
}

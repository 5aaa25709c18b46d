//! Pool names double as filesystem path components and as the middle
//! part of slot ids, so they are validated on construction.

use std::{fmt::Display, str::FromStr};

use serde::de::Visitor;

/// Reserved for the lock file directory next to the pool directories.
pub const LOCKS_DIR_NAME: &str = "locks";

fn contains_slot_suffix_ambiguity(v: &str) -> bool {
    // A repo name containing "-slot<digits>" would make the
    // `workspace-<repo_name>-slot<N>` form ambiguous to decompose.
    let mut rest = v;
    while let Some(pos) = rest.find("-slot") {
        let after = &rest[pos + "-slot".len()..];
        let digits: &str = after
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .unwrap_or("");
        if !digits.is_empty() {
            return true;
        }
        rest = &rest[pos + 1..];
    }
    false
}

pub fn is_valid_repo_name(v: &str) -> bool {
    if v.is_empty() || v.len() > 255 {
        return false;
    }
    if v == "." || v == ".." || v == LOCKS_DIR_NAME {
        return false;
    }
    if !v
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return false;
    }
    !contains_slot_suffix_ambiguity(v)
}

/// The name of a pool's repository. A single path component made of
/// `[A-Za-z0-9._-]`, not `.`/`..`, not the reserved `locks`
/// directory, and without any `-slot<digits>` substring (which would
/// make slot ids undecomposable).
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct RepoName(String);

impl RepoName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RepoName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Display for RepoName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

const ERR_MSG: &str = "a repository/pool name: one path component of \
     `[A-Za-z0-9._-]`, not \".\", \"..\" or \"locks\", without a \
     `-slot<digits>` substring, at most 255 bytes";

impl FromStr for RepoName {
    type Err = &'static str;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        if !is_valid_repo_name(v) {
            return Err(ERR_MSG);
        }
        Ok(RepoName(v.to_owned()))
    }
}

struct RepoNameVisitor;
impl<'de> Visitor<'de> for RepoNameVisitor {
    type Value = RepoName;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str(ERR_MSG)
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(E::custom)
    }
}

impl<'de> serde::Deserialize<'de> for RepoName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(RepoNameVisitor)
    }
}

impl serde::Serialize for RepoName {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

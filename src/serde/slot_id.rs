//! The canonical slot identifier grammar:
//! `workspace-<repo_name>-slot<N>` with N >= 1. `repo_name` may
//! itself contain `-`; decomposition strips the `workspace-` prefix
//! and the final `-slot<N>` suffix, the middle is the repo name.

use std::{fmt::Display, str::FromStr};

use anyhow::anyhow;
use serde::de::Visitor;

use super::repo_name::RepoName;

const PREFIX: &str = "workspace-";
const SLOT_INFIX: &str = "-slot";

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct SlotId {
    repo_name: RepoName,
    index: u32,
}

impl SlotId {
    pub fn new(repo_name: RepoName, index: u32) -> anyhow::Result<Self> {
        if index == 0 {
            return Err(anyhow!("slot index must be >= 1"));
        }
        Ok(Self { repo_name, index })
    }

    pub fn repo_name(&self) -> &RepoName {
        &self.repo_name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// The per-slot directory name under the pool directory,
    /// `slot<N>`.
    pub fn dir_name(&self) -> String {
        format!("slot{}", self.index)
    }

    /// File name of the backing lock file, `<slot_id>.lock`.
    pub fn lock_file_name(&self) -> String {
        format!("{self}.lock")
    }

    /// Parse a `slot<N>` directory name as produced by `dir_name`.
    pub fn index_from_dir_name(name: &str) -> Option<u32> {
        let digits = name.strip_prefix("slot")?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().filter(|n| *n >= 1)
    }
}

impl Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self { repo_name, index } = self;
        write!(f, "{PREFIX}{repo_name}{SLOT_INFIX}{index}")
    }
}

const ERR_MSG: &str = "a slot id of the form `workspace-<repo_name>-slot<N>`";

impl FromStr for SlotId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| anyhow!("missing `{PREFIX}` prefix in slot id {s:?}"))?;
        let pos = rest
            .rfind(SLOT_INFIX)
            .ok_or_else(|| anyhow!("missing `{SLOT_INFIX}<N>` suffix in slot id {s:?}"))?;
        let (name, suffix) = rest.split_at(pos);
        let digits = &suffix[SLOT_INFIX.len()..];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!("expected digits after `{SLOT_INFIX}` in {s:?}"));
        }
        let index: u32 = digits
            .parse()
            .map_err(|e| anyhow!("slot index out of range in {s:?}: {e}"))?;
        if index == 0 {
            return Err(anyhow!("slot index must be >= 1 in {s:?}"));
        }
        let repo_name: RepoName = name
            .parse()
            .map_err(|e| anyhow!("invalid repo name {name:?} in slot id {s:?}: {e}"))?;
        Ok(Self { repo_name, index })
    }
}

struct SlotIdVisitor;
impl<'de> Visitor<'de> for SlotIdVisitor {
    type Value = SlotId;

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

impl<'de> serde::Deserialize<'de> for SlotId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(SlotIdVisitor)
    }
}

impl serde::Serialize for SlotId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

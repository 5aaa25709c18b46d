use std::{fmt::Display, str::FromStr};

use anyhow::bail;
use serde::de::Visitor;

/// A URL that `git clone` accepts: https/git scheme, `file://`, a
/// plain filesystem path, or the scp-like `user@host:path` form. Only
/// syntactic checks, no network access.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, serde::Serialize)]
pub struct GitUrl(String);

impl GitUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for GitUrl {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl<'t> From<&'t GitUrl> for &'t str {
    fn from(value: &'t GitUrl) -> Self {
        value.as_str()
    }
}

impl Display for GitUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const ERR_MSG: &str = "a URL compatible with Git";

fn check_domain_and_path(rest: &str) -> anyhow::Result<()> {
    if let Some((domain, other)) = rest.split_once('/') {
        if domain.is_empty() {
            bail!("domain is empty")
        }
        if other.is_empty() {
            bail!("part after domain is empty")
        }
    } else {
        bail!("expect a '/' between domain and location part")
    }
    Ok(())
}

impl FromStr for GitUrl {
    type Err = anyhow::Error;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        let ok = Ok(GitUrl(v.to_owned()));

        if let Some(rest) = v.strip_prefix("https://") {
            check_domain_and_path(rest)?;
            return ok;
        }

        if let Some(rest) = v.strip_prefix("git://") {
            check_domain_and_path(rest)?;
            return ok;
        }

        if let Some(rest) = v.strip_prefix("file://") {
            if rest.is_empty() {
                bail!("empty file path given")
            }
            return ok;
        }

        if v.starts_with("/") || v.starts_with("./") || v.starts_with("../") {
            return ok;
        }

        if let Some((user, rest)) = v.split_once('@') {
            if user.is_empty() {
                bail!("user is empty")
            }
            if let Some((domain, _path)) = rest.split_once(':') {
                if domain.is_empty() {
                    bail!("domain is empty")
                }
                // The path *can* be empty, if the home dir is the repo.
            } else {
                bail!("missing ':' in ssh based Git URL")
            }
            return ok;
        }

        bail!("no match for any kind of Git url known to this code")
    }
}

struct GitUrlVisitor;
impl<'de> Visitor<'de> for GitUrlVisitor {
    type Value = GitUrl;

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

impl<'de> serde::Deserialize<'de> for GitUrl {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(GitUrlVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_accepted_forms() {
        for s in [
            "https://example.test/r.git",
            "git://example.test/r",
            "file:///srv/git/r.git",
            "/srv/git/r.git",
            "./fixtures/origin",
            "git@example.test:me/r.git",
        ] {
            assert!(s.parse::<GitUrl>().is_ok(), "should accept {s:?}");
        }
    }

    #[test]
    fn t_rejected_forms() {
        for s in [
            "",
            "https://",
            "https://domain-only",
            "file://",
            "@host:path",
            "not a url",
        ] {
            assert!(s.parse::<GitUrl>().is_err(), "should reject {s:?}");
        }
    }
}

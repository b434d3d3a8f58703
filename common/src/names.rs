use std::fmt::Formatter;
use std::str::FromStr;

use rand::distributions::{Alphanumeric, DistString};
use rand::seq::SliceRandom;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, ErrorKind};

const RUN_ID_RANDOM_LEN: usize = 20;
const NAME_MAX_LEN: usize = 63;

static ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crimson", "deft", "eager",
    "fuzzy", "gentle", "keen", "lively", "lucid", "mellow", "nimble", "plucky",
    "quiet", "rapid", "sly", "solid", "spry", "steady", "swift", "wily",
];

static ANIMALS: &[&str] = &[
    "badger", "bison", "crane", "dingo", "falcon", "ferret", "gecko", "heron",
    "ibex", "jackal", "koala", "lemur", "lynx", "marmot", "marten", "newt",
    "osprey", "otter", "puffin", "quokka", "stoat", "tapir", "vole", "wombat",
];

/// Opaque, globally unique, path-safe run identifier: `run_[A-Za-z0-9]+`.
///
/// Validated before any filesystem use; an id that fails the grammar never
/// names a storage directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        let suffix = Alphanumeric.sample_string(&mut rand::thread_rng(), RUN_ID_RANDOM_LEN);
        Self(format!("run_{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let suffix = s
            .strip_prefix("run_")
            .ok_or_else(|| Error::from_kind(ErrorKind::InvalidRunId))?;
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::from_kind(ErrorKind::InvalidRunId));
        }
        Ok(Self(s.to_string()))
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn valid_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= NAME_MAX_LEN
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// User-visible run name: `[a-z0-9]([a-z0-9-]*[a-z0-9])?`, unique among
/// live runs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunName(String);

impl RunName {
    /// Generate an adjective-animal name.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        // Both lists are non-empty, so choose() cannot return None.
        let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&ADJECTIVES[0]);
        let animal = ANIMALS.choose(&mut rng).unwrap_or(&ANIMALS[0]);
        Self(format!("{adjective}-{animal}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RunName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if valid_name(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::from_kind(ErrorKind::InvalidRunName))
        }
    }
}

impl std::fmt::Display for RunName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for RunName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Agent label used as the hostname component in `<svc>.<agent>.localhost`.
/// Same grammar as [`RunName`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AgentLabel(String);

impl AgentLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AgentLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if valid_name(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::from_kind(ErrorKind::InvalidRunName))
        }
    }
}

impl std::fmt::Display for AgentLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for AgentLabel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_parse_and_are_unique() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().parse::<RunId>().unwrap(), a);
    }

    #[test]
    fn id_grammar_is_enforced() {
        assert!("run_abc123".parse::<RunId>().is_ok());
        for bad in ["run_", "abc123", "run_../etc", "run_a b", "RUN_abc"] {
            assert!(bad.parse::<RunId>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn name_grammar_is_enforced() {
        assert!("swift-otter".parse::<RunName>().is_ok());
        assert!("a".parse::<RunName>().is_ok());
        assert!("a1-b2".parse::<RunName>().is_ok());
        for bad in ["", "-lead", "trail-", "Upper", "under_score", "dot.dot"] {
            assert!(bad.parse::<RunName>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn generated_names_satisfy_the_grammar() {
        for _ in 0..64 {
            let name = RunName::generate();
            assert!(name.as_str().parse::<RunName>().is_ok());
        }
    }
}

//! Hand-maintained reference tables: expected stage groups, tier
//! classifications and the correction set.
//!
//! Tables are authored as YAML. A copy of `tables/*.yaml` is compiled in and
//! used when no reference directory is configured. Loading validates every
//! entry; a malformed table is a configuration defect and is reported before
//! the store is touched.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use djcat_core::{
    name_key, Classification, ClassificationReference, Correction, GroupReference, Tier,
    UnknownTier,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "djcat-reference";

pub const GROUPS_FILE: &str = "groups.yaml";
pub const CLASSIFICATIONS_FILE: &str = "classifications.yaml";
pub const CORRECTIONS_FILE: &str = "corrections.yaml";

const BUILTIN_GROUPS: &str = include_str!("../tables/groups.yaml");
const BUILTIN_CLASSIFICATIONS: &str = include_str!("../tables/classifications.yaml");
const BUILTIN_CORRECTIONS: &str = include_str!("../tables/corrections.yaml");

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {file}: {source}")]
    Parse {
        file: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{file}: empty group name")]
    EmptyGroupName { file: &'static str },
    #[error("{file}: empty entity name under `{key}`")]
    EmptyName { file: &'static str, key: String },
    #[error("{file}: `{key}`: {source}")]
    UnknownTier {
        file: &'static str,
        key: String,
        #[source]
        source: UnknownTier,
    },
    #[error("classification `{0}` allows no tiers")]
    EmptyAllowedTiers(String),
    #[error("correction for `{0}` sets neither groups nor tier")]
    EmptyCorrection(String),
    #[error("correction for `{0}` appears more than once")]
    DuplicateCorrection(String),
    #[error("serializing reference tables: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct GroupsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    groups: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ClassificationsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    classifications: BTreeMap<String, RawClassification>,
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    allowed_tiers: Vec<String>,
    #[serde(default)]
    names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CorrectionsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    corrections: Vec<RawCorrection>,
}

#[derive(Debug, Deserialize)]
struct RawCorrection {
    name: String,
    #[serde(default)]
    groups: Option<Vec<String>>,
    #[serde(default)]
    tier: Option<String>,
}

/// Validated reference data for one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReferenceTables {
    pub groups: GroupReference,
    pub classifications: ClassificationReference,
    pub corrections: Vec<Correction>,
}

impl ReferenceTables {
    /// The tables shipped with the binary.
    pub fn builtin() -> Result<Self, ReferenceError> {
        Self::from_yaml(BUILTIN_GROUPS, BUILTIN_CLASSIFICATIONS, BUILTIN_CORRECTIONS)
    }

    /// Load from `dir` when given, otherwise fall back to the built-in tables.
    pub fn load(dir: Option<&Path>) -> Result<Self, ReferenceError> {
        match dir {
            Some(dir) => {
                info!(dir = %dir.display(), "loading reference tables");
                Self::load_dir(dir)
            }
            None => {
                info!("using built-in reference tables");
                Self::builtin()
            }
        }
    }

    pub fn load_dir(dir: &Path) -> Result<Self, ReferenceError> {
        let read = |file: &str| {
            let path = dir.join(file);
            std::fs::read_to_string(&path).map_err(|source| ReferenceError::Io { path, source })
        };
        Self::from_yaml(
            &read(GROUPS_FILE)?,
            &read(CLASSIFICATIONS_FILE)?,
            &read(CORRECTIONS_FILE)?,
        )
    }

    pub fn from_yaml(
        groups_yaml: &str,
        classifications_yaml: &str,
        corrections_yaml: &str,
    ) -> Result<Self, ReferenceError> {
        let groups: GroupsFile =
            serde_yaml::from_str(groups_yaml).map_err(|source| ReferenceError::Parse {
                file: GROUPS_FILE,
                source,
            })?;
        let classifications: ClassificationsFile = serde_yaml::from_str(classifications_yaml)
            .map_err(|source| ReferenceError::Parse {
                file: CLASSIFICATIONS_FILE,
                source,
            })?;
        let corrections: CorrectionsFile =
            serde_yaml::from_str(corrections_yaml).map_err(|source| ReferenceError::Parse {
                file: CORRECTIONS_FILE,
                source,
            })?;

        Ok(Self {
            groups: validate_groups(groups.groups)?,
            classifications: validate_classifications(classifications.classifications)?,
            corrections: validate_corrections(corrections.corrections)?,
        })
    }

    /// Hex SHA-256 over the canonical JSON form of the tables.
    pub fn fingerprint(&self) -> Result<String, ReferenceError> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Every entity name mentioned by the group and classification tables,
    /// first spelling wins, in table order.
    pub fn referenced_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.groups
            .values()
            .flatten()
            .chain(self.classifications.values().flat_map(|c| c.names.iter()))
            .filter(|name| seen.insert(name_key(name)))
            .cloned()
            .collect()
    }
}

fn clean_group(name: &str, file: &'static str) -> Result<String, ReferenceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ReferenceError::EmptyGroupName { file });
    }
    Ok(name.to_string())
}

fn clean_names(
    names: Vec<String>,
    file: &'static str,
    key: &str,
) -> Result<Vec<String>, ReferenceError> {
    names
        .into_iter()
        .map(|n| {
            let trimmed = n.trim();
            if trimmed.is_empty() {
                Err(ReferenceError::EmptyName {
                    file,
                    key: key.to_string(),
                })
            } else {
                Ok(trimmed.to_string())
            }
        })
        .collect()
}

fn parse_tier(value: &str, file: &'static str, key: &str) -> Result<Tier, ReferenceError> {
    value.parse().map_err(|source| ReferenceError::UnknownTier {
        file,
        key: key.to_string(),
        source,
    })
}

fn validate_groups(raw: BTreeMap<String, Vec<String>>) -> Result<GroupReference, ReferenceError> {
    let mut out = GroupReference::new();
    for (group, names) in raw {
        let group = clean_group(&group, GROUPS_FILE)?;
        let names = clean_names(names, GROUPS_FILE, &group)?;
        out.entry(group).or_default().extend(names);
    }
    Ok(out)
}

fn validate_classifications(
    raw: BTreeMap<String, RawClassification>,
) -> Result<ClassificationReference, ReferenceError> {
    let mut out = ClassificationReference::new();
    for (class, entry) in raw {
        let class = class.trim().to_string();
        if class.is_empty() {
            return Err(ReferenceError::EmptyName {
                file: CLASSIFICATIONS_FILE,
                key: "<classification>".to_string(),
            });
        }
        let allowed_tiers = entry
            .allowed_tiers
            .iter()
            .map(|t| parse_tier(t, CLASSIFICATIONS_FILE, &class))
            .collect::<Result<BTreeSet<_>, _>>()?;
        if allowed_tiers.is_empty() {
            return Err(ReferenceError::EmptyAllowedTiers(class));
        }
        let names = clean_names(entry.names, CLASSIFICATIONS_FILE, &class)?;
        out.insert(
            class,
            Classification {
                names,
                allowed_tiers,
            },
        );
    }
    Ok(out)
}

fn validate_corrections(raw: Vec<RawCorrection>) -> Result<Vec<Correction>, ReferenceError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for entry in raw {
        let name = entry.name.trim().to_string();
        if name.is_empty() {
            return Err(ReferenceError::EmptyName {
                file: CORRECTIONS_FILE,
                key: "name".to_string(),
            });
        }
        if !seen.insert(name_key(&name)) {
            return Err(ReferenceError::DuplicateCorrection(name));
        }
        if entry.groups.is_none() && entry.tier.is_none() {
            return Err(ReferenceError::EmptyCorrection(name));
        }
        let groups = entry
            .groups
            .map(|groups| {
                groups
                    .iter()
                    .map(|g| clean_group(g, CORRECTIONS_FILE))
                    .collect::<Result<BTreeSet<_>, _>>()
            })
            .transpose()?;
        let tier = entry
            .tier
            .map(|t| parse_tier(&t, CORRECTIONS_FILE, &name))
            .transpose()?;
        out.push(Correction { name, groups, tier });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GROUPS: &str = "version: 1\ngroups:\n  core:\n    - Carl Cox\n    - Adam Beyer\n";
    const CLASSES: &str = "version: 1\nclassifications:\n  headliner:\n    allowed_tiers: [EPIC, LEGENDARY]\n    names: [Carl Cox]\n";
    const CORRECTIONS: &str =
        "version: 1\ncorrections:\n  - name: Carl Cox\n    groups: [core]\n    tier: LEGENDARY\n";

    #[test]
    fn builtin_tables_are_valid() {
        let tables = ReferenceTables::builtin().expect("builtin tables");
        let groups = tables.groups.keys().cloned().collect::<Vec<_>>();
        assert_eq!(
            groups,
            vec!["asot", "core", "elixir", "liveact", "mainstage", "qdance"]
        );
        let headliner = &tables.classifications["headliner"];
        assert!(headliner.allowed_tiers.contains(&Tier::Legendary));
        assert!(headliner.names.iter().any(|n| n == "Axwell /\\ Ingrosso"));
        assert!(!tables.corrections.is_empty());
    }

    #[test]
    fn builtin_corrections_agree_with_groups_and_classes() {
        let tables = ReferenceTables::builtin().expect("builtin tables");
        let by_name = tables
            .corrections
            .iter()
            .map(|c| (name_key(&c.name), c))
            .collect::<BTreeMap<_, _>>();

        for (group, names) in &tables.groups {
            for name in names {
                let correction = by_name.get(&name_key(name)).expect("correction for member");
                let groups = correction.groups.as_ref().expect("groups");
                assert!(groups.contains(group), "{name} should carry {group}");
            }
        }
        for (class, classification) in &tables.classifications {
            for name in &classification.names {
                if let Some(tier) = by_name.get(&name_key(name)).and_then(|c| c.tier) {
                    assert!(
                        classification.allowed_tiers.contains(&tier),
                        "{name} in {class} corrected to {tier}"
                    );
                }
            }
        }
    }

    #[test]
    fn unknown_tier_is_fatal() {
        let classes = "version: 1\nclassifications:\n  breakout:\n    allowed_tiers: [UNCOMMON, RARE]\n    names: [Anyma]\n";
        let err = ReferenceTables::from_yaml(GROUPS, classes, CORRECTIONS).unwrap_err();
        assert!(matches!(err, ReferenceError::UnknownTier { ref key, .. } if key == "breakout"));
    }

    #[test]
    fn empty_names_are_fatal() {
        let groups = "version: 1\ngroups:\n  core:\n    - Carl Cox\n    - \"  \"\n";
        let err = ReferenceTables::from_yaml(groups, CLASSES, CORRECTIONS).unwrap_err();
        assert!(matches!(err, ReferenceError::EmptyName { file: GROUPS_FILE, .. }));

        let groups = "version: 1\ngroups:\n  \" \":\n    - Carl Cox\n";
        let err = ReferenceTables::from_yaml(groups, CLASSES, CORRECTIONS).unwrap_err();
        assert!(matches!(err, ReferenceError::EmptyGroupName { .. }));
    }

    #[test]
    fn empty_allowed_tiers_are_fatal() {
        let classes = "version: 1\nclassifications:\n  headliner:\n    allowed_tiers: []\n    names: [Carl Cox]\n";
        let err = ReferenceTables::from_yaml(GROUPS, classes, CORRECTIONS).unwrap_err();
        assert!(matches!(err, ReferenceError::EmptyAllowedTiers(ref c) if c == "headliner"));
    }

    #[test]
    fn corrections_must_set_something_and_be_unique() {
        let empty = "version: 1\ncorrections:\n  - name: Carl Cox\n";
        let err = ReferenceTables::from_yaml(GROUPS, CLASSES, empty).unwrap_err();
        assert!(matches!(err, ReferenceError::EmptyCorrection(_)));

        let dup = "version: 1\ncorrections:\n  - name: Carl Cox\n    tier: EPIC\n  - name: carl cox\n    tier: LEGENDARY\n";
        let err = ReferenceTables::from_yaml(GROUPS, CLASSES, dup).unwrap_err();
        assert!(matches!(err, ReferenceError::DuplicateCorrection(ref n) if n == "carl cox"));
    }

    #[test]
    fn parse_errors_name_the_file() {
        let err = ReferenceTables::from_yaml("groups: [", CLASSES, CORRECTIONS).unwrap_err();
        assert!(err.to_string().starts_with("parsing groups.yaml"));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = ReferenceTables::from_yaml(GROUPS, CLASSES, CORRECTIONS).expect("tables");
        let b = ReferenceTables::from_yaml(GROUPS, CLASSES, CORRECTIONS).expect("tables");
        let fa = a.fingerprint().expect("fingerprint");
        assert_eq!(fa, b.fingerprint().expect("fingerprint"));
        assert_eq!(fa.len(), 64);
        assert!(fa.chars().all(|c| c.is_ascii_hexdigit()));

        let groups = "version: 1\ngroups:\n  core:\n    - Carl Cox\n";
        let c = ReferenceTables::from_yaml(groups, CLASSES, CORRECTIONS).expect("tables");
        assert_ne!(fa, c.fingerprint().expect("fingerprint"));
    }

    #[test]
    fn builtin_tables_fingerprint() {
        let tables = ReferenceTables::builtin().expect("builtin tables");
        let fp = tables.fingerprint().expect("fingerprint");
        assert_eq!(fp, tables.clone().fingerprint().expect("fingerprint"));
        assert_ne!(fp, ReferenceTables::default().fingerprint().expect("fingerprint"));
    }

    #[test]
    fn referenced_names_deduplicate_case_insensitively() {
        let classes = "version: 1\nclassifications:\n  headliner:\n    allowed_tiers: [EPIC]\n    names: [carl cox, Amelie Lens]\n";
        let tables = ReferenceTables::from_yaml(GROUPS, classes, CORRECTIONS).expect("tables");
        assert_eq!(
            tables.referenced_names(),
            vec!["Carl Cox", "Adam Beyer", "Amelie Lens"]
        );
    }

    #[test]
    fn load_dir_reads_all_three_files() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join(GROUPS_FILE), GROUPS).expect("write");
        std::fs::write(dir.path().join(CLASSIFICATIONS_FILE), CLASSES).expect("write");
        let err = ReferenceTables::load(Some(dir.path())).unwrap_err();
        assert!(matches!(err, ReferenceError::Io { .. }));

        std::fs::write(dir.path().join(CORRECTIONS_FILE), CORRECTIONS).expect("write");
        let tables = ReferenceTables::load(Some(dir.path())).expect("tables");
        assert_eq!(tables.groups["core"], vec!["Carl Cox", "Adam Beyer"]);
        assert_eq!(tables.corrections[0].tier, Some(Tier::Legendary));
    }
}

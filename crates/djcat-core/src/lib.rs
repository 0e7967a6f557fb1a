//! Core catalog model for the DJ card reconciler.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "djcat-core";

/// Stage category tag, e.g. `mainstage` or `core`.
pub type GroupName = String;

/// Group name -> expected display names, in authoring order.
pub type GroupReference = BTreeMap<GroupName, Vec<String>>;

/// Classification name -> member names and the tiers they may carry.
pub type ClassificationReference = BTreeMap<String, Classification>;

/// Card rarity, ordered from lowest (`Common`) to highest (`Legendary`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Common,
    Rare,
    Epic,
    Legendary,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Common, Tier::Rare, Tier::Epic, Tier::Legendary];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Common => "COMMON",
            Tier::Rare => "RARE",
            Tier::Epic => "EPIC",
            Tier::Legendary => "LEGENDARY",
        }
    }

    /// 1-based rank, `TIER_1` being the lowest.
    pub fn rank(self) -> u8 {
        match self {
            Tier::Common => 1,
            Tier::Rare => 2,
            Tier::Epic => 3,
            Tier::Legendary => 4,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tier `{0}` (expected one of COMMON, RARE, EPIC, LEGENDARY)")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    /// Accepts the rarity names case-insensitively, plus `TIER_1`..`TIER_4`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(tier) = Tier::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(trimmed))
        {
            return Ok(tier);
        }
        match trimmed.to_ascii_uppercase().as_str() {
            "TIER_1" => Ok(Tier::Common),
            "TIER_2" => Ok(Tier::Rare),
            "TIER_3" => Ok(Tier::Epic),
            "TIER_4" => Ok(Tier::Legendary),
            _ => Err(UnknownTier(trimmed.to_string())),
        }
    }
}

/// Rarity values the catalog held before the four-tier scheme, with the tier
/// each one now reads as.
pub const LEGACY_TIERS: [(&str, Tier); 1] = [("UNCOMMON", Tier::Rare)];

impl Tier {
    /// Parse a rarity as stored in the catalog.
    ///
    /// Canonical values decode to `(tier, None)`. Legacy values decode to
    /// their current reading and hand back the raw stored text so the record
    /// can be flagged and rewritten.
    pub fn from_stored(raw: &str) -> Result<(Tier, Option<String>), UnknownTier> {
        match raw.parse::<Tier>() {
            Ok(tier) => Ok((tier, None)),
            Err(err) => {
                let trimmed = raw.trim();
                LEGACY_TIERS
                    .iter()
                    .find(|(legacy, _)| legacy.eq_ignore_ascii_case(trimmed))
                    .map(|(_, tier)| (*tier, Some(trimmed.to_string())))
                    .ok_or(err)
            }
        }
    }
}

/// Opaque store-assigned identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One catalog item (a DJ card) as held by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: RecordId,
    pub display_name: String,
    #[serde(default)]
    pub groups: BTreeSet<GroupName>,
    pub tier: Tier,
    /// Raw rarity when the store holds a legacy value; `tier` is its reading.
    /// Cleared by any tier write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_tier: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(display_name: impl Into<String>, tier: Tier) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new_v4(),
            display_name: display_name.into(),
            groups: BTreeSet::new(),
            tier,
            stored_tier: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<GroupName>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

/// Members of one classification (e.g. headliners) and their permitted tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub names: Vec<String>,
    pub allowed_tiers: BTreeSet<Tier>,
}

/// Authoritative values for one entity, applied by the corrective writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<BTreeSet<GroupName>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

/// Case-folded matching key for display names.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Display-name comparison policy.
///
/// The default is case-insensitive exact matching. `substring` additionally
/// treats two names as equal when either contains the other; it over-matches
/// short names and is meant for diagnostics only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameMatcher {
    pub substring: bool,
}

impl NameMatcher {
    pub fn exact() -> Self {
        Self { substring: false }
    }

    pub fn substring() -> Self {
        Self { substring: true }
    }

    pub fn matches(&self, a: &str, b: &str) -> bool {
        let ka = name_key(a);
        let kb = name_key(b);
        self.matches_keys(&ka, &kb)
    }

    /// Same as [`NameMatcher::matches`] on keys already produced by [`name_key`].
    pub fn matches_keys(&self, ka: &str, kb: &str) -> bool {
        if ka == kb {
            return true;
        }
        self.substring
            && !ka.is_empty()
            && !kb.is_empty()
            && (ka.contains(kb) || kb.contains(ka))
    }
}

//! Catalog reconciliation: group membership and tier checks against the
//! reference tables, the corrective writer, and run orchestration.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use djcat_core::{
    name_key, ClassificationReference, Correction, EntityRecord, GroupName, GroupReference,
    NameMatcher, RecordId, Tier,
};
use djcat_reference::ReferenceTables;
use djcat_storage::{
    InMemoryRecordStore, PgRecordStore, RecordStore, RejectedRow, RestRecordStore,
    RestStoreConfig, StoreError,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

mod report;

pub use report::{format_report, Report, RunMeta, ALL_PASSED};

pub const CRATE_NAME: &str = "djcat-reconcile";

/// Minimum Jaro-Winkler score for a store name to be offered as a likely
/// spelling of a reference name that has no record.
pub const NEAR_MATCH_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDiff {
    /// Reference names that do not carry the group in the store.
    pub missing: Vec<String>,
    /// Store names carrying the group that the reference does not list.
    pub extra: Vec<String>,
}

impl GroupDiff {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

pub type GroupResult = BTreeMap<GroupName, GroupDiff>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierViolation {
    pub name: String,
    pub actual_tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassViolations {
    pub allowed_tiers: BTreeSet<Tier>,
    pub violations: Vec<TierViolation>,
}

/// Only classifications with at least one violation appear.
pub type TierResult = BTreeMap<String, ClassViolations>;

/// Names deduplicated by matching key, first spelling wins.
fn distinct_names(names: &[String]) -> Vec<(String, &str)> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|n| (name_key(n), n.as_str()))
        .filter(|(key, _)| seen.insert(key.clone()))
        .collect()
}

/// Compare each reference group against the names carrying it in the store.
///
/// `records` must already be restricted to active records. The result does
/// not depend on the order of `records`: `missing` follows reference order and
/// `extra` is sorted by matching key.
pub fn reconcile_groups(
    reference: &GroupReference,
    records: &[EntityRecord],
    matcher: NameMatcher,
) -> GroupResult {
    let mut out = GroupResult::new();
    for (group, names) in reference {
        let expected = distinct_names(names);

        let mut actual = records
            .iter()
            .filter(|r| r.has_group(group))
            .map(|r| (name_key(&r.display_name), r.display_name.as_str()))
            .collect::<Vec<_>>();
        actual.sort();
        actual.dedup_by(|a, b| a.0 == b.0);

        let missing = expected
            .iter()
            .filter(|(key, _)| !actual.iter().any(|(ak, _)| matcher.matches_keys(key, ak)))
            .map(|(_, name)| name.to_string())
            .collect();
        let extra = actual
            .iter()
            .filter(|(ak, _)| !expected.iter().any(|(key, _)| matcher.matches_keys(key, ak)))
            .map(|(_, name)| name.to_string())
            .collect();

        out.insert(group.clone(), GroupDiff { missing, extra });
    }
    out
}

/// Report records whose tier falls outside their classification's allowed set.
///
/// Names with no record are skipped; group reconciliation already reports
/// them. Each classification is evaluated on its own, so a name listed in two
/// classes can be reported twice.
pub fn reconcile_tiers(
    classifications: &ClassificationReference,
    records: &[EntityRecord],
    matcher: NameMatcher,
) -> TierResult {
    let mut keyed = records
        .iter()
        .map(|r| (name_key(&r.display_name), r))
        .collect::<Vec<_>>();
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.id.cmp(&b.1.id)));

    let mut out = TierResult::new();
    for (class, classification) in classifications {
        let mut reported = HashSet::<RecordId>::new();
        let mut violations = Vec::new();
        for (key, _) in distinct_names(&classification.names) {
            for (_, record) in keyed.iter().filter(|(rk, _)| matcher.matches_keys(&key, rk)) {
                if classification.allowed_tiers.contains(&record.tier) || !reported.insert(record.id) {
                    continue;
                }
                violations.push(TierViolation {
                    name: record.display_name.clone(),
                    actual_tier: record.tier,
                });
            }
        }
        if !violations.is_empty() {
            out.insert(
                class.clone(),
                ClassViolations {
                    allowed_tiers: classification.allowed_tiers.clone(),
                    violations,
                },
            );
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearMatch {
    pub expected: String,
    pub candidate: String,
    pub score: f64,
}

/// Store-wide findings that do not belong to a single group or class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogAudit {
    /// Referenced names with no active record at all.
    pub missing_from_store: Vec<String>,
    /// Active records that carry no group.
    pub ungrouped: Vec<String>,
    pub near_matches: Vec<NearMatch>,
    /// Records still carrying a legacy rarity.
    #[serde(default)]
    pub legacy_tiers: Vec<LegacyTier>,
    /// Active rows the store could not decode at all.
    #[serde(default)]
    pub unreadable: Vec<RejectedRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTier {
    pub name: String,
    pub stored: String,
    pub reads_as: Tier,
}

impl CatalogAudit {
    pub fn issue_count(&self) -> usize {
        self.ungrouped.len() + self.legacy_tiers.len() + self.unreadable.len()
    }
}

pub fn audit_catalog(
    reference: &ReferenceTables,
    records: &[EntityRecord],
    matcher: NameMatcher,
) -> CatalogAudit {
    let keys = records
        .iter()
        .map(|r| (name_key(&r.display_name), r.display_name.as_str()))
        .collect::<Vec<_>>();

    let missing_from_store = reference
        .referenced_names()
        .into_iter()
        .filter(|name| {
            let key = name_key(name);
            !keys.iter().any(|(rk, _)| matcher.matches_keys(&key, rk))
        })
        .collect::<Vec<_>>();

    let mut near_matches = Vec::new();
    for expected in &missing_from_store {
        let key = name_key(expected);
        let best = keys
            .iter()
            .map(|(rk, name)| (jaro_winkler(&key, rk), *name))
            .filter(|(score, _)| *score >= NEAR_MATCH_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(a.1)));
        if let Some((score, candidate)) = best {
            near_matches.push(NearMatch {
                expected: expected.clone(),
                candidate: candidate.to_string(),
                score,
            });
        }
    }

    let mut ungrouped = records
        .iter()
        .filter(|r| r.groups.is_empty())
        .map(|r| r.display_name.clone())
        .collect::<Vec<_>>();
    ungrouped.sort_by_key(|n| name_key(n));

    let mut legacy_tiers = records
        .iter()
        .filter_map(|r| {
            r.stored_tier.as_ref().map(|stored| LegacyTier {
                name: r.display_name.clone(),
                stored: stored.clone(),
                reads_as: r.tier,
            })
        })
        .collect::<Vec<_>>();
    legacy_tiers.sort_by_key(|l| name_key(&l.name));

    CatalogAudit {
        missing_from_store,
        ungrouped,
        near_matches,
        legacy_tiers,
        unreadable: Vec::new(),
    }
}

/// How a correction's groups combine with the record's current groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupWriteMode {
    /// The record ends up with exactly the correction's groups.
    #[default]
    Replace,
    /// The correction's groups are added to whatever the record already has.
    Merge,
}

#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    pub group_mode: GroupWriteMode,
    pub dry_run: bool,
    /// Maximum writes in flight. Outcomes keep input order regardless.
    pub concurrency: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            group_mode: GroupWriteMode::Replace,
            dry_run: false,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    AlreadyCorrect,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NotFound => "not_found",
            SkipReason::AlreadyCorrect => "already_correct",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CorrectionOutcome {
    Updated {
        name: String,
        id: RecordId,
        groups_changed: bool,
        tier_changed: bool,
    },
    WouldUpdate {
        name: String,
        id: RecordId,
        groups_changed: bool,
        tier_changed: bool,
    },
    Skipped {
        name: String,
        reason: SkipReason,
    },
    Failed {
        name: String,
        reason: String,
        /// The group write went through before the tier write failed.
        #[serde(default)]
        groups_written: bool,
    },
}

impl CorrectionOutcome {
    pub fn name(&self) -> &str {
        match self {
            CorrectionOutcome::Updated { name, .. }
            | CorrectionOutcome::WouldUpdate { name, .. }
            | CorrectionOutcome::Skipped { name, .. }
            | CorrectionOutcome::Failed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionError {
    pub name: String,
    pub reason: String,
    #[serde(default)]
    pub groups_written: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    /// Always zero: the corrective writer never creates records.
    pub created: usize,
    /// Entries written (or, in a dry run, that would be written).
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<CorrectionError>,
    pub dry_run: bool,
    /// One outcome per correction entry, in input order.
    pub outcomes: Vec<CorrectionOutcome>,
}

impl ApplySummary {
    fn from_outcomes(outcomes: Vec<CorrectionOutcome>, dry_run: bool) -> Self {
        let mut summary = ApplySummary {
            dry_run,
            ..Default::default()
        };
        for outcome in &outcomes {
            match outcome {
                CorrectionOutcome::Updated { .. } | CorrectionOutcome::WouldUpdate { .. } => {
                    summary.updated += 1
                }
                CorrectionOutcome::Skipped { .. } => summary.skipped += 1,
                CorrectionOutcome::Failed {
                    name,
                    reason,
                    groups_written,
                } => summary.errors.push(CorrectionError {
                    name: name.clone(),
                    reason: reason.clone(),
                    groups_written: *groups_written,
                }),
            }
        }
        summary.outcomes = outcomes;
        summary
    }

    pub fn processed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, CorrectionOutcome::Skipped { reason: r, .. } if *r == reason))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CorrectionPlan {
    Skip {
        name: String,
        reason: SkipReason,
    },
    Ambiguous {
        name: String,
        matches: usize,
    },
    Write {
        name: String,
        id: RecordId,
        groups: Option<BTreeSet<GroupName>>,
        tier: Option<Tier>,
    },
}

fn plan_correction(
    correction: &Correction,
    index: &HashMap<String, Vec<&EntityRecord>>,
    mode: GroupWriteMode,
) -> CorrectionPlan {
    let name = correction.name.clone();
    let record = match index.get(&name_key(&correction.name)).map(Vec::as_slice) {
        None | Some([]) => {
            return CorrectionPlan::Skip {
                name,
                reason: SkipReason::NotFound,
            }
        }
        Some([record]) => *record,
        Some(many) => {
            return CorrectionPlan::Ambiguous {
                name,
                matches: many.len(),
            }
        }
    };

    let groups = correction.groups.as_ref().and_then(|wanted| {
        let target = match mode {
            GroupWriteMode::Replace => wanted.clone(),
            GroupWriteMode::Merge => record.groups.union(wanted).cloned().collect(),
        };
        (target != record.groups).then_some(target)
    });
    let tier = correction
        .tier
        .filter(|t| *t != record.tier || record.stored_tier.is_some());

    if groups.is_none() && tier.is_none() {
        return CorrectionPlan::Skip {
            name,
            reason: SkipReason::AlreadyCorrect,
        };
    }
    CorrectionPlan::Write {
        name,
        id: record.id,
        groups,
        tier,
    }
}

async fn execute_plan(plan: CorrectionPlan, store: &dyn RecordStore, dry_run: bool) -> CorrectionOutcome {
    match plan {
        CorrectionPlan::Skip { name, reason } => {
            debug!(%name, reason = reason.as_str(), "correction skipped");
            CorrectionOutcome::Skipped { name, reason }
        }
        CorrectionPlan::Ambiguous { name, matches } => {
            warn!(%name, matches, "correction matches several records; not written");
            CorrectionOutcome::Failed {
                name,
                reason: format!("ambiguous name ({matches} records)"),
                groups_written: false,
            }
        }
        CorrectionPlan::Write {
            name,
            id,
            groups,
            tier,
        } => {
            let groups_changed = groups.is_some();
            let tier_changed = tier.is_some();
            if dry_run {
                return CorrectionOutcome::WouldUpdate {
                    name,
                    id,
                    groups_changed,
                    tier_changed,
                };
            }
            if let Some(groups) = &groups {
                if let Err(err) = store.update_groups(id, groups).await {
                    warn!(%name, %id, error = %err, "group update failed");
                    return CorrectionOutcome::Failed {
                        name,
                        reason: err.to_string(),
                        groups_written: false,
                    };
                }
            }
            if let Some(tier) = tier {
                if let Err(err) = store.update_tier(id, tier).await {
                    warn!(%name, %id, groups_written = groups_changed, error = %err, "tier update failed");
                    return CorrectionOutcome::Failed {
                        name,
                        reason: err.to_string(),
                        groups_written: groups_changed,
                    };
                }
            }
            debug!(%name, %id, groups_changed, tier_changed, "correction applied");
            CorrectionOutcome::Updated {
                name,
                id,
                groups_changed,
                tier_changed,
            }
        }
    }
}

/// Bring the store in line with `corrections`.
///
/// Records are looked up by case-insensitive exact name in a single snapshot.
/// Absent names are skipped, never created. A failed write is recorded for
/// that entry and the batch carries on; only a failure to read the snapshot
/// aborts the call.
pub async fn apply_corrections(
    corrections: &[Correction],
    store: &dyn RecordStore,
    options: ApplyOptions,
) -> Result<ApplySummary, StoreError> {
    let snapshot = store.list_active().await?;
    let mut index: HashMap<String, Vec<&EntityRecord>> = HashMap::new();
    for record in &snapshot {
        index.entry(name_key(&record.display_name)).or_default().push(record);
    }

    let plans = corrections
        .iter()
        .map(|c| plan_correction(c, &index, options.group_mode))
        .collect::<Vec<_>>();

    let outcomes = stream::iter(plans)
        .map(|plan| execute_plan(plan, store, options.dry_run))
        .buffered(options.concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let summary = ApplySummary::from_outcomes(outcomes, options.dry_run);
    info!(
        updated = summary.updated,
        skipped = summary.skipped,
        errors = summary.errors.len(),
        dry_run = options.dry_run,
        "corrections processed"
    );
    Ok(summary)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
    Rest,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres => "postgres",
            StoreBackend::Rest => "rest",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "snapshot" => Ok(StoreBackend::Memory),
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            "rest" | "supabase" => Ok(StoreBackend::Rest),
            other => bail!("unknown store backend `{other}` (expected memory, postgres or rest)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub store: StoreBackend,
    pub snapshot_path: PathBuf,
    pub database_url: Option<String>,
    pub rest_url: Option<String>,
    pub rest_service_key: Option<String>,
    /// `None` selects the built-in reference tables.
    pub reference_dir: Option<PathBuf>,
    /// `None` disables writing run reports.
    pub reports_dir: Option<PathBuf>,
    pub write_concurrency: usize,
    pub http_timeout_secs: u64,
    pub substring_match: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Memory,
            snapshot_path: PathBuf::from("fixtures/catalog_snapshot.json"),
            database_url: None,
            rest_url: None,
            rest_service_key: None,
            reference_dir: None,
            reports_dir: Some(PathBuf::from("reports")),
            write_concurrency: 1,
            http_timeout_secs: 20,
            substring_match: false,
        }
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    let n = value
        .trim()
        .parse::<usize>()
        .with_context(|| format!("{key}: `{value}` is not a positive integer"))?;
    if n == 0 {
        bail!("{key} must be at least 1");
    }
    Ok(n)
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Ok(Self {
            store: env("DJCAT_STORE")
                .map(|v| v.parse::<StoreBackend>())
                .transpose()?
                .unwrap_or(defaults.store),
            snapshot_path: env("DJCAT_SNAPSHOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_path),
            database_url: env("DATABASE_URL"),
            rest_url: env("SUPABASE_URL"),
            rest_service_key: env("SUPABASE_SERVICE_ROLE_KEY"),
            reference_dir: env("DJCAT_REFERENCE_DIR").map(PathBuf::from),
            reports_dir: env("DJCAT_REPORTS_DIR")
                .map(PathBuf::from)
                .or(defaults.reports_dir),
            write_concurrency: env("DJCAT_WRITE_CONCURRENCY")
                .map(|v| parse_count("DJCAT_WRITE_CONCURRENCY", &v))
                .transpose()?
                .unwrap_or(defaults.write_concurrency),
            http_timeout_secs: env("DJCAT_HTTP_TIMEOUT_SECS")
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .with_context(|| format!("DJCAT_HTTP_TIMEOUT_SECS: `{v}` is not a number of seconds"))
                })
                .transpose()?
                .unwrap_or(defaults.http_timeout_secs),
            substring_match: env("DJCAT_SUBSTRING_MATCH")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.substring_match),
        })
    }

    pub fn matcher(&self) -> NameMatcher {
        NameMatcher {
            substring: self.substring_match,
        }
    }
}

/// The configured record store. The memory backend remembers its snapshot
/// file so applied corrections can be written back.
pub enum CatalogStore {
    Memory {
        store: InMemoryRecordStore,
        snapshot_path: Option<PathBuf>,
    },
    Postgres(PgRecordStore),
    Rest(RestRecordStore),
}

impl CatalogStore {
    pub fn memory(store: InMemoryRecordStore) -> Self {
        CatalogStore::Memory {
            store,
            snapshot_path: None,
        }
    }

    pub async fn open(config: &ReconcileConfig) -> Result<Self> {
        match config.store {
            StoreBackend::Memory => {
                let store = InMemoryRecordStore::load_snapshot(&config.snapshot_path).await?;
                Ok(CatalogStore::Memory {
                    store,
                    snapshot_path: Some(config.snapshot_path.clone()),
                })
            }
            StoreBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .context("DATABASE_URL is required for the postgres store")?;
                Ok(CatalogStore::Postgres(PgRecordStore::connect(url).await?))
            }
            StoreBackend::Rest => {
                let base_url = config
                    .rest_url
                    .clone()
                    .context("SUPABASE_URL is required for the rest store")?;
                let service_key = config
                    .rest_service_key
                    .clone()
                    .context("SUPABASE_SERVICE_ROLE_KEY is required for the rest store")?;
                Ok(CatalogStore::Rest(RestRecordStore::new(RestStoreConfig {
                    base_url,
                    service_key,
                    timeout: Duration::from_secs(config.http_timeout_secs),
                })?))
            }
        }
    }

    pub fn backend(&self) -> StoreBackend {
        match self {
            CatalogStore::Memory { .. } => StoreBackend::Memory,
            CatalogStore::Postgres(_) => StoreBackend::Postgres,
            CatalogStore::Rest(_) => StoreBackend::Rest,
        }
    }

    pub fn as_store(&self) -> &dyn RecordStore {
        match self {
            CatalogStore::Memory { store, .. } => store,
            CatalogStore::Postgres(store) => store,
            CatalogStore::Rest(store) => store,
        }
    }

    /// Flush in-memory changes to the snapshot file; remote backends are
    /// already durable.
    pub async fn persist(&self) -> Result<()> {
        if let CatalogStore::Memory {
            store,
            snapshot_path: Some(path),
        } = self
        {
            store.save_snapshot(path).await?;
            info!(path = %path.display(), "catalog snapshot written");
        }
        Ok(())
    }
}

/// Result of one verify or fix run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub meta: RunMeta,
    pub report: Report,
    pub report_dir: Option<PathBuf>,
}

impl RunOutcome {
    /// True when the catalog is consistent and no correction failed.
    pub fn passed(&self) -> bool {
        self.report.passed()
    }
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    reference: ReferenceTables,
    store: CatalogStore,
}

impl ReconcilePipeline {
    pub fn new(config: ReconcileConfig, reference: ReferenceTables, store: CatalogStore) -> Self {
        Self {
            config,
            reference,
            store,
        }
    }

    /// Load and validate the reference tables, then open the store. A bad
    /// table fails here before any connection is attempted.
    pub async fn from_config(config: ReconcileConfig) -> Result<Self> {
        let reference = ReferenceTables::load(config.reference_dir.as_deref())
            .context("loading reference tables")?;
        let store = CatalogStore::open(&config)
            .await
            .with_context(|| format!("opening {} store", config.store.as_str()))?;
        Ok(Self::new(config, reference, store))
    }

    pub fn reference(&self) -> &ReferenceTables {
        &self.reference
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub async fn verify(&self) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let report = self
            .check(None)
            .instrument(info_span!("verify", %run_id))
            .await?;
        self.finish(run_id, "verify", started_at, report).await
    }

    pub async fn fix(&self, options: ApplyOptions) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let report = self
            .correct_and_check(options)
            .instrument(info_span!("fix", %run_id, dry_run = options.dry_run))
            .await?;
        let mode = if options.dry_run { "fix (dry run)" } else { "fix" };
        self.finish(run_id, mode, started_at, report).await
    }

    async fn correct_and_check(&self, options: ApplyOptions) -> Result<Report> {
        let summary = apply_corrections(&self.reference.corrections, self.store.as_store(), options)
            .await
            .context("applying corrections")?;
        if !options.dry_run && summary.updated > 0 {
            self.store.persist().await?;
        }
        self.check(Some(summary)).await
    }

    async fn check(&self, apply: Option<ApplySummary>) -> Result<Report> {
        let scan = self
            .store
            .as_store()
            .scan_active()
            .await
            .context("listing active records")?;
        let records = scan.records;
        info!(
            records = records.len(),
            unreadable = scan.rejected.len(),
            "catalog snapshot loaded"
        );

        let matcher = self.config.matcher();
        let groups = reconcile_groups(&self.reference.groups, &records, matcher);
        let tiers = reconcile_tiers(&self.reference.classifications, &records, matcher);
        let mut audit = audit_catalog(&self.reference, &records, matcher);
        audit.unreadable = scan.rejected;
        Ok(format_report(&groups, &tiers, apply.as_ref()).with_audit(audit))
    }

    async fn finish(
        &self,
        run_id: Uuid,
        mode: &str,
        started_at: DateTime<Utc>,
        report: Report,
    ) -> Result<RunOutcome> {
        let meta = RunMeta {
            run_id,
            mode: mode.to_string(),
            started_at,
            finished_at: Utc::now(),
            store_backend: self.store.backend().as_str().to_string(),
            reference_fingerprint: self
                .reference
                .fingerprint()
                .context("fingerprinting reference tables")?,
            substring_match: self.config.substring_match,
        };
        let report_dir = match &self.config.reports_dir {
            Some(root) => Some(write_reports(root, &meta, &report).await?),
            None => None,
        };
        info!(%run_id, ok = report.ok, issues = report.issue_count, "reconciliation finished");
        Ok(RunOutcome {
            meta,
            report,
            report_dir,
        })
    }
}

pub const REPORT_MARKDOWN: &str = "reconcile_report.md";
pub const REPORT_JSON: &str = "reconcile_report.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredReport {
    run: RunMeta,
    report: Report,
}

/// Write `<root>/<run_id>/reconcile_report.{md,json}` and return the run directory.
pub async fn write_reports(root: &Path, meta: &RunMeta, report: &Report) -> Result<PathBuf> {
    let run_dir = root.join(meta.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    fs::write(run_dir.join(REPORT_MARKDOWN), report.render_markdown(meta))
        .await
        .with_context(|| format!("writing {REPORT_MARKDOWN}"))?;

    let json = serde_json::to_vec_pretty(&StoredReport {
        run: meta.clone(),
        report: report.clone(),
    })
    .context("serializing reconcile report")?;
    fs::write(run_dir.join(REPORT_JSON), json)
        .await
        .with_context(|| format!("writing {REPORT_JSON}"))?;

    Ok(run_dir)
}

/// Markdown digest of the most recent `runs` reports under `reports_root`.
pub fn history_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut lines = vec!["# Catalog Reconciliation History".to_string(), String::new()];
    if !reports_root.exists() {
        lines.push("_no runs recorded_".to_string());
        return Ok(lines.join("\n"));
    }

    let mut stored = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| entry.path().join(REPORT_JSON))
        .filter(|path| path.exists())
        .map(|path| {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<StoredReport>(&text)
                .with_context(|| format!("parsing {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    stored.sort_by(|a, b| b.run.started_at.cmp(&a.run.started_at));

    for entry in stored.into_iter().take(runs.max(1)) {
        let run = &entry.run;
        let report = &entry.report;
        lines.push(format!("## Run `{}` ({})", run.run_id, run.mode));
        lines.push(format!("- started: {}", run.started_at.to_rfc3339()));
        lines.push(format!("- store: {}", run.store_backend));
        lines.push(format!(
            "- result: {}",
            if report.passed() { "passed" } else { "failed" }
        ));
        lines.push(format!("- issues: {}", report.issue_count));
        if let Some(apply) = &report.apply {
            lines.push(format!(
                "- corrections: {} updated, {} skipped, {} errors",
                apply.updated,
                apply.skipped,
                apply.errors.len()
            ));
        }
        lines.push(format!("- reference: `{}`", &run.reference_fingerprint));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use djcat_core::Classification;

    fn record(name: &str, tier: Tier, groups: &[&str]) -> EntityRecord {
        EntityRecord::new(name, tier).with_groups(groups.iter().copied())
    }

    fn reference(entries: &[(&str, &[&str])]) -> GroupReference {
        entries
            .iter()
            .map(|(g, names)| (g.to_string(), names.iter().map(|n| n.to_string()).collect()))
            .collect()
    }

    fn classes(entries: &[(&str, &[&str], &[Tier])]) -> ClassificationReference {
        entries
            .iter()
            .map(|(c, names, tiers)| {
                (
                    c.to_string(),
                    Classification {
                        names: names.iter().map(|n| n.to_string()).collect(),
                        allowed_tiers: tiers.iter().copied().collect(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn missing_member_is_reported() {
        let reference = reference(&[("core", &["Carl Cox", "Adam Beyer"])]);
        let records = vec![record("Carl Cox", Tier::Legendary, &["core"])];
        let result = reconcile_groups(&reference, &records, NameMatcher::exact());
        assert_eq!(
            result["core"],
            GroupDiff {
                missing: vec!["Adam Beyer".into()],
                extra: vec![],
            }
        );
    }

    #[test]
    fn extra_members_are_sorted_and_case_folded() {
        let reference = reference(&[("core", &["carl cox"])]);
        let records = vec![
            record("Solomun", Tier::Epic, &["core"]),
            record("Carl Cox", Tier::Legendary, &["core"]),
            record("amelie lens", Tier::Epic, &["core"]),
            record("Peggy Gou", Tier::Rare, &["elixir"]),
        ];
        let result = reconcile_groups(&reference, &records, NameMatcher::exact());
        assert!(result["core"].missing.is_empty());
        assert_eq!(result["core"].extra, vec!["amelie lens", "Solomun"]);
    }

    #[test]
    fn group_result_ignores_record_order() {
        let reference = reference(&[("elixir", &["Fisher", "Chris Lake", "Dixon"])]);
        let mut records = vec![
            record("Fisher", Tier::Rare, &["elixir"]),
            record("Malaa", Tier::Rare, &["elixir"]),
            record("Tchami", Tier::Rare, &["elixir"]),
            record("Dixon", Tier::Common, &[]),
        ];
        let forward = reconcile_groups(&reference, &records, NameMatcher::exact());
        records.reverse();
        let backward = reconcile_groups(&reference, &records, NameMatcher::exact());
        assert_eq!(forward, backward);
        assert_eq!(forward["elixir"].missing, vec!["Chris Lake", "Dixon"]);
    }

    #[test]
    fn duplicate_reference_names_are_reported_once() {
        let reference = reference(&[("asot", &["Rank 1", "rank 1", "Rank 1"])]);
        let result = reconcile_groups(&reference, &[], NameMatcher::exact());
        assert_eq!(result["asot"].missing, vec!["Rank 1"]);
    }

    #[test]
    fn substring_matching_is_opt_in() {
        let reference = reference(&[("mainstage", &["Axwell /\\ Ingrosso"])]);
        let records = vec![record("Axwell", Tier::Legendary, &["mainstage"])];

        let exact = reconcile_groups(&reference, &records, NameMatcher::exact());
        assert_eq!(exact["mainstage"].missing.len(), 1);
        assert_eq!(exact["mainstage"].extra.len(), 1);

        let loose = reconcile_groups(&reference, &records, NameMatcher::substring());
        assert!(loose["mainstage"].is_clean());
    }

    #[test]
    fn empty_reference_gives_empty_result() {
        let records = vec![record("Carl Cox", Tier::Legendary, &["core"])];
        assert!(reconcile_groups(&GroupReference::new(), &records, NameMatcher::exact()).is_empty());
    }

    #[test]
    fn headliner_below_allowed_tier_is_a_violation() {
        let classes = classes(&[("headliner", &["Carl Cox"], &[Tier::Epic, Tier::Legendary])]);
        let records = vec![record("Carl Cox", Tier::Common, &["core"])];
        let result = reconcile_tiers(&classes, &records, NameMatcher::exact());
        assert_eq!(
            result["headliner"].violations,
            vec![TierViolation {
                name: "Carl Cox".into(),
                actual_tier: Tier::Common,
            }]
        );
    }

    #[test]
    fn tier_check_skips_absent_names_and_clean_classes() {
        let classes = classes(&[
            ("headliner", &["Carl Cox", "Hardwell"], &[Tier::Epic, Tier::Legendary]),
            ("breakout", &["John Summit"], &[Tier::Common, Tier::Rare]),
        ]);
        let records = vec![
            record("carl cox", Tier::Legendary, &["core"]),
            record("John Summit", Tier::Rare, &["elixir"]),
        ];
        assert!(reconcile_tiers(&classes, &records, NameMatcher::exact()).is_empty());
    }

    #[test]
    fn overlapping_classes_report_independently() {
        let classes = classes(&[
            ("headliner", &["Maddix"], &[Tier::Epic, Tier::Legendary]),
            ("breakout", &["Maddix"], &[Tier::Common, Tier::Rare]),
        ]);
        let rare = vec![record("Maddix", Tier::Rare, &["mainstage"])];
        let result = reconcile_tiers(&classes, &rare, NameMatcher::exact());
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("headliner"));

        let common_and_epic = vec![
            record("Maddix", Tier::Common, &["mainstage"]),
            record("Maddix", Tier::Legendary, &["mainstage"]),
        ];
        let result = reconcile_tiers(&classes, &common_and_epic, NameMatcher::exact());
        assert_eq!(result["headliner"].violations.len(), 1);
        assert_eq!(result["breakout"].violations.len(), 1);
    }

    #[test]
    fn audit_finds_unmatched_names_and_ungrouped_records() {
        let tables = ReferenceTables {
            groups: reference(&[("elixir", &["Fred again..", "Fisher"])]),
            classifications: classes(&[("breakout", &["Acraze"], &[Tier::Rare])]),
            corrections: vec![],
        };
        let records = vec![
            record("Fred Again", Tier::Rare, &["elixir"]),
            record("Fisher", Tier::Rare, &["elixir"]),
            record("Zatox", Tier::Common, &[]),
        ];
        let audit = audit_catalog(&tables, &records, NameMatcher::exact());
        assert_eq!(audit.missing_from_store, vec!["Fred again..", "Acraze"]);
        assert_eq!(audit.ungrouped, vec!["Zatox"]);
        assert_eq!(audit.near_matches.len(), 1);
        assert_eq!(audit.near_matches[0].candidate, "Fred Again");
        assert!(audit.near_matches[0].score >= NEAR_MATCH_THRESHOLD);
    }

    #[test]
    fn plan_merge_keeps_existing_groups() {
        let existing = record("Solomun", Tier::Epic, &["elixir"]);
        let index = HashMap::from([(name_key("Solomun"), vec![&existing])]);
        let correction = Correction {
            name: "SOLOMUN".into(),
            groups: Some(["core".to_string()].into_iter().collect()),
            tier: Some(Tier::Epic),
        };

        match plan_correction(&correction, &index, GroupWriteMode::Merge) {
            CorrectionPlan::Write { groups, tier, .. } => {
                let groups = groups.expect("groups change");
                assert!(groups.contains("core") && groups.contains("elixir"));
                assert_eq!(tier, None);
            }
            other => panic!("unexpected plan {other:?}"),
        }

        let merged = record("Solomun", Tier::Epic, &["core", "elixir"]);
        let index = HashMap::from([(name_key("Solomun"), vec![&merged])]);
        assert_eq!(
            plan_correction(&correction, &index, GroupWriteMode::Merge),
            CorrectionPlan::Skip {
                name: "SOLOMUN".into(),
                reason: SkipReason::AlreadyCorrect,
            }
        );
    }

    #[test]
    fn plan_flags_ambiguous_names() {
        let a = record("ANNA", Tier::Rare, &["core"]);
        let b = record("Anna", Tier::Rare, &["core"]);
        let index = HashMap::from([(name_key("ANNA"), vec![&a, &b])]);
        let correction = Correction {
            name: "ANNA".into(),
            groups: None,
            tier: Some(Tier::Epic),
        };
        assert_eq!(
            plan_correction(&correction, &index, GroupWriteMode::Replace),
            CorrectionPlan::Ambiguous {
                name: "ANNA".into(),
                matches: 2,
            }
        );
    }

    #[test]
    fn legacy_tier_is_rewritten_and_audited() {
        let mut maddix = record("Maddix", Tier::Rare, &["mainstage"]);
        maddix.stored_tier = Some("UNCOMMON".into());
        let index = HashMap::from([(name_key("Maddix"), vec![&maddix])]);
        let correction = Correction {
            name: "Maddix".into(),
            groups: None,
            tier: Some(Tier::Rare),
        };
        assert!(matches!(
            plan_correction(&correction, &index, GroupWriteMode::Replace),
            CorrectionPlan::Write {
                groups: None,
                tier: Some(Tier::Rare),
                ..
            }
        ));

        let audit = audit_catalog(&ReferenceTables::default(), &[maddix], NameMatcher::exact());
        assert_eq!(
            audit.legacy_tiers,
            vec![LegacyTier {
                name: "Maddix".into(),
                stored: "UNCOMMON".into(),
                reads_as: Tier::Rare,
            }]
        );
        assert_eq!(audit.issue_count(), 1);
    }

    #[test]
    fn numeric_settings_reject_garbage() {
        assert_eq!(parse_count("DJCAT_WRITE_CONCURRENCY", " 4 ").unwrap(), 4);
        let err = parse_count("DJCAT_WRITE_CONCURRENCY", "four").unwrap_err();
        assert!(format!("{err:#}").contains("DJCAT_WRITE_CONCURRENCY"));
        assert!(parse_count("DJCAT_WRITE_CONCURRENCY", "0").is_err());
    }

    #[test]
    fn store_backend_parses_aliases() {
        assert_eq!("Supabase".parse::<StoreBackend>().unwrap(), StoreBackend::Rest);
        assert_eq!("pg".parse::<StoreBackend>().unwrap(), StoreBackend::Postgres);
        assert!("sqlite".parse::<StoreBackend>().is_err());
    }
}

//! Record store facade over the `djs` table, with in-memory, Postgres and
//! PostgREST backends.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use djcat_core::{EntityRecord, GroupName, RecordId, Tier};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "djcat-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("malformed row for `{name}`: {reason}")]
    Decode { name: String, reason: String },
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Minimal read/write surface the reconciler needs from the catalog.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every `active = true` row, split into decoded records and rows that
    /// could not be read.
    async fn scan_active(&self) -> Result<ActiveScan, StoreError>;

    /// All records with `active = true` that decode cleanly.
    async fn list_active(&self) -> Result<Vec<EntityRecord>, StoreError> {
        Ok(self.scan_active().await?.records)
    }

    /// Replace the record's group set and refresh `updated_at`.
    async fn update_groups(
        &self,
        id: RecordId,
        groups: &BTreeSet<GroupName>,
    ) -> Result<EntityRecord, StoreError>;

    /// Set the record's tier and refresh `updated_at`.
    async fn update_tier(&self, id: RecordId, tier: Tier) -> Result<EntityRecord, StoreError>;
}

/// A row left out of a scan because it could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub id: RecordId,
    pub name: String,
    pub reason: String,
}

/// One pass over the active rows. A bad row lands in `rejected` instead of
/// failing the whole listing.
#[derive(Debug, Clone, Default)]
pub struct ActiveScan {
    pub records: Vec<EntityRecord>,
    pub rejected: Vec<RejectedRow>,
}

impl ActiveScan {
    pub fn push(&mut self, id: RecordId, name: String, decoded: Result<EntityRecord, StoreError>) {
        match decoded {
            Ok(record) => self.records.push(record),
            Err(err) => {
                warn!(%id, %name, error = %err, "skipping unreadable catalog row");
                self.rejected.push(RejectedRow {
                    id,
                    name,
                    reason: err.to_string(),
                });
            }
        }
    }
}

fn decode_tier(name: &str, raw: &str) -> Result<(Tier, Option<String>), StoreError> {
    Tier::from_stored(raw).map_err(|err| StoreError::Decode {
        name: name.to_string(),
        reason: err.to_string(),
    })
}

/// Wire/row shape of the `djs` table shared by the SQL and REST backends.
#[derive(Debug, Clone, Deserialize)]
pub struct DjRow {
    pub id: Uuid,
    pub stage_name: String,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    pub rarity: String,
    #[serde(default)]
    pub is_active: Option<bool>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DjRow {
    pub fn into_record(self) -> Result<EntityRecord, StoreError> {
        let (tier, stored_tier) = decode_tier(&self.stage_name, &self.rarity)?;
        Ok(EntityRecord {
            id: RecordId(self.id),
            display_name: self.stage_name,
            groups: self
                .categories
                .unwrap_or_default()
                .into_iter()
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect(),
            tier,
            stored_tier,
            active: self.is_active.unwrap_or(true),
            created_at: self.created_at,
            updated_at: self.updated_at.unwrap_or(self.created_at),
        })
    }

    fn scan_into(self, scan: &mut ActiveScan) {
        let (id, name) = (RecordId(self.id), self.stage_name.clone());
        scan.push(id, name, self.into_record());
    }
}

fn default_active() -> bool {
    true
}

/// One record in the on-disk snapshot. The tier stays text so legacy or
/// damaged values survive a load/save cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub id: RecordId,
    pub display_name: String,
    #[serde(default)]
    pub groups: BTreeSet<GroupName>,
    pub tier: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SnapshotRow {
    pub fn decode(&self) -> Result<EntityRecord, StoreError> {
        let (tier, stored_tier) = decode_tier(&self.display_name, &self.tier)?;
        Ok(EntityRecord {
            id: self.id,
            display_name: self.display_name.clone(),
            groups: self.groups.clone(),
            tier,
            stored_tier,
            active: self.active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl From<&EntityRecord> for SnapshotRow {
    fn from(record: &EntityRecord) -> Self {
        Self {
            id: record.id,
            display_name: record.display_name.clone(),
            groups: record.groups.clone(),
            tier: record
                .stored_tier
                .clone()
                .unwrap_or_else(|| record.tier.as_str().to_string()),
            active: record.active,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// On-disk JSON snapshot of the catalog used by the memory backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub records: Vec<SnapshotRow>,
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<RecordId, EntityRecord>>,
    /// Snapshot rows that failed to decode, kept verbatim for write-back.
    unreadable: Vec<(SnapshotRow, String)>,
}

impl InMemoryRecordStore {
    pub fn new(records: impl IntoIterator<Item = EntityRecord>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().map(|r| (r.id, r)).collect()),
            unreadable: Vec::new(),
        }
    }

    pub async fn insert(&self, record: EntityRecord) {
        self.records.lock().await.insert(record.id, record);
    }

    pub async fn get(&self, id: RecordId) -> Option<EntityRecord> {
        self.records.lock().await.get(&id).cloned()
    }

    /// Every decoded record, inactive ones included.
    pub async fn all(&self) -> Vec<EntityRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    pub async fn load_snapshot(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let snapshot: CatalogSnapshot =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut records = Vec::with_capacity(snapshot.records.len());
        let mut unreadable = Vec::new();
        for row in snapshot.records {
            match row.decode() {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(id = %row.id, name = %row.display_name, error = %err, "unreadable snapshot row");
                    unreadable.push((row, err.to_string()));
                }
            }
        }
        Ok(Self {
            unreadable,
            ..Self::new(records)
        })
    }

    /// Write the current contents back as a snapshot via temp-file rename.
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let snapshot = CatalogSnapshot {
            records: self
                .all()
                .await
                .iter()
                .map(SnapshotRow::from)
                .chain(self.unreadable.iter().map(|(row, _)| row.clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot).context("serializing catalog snapshot")?;

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let temp_path = parent.join(format!(".{}.snapshot.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), path.display())
            });
        }
        Ok(())
    }

    async fn mutate(
        &self,
        id: RecordId,
        apply: impl FnOnce(&mut EntityRecord),
    ) -> Result<EntityRecord, StoreError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        apply(record);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn scan_active(&self) -> Result<ActiveScan, StoreError> {
        let records = self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.active)
            .cloned()
            .collect();
        let rejected = self
            .unreadable
            .iter()
            .filter(|(row, _)| row.active)
            .map(|(row, reason)| RejectedRow {
                id: row.id,
                name: row.display_name.clone(),
                reason: reason.clone(),
            })
            .collect();
        Ok(ActiveScan { records, rejected })
    }

    async fn update_groups(
        &self,
        id: RecordId,
        groups: &BTreeSet<GroupName>,
    ) -> Result<EntityRecord, StoreError> {
        self.mutate(id, |r| r.groups = groups.clone()).await
    }

    async fn update_tier(&self, id: RecordId, tier: Tier) -> Result<EntityRecord, StoreError> {
        self.mutate(id, |r| {
            r.tier = tier;
            r.stored_tier = None;
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to catalog database")?;
        Ok(Self::new(pool))
    }

    fn row_to_dj(row: &PgRow) -> Result<DjRow, StoreError> {
        Ok(DjRow {
            id: row.try_get("id")?,
            stage_name: row.try_get("stage_name")?,
            categories: row.try_get("categories")?,
            rarity: row.try_get("rarity")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn scan_active(&self) -> Result<ActiveScan, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, stage_name, categories, rarity, is_active, created_at, updated_at
              FROM djs
             WHERE is_active = true
             ORDER BY stage_name
            "#,
        )
        .fetch_all(&self.pool)
        .instrument(info_span!("pg_scan_active"))
        .await?;
        let mut scan = ActiveScan::default();
        for row in &rows {
            Self::row_to_dj(row)?.scan_into(&mut scan);
        }
        Ok(scan)
    }

    async fn update_groups(
        &self,
        id: RecordId,
        groups: &BTreeSet<GroupName>,
    ) -> Result<EntityRecord, StoreError> {
        let categories = groups.iter().cloned().collect::<Vec<_>>();
        let row = sqlx::query(
            r#"
            UPDATE djs
               SET categories = $2, updated_at = now()
             WHERE id = $1
            RETURNING id, stage_name, categories, rarity, is_active, created_at, updated_at
            "#,
        )
        .bind(id.0)
        .bind(categories.as_slice())
        .fetch_optional(&self.pool)
        .await?;
        debug!(%id, ?categories, "updated groups");
        Self::row_to_dj(&row.ok_or(StoreError::NotFound(id))?)?.into_record()
    }

    async fn update_tier(&self, id: RecordId, tier: Tier) -> Result<EntityRecord, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE djs
               SET rarity = $2, updated_at = now()
             WHERE id = $1
            RETURNING id, stage_name, categories, rarity, is_active, created_at, updated_at
            "#,
        )
        .bind(id.0)
        .bind(tier.as_str())
        .fetch_optional(&self.pool)
        .await?;
        debug!(%id, %tier, "updated tier");
        Self::row_to_dj(&row.ok_or(StoreError::NotFound(id))?)?.into_record()
    }
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub service_key: String,
    pub timeout: Duration,
}

/// Talks to the hosted catalog through its PostgREST endpoint (`/rest/v1/djs`).
#[derive(Debug, Clone)]
pub struct RestRecordStore {
    client: reqwest::Client,
    table_url: String,
    service_key: String,
}

const REST_COLUMNS: &str = "id,stage_name,categories,rarity,is_active,created_at,updated_at";

impl RestRecordStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            table_url: format!("{}/rest/v1/djs", config.base_url.trim_end_matches('/')),
            service_key: config.service_key,
        })
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, StoreError> {
        let status = resp.status();
        if !status.is_success() {
            let url = resp.url().to_string();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        Ok(resp.json::<T>().await?)
    }

    async fn patch(
        &self,
        id: RecordId,
        body: serde_json::Value,
    ) -> Result<EntityRecord, StoreError> {
        let resp = self
            .client
            .patch(&self.table_url)
            .query(&[("id", format!("eq.{id}")), ("select", REST_COLUMNS.to_string())])
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .instrument(info_span!("rest_patch", %id))
            .await?;
        let rows: Vec<DjRow> = Self::decode(resp).await?;
        rows.into_iter()
            .next()
            .ok_or(StoreError::NotFound(id))?
            .into_record()
    }
}

#[async_trait]
impl RecordStore for RestRecordStore {
    async fn scan_active(&self) -> Result<ActiveScan, StoreError> {
        let resp = self
            .client
            .get(&self.table_url)
            .query(&[
                ("select", REST_COLUMNS),
                ("is_active", "eq.true"),
                ("order", "stage_name.asc"),
            ])
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .send()
            .instrument(info_span!("rest_scan_active"))
            .await?;
        let rows: Vec<DjRow> = Self::decode(resp).await?;
        let mut scan = ActiveScan::default();
        for row in rows {
            row.scan_into(&mut scan);
        }
        Ok(scan)
    }

    async fn update_groups(
        &self,
        id: RecordId,
        groups: &BTreeSet<GroupName>,
    ) -> Result<EntityRecord, StoreError> {
        self.patch(
            id,
            serde_json::json!({ "categories": groups, "updated_at": Utc::now() }),
        )
        .await
    }

    async fn update_tier(&self, id: RecordId, tier: Tier) -> Result<EntityRecord, StoreError> {
        self.patch(
            id,
            serde_json::json!({ "rarity": tier.as_str(), "updated_at": Utc::now() }),
        )
        .await
    }
}

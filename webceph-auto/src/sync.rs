//! Result synchronization with the remote data store. Failed writes are
//! pushed into the [`OfflineQueue`] instead of being lost.

use chrono::{DateTime, Local, NaiveDate};
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DataStoreConfig;
use crate::errors::AutomationError;
use crate::queue::{OfflineQueue, QueueItem, ReplaySummary};
use crate::record::PatientRecord;
use crate::wait::{Clock, SystemClock};

const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    CreatePatient,
    UpdateResult,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::CreatePatient => "create_patient",
            SyncAction::UpdateResult => "update_result",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create_patient" => Some(SyncAction::CreatePatient),
            "update_result" => Some(SyncAction::UpdateResult),
            _ => None,
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote write, in the shape it is queued in.
///
/// Create payloads are `{"fields": {...}}`; update payloads add `record_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOperation {
    pub action: SyncAction,
    pub payload: Value,
}

impl SyncOperation {
    pub fn create_patient(fields: Map<String, Value>) -> Self {
        Self {
            action: SyncAction::CreatePatient,
            payload: json!({ "fields": fields }),
        }
    }

    pub fn update_result(record_id: &str, fields: Map<String, Value>) -> Self {
        Self {
            action: SyncAction::UpdateResult,
            payload: json!({ "record_id": record_id, "fields": fields }),
        }
    }

    pub fn from_queue_item(item: &QueueItem) -> Result<Self, AutomationError> {
        let action = SyncAction::parse(&item.action_type).ok_or_else(|| {
            AutomationError::InvalidArgument(format!(
                "unknown queued action '{}'",
                item.action_type
            ))
        })?;
        Ok(Self {
            action,
            payload: item.payload.clone(),
        })
    }

    fn fields(&self) -> Value {
        self.payload.get("fields").cloned().unwrap_or_else(|| json!({}))
    }

    fn record_id(&self) -> Result<&str, AutomationError> {
        self.payload
            .get("record_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AutomationError::InvalidArgument("update_result without record_id".to_string())
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReceipt {
    pub record_id: Option<String>,
}

/// A data store that accepts [`SyncOperation`]s.
pub trait RemoteStore: Send + Sync {
    fn execute(&self, operation: &SyncOperation) -> Result<SyncReceipt, AutomationError>;
}

/// Statuses worth another attempt: rate limiting and server-side failures.
const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// One failed HTTP attempt and whether repeating it may help.
#[derive(Debug)]
pub struct HttpFailure {
    pub error: AutomationError,
    pub transient: bool,
}

impl HttpFailure {
    pub fn status(status: u16, body: &str) -> Self {
        Self {
            error: AutomationError::Http(format!("HTTP {status}: {body}")),
            transient: TRANSIENT_STATUSES.contains(&status),
        }
    }

    pub fn permanent(error: AutomationError) -> Self {
        Self {
            error,
            transient: false,
        }
    }
}

impl From<reqwest::Error> for HttpFailure {
    fn from(e: reqwest::Error) -> Self {
        let transient = e.is_connect() || e.is_timeout();
        Self {
            error: e.into(),
            transient,
        }
    }
}

/// Bounded retry with exponential backoff: retry `n` waits `backoff * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff
            .saturating_mul(2_u32.saturating_pow(retry.saturating_sub(1)))
    }

    /// Call `attempt` until it succeeds, fails permanently or the retries run out.
    pub fn run<T, F>(&self, clock: &dyn Clock, what: &str, mut attempt: F) -> Result<T, AutomationError>
    where
        F: FnMut() -> Result<T, HttpFailure>,
    {
        let mut retry = 0;
        loop {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(failure) if failure.transient && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.delay(retry);
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        what, failure.error, retry, self.max_retries, delay
                    );
                    clock.sleep(delay);
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }
}

/// One page of a table listing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<Value>,
    #[serde(default)]
    pub offset: Option<String>,
}

/// Follow `offset` cursors until the listing ends or `limit` records are in.
pub fn collect_pages<F>(limit: Option<usize>, mut fetch: F) -> Result<Vec<Value>, AutomationError>
where
    F: FnMut(Option<&str>) -> Result<RecordPage, AutomationError>,
{
    let mut records = Vec::new();
    let mut offset: Option<String> = None;
    loop {
        let page = fetch(offset.as_deref())?;
        records.extend(page.records);
        if let Some(limit) = limit {
            if records.len() >= limit {
                records.truncate(limit);
                break;
            }
        }
        match page.offset {
            Some(next) if !next.is_empty() => offset = Some(next),
            _ => break,
        }
    }
    Ok(records)
}

/// Session counts for one day, by row status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStatistics {
    pub date: NaiveDate,
    pub total_patients: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub failed: usize,
}

impl DailyStatistics {
    pub fn from_records(date: NaiveDate, records: &[Value]) -> Self {
        let count = |status: &str| {
            records
                .iter()
                .filter(|r| r["fields"]["status"].as_str() == Some(status))
                .count()
        };
        Self {
            date,
            total_patients: records.len(),
            completed: count("COMPLETED"),
            in_progress: count("IN_PROGRESS"),
            failed: count("FAILED"),
        }
    }

    /// Completed sessions as a percentage of all sessions that day.
    pub fn success_rate(&self) -> f64 {
        if self.total_patients == 0 {
            return 0.0;
        }
        self.completed as f64 * 100.0 / self.total_patients as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub path: PathBuf,
    pub total_records: usize,
}

/// Write `records` to `path` as a dated backup document.
pub fn write_backup(
    path: &Path,
    records: Vec<Value>,
    now: DateTime<Local>,
) -> Result<BackupSummary, AutomationError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let total_records = records.len();
    let document = json!({
        "backup_date": now.to_rfc3339(),
        "total_records": total_records,
        "records": records,
    });
    std::fs::write(path, serde_json::to_string_pretty(&document)?)?;
    info!("Backed up {} record(s) to {}", total_records, path.display());
    Ok(BackupSummary {
        path: path.to_path_buf(),
        total_records,
    })
}

/// `airtable_backup_<YYYYMMDD_HHMMSS>.json` inside `folder`.
pub fn backup_file_path(folder: &Path, now: DateTime<Local>) -> PathBuf {
    folder.join(format!(
        "airtable_backup_{}.json",
        now.format("%Y%m%d_%H%M%S")
    ))
}

/// Airtable REST client.
#[derive(Clone)]
pub struct AirtableStore {
    client: Client,
    config: DataStoreConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for AirtableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AirtableStore")
            .field("table", &self.config.table_name)
            .field("retry", &self.retry)
            .finish()
    }
}

impl AirtableStore {
    pub fn new(config: DataStoreConfig, timeout: Duration) -> Result<Self, AutomationError> {
        if !config.is_configured() {
            return Err(AutomationError::MissingCredentials(
                "data store api key and base id must be configured".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AutomationError::Http(format!("Failed to build http client: {e}")))?;
        Ok(Self {
            client,
            config,
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn table_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.base_id,
            self.config.table_name
        )
    }

    fn send<B>(&self, what: &str, build: B) -> Result<Value, AutomationError>
    where
        B: Fn() -> RequestBuilder,
    {
        self.retry.run(self.clock.as_ref(), what, || {
            let response = build().bearer_auth(&self.config.api_key).send()?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(HttpFailure::status(status.as_u16(), &body));
            }
            response
                .json()
                .map_err(|e| HttpFailure::permanent(AutomationError::from(e)))
        })
    }

    fn list_page(
        &self,
        filter_formula: Option<&str>,
        offset: Option<&str>,
    ) -> Result<RecordPage, AutomationError> {
        let mut query: Vec<(&str, String)> = vec![("pageSize", PAGE_SIZE.to_string())];
        if let Some(formula) = filter_formula {
            query.push(("filterByFormula", formula.to_string()));
        }
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }
        let page = self.send("list records", || {
            self.client.get(self.table_url()).query(&query)
        })?;
        Ok(serde_json::from_value(page)?)
    }

    /// Read one record to check the key, base and table.
    pub fn test_connection(&self) -> Result<(), AutomationError> {
        self.send("connection test", || {
            self.client
                .get(self.table_url())
                .query(&[("maxRecords", "1")])
        })?;
        info!("Data store connection OK ({})", self.config.table_name);
        Ok(())
    }

    /// Rows matching an optional Airtable formula, at most `max_records`.
    #[instrument(level = "debug", skip(self))]
    pub fn patient_records(
        &self,
        filter_formula: Option<&str>,
        max_records: usize,
    ) -> Result<Vec<Value>, AutomationError> {
        let records = collect_pages(Some(max_records), |offset| {
            self.list_page(filter_formula, offset)
        })?;
        info!("Fetched {} record(s)", records.len());
        Ok(records)
    }

    /// Status counts for sessions dated `date`.
    pub fn daily_statistics(&self, date: NaiveDate) -> Result<DailyStatistics, AutomationError> {
        let formula = format!("{{session_date}} = '{}'", date.format("%Y-%m-%d"));
        let records = collect_pages(None, |offset| self.list_page(Some(&formula), offset))?;
        Ok(DailyStatistics::from_records(date, &records))
    }

    /// Dump every row of the table to a JSON file.
    pub fn backup(&self, path: &Path) -> Result<BackupSummary, AutomationError> {
        let records = collect_pages(None, |offset| self.list_page(None, offset))?;
        write_backup(path, records, Local::now())
    }
}

impl RemoteStore for AirtableStore {
    fn execute(&self, operation: &SyncOperation) -> Result<SyncReceipt, AutomationError> {
        let body = json!({ "fields": operation.fields() });
        let response = match operation.action {
            SyncAction::CreatePatient => self.send("create_patient", || {
                self.client.post(self.table_url()).json(&body)
            })?,
            SyncAction::UpdateResult => {
                let url = format!("{}/{}", self.table_url(), operation.record_id()?);
                self.send("update_result", || self.client.patch(&url).json(&body))?
            }
        };
        let record_id = response
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        debug!("{} succeeded (record {:?})", operation.action, record_id);
        Ok(SyncReceipt { record_id })
    }
}

/// Patient row fields for a new session.
pub fn patient_fields(
    record: &PatientRecord,
    operator: &str,
    image_count: Option<usize>,
    now: DateTime<Local>,
) -> Map<String, Value> {
    let stamp = now.format("%Y%m%d%H%M").to_string();
    let patient_id = format!("PAT_{stamp}");
    let session_id = format!("SES_{stamp}_{}", now.format("%H%M"));
    let timestamp = now.to_rfc3339();

    let mut fields = Map::new();
    fields.insert("patient_id".into(), json!(patient_id));
    fields.insert("name".into(), json!(record.name));
    fields.insert("birth_date".into(), json!(record.birth_date_text()));
    fields.insert("registration_number".into(), json!(record.chart_no));
    if let Some(gender) = record.gender {
        fields.insert("gender".into(), json!(gender.code()));
    }
    fields.insert("created_at".into(), json!(timestamp));
    fields.insert("updated_at".into(), json!(timestamp));
    fields.insert("session_id".into(), json!(session_id));
    fields.insert("session_date".into(), json!(now.format("%Y-%m-%d").to_string()));
    fields.insert("session_type".into(), json!("INITIAL"));
    fields.insert("operator_name".into(), json!(operator));
    fields.insert("status".into(), json!("IN_PROGRESS"));
    fields.insert("started_at".into(), json!(timestamp));

    if let Some(phone) = &record.phone {
        fields.insert("phone_number".into(), json!(phone));
    }
    if let Some(email) = &record.email {
        fields.insert("email".into(), json!(email));
    }
    if let Some(notes) = &record.notes {
        fields.insert("notes".into(), json!(notes));
    }
    if let Some(count) = image_count {
        fields.insert("total_images".into(), json!(count));
    }
    fields
}

/// What the analysis produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub report_path: Option<PathBuf>,
    pub analysis_type: Option<String>,
    pub web_ceph_id: Option<String>,
    pub summary: Option<String>,
}

pub fn analysis_fields(result: &AnalysisResult, now: DateTime<Local>) -> Map<String, Value> {
    let timestamp = now.to_rfc3339();
    let mut fields = Map::new();
    fields.insert(
        "result_id".into(),
        json!(format!("RES_{}", now.format("%Y%m%d%H%M%S"))),
    );
    fields.insert("analyzed_at".into(), json!(timestamp));
    fields.insert("status".into(), json!("COMPLETED"));
    fields.insert("completed_at".into(), json!(timestamp));

    if let Some(path) = &result.report_path {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let folder = path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let size_kb = std::fs::metadata(path).map(|m| m.len() / 1024).unwrap_or(0);
        fields.insert("pdf_file_name".into(), json!(name));
        fields.insert("pdf_file_path".into(), json!(folder));
        fields.insert("pdf_size_kb".into(), json!(size_kb));
    }
    fields.insert(
        "analysis_type".into(),
        json!(result.analysis_type.as_deref().unwrap_or("CEPHALOMETRIC")),
    );
    if let Some(id) = &result.web_ceph_id {
        fields.insert("web_ceph_id".into(), json!(id));
    }
    if let Some(summary) = &result.summary {
        fields.insert("summary".into(), json!(summary));
    }
    fields
}

/// Submits remote writes, queueing whatever fails.
#[derive(Clone)]
pub struct SyncService {
    store: Arc<dyn RemoteStore>,
    queue: Arc<OfflineQueue>,
}

impl SyncService {
    pub fn new(store: Arc<dyn RemoteStore>, queue: Arc<OfflineQueue>) -> Self {
        Self { store, queue }
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Execute `operation`; on failure enqueue it and return `RemoteSyncFailed`.
    #[instrument(level = "info", skip(self, operation), fields(action = %operation.action))]
    pub fn submit(&self, operation: SyncOperation) -> Result<SyncReceipt, AutomationError> {
        match self.store.execute(&operation) {
            Ok(receipt) => {
                info!("{} synced", operation.action);
                Ok(receipt)
            }
            Err(e) => {
                let queued = match self
                    .queue
                    .enqueue(operation.action.as_str(), operation.payload.clone())
                {
                    Ok(id) => {
                        warn!("{} failed, queued as {}: {}", operation.action, id, e);
                        true
                    }
                    Err(queue_error) => {
                        error!(
                            "{} failed and could not be queued ({}): {}",
                            operation.action, queue_error, e
                        );
                        false
                    }
                };
                Err(AutomationError::RemoteSyncFailed {
                    action: operation.action.to_string(),
                    reason: e.to_string(),
                    queued,
                })
            }
        }
    }

    /// Replay the offline queue against the store.
    pub fn replay_pending(&self) -> Result<ReplaySummary, AutomationError> {
        self.queue.replay(|item| {
            let operation = SyncOperation::from_queue_item(item)?;
            self.store.execute(&operation).map(|_| ())
        })
    }
}

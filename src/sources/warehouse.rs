//! Adapter for the analytics warehouse (BigQuery).
//!
//! Usage events land in the `billing{suffix}.events` dataset, partitioned by
//! ingestion date. Ingestion can lag the event itself, so the partition
//! filter is widened one day past the logical window; the `received_at`
//! predicate still decides which rows qualify.
//!
//! The client speaks the synchronous query REST protocol directly: one
//! `jobs.query` POST, then `getQueryResults` polling and paging when the job
//! is slow or the result set spans pages.
//!
//! Supports three authentication modes:
//! - **ADC**: Application Default Credentials
//! - **Service account**: key file or inline key JSON
//! - **None**: for unauthenticated emulator endpoints

use std::{path::Path, sync::Arc, time::Duration, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, SecondsFormat, Utc};
use google_cloud_token::TokenSourceProvider;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    config::{GcpCredentials, WarehouseConfig},
    models::{Org, SourceName, UsageRecord},
    reconcile::{ReconcileWindow, ceil_to_day},
    sources::{SourceError, SourceResult, UsageSource, read_json},
};

const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

const WAREHOUSE_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Buffer time before token expiry to trigger refresh (5 minutes).
/// Ensures tokens are refreshed before they actually expire.
const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;

/// Default token cache duration (1 hour).
/// Most Google OAuth tokens have a 1-hour lifetime.
const TOKEN_CACHE_DURATION_SECS: u64 = 3600;

/// Server-side wait per request, in milliseconds. Kept short so a slow job
/// is polled rather than tying up one long HTTP call.
const QUERY_WAIT_MS: u64 = 10_000;

fn usage_sql(suffix: &str) -> String {
    // Ordered for stable debugging output only; the caller treats rows as a
    // set. The partition bounds scan one extra day for late-arriving events.
    format!(
        "SELECT
  internal_instance_id,
  DATE(received_at) AS day,
  amount_type,
  SUM(amount_value) AS amount
FROM billing{suffix}.events
WHERE received_at >= @start
  AND received_at < @end
  AND _PARTITIONDATE >= @partition_start
  AND _PARTITIONDATE <= @partition_end
  AND internal_instance_id IN UNNEST(@instance_ids)
GROUP BY internal_instance_id, day, amount_type
ORDER BY internal_instance_id ASC, day DESC"
    )
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Low-level warehouse query client. Shared by the usage adapter and the
/// access-denial check; owns an HTTP client and a cached OAuth token.
pub struct WarehouseClient {
    project: String,
    base_url: String,
    credentials: GcpCredentials,
    token_cache: Arc<RwLock<Option<CachedToken>>>,
    timeout: Duration,
    http: reqwest::Client,
}

impl WarehouseClient {
    pub fn new(config: &WarehouseConfig) -> SourceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            project: config.project.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            credentials: config.credentials.clone(),
            token_cache: Arc::new(RwLock::new(None)),
            timeout: Duration::from_secs(config.timeout_secs),
            http,
        })
    }

    /// Run one parameterized query and collect every result row, following
    /// incomplete-job polls and page tokens until the set is exhausted.
    pub async fn run_query(
        &self,
        sql: &str,
        params: Vec<QueryParameter>,
    ) -> SourceResult<ResultSet> {
        let token = self.get_token().await?;

        let request = QueryRequest {
            query: sql.to_string(),
            use_legacy_sql: false,
            parameter_mode: "NAMED".to_string(),
            query_parameters: params,
            timeout_ms: QUERY_WAIT_MS,
        };
        let url = format!("{}/projects/{}/queries", self.base_url, self.project);
        let mut req = self.http.post(&url).json(&request);
        if let Some(token) = &token {
            req = req.bearer_auth(token);
        }

        let mut page: QueryResponse = read_json(req.send().await?, "query response").await?;
        let job = page.job_reference.clone();
        let deadline = Instant::now() + self.timeout;

        let mut schema = page.schema.take();
        let mut rows = std::mem::take(&mut page.rows);
        let mut page_token = page.page_token.take();
        let mut complete = page.job_complete;

        while !complete || page_token.is_some() {
            if !complete && Instant::now() >= deadline {
                return Err(SourceError::Timeout(self.timeout));
            }
            let Some(job) = &job else {
                return Err(SourceError::Payload(
                    "incomplete query response carried no job reference".into(),
                ));
            };

            let mut next = self
                .get_query_results(token.as_deref(), job, page_token.as_deref())
                .await?;
            complete = next.job_complete;
            if complete {
                if schema.is_none() {
                    schema = next.schema.take();
                }
                rows.append(&mut next.rows);
                page_token = next.page_token.take();
            }
        }

        let Some(schema) = schema else {
            return Err(SourceError::Payload(
                "completed query response carried no schema".into(),
            ));
        };

        Ok(ResultSet {
            columns: schema.fields.into_iter().map(|f| f.name).collect(),
            rows: rows
                .into_iter()
                .map(flatten_row)
                .collect::<SourceResult<_>>()?,
        })
    }

    async fn get_query_results(
        &self,
        token: Option<&str>,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> SourceResult<QueryResponse> {
        let mut url = format!(
            "{}/projects/{}/queries/{}?timeoutMs={}",
            self.base_url, job.project_id, job.job_id, QUERY_WAIT_MS
        );
        if let Some(location) = &job.location {
            url.push_str("&location=");
            url.push_str(location);
        }
        if let Some(page_token) = page_token {
            url.push_str("&pageToken=");
            url.push_str(page_token);
        }

        let mut req = self.http.get(&url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        read_json(req.send().await?, "query results page").await
    }

    /// Get an access token, refreshing if necessary. Returns `None` in the
    /// unauthenticated emulator mode.
    async fn get_token(&self) -> SourceResult<Option<String>> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.expires_at
                    > Instant::now() + Duration::from_secs(TOKEN_REFRESH_BUFFER_SECS)
            {
                return Ok(Some(cached.token.clone()));
            }
        }

        let token = match &self.credentials {
            GcpCredentials::None => return Ok(None),
            GcpCredentials::Default => {
                let config = google_cloud_auth::project::Config::default()
                    .with_scopes(&[WAREHOUSE_SCOPE]);

                let provider = google_cloud_auth::token::DefaultTokenSourceProvider::new(config)
                    .await
                    .map_err(|e| {
                        SourceError::Auth(format!("failed to create token source: {e}"))
                    })?;

                provider
                    .token_source()
                    .token()
                    .await
                    .map_err(|e| SourceError::Auth(format!("failed to get token: {e}")))?
            }
            GcpCredentials::ServiceAccount { key_path } => {
                self.token_from_key_file(Path::new(key_path)).await?
            }
            GcpCredentials::ServiceAccountJson { json } => self.token_from_key_json(json).await?,
        };

        // Cache token (assume standard expiry for Google tokens)
        {
            let mut cache = self.token_cache.write().await;
            *cache = Some(CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + Duration::from_secs(TOKEN_CACHE_DURATION_SECS),
            });
        }

        Ok(Some(token))
    }

    async fn token_from_key_file(&self, key_path: &Path) -> SourceResult<String> {
        let key_json = tokio::fs::read_to_string(key_path).await.map_err(|e| {
            SourceError::Auth(format!(
                "failed to read service account key file '{}': {e}",
                key_path.display()
            ))
        })?;

        self.token_from_key_json(&key_json).await
    }

    async fn token_from_key_json(&self, json: &str) -> SourceResult<String> {
        use google_cloud_auth::credentials::CredentialsFile;

        let creds: CredentialsFile = serde_json::from_str(json)
            .map_err(|e| SourceError::Auth(format!("failed to parse service account JSON: {e}")))?;

        let config =
            google_cloud_auth::project::Config::default().with_scopes(&[WAREHOUSE_SCOPE]);

        let provider = google_cloud_auth::token::DefaultTokenSourceProvider::new_with_credentials(
            config,
            Box::new(creds),
        )
        .await
        .map_err(|e| {
            SourceError::Auth(format!("failed to create token source from service account: {e}"))
        })?;

        provider
            .token_source()
            .token()
            .await
            .map_err(|e| SourceError::Auth(format!("failed to get token: {e}")))
    }
}

/// The warehouse's view of billable usage.
pub struct WarehouseSource {
    client: WarehouseClient,
    dataset_suffix: &'static str,
}

impl WarehouseSource {
    pub fn new(config: &WarehouseConfig) -> SourceResult<Self> {
        Ok(Self {
            client: WarehouseClient::new(config)?,
            dataset_suffix: config.dataset_suffix(),
        })
    }
}

#[async_trait]
impl UsageSource for WarehouseSource {
    fn name(&self) -> SourceName {
        SourceName::Warehouse
    }

    #[tracing::instrument(skip(self, orgs), fields(source = "warehouse", orgs = orgs.len(), window = %window))]
    async fn fetch(&self, orgs: &[Org], window: &ReconcileWindow) -> SourceResult<Vec<UsageRecord>> {
        if orgs.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = orgs.iter().map(|org| org.internal_id.clone()).collect();
        let partition_start = window.start.date_naive();
        let partition_end = ceil_to_day(window.end)
            .date_naive()
            .checked_add_days(Days::new(1))
            .unwrap_or_else(|| window.end.date_naive());

        let params = vec![
            QueryParameter::timestamp("start", window.start),
            QueryParameter::timestamp("end", window.end),
            QueryParameter::date("partition_start", partition_start),
            QueryParameter::date("partition_end", partition_end),
            QueryParameter::string_array("instance_ids", &ids),
        ];

        let result = self
            .client
            .run_query(&usage_sql(self.dataset_suffix), params)
            .await?;

        let mut records = Vec::with_capacity(result.rows.len());
        for row in result.rows() {
            records.push(UsageRecord {
                org_ref: row.str_value("internal_instance_id")?.to_string(),
                day: row.date_value("day")?,
                unit: row.str_value("amount_type")?.to_string(),
                amount: row.i64_value("amount")?,
            });
        }
        Ok(records)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

/// Named query parameter for the warehouse REST protocol.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParameter {
    name: String,
    parameter_type: ParameterType,
    parameter_value: ParameterValue,
}

impl QueryParameter {
    pub fn timestamp(name: &str, value: DateTime<Utc>) -> Self {
        Self::scalar(
            name,
            "TIMESTAMP",
            value.to_rfc3339_opts(SecondsFormat::Micros, true),
        )
    }

    pub fn date(name: &str, value: NaiveDate) -> Self {
        Self::scalar(name, "DATE", value.format("%Y-%m-%d").to_string())
    }

    pub fn string_array(name: &str, values: &[String]) -> Self {
        Self {
            name: name.to_string(),
            parameter_type: ParameterType {
                kind: "ARRAY".to_string(),
                array_type: Some(Box::new(ParameterType {
                    kind: "STRING".to_string(),
                    array_type: None,
                })),
            },
            parameter_value: ParameterValue {
                value: None,
                array_values: Some(
                    values
                        .iter()
                        .map(|v| ParameterValue {
                            value: Some(v.clone()),
                            array_values: None,
                        })
                        .collect(),
                ),
            },
        }
    }

    fn scalar(name: &str, kind: &str, value: String) -> Self {
        Self {
            name: name.to_string(),
            parameter_type: ParameterType {
                kind: kind.to_string(),
                array_type: None,
            },
            parameter_value: ParameterValue {
                value: Some(value),
                array_values: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParameterType {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    array_type: Option<Box<ParameterType>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParameterValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    array_values: Option<Vec<ParameterValue>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    query: String,
    use_legacy_sql: bool,
    parameter_mode: String,
    query_parameters: Vec<QueryParameter>,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    rows: Vec<TableRow>,
    schema: Option<TableSchema>,
    job_reference: Option<JobReference>,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    fields: Vec<TableField>,
}

#[derive(Debug, Deserialize)]
struct TableField {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

fn flatten_row(row: TableRow) -> SourceResult<Vec<Option<String>>> {
    row.f
        .into_iter()
        .map(|cell| match cell.v {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(SourceError::Payload(format!(
                "unexpected result cell shape: {other}"
            ))),
        })
        .collect()
}

/// Tabular query result with by-name column access.
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(|cells| Row {
            columns: &self.columns,
            cells,
        })
    }
}

/// One result row. Cells arrive as strings on the wire regardless of column
/// type; accessors parse them into what the caller needs.
pub struct Row<'a> {
    columns: &'a [String],
    cells: &'a [Option<String>],
}

impl Row<'_> {
    fn cell(&self, name: &str) -> SourceResult<&str> {
        let idx = self
            .columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| SourceError::Payload(format!("result row is missing column {name}")))?;
        self.cells
            .get(idx)
            .and_then(|cell| cell.as_deref())
            .ok_or_else(|| SourceError::Payload(format!("column {name} is unexpectedly null")))
    }

    pub fn str_value(&self, name: &str) -> SourceResult<&str> {
        self.cell(name)
    }

    pub fn i64_value(&self, name: &str) -> SourceResult<i64> {
        let raw = self.cell(name)?;
        raw.parse().map_err(|_| {
            SourceError::Payload(format!("column {name} is not an integer: {raw}"))
        })
    }

    pub fn date_value(&self, name: &str) -> SourceResult<NaiveDate> {
        let raw = self.cell(name)?;
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| SourceError::Payload(format!("column {name} is not a date: {raw}")))
    }
}

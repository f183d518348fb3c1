//! Adapter for the external billing platform.
//!
//! The platform's REST API serves usage per billing account, newest first,
//! through a cursor-paginated endpoint. The adapter walks the pages only as
//! far as the reconciliation window needs, rolls rows up into per-day
//! records, and exposes the platform's bulk-upload and delete endpoints for
//! the manual correction workflow.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::{
    config::{BillingPlatformConfig, ConfigError},
    models::{BILLABLE_UNIT, Org, SourceName, UsageRecord},
    reconcile::ReconcileWindow,
    sources::{SourceError, SourceResult, UsageSource, read_json},
};

/// One in-window usage row from the platform, already parsed.
#[derive(Debug, Clone)]
pub struct PlatformUsageRow {
    pub start: DateTime<Utc>,
    pub unit: String,
    pub quantity: f64,
}

/// The subscription and charge that usage rows book against for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageAssignment {
    pub subscription_number: String,
    pub charge_number: String,
}

/// One day's usage for one account, staged for bulk upload.
#[derive(Debug, Clone)]
pub struct UsageUpload {
    pub billing_account_ref: String,
    pub day: NaiveDate,
    pub quantity: i64,
}

/// One line of the platform's fixed-column usage import file.
#[derive(Serialize)]
#[serde(rename_all = "UPPERCASE")]
struct UploadRow<'a> {
    account_id: &'a str,
    uom: &'a str,
    qty: i64,
    startdate: String,
    enddate: String,
    subscription_id: &'a str,
    charge_id: &'a str,
    description: &'a str,
}

/// Authenticated client for the billing platform REST API.
pub struct BillingPlatformClient {
    base_url: Url,
    username: String,
    password: String,
    page_size: u32,
    http: reqwest::Client,
    assignments: RwLock<HashMap<String, UsageAssignment>>,
}

impl BillingPlatformClient {
    pub fn new(config: &BillingPlatformConfig) -> SourceResult<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ConfigError::Validation(format!("billing_platform.base_url: {e}")))?;
        let password = config.resolve_password()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url,
            username: config.username.clone(),
            password,
            page_size: config.page_size,
            http,
            assignments: RwLock::new(HashMap::new()),
        })
    }

    /// Walk the paginated usage API for one account, collecting the rows
    /// that fall inside the window.
    ///
    /// Pages come back in reverse-chronological order, so the first row
    /// older than the window proves no further page holds anything useful
    /// and the walk stops without another request. Rows at or past the
    /// window end are skipped but do not stop the walk.
    pub async fn get_usage(
        &self,
        account_id: &str,
        window: &ReconcileWindow,
    ) -> SourceResult<Vec<PlatformUsageRow>> {
        let mut url = self.endpoint(&format!(
            "/usage/accounts/{account_id}?pageSize={}",
            self.page_size
        ));
        let mut rows = Vec::new();

        loop {
            let response = self
                .request(reqwest::Method::GET, &url)
                .send()
                .await?;
            let page: UsageResponse =
                read_json(response, &format!("usage page for account {account_id}")).await?;
            if !page.success {
                return Err(SourceError::Unsuccessful(format!(
                    "usage query for account {account_id}"
                )));
            }

            for wire in page.usage {
                let start = parse_timestamp(&wire.start_date_time)?;
                if start >= window.end {
                    continue;
                }
                if start < window.start {
                    return Ok(rows);
                }
                rows.push(PlatformUsageRow {
                    start,
                    unit: wire.unit_of_measure,
                    quantity: wire.quantity,
                });
            }

            match page.next_page {
                Some(next) => url = self.next_page_url(&next)?,
                None => return Ok(rows),
            }
        }
    }

    /// Resolve the subscription and charge usage uploads book against.
    ///
    /// The platform holds exactly one subscription with exactly one rate
    /// plan and one charge per reconciled account; any other cardinality is
    /// a contract violation and fails the call. Resolved once per account
    /// and cached for the client's lifetime.
    pub async fn usage_assignment(&self, account_id: &str) -> SourceResult<UsageAssignment> {
        {
            let cache = self.assignments.read().await;
            if let Some(found) = cache.get(account_id) {
                return Ok(found.clone());
            }
        }

        let url = self.endpoint(&format!("/subscriptions/accounts/{account_id}"));
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        let parsed: SubscriptionsResponse = read_json(
            response,
            &format!("subscriptions for account {account_id}"),
        )
        .await?;
        if !parsed.success {
            return Err(SourceError::Unsuccessful(format!(
                "subscription lookup for account {account_id}"
            )));
        }

        let subscription = exactly_one(parsed.subscriptions, "subscription", account_id)?;
        let subscription_number = subscription.subscription_number;
        let rate_plan = exactly_one(subscription.rate_plans, "rate plan", account_id)?;
        let charge = exactly_one(rate_plan.rate_plan_charges, "rate plan charge", account_id)?;

        let assignment = UsageAssignment {
            subscription_number,
            charge_number: charge.number,
        };
        self.assignments
            .write()
            .await
            .insert(account_id.to_string(), assignment.clone());
        Ok(assignment)
    }

    /// Bulk-upload usage rows through the platform's fixed-column CSV
    /// import. Dates are day-granular; every row covers exactly one day.
    #[allow(dead_code)] // Write-back path: no caller in the check loop yet.
    pub async fn upload_usage(&self, rows: &[UsageUpload]) -> SourceResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows {
            let assignment = self.usage_assignment(&row.billing_account_ref).await?;
            writer.serialize(UploadRow {
                account_id: &row.billing_account_ref,
                uom: BILLABLE_UNIT,
                qty: row.quantity,
                startdate: format_upload_date(row.day),
                enddate: format_upload_date(row.day + Days::new(1)),
                subscription_id: &assignment.subscription_number,
                charge_id: &assignment.charge_number,
                description: "manual import",
            })?;
        }
        let buf = writer
            .into_inner()
            .map_err(|e| SourceError::Payload(format!("finishing usage csv: {e}")))?;

        let part = reqwest::multipart::Part::bytes(buf)
            .file_name("manual-upload.csv")
            .mime_str("text/csv")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = self.endpoint("/usage");
        let response = self
            .request(reqwest::Method::POST, &url)
            .multipart(form)
            .send()
            .await?;
        let status: StatusResponse = read_json(response, "usage upload response").await?;
        if !status.success {
            return Err(SourceError::Unsuccessful("usage upload".into()));
        }
        // TODO: follow the returned import-status link to confirm the rows
        // were actually ingested, not just accepted.
        Ok(())
    }

    /// Delete a single usage row by its platform-assigned identifier.
    #[allow(dead_code)] // Write-back path: no caller in the check loop yet.
    pub async fn delete_usage(&self, usage_id: &str) -> SourceResult<()> {
        let url = self.endpoint(&format!("/object/usage/{usage_id}"));
        let response = self.request(reqwest::Method::DELETE, &url).send().await?;
        let status: StatusResponse = read_json(response, "usage delete response").await?;
        if !status.success {
            return Err(SourceError::Unsuccessful(format!(
                "delete of usage row {usage_id}"
            )));
        }
        Ok(())
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    /// The upstream sometimes returns absolute pagination links and
    /// sometimes origin-relative ones; normalize both to a fetchable URL.
    fn next_page_url(&self, next_page: &str) -> SourceResult<String> {
        let url = if next_page.contains("://") {
            Url::parse(next_page)
        } else {
            self.base_url.join(next_page)
        }
        .map_err(|e| SourceError::Payload(format!("bad next-page link {next_page}: {e}")))?;
        Ok(url.into())
    }
}

/// The billing platform's view of billable usage.
pub struct BillingPlatformSource {
    client: BillingPlatformClient,
}

impl BillingPlatformSource {
    pub fn new(config: &BillingPlatformConfig) -> SourceResult<Self> {
        Ok(Self {
            client: BillingPlatformClient::new(config)?,
        })
    }
}

#[async_trait]
impl UsageSource for BillingPlatformSource {
    fn name(&self) -> SourceName {
        SourceName::BillingPlatform
    }

    #[tracing::instrument(skip(self, orgs), fields(source = "billing_platform", orgs = orgs.len(), window = %window))]
    async fn fetch(&self, orgs: &[Org], window: &ReconcileWindow) -> SourceResult<Vec<UsageRecord>> {
        let mut records = Vec::new();

        for org in orgs {
            let Some(account_id) = org.billing_account_ref.as_deref() else {
                return Err(SourceError::MissingBillingRef(org.external_id.clone()));
            };

            let rows = self.client.get_usage(account_id, window).await?;

            // The API yields individual usage rows; roll them up into the
            // common per-day shape.
            let mut by_day_unit: BTreeMap<(NaiveDate, String), f64> = BTreeMap::new();
            for row in rows {
                *by_day_unit
                    .entry((row.start.date_naive(), row.unit))
                    .or_insert(0.0) += row.quantity;
            }

            for ((day, unit), quantity) in by_day_unit {
                records.push(UsageRecord {
                    org_ref: org.internal_id.clone(),
                    day,
                    unit,
                    amount: quantity.round() as i64,
                });
            }
        }

        Ok(records)
    }
}

/// Timestamps arrive as naive `YYYY-MM-DD HH:MM:SS` strings meaning UTC.
fn parse_timestamp(s: &str) -> SourceResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .map_err(|_| SourceError::Payload(format!("unparseable usage timestamp: {s}")))
}

/// The import format wants day/month/year.
fn format_upload_date(day: NaiveDate) -> String {
    day.format("%d/%m/%Y").to_string()
}

fn exactly_one<T>(mut items: Vec<T>, what: &str, account_id: &str) -> SourceResult<T> {
    if items.len() != 1 {
        return Err(SourceError::ContractViolation(format!(
            "expected exactly one {what} for account {account_id}, got {}",
            items.len()
        )));
    }
    Ok(items.remove(0))
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageResponse {
    success: bool,
    #[serde(default)]
    usage: Vec<WireUsageRow>,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsageRow {
    start_date_time: String,
    unit_of_measure: String,
    quantity: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionsResponse {
    success: bool,
    #[serde(default)]
    subscriptions: Vec<WireSubscription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSubscription {
    subscription_number: String,
    #[serde(default)]
    rate_plans: Vec<WireRatePlan>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRatePlan {
    #[serde(default)]
    rate_plan_charges: Vec<WireRatePlanCharge>,
}

#[derive(Debug, Deserialize)]
struct WireRatePlanCharge {
    number: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    success: bool,
}

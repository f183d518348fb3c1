//! Periodic upload-access violation check.
//!
//! Instances that refused data upload must not appear in the warehouse
//! event log. Each cycle queries yesterday's partitions for instances that
//! did both and publishes how many were found.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};

use crate::checks::StopSignal;
use crate::config::ReconcilerConfig;
use crate::observability::metrics;
use crate::sources::{QueryParameter, SourceError, WarehouseClient};

fn access_sql(suffix: &str) -> String {
    format!(
        "WITH instances_daily_access AS (
  SELECT
    _PARTITIONDATE AS pd,
    ID AS internal_instance_id,
    -- If it was ever false within the day, the whole day counts as false.
    MIN(RefuseDataUpload) AS refuse_data_upload
  FROM service{suffix}.instances
  WHERE _PARTITIONDATE = @day
  GROUP BY pd, internal_instance_id
)
-- Instances that were both denied upload access and still logged events.
SELECT pd, internal_instance_id FROM instances_daily_access WHERE refuse_data_upload = true
INTERSECT DISTINCT
SELECT
  _PARTITIONDATE AS pd,
  internal_instance_id
FROM billing{suffix}.events
WHERE _PARTITIONDATE = @day
GROUP BY pd, internal_instance_id
ORDER BY internal_instance_id"
    )
}

/// Starts the access check as a background task.
///
/// Each cycle looks at yesterday's warehouse partitions and counts the
/// instances violating their upload denial. Runs until `stop` fires.
pub async fn start_access_check(config: Arc<ReconcilerConfig>, stop: StopSignal) {
    let check = &config.checks.access;
    if !check.enabled {
        tracing::info!("Access check disabled by configuration");
        return;
    }

    tracing::info!(interval_hours = check.interval_hours, "Starting access check");

    let interval = Duration::from_secs(check.interval_hours * 60 * 60);

    loop {
        match run_access_check(&config).await {
            Ok(violations) => {
                if violations.is_empty() {
                    tracing::debug!("Access check complete, no violations");
                } else {
                    tracing::warn!(
                        count = violations.len(),
                        instances = ?violations,
                        "Instances refusing data upload still logged events"
                    );
                }
                metrics::record_access_violations(violations.len());
                metrics::record_access_check_time(Utc::now().timestamp() as f64);
            }
            Err(e) => {
                // The violation gauge keeps its last value; only the check
                // time is zeroed to flag the cycle as stale.
                tracing::error!(error = %e, "Error while checking access");
                metrics::record_access_check_time(0.0);
            }
        }

        if stop.wait_timeout(interval).await {
            tracing::info!("Access check stopped");
            return;
        }
    }
}

/// Run a single check cycle. Returns the violating instance ids.
async fn run_access_check(config: &ReconcilerConfig) -> Result<Vec<String>, SourceError> {
    let client = WarehouseClient::new(&config.warehouse)?;
    let today = Utc::now().date_naive();
    let day = today.checked_sub_days(Days::new(1)).unwrap_or(today);
    query_access_log(&client, config.warehouse.dataset_suffix(), day).await
}

async fn query_access_log(
    client: &WarehouseClient,
    suffix: &str,
    day: NaiveDate,
) -> Result<Vec<String>, SourceError> {
    let result = client
        .run_query(&access_sql(suffix), vec![QueryParameter::date("day", day)])
        .await?;

    let mut instances = Vec::new();
    for row in result.rows() {
        instances.push(row.str_value("internal_instance_id")?.to_string());
    }
    Ok(instances)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::{GcpCredentials, WarehouseConfig};

    fn test_config(server: &MockServer) -> WarehouseConfig {
        WarehouseConfig {
            project: "test-bi".into(),
            production: false,
            credentials: GcpCredentials::None,
            base_url: Some(server.uri()),
            timeout_secs: 5,
        }
    }

    #[test]
    fn access_sql_switches_datasets() {
        let dev = access_sql("_dev");
        assert!(dev.contains("service_dev.instances"));
        assert!(dev.contains("billing_dev.events"));

        let production = access_sql("");
        assert!(production.contains("service.instances"));
        assert!(production.contains("billing.events"));
    }

    #[tokio::test]
    async fn violating_instances_are_listed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/projects/test-bi/queries"))
            .and(body_partial_json(json!({
                "queryParameters": [{
                    "name": "day",
                    "parameterType": {"type": "DATE"},
                    "parameterValue": {"value": "2024-01-09"},
                }],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": true,
                "schema": {"fields": [
                    {"name": "pd", "type": "DATE"},
                    {"name": "internal_instance_id", "type": "STRING"},
                ]},
                "rows": [
                    {"f": [{"v": "2024-01-09"}, {"v": "inst-3"}]},
                    {"f": [{"v": "2024-01-09"}, {"v": "inst-9"}]},
                ],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = WarehouseClient::new(&test_config(&server)).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 1, 9).unwrap();
        let instances = query_access_log(&client, "", day).await.unwrap();
        assert_eq!(instances, vec!["inst-3", "inst-9"]);
    }

    #[tokio::test]
    async fn clean_day_lists_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/projects/test-bi/queries"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": true,
                "schema": {"fields": [
                    {"name": "pd", "type": "DATE"},
                    {"name": "internal_instance_id", "type": "STRING"},
                ]},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = WarehouseClient::new(&test_config(&server)).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 1, 9).unwrap();
        let instances = query_access_log(&client, "", day).await.unwrap();
        assert!(instances.is_empty());
    }
}

//! PostgreSQL test harness using testcontainers
//!
//! One container is shared across the whole test run; each test gets its own
//! schema, so tests stay isolated without paying container startup per test.

use std::sync::OnceLock;

use sqlx::PgPool;
use testcontainers_modules::{
    postgres::Postgres,
    testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner},
};
use tokio::sync::OnceCell;

/// Shared container state - initialized once per test run
struct SharedContainer {
    #[allow(dead_code)] // Test infrastructure: keeps container alive
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container - lazily initialized on first use
static SHARED_CONTAINER: OnceLock<OnceCell<SharedContainer>> = OnceLock::new();

async fn get_shared_container() -> &'static SharedContainer {
    let cell = SHARED_CONTAINER.get_or_init(OnceCell::new);
    cell.get_or_init(|| async {
        let container = Postgres::default()
            .with_tag("18-alpine")
            .start()
            .await
            .expect("Failed to start PostgreSQL container");

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        let connection_string =
            format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

        SharedContainer {
            container,
            connection_string,
        }
    })
    .await
}

/// Create an isolated schema for a single test.
///
/// Starts the shared PostgreSQL container on first use, then points the
/// returned pool at a freshly created schema via `search_path`. Tables are
/// not created here; call [`create_source_tables`] when a test needs them.
pub async fn create_isolated_postgres_pool() -> PgPool {
    let shared = get_shared_container().await;

    // Admin pool, only used to create the schema
    let admin_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&shared.connection_string)
        .await
        .expect("Failed to connect to PostgreSQL");

    let schema_name = format!("test_{}", uuid::Uuid::new_v4().simple());

    sqlx::query(&format!("CREATE SCHEMA \"{}\"", schema_name))
        .execute(&admin_pool)
        .await
        .expect("Failed to create test schema");

    let isolated_url = format!(
        "{}?options=-c search_path={}",
        shared.connection_string, schema_name
    );

    sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&isolated_url)
        .await
        .expect("Failed to connect to isolated schema")
}

/// Create the minimal shapes of the externally owned tables the
/// repositories read: the org registry and the pre-aggregated usage table.
pub async fn create_source_tables(pool: &PgPool) {
    sqlx::query(
        r#"
        CREATE TABLE organizations (
            id bigserial PRIMARY KEY,
            external_id text NOT NULL,
            trial_expires_at timestamptz NOT NULL,
            zuora_account_number text,
            deleted_at timestamptz
        )
        "#,
    )
    .execute(pool)
    .await
    .expect("Failed to create organizations table");

    sqlx::query(
        r#"
        CREATE TABLE aggregates (
            instance_id text NOT NULL,
            bucket_start timestamptz NOT NULL,
            amount_type text NOT NULL,
            amount_value bigint NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .expect("Failed to create aggregates table");
}

//! Database repository test infrastructure
//!
//! The reconciler reads tables owned by other services, so there are no
//! migrations to run; each test creates the table shapes it needs inside an
//! isolated schema on a shared testcontainers PostgreSQL instance.
//!
//! Everything here requires Docker and is marked `#[ignore]`:
//!
//! ```bash
//! cargo test -- --ignored          # PostgreSQL integration tests (requires Docker)
//! cargo test -- --include-ignored  # Run all tests
//! ```

mod aggregates;
pub mod harness;

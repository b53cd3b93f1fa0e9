//! Storage authority for an ACME certificate authority.
//!
//! Holds accounts, domain-validation authorizations, orders and issued
//! certificates in PostgreSQL, derives order status from the authorizations
//! an order links to, detects renewals through name-set hashes, and answers
//! the windowed counts that rate limits are enforced against.

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate diesel_derive_enum;

pub mod schema;
pub mod models;
pub mod errors;
pub mod names;
pub mod clock;
pub mod settings;
mod sa;
pub mod fqdn_set;
pub mod rate_limits;
pub mod authz;
pub mod order;
pub mod certificates;
pub mod registrations;

pub use errors::{Error, Result};
pub use sa::StorageAuthority;
pub use settings::{Config, SaOptions};

pub type DBPool = diesel_async::pooled_connection::mobc::Pool<diesel_async::AsyncPgConnection>;
pub type DBConn = mobc::Connection<diesel_async::pooled_connection::AsyncDieselConnectionManager<diesel_async::AsyncPgConnection>>;

pub const MIGRATIONS: diesel_migrations::EmbeddedMigrations = diesel_migrations::embed_migrations!("migrations");

/// Applies any migrations the database has not seen yet.
pub fn run_migrations(database_url: &str) -> std::result::Result<(), String> {
    use diesel_migrations::MigrationHarness;
    use diesel::Connection;

    let mut conn = diesel::pg::PgConnection::establish(database_url)
        .map_err(|e| format!("failed to get database connection: {}", e))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| format!("failed to run migrations: {}", e))?;
    Ok(())
}

/// Builds the async connection pool, capped at `max_open` connections.
pub fn build_pool(database_url: &str, max_open: u64) -> DBPool {
    let manager = diesel_async::pooled_connection::AsyncDieselConnectionManager::<diesel_async::AsyncPgConnection>::new(database_url);
    mobc::Pool::builder()
        .max_open(max_open)
        .build(manager)
}

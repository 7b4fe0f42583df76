//! Connection handle for the columnar store.

use crate::config::ClickHouseConfig;
use clickhouse::insert::Insert;
use clickhouse::query::Query;
use clickhouse::{Client, Row};
use engine_core::{Error, Result};
use tracing::info;

/// Shared handle over the HTTP connection pool of the `clickhouse` crate.
/// Clones are cheap and reuse the same pool.
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
    database: String,
}

impl ClickHouseClient {
    pub fn new(config: ClickHouseConfig) -> Result<Self> {
        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            return Err(Error::validation(format!(
                "clickhouse url must be http(s), got '{}'",
                config.url
            )));
        }

        let base = Client::default()
            .with_url(&config.url)
            .with_database(&config.database)
            .with_option("max_execution_time", config.timeout_secs.to_string());
        let client = match (&config.username, &config.password) {
            (Some(user), Some(password)) => base.with_user(user).with_password(password),
            (Some(user), None) => base.with_user(user),
            (None, Some(password)) => base.with_password(password),
            (None, None) => base,
        };

        info!(url = %config.url, database = %config.database, "Columnar store handle ready");
        Ok(Self {
            client,
            database: config.database,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn query(&self, sql: &str) -> Query {
        self.client.query(sql)
    }

    /// Start a batch insert into `table` of the configured database.
    pub fn insert<T: Row>(&self, table: &str) -> Result<Insert<T>> {
        self.client
            .insert(table)
            .map_err(|e| Error::store_write(format!("cannot open insert into {}: {}", table, e)))
    }
}

//! `pg_stat_database` snapshot source.
//!
//! Connects with the blocking `postgres` client. TLS follows libpq's
//! `sslmode`: `disable` never negotiates TLS, `prefer` (the default) tries it
//! and falls back to plain only when the server declines, `require` insists
//! on it. As in libpq, neither mode verifies the server certificate.
//!
//! A failed query drops the client; the next fetch reconnects lazily.

use std::time::Duration;

use native_tls::TlsConnector;
use postgres::config::SslMode;
use postgres::{Client, Config, NoTls, Row};
use postgres_native_tls::MakeTlsConnector;
use tracing::{debug, info, warn};

use super::{SnapshotRows, SnapshotSource, SourceError, TupleCounters};

/// Per-database tuple counters. Template databases are reported like any
/// other database; only rows without a name (shared objects) are excluded.
const STAT_DATABASE_QUERY: &str = r#"
    SELECT
        datid::int8 AS datid,
        datname,
        tup_inserted,
        tup_updated
    FROM pg_stat_database
    WHERE datname IS NOT NULL
"#;

/// Snapshot source backed by `pg_stat_database`.
pub struct PostgresSource {
    connection_string: String,
    client: Option<Client>,
    statement_timeout: Option<Duration>,
    last_error: Option<String>,
}

impl PostgresSource {
    /// Creates a source from standard libpq environment variables:
    /// - PGHOST (default: localhost)
    /// - PGPORT (default: 5432)
    /// - PGUSER (default: $USER)
    /// - PGPASSWORD (default: empty)
    /// - PGDATABASE (default: same as PGUSER)
    pub fn from_env() -> Result<Self, SourceError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| SourceError::ConnectionFailure("PGUSER or USER not set".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        Ok(Self::with_connection_string(build_connection_string(
            &host, &port, &user, &password, &database,
        )))
    }

    /// Creates a source from a libpq URL (`postgres://...`) or key=value string.
    pub fn with_connection_string(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            client: None,
            statement_timeout: None,
            last_error: None,
        }
    }

    /// Bounds connection setup and the snapshot query on the server side.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Connects eagerly. Used at startup, where a failure is fatal.
    pub fn try_connect(&mut self) -> Result<(), SourceError> {
        self.ensure_connected()
    }

    /// Returns the last error message, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn ensure_connected(&mut self) -> Result<(), SourceError> {
        if let Some(client) = &self.client {
            if !client.is_closed() {
                return Ok(());
            }
            debug!("connection closed by server, reconnecting");
            self.client = None;
        }

        match self.connect() {
            Ok(client) => {
                info!("connected to PostgreSQL");
                self.client = Some(client);
                self.last_error = None;
                Ok(())
            }
            Err(msg) => {
                self.last_error = Some(msg.clone());
                Err(SourceError::ConnectionFailure(msg))
            }
        }
    }

    fn connect(&self) -> Result<Client, String> {
        let mut config: Config = self
            .connection_string
            .parse()
            .map_err(|e: postgres::Error| format!("invalid connection string: {e}"))?;
        config.application_name("pgtup-agent");
        if let Some(timeout) = self.statement_timeout {
            config.connect_timeout(timeout);
        }

        let mut client = match tls_connector_for(config.get_ssl_mode())? {
            Some(tls) => config.connect(tls),
            None => config.connect(NoTls),
        }
        .map_err(|e| format_postgres_error(&e))?;

        if let Some(timeout) = self.statement_timeout {
            client
                .batch_execute(&format!("SET statement_timeout = {}", timeout.as_millis()))
                .map_err(|e| format_postgres_error(&e))?;
        }

        Ok(client)
    }
}

impl SnapshotSource for PostgresSource {
    fn fetch_snapshot(&mut self) -> Result<SnapshotRows, SourceError> {
        if let Err(e) = self.ensure_connected() {
            return Err(SourceError::SourceUnavailable(e.to_string()));
        }
        let Some(client) = self.client.as_mut() else {
            return Err(SourceError::SourceUnavailable("not connected".to_string()));
        };

        match client.query(STAT_DATABASE_QUERY, &[]) {
            Ok(rows) => {
                self.last_error = None;
                Ok(rows.iter().map(decode_row).collect())
            }
            Err(e) => {
                let msg = format_postgres_error(&e);
                warn!(error = %msg, "pg_stat_database query failed, dropping connection");
                self.last_error = Some(msg.clone());
                self.client = None;
                Err(SourceError::SourceUnavailable(msg))
            }
        }
    }
}

/// TLS connector for an `sslmode`; `None` means a plain connection.
fn tls_connector_for(mode: SslMode) -> Result<Option<MakeTlsConnector>, String> {
    if mode == SslMode::Disable {
        return Ok(None);
    }
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| format!("TLS setup failed: {e}"))?;
    Ok(Some(MakeTlsConnector::new(connector)))
}

fn decode_row(row: &Row) -> Result<TupleCounters, SourceError> {
    let datid = row.try_get::<_, i64>("datid");
    let known_datid = datid.as_ref().ok().copied();
    let decode_err = |reason: String| SourceError::RowDecode {
        datid: known_datid,
        reason,
    };

    let datid = datid.map_err(|e| decode_err(format!("datid: {e}")))?;
    let datname: String = row
        .try_get("datname")
        .map_err(|e| decode_err(format!("datname: {e}")))?;
    let tup_inserted: i64 = row
        .try_get("tup_inserted")
        .map_err(|e| decode_err(format!("tup_inserted: {e}")))?;
    let tup_updated: i64 = row
        .try_get("tup_updated")
        .map_err(|e| decode_err(format!("tup_updated: {e}")))?;

    counters_from_columns(datid, datname, tup_inserted, tup_updated)
}

/// Validates raw column values. Counters are `bigint` in the catalog but must
/// never be negative.
fn counters_from_columns(
    datid: i64,
    datname: String,
    tup_inserted: i64,
    tup_updated: i64,
) -> Result<TupleCounters, SourceError> {
    let non_negative = |column: &str, value: i64| {
        u64::try_from(value).map_err(|_| SourceError::RowDecode {
            datid: Some(datid),
            reason: format!("{column} is negative ({value})"),
        })
    };

    Ok(TupleCounters {
        datid,
        tup_inserted: non_negative("tup_inserted", tup_inserted)?,
        tup_updated: non_negative("tup_updated", tup_updated)?,
        datname,
    })
}

fn build_connection_string(
    host: &str,
    port: &str,
    user: &str,
    password: &str,
    database: &str,
) -> String {
    if password.is_empty() {
        format!("host={host} port={port} user={user} dbname={database}")
    } else {
        format!("host={host} port={port} user={user} password={password} dbname={database}")
    }
}

/// Formats PostgreSQL error message for display.
///
/// Server errors keep severity and message; client-side failures are
/// condensed to what an operator of the agent acts on.
pub fn format_postgres_error(e: &postgres::Error) -> String {
    match e.as_db_error() {
        Some(db_error) => format!("{}: {}", db_error.severity(), db_error.message()),
        None => condense_client_error(&e.to_string()),
    }
}

fn condense_client_error(msg: &str) -> String {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("connection refused") {
        "connection refused".to_string()
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "connection timed out".to_string()
    } else if lower.contains("password authentication failed") {
        "password authentication failed".to_string()
    } else if lower.contains("server does not support tls") {
        "server does not support TLS (sslmode=require)".to_string()
    } else if lower.contains("tls") || lower.contains("ssl") || lower.contains("certificate") {
        format!("TLS negotiation failed: {}", msg.trim())
    } else {
        msg.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_from_columns_accepts_valid_row() {
        let counters = counters_from_columns(5, "app".to_string(), 100, 7).unwrap();
        assert_eq!(counters, TupleCounters::new(5, "app", 100, 7));
    }

    #[test]
    fn counters_from_columns_rejects_negative_counter() {
        let err = counters_from_columns(5, "app".to_string(), 100, -1).unwrap_err();
        assert_eq!(
            err,
            SourceError::RowDecode {
                datid: Some(5),
                reason: "tup_updated is negative (-1)".to_string(),
            }
        );
    }

    #[test]
    fn build_connection_string_omits_empty_password() {
        assert_eq!(
            build_connection_string("db1", "5433", "app", "", "postgres"),
            "host=db1 port=5433 user=app dbname=postgres"
        );
    }

    #[test]
    fn build_connection_string_includes_password() {
        assert_eq!(
            build_connection_string("localhost", "5432", "app", "s3cret", "app"),
            "host=localhost port=5432 user=app password=s3cret dbname=app"
        );
    }

    #[test]
    fn disabled_sslmode_connects_without_tls() {
        assert!(tls_connector_for(SslMode::Disable).unwrap().is_none());
    }

    #[test]
    fn prefer_and_require_negotiate_tls() {
        assert!(tls_connector_for(SslMode::Prefer).unwrap().is_some());
        assert!(tls_connector_for(SslMode::Require).unwrap().is_some());
    }

    #[test]
    fn default_connection_string_prefers_tls() {
        let config: Config = "host=localhost user=app".parse().unwrap();
        assert_eq!(config.get_ssl_mode(), SslMode::Prefer);
        assert!(tls_connector_for(config.get_ssl_mode()).unwrap().is_some());
    }

    #[test]
    fn client_errors_are_condensed() {
        assert_eq!(
            condense_client_error("error connecting to server: Connection refused (os error 111)"),
            "connection refused"
        );
        assert_eq!(
            condense_client_error("error connecting to server: timed out"),
            "connection timed out"
        );
        assert_eq!(
            condense_client_error("error performing TLS handshake: server does not support TLS"),
            "server does not support TLS (sslmode=require)"
        );
        assert_eq!(
            condense_client_error("error performing TLS handshake: bad certificate"),
            "TLS negotiation failed: error performing TLS handshake: bad certificate"
        );
        assert_eq!(condense_client_error(" db closed "), "db closed");
    }

    #[test]
    fn fetch_against_unreachable_server_is_source_unavailable() {
        let mut source = PostgresSource::with_connection_string(
            "host=127.0.0.1 port=1 user=nobody dbname=nowhere connect_timeout=1",
        );
        let err = source.fetch_snapshot().unwrap_err();
        assert!(matches!(err, SourceError::SourceUnavailable(_)), "{err:?}");
        assert!(source.last_error().is_some());
    }

    #[test]
    fn invalid_connection_string_is_connection_failure() {
        let mut source = PostgresSource::with_connection_string("port=notanumber");
        let err = source.try_connect().unwrap_err();
        assert!(matches!(err, SourceError::ConnectionFailure(_)), "{err:?}");
    }
}

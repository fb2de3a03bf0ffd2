//! PostgreSQL source.
//!
//! Rows are streamed with `query_raw`, so the server result set is consumed
//! as the extraction queue drains instead of being buffered in full.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::StreamExt;
use rustls::ClientConfig;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Config as PgConfig, RowStream};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

use super::{quote_ident, RowCursor, SourceField, SourceQuery, SourceSystem};
use crate::config::PostgresConfig;
use crate::core::{Row, SqlValue};
use crate::error::{MigrateError, Result};

type Param = Box<dyn ToSql + Sync + Send>;

/// PostgreSQL source backed by a deadpool connection pool.
pub struct PostgresSource {
    pool: Pool,
}

impl PostgresSource {
    /// Create the pool and test one connection.
    pub async fn new(config: &PostgresConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let max_conns = config.get_max_connections();

        let pool = match config.ssl_mode.to_lowercase().as_str() {
            "disable" => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| MigrateError::pool("source", e, "creating PostgreSQL pool"))?
            }
            mode => {
                let tls_config = Self::build_tls_config(mode)?;
                let tls_connector = MakeRustlsConnect::new(tls_config);
                let mgr = Manager::from_config(pg_config, tls_connector, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| MigrateError::pool("source", e, "creating PostgreSQL pool"))?
            }
        };

        let source = Self { pool };
        source.ping().await?;

        info!(
            "Connected to PostgreSQL source: {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(source)
    }

    /// Build TLS configuration based on ssl_mode.
    fn build_tls_config(ssl_mode: &str) -> Result<ClientConfig> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = match ssl_mode {
            "require" => {
                warn!(
                    "ssl_mode=require: TLS enabled but server certificate is not verified. \
                     Consider using 'verify-full' for production."
                );
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth()
            }
            "verify-ca" | "verify-full" => {
                info!("ssl_mode={}: certificate verification enabled", ssl_mode);
                ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
            other => {
                return Err(MigrateError::Config(format!(
                    "Invalid ssl_mode '{}'. Valid options: disable, require, verify-ca, verify-full",
                    other
                )));
            }
        };

        Ok(config)
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool("source", e, context))
    }
}

/// Wrap the base query with the change filter. Returns the SQL and its parameters.
fn shaped_query(query: &SourceQuery, projection: &str, ordered: bool) -> (String, Vec<Param>) {
    let base = query.base_sql();
    let Some(filter) = &query.change_filter else {
        return (format!("SELECT {} FROM ({}) AS src", projection, base), Vec::new());
    };
    let column = format!("src.{}", quote_ident(&filter.column));
    let order = if ordered {
        format!(" ORDER BY {}", column)
    } else {
        String::new()
    };
    match filter.after.as_ref().and_then(watermark_param) {
        Some((cast, param)) => (
            format!(
                "SELECT {} FROM ({}) AS src WHERE ({})::{} > $1{}",
                projection, base, column, cast, order
            ),
            vec![param],
        ),
        None => (
            format!(
                "SELECT {} FROM ({}) AS src WHERE {} IS NOT NULL{}",
                projection, base, column, order
            ),
            Vec::new(),
        ),
    }
}

/// Bind a watermark with the cast that matches its kind.
fn watermark_param(value: &SqlValue) -> Option<(&'static str, Param)> {
    let bound: (&'static str, Param) = match value {
        SqlValue::Null => return None,
        SqlValue::I64(v) => ("int8", Box::new(*v)),
        SqlValue::F64(v) => ("float8", Box::new(*v)),
        SqlValue::Decimal(v) => ("numeric", Box::new(*v)),
        SqlValue::DateTime(v) => ("timestamp", Box::new(*v)),
        SqlValue::DateTimeOffset(v) => ("timestamptz", Box::new(*v)),
        SqlValue::Date(v) => ("date", Box::new(*v)),
        other => ("text", Box::new(other.key_string().unwrap_or_default())),
    };
    Some(bound)
}

#[async_trait]
impl SourceSystem for PostgresSource {
    async fn open_cursor(&self, query: &SourceQuery, chunk_size: usize) -> Result<Box<dyn RowCursor>> {
        let client = self.client("opening source cursor").await?;
        let (sql, params) = shaped_query(query, "*", true);
        debug!("Source query: {}", sql);

        let statement = client.prepare(&sql).await?;
        let columns: Arc<Vec<String>> =
            Arc::new(statement.columns().iter().map(|c| c.name().to_string()).collect());
        let types: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.type_().name().to_string())
            .collect();

        let stream = client
            .query_raw(&statement, params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)))
            .await?;

        Ok(Box::new(PgCursor {
            _client: client,
            stream: Box::pin(stream),
            columns,
            types,
            chunk_size: chunk_size.max(1),
        }))
    }

    async fn count(&self, query: &SourceQuery) -> Result<Option<u64>> {
        let projection = match &query.distinct_key {
            Some(key) => format!("COUNT(DISTINCT src.{})::int8", quote_ident(key)),
            None => "COUNT(*)::int8".to_string(),
        };
        let (sql, params) = shaped_query(query, &projection, false);
        let client = self.client("counting source rows").await?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        match client.query_one(&sql, &refs).await {
            Ok(row) => Ok(Some(row.get::<_, i64>(0).max(0) as u64)),
            Err(e) => {
                warn!("Source count unavailable, progress will be approximate: {}", e);
                Ok(None)
            }
        }
    }

    async fn describe(&self, sql: &str) -> Result<Vec<SourceField>> {
        let client = self.client("describing source query").await?;
        let statement = client.prepare(sql).await?;
        Ok(statement
            .columns()
            .iter()
            .map(|c| SourceField::new(c.name(), c.type_().name()))
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client("testing PostgreSQL source connection").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn system_type(&self) -> &str {
        "postgres"
    }
}

/// Holds the pooled connection for the lifetime of the stream.
struct PgCursor {
    _client: Object,
    stream: Pin<Box<RowStream>>,
    columns: Arc<Vec<String>>,
    types: Vec<String>,
    chunk_size: usize,
}

#[async_trait]
impl RowCursor for PgCursor {
    async fn next_chunk(&mut self) -> Result<Option<Vec<Row>>> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        while chunk.len() < self.chunk_size {
            match self.stream.next().await {
                Some(row) => {
                    let row = row?;
                    let values = self
                        .types
                        .iter()
                        .enumerate()
                        .map(|(idx, data_type)| convert_pg_row_value(&row, idx, data_type))
                        .collect();
                    chunk.push(Row::new(self.columns.clone(), values));
                }
                None => break,
            }
        }
        Ok(if chunk.is_empty() { None } else { Some(chunk) })
    }
}

/// Convert a PostgreSQL row value to SqlValue based on column type.
fn convert_pg_row_value(row: &tokio_postgres::Row, idx: usize, data_type: &str) -> SqlValue {
    let dt = data_type.to_lowercase();

    let value = match dt.as_str() {
        "bool" | "boolean" => row.try_get::<_, Option<bool>>(idx).ok().flatten().map(SqlValue::Bool),
        "int2" | "smallint" => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::I64(v.into())),
        "int4" | "integer" | "int" => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::I64(v.into())),
        "int8" | "bigint" => row.try_get::<_, Option<i64>>(idx).ok().flatten().map(SqlValue::I64),
        "float4" | "real" => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::F64(v.into())),
        "float8" | "double precision" => {
            row.try_get::<_, Option<f64>>(idx).ok().flatten().map(SqlValue::F64)
        }
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Uuid),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::DateTime),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::DateTimeOffset),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Date),
        "time" => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Time),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Bytes),
        "numeric" => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Decimal),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::Text(v.to_string())),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Text),
    };
    value.unwrap_or(SqlValue::Null)
}

/// Certificate verifier that accepts any certificate.
///
/// Only used for `ssl_mode=require`; `verify-full` validates against the
/// webpki roots.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

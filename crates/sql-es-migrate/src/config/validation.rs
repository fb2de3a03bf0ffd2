//! Configuration validation.

use std::collections::HashSet;

use super::{Config, SourceConnection, TargetConnection};
use crate::error::{MigrateError, Result};

const SSL_MODES: &[&str] = &["disable", "require", "verify-ca", "verify-full"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    for (name, source) in &config.connections.sources {
        match source {
            SourceConnection::Postgres(pg) => {
                if pg.host.is_empty() {
                    return Err(MigrateError::Config(format!(
                        "connections.sources.{}.host is required",
                        name
                    )));
                }
                if pg.database.is_empty() {
                    return Err(MigrateError::Config(format!(
                        "connections.sources.{}.database is required",
                        name
                    )));
                }
                if pg.user.is_empty() {
                    return Err(MigrateError::Config(format!(
                        "connections.sources.{}.user is required",
                        name
                    )));
                }
                if !SSL_MODES.contains(&pg.ssl_mode.to_lowercase().as_str()) {
                    return Err(MigrateError::Config(format!(
                        "connections.sources.{}.ssl_mode '{}' is invalid. Valid options: {}",
                        name,
                        pg.ssl_mode,
                        SSL_MODES.join(", ")
                    )));
                }
                if let Some(0) = pg.max_connections {
                    return Err(MigrateError::Config(format!(
                        "connections.sources.{}.max_connections must be at least 1",
                        name
                    )));
                }
            }
            SourceConnection::Memory(mem) => {
                if let Some(row) = mem.rows.iter().find(|r| r.len() != mem.columns.len()) {
                    return Err(MigrateError::Config(format!(
                        "connections.sources.{}: row has {} values for {} columns",
                        name,
                        row.len(),
                        mem.columns.len()
                    )));
                }
            }
        }
    }

    for (name, target) in &config.connections.targets {
        if let TargetConnection::Elasticsearch(es) = target {
            if !(es.url.starts_with("http://") || es.url.starts_with("https://")) {
                return Err(MigrateError::Config(format!(
                    "connections.targets.{}.url must start with http:// or https://",
                    name
                )));
            }
            if es.password.is_some() && es.username.is_none() {
                return Err(MigrateError::Config(format!(
                    "connections.targets.{}.password requires a username",
                    name
                )));
            }
        }
    }

    // Engine config validation - only check if explicitly set
    let engine = &config.engine;
    if let Some(0) = engine.chunk_size {
        return Err(MigrateError::Config(
            "engine.chunk_size must be at least 1".into(),
        ));
    }
    if let Some(0) = engine.queue_depth {
        return Err(MigrateError::Config(
            "engine.queue_depth must be at least 1".into(),
        ));
    }
    if let Some(0) = engine.bulk_batch_size {
        return Err(MigrateError::Config(
            "engine.bulk_batch_size must be at least 1".into(),
        ));
    }
    if engine.retry.max_attempts == 0 {
        return Err(MigrateError::Config(
            "engine.retry.max_attempts must be at least 1".into(),
        ));
    }
    if !(0.0..=1.0).contains(&engine.retry.jitter) {
        return Err(MigrateError::Config(
            "engine.retry.jitter must be between 0.0 and 1.0".into(),
        ));
    }
    if engine.retry.base_delay_ms > engine.retry.max_delay_ms {
        return Err(MigrateError::Config(
            "engine.retry.base_delay_ms cannot exceed max_delay_ms".into(),
        ));
    }
    if engine.transform.large_text_threshold_bytes == 0 {
        return Err(MigrateError::Config(
            "engine.large_text_threshold_bytes must be at least 1".into(),
        ));
    }

    if !matches!(config.logging.format.as_str(), "text" | "json") {
        return Err(MigrateError::Config(format!(
            "logging.format must be 'text' or 'json', got '{}'",
            config.logging.format
        )));
    }

    let mut names = HashSet::new();
    for mapping in &config.mappings {
        if !names.insert(mapping.name.as_str()) {
            return Err(MigrateError::Config(format!(
                "duplicate mapping name '{}'",
                mapping.name
            )));
        }
        if !config
            .connections
            .sources
            .contains_key(&mapping.source_connection)
        {
            return Err(MigrateError::Config(format!(
                "mapping '{}' references unknown source connection '{}'",
                mapping.name, mapping.source_connection
            )));
        }
        if !config
            .connections
            .targets
            .contains_key(&mapping.target_connection)
        {
            return Err(MigrateError::Config(format!(
                "mapping '{}' references unknown target connection '{}'",
                mapping.name, mapping.target_connection
            )));
        }
        mapping.validate()?;
    }

    Ok(())
}

//! # Configuration
//!
//! Plain structs with `Default` impls. The satellite process takes one
//! [`SatelliteConfig`] at start; internal table names are overridable for
//! embedders that need a different schema prefix.

use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Auth
// =============================================================================

/// Credentials for the replication service handshake.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// JWT presented during the auth handshake. Required.
    pub token: String,
    /// Fixed client id. When absent, the id persisted in meta is used, or a
    /// fresh v4 UUID is generated on first start.
    pub client_id: Option<String>,
}

impl AuthConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Rejects unusable credentials before any connection attempt.
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(Error::Config("auth token must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Resolved auth state carried through the connect handshake.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub client_id: String,
    pub token: String,
}

// =============================================================================
// Table Names
// =============================================================================

/// Names of the internal bookkeeping tables. Defaults match the on-disk
/// layout other satellite clients use; embedders may re-prefix them.
#[derive(Debug, Clone)]
pub struct TableNames {
    /// Schema namespace for every statement. Always `main` in practice.
    pub namespace: String,
    pub meta: String,
    pub oplog: String,
    pub shadow: String,
    pub migrations: String,
    pub triggers: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            namespace: "main".to_string(),
            meta: "_electric_meta".to_string(),
            oplog: "_electric_oplog".to_string(),
            shadow: "_electric_shadow".to_string(),
            migrations: "_electric_migrations".to_string(),
            triggers: "_electric_triggers".to_string(),
        }
    }
}

impl TableNames {
    /// Fully-qualified quoted name, e.g. `"main"."_electric_oplog"`.
    fn qualified(&self, table: &str) -> String {
        format!("\"{}\".\"{}\"", self.namespace, table)
    }

    pub fn meta_qualified(&self) -> String {
        self.qualified(&self.meta)
    }

    pub fn oplog_qualified(&self) -> String {
        self.qualified(&self.oplog)
    }

    pub fn shadow_qualified(&self) -> String {
        self.qualified(&self.shadow)
    }

    pub fn migrations_qualified(&self) -> String {
        self.qualified(&self.migrations)
    }

    pub fn triggers_qualified(&self) -> String {
        self.qualified(&self.triggers)
    }

    /// True for tables the trigger installer must skip.
    pub fn is_internal(&self, table: &str) -> bool {
        table == self.meta
            || table == self.oplog
            || table == self.shadow
            || table == self.migrations
            || table == self.triggers
            || table.starts_with("sqlite_")
    }
}

// =============================================================================
// Satellite Config
// =============================================================================

/// Tunables for the satellite process.
#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    /// Replication endpoint, `host:port`. Unused by clients constructed over
    /// an existing stream.
    pub url: Option<String>,

    /// Cadence of the background timer that hints "potentially changed" and
    /// triggers a throttled snapshot.
    pub polling_interval: Duration,

    /// Minimum spacing between two snapshots. Requests inside the window
    /// coalesce; the trailing request runs when the window elapses.
    pub min_snapshot_window: Duration,

    /// Recover from a behind-window start-replication error by clearing
    /// local replication state and re-subscribing previously synced shapes.
    pub clear_on_behind_window: bool,

    /// Internal table names.
    pub table_names: TableNames,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            url: None,
            polling_interval: Duration::from_secs(2),
            min_snapshot_window: Duration::from_millis(40),
            clear_on_behind_window: true,
            table_names: TableNames::default(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Host Store (§4.A): the durable mapping of hosts keyed by name, with
//! unique-MAC/IP constraints and lifecycle events.
//!
//! Backed by SQLite through `sqlx`, in WAL mode for concurrent reader/writer
//! access.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use node_agent_core::{format_mac, Host, HostPatch, HostStatus, LifecycleBus, LifecycleEvent, NewHost};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// SQLite-backed implementation of the Host Store.
///
/// Writes are serialised by SQLite's own single-writer semantics under WAL
/// mode; readers see a consistent snapshot because every read is a single
/// `SELECT` against a connection from the pool.
pub struct HostStore {
    pool: SqlitePool,
    bus: LifecycleBus,
}

fn row_to_host(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Host> {
    let status_str: String = row.try_get("status").map_err(StoreError::from)?;
    let status = match status_str.as_str() {
        "awake" => HostStatus::Awake,
        _ => HostStatus::Asleep,
    };
    let ping_responsive: Option<i64> = row.try_get("ping_responsive").map_err(StoreError::from)?;
    let tags_json: Option<String> = row.try_get("tags").map_err(StoreError::from)?;
    let tags: Vec<String> = tags_json
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(Host {
        name: row.try_get("name").map_err(StoreError::from)?,
        mac: row.try_get("mac").map_err(StoreError::from)?,
        ip: row.try_get("ip").map_err(StoreError::from)?,
        status,
        last_seen: row
            .try_get::<Option<DateTime<Utc>>, _>("last_seen")
            .map_err(StoreError::from)?,
        discovered: row.try_get::<i64, _>("discovered").map_err(StoreError::from)? != 0,
        ping_responsive: ping_responsive.map(|v| v != 0),
        notes: row.try_get("notes").map_err(StoreError::from)?,
        tags,
    })
}

impl HostStore {
    /// Open (creating if absent) the SQLite database at `path` and ensure
    /// the schema exists.
    pub async fn open<P: AsRef<Path>>(path: P, bus: LifecycleBus) -> StoreResult<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path_str}"))
            .map_err(|e| StoreError::Connect(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        info!(path = %path_str, "opened host store");
        let store = Self { pool, bus };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await
            .ok();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
                name TEXT PRIMARY KEY,
                mac TEXT NOT NULL UNIQUE,
                ip TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                last_seen TIMESTAMP,
                discovered INTEGER NOT NULL DEFAULT 0,
                ping_responsive INTEGER,
                notes TEXT,
                tags TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Schema(e.to_string()))?;

        debug!("host store schema ready");
        Ok(())
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<LifecycleEvent> {
        self.bus.subscribe()
    }

    pub async fn get_all(&self) -> StoreResult<Vec<Host>> {
        let rows = sqlx::query("SELECT * FROM hosts ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;
        rows.iter().map(row_to_host).collect()
    }

    pub async fn get_by_name(&self, name: &str) -> StoreResult<Option<Host>> {
        let row = sqlx::query("SELECT * FROM hosts WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        row.as_ref().map(row_to_host).transpose()
    }

    pub async fn get_by_mac(&self, mac: &str) -> StoreResult<Option<Host>> {
        let row = sqlx::query("SELECT * FROM hosts WHERE mac = ?")
            .bind(mac)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        row.as_ref().map(row_to_host).transpose()
    }

    fn map_write_error(e: sqlx::Error) -> StoreError {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.is_unique_violation() {
                return StoreError::UniquenessConflict(db_err.message().to_string());
            }
        }
        StoreError::from(e)
    }

    /// Insert a new, manually-added host (`discovered = false`). `mac` is
    /// canonicalised via [`format_mac`] before it is persisted, so the
    /// stored value always matches what discovery and wire payloads use to
    /// key this row, regardless of the casing/separator it arrived in.
    pub async fn add(&self, name: &str, mac: &str, ip: &str, new: NewHost) -> StoreResult<Host> {
        let mac = format_mac(mac).map_err(|e| StoreError::Validation(e.to_string()))?;
        let tags_json = serde_json::to_string(&new.tags).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            "INSERT INTO hosts (name, mac, ip, status, discovered, notes, tags) \
             VALUES (?, ?, ?, 'asleep', 0, ?, ?)",
        )
        .bind(name)
        .bind(&mac)
        .bind(ip)
        .bind(&new.notes)
        .bind(&tags_json)
        .execute(&self.pool)
        .await
        .map_err(Self::map_write_error)?;

        let host = self
            .get_by_name(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        self.bus.publish(LifecycleEvent::HostDiscovered(host.clone()));
        Ok(host)
    }

    /// Insert a discovered host without emitting a lifecycle event; the
    /// scan orchestrator (§4.C) emits `host-discovered` itself after the
    /// status/seen fields are also set.
    pub async fn add_suppressed(&self, name: &str, mac: &str, ip: &str) -> StoreResult<()> {
        let mac = format_mac(mac).map_err(|e| StoreError::Validation(e.to_string()))?;
        sqlx::query(
            "INSERT INTO hosts (name, mac, ip, status, discovered) VALUES (?, ?, ?, 'asleep', 1)",
        )
        .bind(name)
        .bind(&mac)
        .bind(ip)
        .execute(&self.pool)
        .await
        .map_err(Self::map_write_error)?;
        Ok(())
    }

    /// Apply a partial update. `emit_lifecycle_event` controls whether
    /// `host-updated` is published here or left for the caller to emit
    /// explicitly (agent-driven mutations, per §7).
    pub async fn update(
        &self,
        name: &str,
        patch: HostPatch,
        emit_lifecycle_event: bool,
    ) -> StoreResult<Host> {
        let mut tx: Transaction<'_, Sqlite> =
            self.pool.begin().await.map_err(StoreError::from)?;

        let target_name = patch.name.as_deref().unwrap_or(name);
        if let Some(ref new_name) = patch.name {
            if new_name != name {
                sqlx::query("UPDATE hosts SET name = ? WHERE name = ?")
                    .bind(new_name)
                    .bind(name)
                    .execute(&mut *tx)
                    .await
                    .map_err(Self::map_write_error)?;
            }
        }
        if let Some(ref mac) = patch.mac {
            let mac = format_mac(mac).map_err(|e| StoreError::Validation(e.to_string()))?;
            sqlx::query("UPDATE hosts SET mac = ? WHERE name = ?")
                .bind(mac)
                .bind(target_name)
                .execute(&mut *tx)
                .await
                .map_err(Self::map_write_error)?;
        }
        if let Some(ref ip) = patch.ip {
            sqlx::query("UPDATE hosts SET ip = ? WHERE name = ?")
                .bind(ip)
                .bind(target_name)
                .execute(&mut *tx)
                .await
                .map_err(Self::map_write_error)?;
        }
        if let Some(status) = patch.status {
            let status_str = status.to_string();
            sqlx::query("UPDATE hosts SET status = ? WHERE name = ?")
                .bind(status_str)
                .bind(target_name)
                .execute(&mut *tx)
                .await
                .map_err(Self::map_write_error)?;
        }
        if let Some(ref notes) = patch.notes {
            sqlx::query("UPDATE hosts SET notes = ? WHERE name = ?")
                .bind(notes)
                .bind(target_name)
                .execute(&mut *tx)
                .await
                .map_err(Self::map_write_error)?;
        }
        if let Some(ref tags) = patch.tags {
            let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
            sqlx::query("UPDATE hosts SET tags = ? WHERE name = ?")
                .bind(tags_json)
                .bind(target_name)
                .execute(&mut *tx)
                .await
                .map_err(Self::map_write_error)?;
        }

        let row = sqlx::query("SELECT * FROM hosts WHERE name = ?")
            .bind(target_name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::from)?
            .ok_or_else(|| StoreError::NotFound(target_name.to_string()))?;
        let host = row_to_host(&row)?;

        tx.commit().await.map_err(StoreError::from)?;

        if emit_lifecycle_event {
            self.bus.publish(LifecycleEvent::HostUpdated(host.clone()));
        }
        Ok(host)
    }

    pub async fn delete(&self, name: &str, emit_lifecycle_event: bool) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM hosts WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }

        if emit_lifecycle_event {
            self.bus.publish(LifecycleEvent::HostRemoved {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub async fn update_status(&self, name: &str, status: HostStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE hosts SET status = ? WHERE name = ?")
            .bind(status.to_string())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(())
    }

    /// Update status + `lastSeen` + `pingResponsive` atomically, keyed by
    /// MAC (used by discovery/scan flows). Fails with `NotFound` if no row
    /// matches, per §4.A.
    pub async fn update_seen(
        &self,
        mac: &str,
        status: HostStatus,
        ping_responsive: Option<bool>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE hosts SET status = ?, last_seen = ?, ping_responsive = ? WHERE mac = ?",
        )
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(ping_responsive.map(|b| b as i64))
        .bind(mac)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(mac.to_string()));
        }
        Ok(())
    }

    pub async fn count(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM hosts")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.try_get("c").map_err(StoreError::from)?)
    }

    pub fn emit_scan_complete(&self, host_count: usize) {
        self.bus.publish(LifecycleEvent::ScanComplete { host_count });
    }

    pub fn emit_host_discovered(&self, host: Host) {
        self.bus.publish(LifecycleEvent::HostDiscovered(host));
    }

    /// Close the underlying connection pool. Takes `&self` rather than
    /// consuming the store since callers typically hold it behind an `Arc`
    /// shared with the scan orchestrator and agent service.
    pub async fn close(&self) {
        self.pool.close().await;
        warn!("host store pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_store() -> HostStore {
        HostStore::open(":memory:", LifecycleBus::new()).await.unwrap()
    }

    #[tokio::test]
    async fn add_then_get_by_name_and_mac() {
        let store = new_store().await;
        store
            .add("PHANTOM", "AA:BB:CC:DD:EE:FF", "192.168.1.10", NewHost::default())
            .await
            .unwrap();

        let by_name = store.get_by_name("PHANTOM").await.unwrap().unwrap();
        assert_eq!(by_name.mac, "AA:BB:CC:DD:EE:FF");
        let by_mac = store.get_by_mac("AA:BB:CC:DD:EE:FF").await.unwrap().unwrap();
        assert_eq!(by_mac.name, "PHANTOM");
    }

    #[tokio::test]
    async fn duplicate_mac_is_a_uniqueness_conflict() {
        let store = new_store().await;
        store
            .add("A", "AA:BB:CC:DD:EE:FF", "192.168.1.10", NewHost::default())
            .await
            .unwrap();
        let err = store
            .add("B", "AA:BB:CC:DD:EE:FF", "192.168.1.11", NewHost::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniquenessConflict(_)));
    }

    #[tokio::test]
    async fn update_seen_fails_for_unknown_mac() {
        let store = new_store().await;
        let err = store
            .update_seen("AA:BB:CC:DD:EE:FF", HostStatus::Awake, Some(true))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_seen_sets_status_and_ping_responsive() {
        let store = new_store().await;
        store
            .add("A", "AA:BB:CC:DD:EE:FF", "192.168.1.10", NewHost::default())
            .await
            .unwrap();
        store
            .update_seen("AA:BB:CC:DD:EE:FF", HostStatus::Awake, Some(true))
            .await
            .unwrap();
        let host = store.get_by_name("A").await.unwrap().unwrap();
        assert_eq!(host.status, HostStatus::Awake);
        assert_eq!(host.ping_responsive, Some(true));
        assert!(host.last_seen.is_some());
    }

    #[tokio::test]
    async fn rename_via_update_moves_primary_key() {
        let store = new_store().await;
        store
            .add("OLD", "AA:BB:CC:DD:EE:FF", "192.168.1.10", NewHost::default())
            .await
            .unwrap();
        let patch = HostPatch {
            current_name: Some("OLD".to_string()),
            name: Some("NEW".to_string()),
            ..Default::default()
        };
        store.update("OLD", patch, false).await.unwrap();
        assert!(store.get_by_name("OLD").await.unwrap().is_none());
        assert!(store.get_by_name("NEW").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_missing_host_is_not_found() {
        let store = new_store().await;
        let err = store.delete("GHOST", true).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}

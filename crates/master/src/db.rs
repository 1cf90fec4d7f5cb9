use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::device::{
    Device, DeviceDirectory, DeviceId, MasterActiveState, PhysicalZone, StateField,
};
use crate::error::DirectoryError;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveConfig {
    pub id: DeviceId,
    pub name: String,
    pub enabled: bool,
    pub configured: bool,
    pub zones: Vec<SlaveZoneConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SlaveZoneConfig {
    pub name: String,
    pub max_duration_min: i64,
    pub gpio_pin: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    pub id: DeviceId,
    pub name: String,
    /// Configured controllers, in configuration order.
    pub controllers: Vec<DeviceId>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StateChange {
    pub ts: i64,
    pub master_id: DeviceId,
    pub active_zone: i64,
    pub active_slave_id: i64,
    pub active_slave_zone: i64,
}

#[derive(FromRow)]
struct DeviceRow {
    id: i64,
    name: String,
    enabled: bool,
    configured: bool,
    active_zone: i64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/sprinkler/sprinkler-master.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Device config
    // ----------------------------

    pub async fn upsert_slave(&self, s: &SlaveConfig) -> Result<()> {
        let mut tx = self.pool.begin().await.context("upsert_slave: begin failed")?;

        sqlx::query(
            r#"
            INSERT INTO devices (id, name, kind, enabled, configured)
            VALUES (?, ?, 'slave', ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              kind=excluded.kind,
              enabled=excluded.enabled,
              configured=excluded.configured
            "#,
        )
        .bind(s.id)
        .bind(&s.name)
        .bind(s.enabled)
        .bind(s.configured)
        .execute(&mut *tx)
        .await
        .context("upsert_slave failed")?;

        sqlx::query("DELETE FROM slave_zones WHERE device_id = ?")
            .bind(s.id)
            .execute(&mut *tx)
            .await
            .context("upsert_slave: clearing zones failed")?;

        for (idx, z) in s.zones.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO slave_zones (device_id, zone_index, name, max_duration_min, gpio_pin)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(s.id)
            .bind(idx as i64)
            .bind(&z.name)
            .bind(z.max_duration_min)
            .bind(z.gpio_pin)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upsert_slave: inserting zone {} failed", idx + 1))?;
        }

        tx.commit().await.context("upsert_slave: commit failed")?;
        Ok(())
    }

    pub async fn upsert_master(&self, m: &MasterConfig) -> Result<()> {
        let mut tx = self.pool.begin().await.context("upsert_master: begin failed")?;

        sqlx::query(
            r#"
            INSERT INTO devices (id, name, kind)
            VALUES (?, ?, 'master')
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              kind=excluded.kind
            "#,
        )
        .bind(m.id)
        .bind(&m.name)
        .execute(&mut *tx)
        .await
        .context("upsert_master failed")?;

        sqlx::query("DELETE FROM master_controllers WHERE master_id = ?")
            .bind(m.id)
            .execute(&mut *tx)
            .await
            .context("upsert_master: clearing controllers failed")?;

        for (pos, slave_id) in m.controllers.iter().enumerate() {
            sqlx::query(
                "INSERT INTO master_controllers (master_id, position, slave_id) VALUES (?, ?, ?)",
            )
            .bind(m.id)
            .bind(pos as i64)
            .bind(slave_id)
            .execute(&mut *tx)
            .await
            .context("upsert_master: inserting controller failed")?;
        }

        tx.commit().await.context("upsert_master: commit failed")?;
        Ok(())
    }

    pub async fn delete_device(&self, id: DeviceId) -> Result<()> {
        sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_device failed")?;
        Ok(())
    }

    pub async fn load_slaves(&self) -> Result<Vec<SlaveConfig>> {
        let rows: Vec<DeviceRow> = sqlx::query_as(
            r#"
            SELECT id, name, enabled, configured, active_zone
            FROM devices
            WHERE kind = 'slave'
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_slaves failed")?;

        let mut slaves = Vec::with_capacity(rows.len());
        for r in rows {
            slaves.push(SlaveConfig {
                id: r.id,
                zones: self.zones_for(r.id).await?,
                name: r.name,
                enabled: r.enabled,
                configured: r.configured,
            });
        }
        Ok(slaves)
    }

    pub async fn load_masters(&self) -> Result<Vec<MasterConfig>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, name FROM devices WHERE kind = 'master' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_masters failed")?;

        let mut masters = Vec::with_capacity(rows.len());
        for (id, name) in rows {
            let controllers: Vec<(i64,)> = sqlx::query_as(
                "SELECT slave_id FROM master_controllers WHERE master_id = ? ORDER BY position",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .context("load_masters: controllers failed")?;

            masters.push(MasterConfig {
                id,
                name,
                controllers: controllers.into_iter().map(|(s,)| s).collect(),
            });
        }
        Ok(masters)
    }

    async fn zones_for(&self, device_id: DeviceId) -> Result<Vec<SlaveZoneConfig>> {
        sqlx::query_as(
            r#"
            SELECT name, max_duration_min, gpio_pin
            FROM slave_zones
            WHERE device_id = ?
            ORDER BY zone_index
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("zones_for failed")
    }

    // ----------------------------
    // Device records + state
    // ----------------------------

    pub async fn get_device(&self, id: DeviceId) -> Result<Option<Device>> {
        let row: Option<DeviceRow> = sqlx::query_as(
            "SELECT id, name, enabled, configured, active_zone FROM devices WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_device failed")?;

        let Some(r) = row else {
            return Ok(None);
        };

        let zones = self
            .zones_for(id)
            .await?
            .into_iter()
            .map(|z| PhysicalZone {
                name: z.name,
                max_duration_min: z.max_duration_min.max(0) as u32,
            })
            .collect();

        Ok(Some(Device {
            id: r.id,
            name: r.name,
            enabled: r.enabled,
            configured: r.configured,
            zones,
            active_zone: r.active_zone.max(0) as u32,
        }))
    }

    /// Record the zone a controller reports as running (0 = idle).
    pub async fn set_device_active_zone(&self, id: DeviceId, zone: u32) -> Result<()> {
        let res = sqlx::query("UPDATE devices SET active_zone = ? WHERE id = ?")
            .bind(i64::from(zone))
            .bind(id)
            .execute(&self.pool)
            .await
            .context("set_device_active_zone failed")?;
        if res.rows_affected() == 0 {
            bail!("device {id} not found");
        }
        Ok(())
    }

    pub async fn get_props(&self, id: DeviceId) -> Result<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM device_props WHERE device_id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await
                .context("get_props failed")?;
        Ok(rows.into_iter().collect())
    }

    pub async fn replace_props(
        &self,
        id: DeviceId,
        props: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("replace_props: begin failed")?;

        sqlx::query("DELETE FROM device_props WHERE device_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("replace_props: clear failed")?;

        for (key, value) in props {
            sqlx::query("INSERT INTO device_props (device_id, key, value) VALUES (?, ?, ?)")
                .bind(id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("replace_props: insert {key} failed"))?;
        }

        tx.commit().await.context("replace_props: commit failed")?;
        Ok(())
    }

    pub async fn set_state_field(&self, id: DeviceId, field: StateField, value: i64) -> Result<()> {
        let sql = match field {
            StateField::ActiveZone => "UPDATE devices SET active_zone = ? WHERE id = ?",
            StateField::ActiveSlaveId => "UPDATE devices SET active_slave_id = ? WHERE id = ?",
            StateField::ActiveSlaveZone => "UPDATE devices SET active_slave_zone = ? WHERE id = ?",
        };
        let res = sqlx::query(sql)
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("set_state_field {} failed", field.as_str()))?;
        if res.rows_affected() == 0 {
            bail!("device {id} not found");
        }
        Ok(())
    }

    /// Write all three active-state fields and append a history row, in one
    /// transaction.
    pub async fn write_active_state(&self, id: DeviceId, st: MasterActiveState) -> Result<()> {
        let mut tx = self.pool.begin().await.context("write_active_state: begin failed")?;

        let res = sqlx::query(
            r#"
            UPDATE devices
            SET active_zone = ?, active_slave_id = ?, active_slave_zone = ?
            WHERE id = ?
            "#,
        )
        .bind(i64::from(st.active_zone))
        .bind(st.active_slave_id)
        .bind(i64::from(st.active_slave_zone))
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("write_active_state failed")?;

        if res.rows_affected() == 0 {
            bail!("device {id} not found");
        }

        sqlx::query(
            r#"
            INSERT INTO state_changes
              (ts, master_id, active_zone, active_slave_id, active_slave_zone)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .bind(id)
        .bind(i64::from(st.active_zone))
        .bind(st.active_slave_id)
        .bind(i64::from(st.active_slave_zone))
        .execute(&mut *tx)
        .await
        .context("write_active_state: history insert failed")?;

        tx.commit().await.context("write_active_state: commit failed")?;
        Ok(())
    }

    pub async fn get_active_state(&self, id: DeviceId) -> Result<Option<MasterActiveState>> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            "SELECT active_zone, active_slave_id, active_slave_zone FROM devices WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_active_state failed")?;

        Ok(row.map(|(zone, slave, slave_zone)| {
            MasterActiveState::running(zone.max(0) as u32, slave, slave_zone.max(0) as u32)
        }))
    }

    /// Most recent state changes for a master, newest first.
    pub async fn recent_state_changes(
        &self,
        master: DeviceId,
        limit: i64,
    ) -> Result<Vec<StateChange>> {
        sqlx::query_as(
            r#"
            SELECT ts, master_id, active_zone, active_slave_id, active_slave_zone
            FROM state_changes
            WHERE master_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(master)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_state_changes failed")
    }
}

// ---------------------------------------------------------------------------
// Device directory backed by the database
// ---------------------------------------------------------------------------

#[async_trait]
impl DeviceDirectory for Db {
    async fn resolve(&self, id: DeviceId) -> Result<Option<Device>, DirectoryError> {
        Ok(self.get_device(id).await?)
    }

    async fn set_properties(
        &self,
        id: DeviceId,
        props: &BTreeMap<String, String>,
    ) -> Result<(), DirectoryError> {
        Ok(self.replace_props(id, props).await?)
    }

    async fn set_state(
        &self,
        id: DeviceId,
        field: StateField,
        value: i64,
    ) -> Result<(), DirectoryError> {
        Ok(self.set_state_field(id, field, value).await?)
    }

    async fn set_active_state(
        &self,
        id: DeviceId,
        state: MasterActiveState,
    ) -> Result<(), DirectoryError> {
        Ok(self.write_active_state(id, state).await?)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

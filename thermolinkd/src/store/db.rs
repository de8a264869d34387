use std::path::Path;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::types::{
    ControllerSettings, NetSettings, OutputId, OutputSettings, SensorId, TempProfile,
};

const KEY_AUTH_TOKEN: &str = "auth_token";
const KEY_NET_SETTINGS: &str = "net_settings";

fn controller_key(sensor_id: SensorId) -> String {
    format!("controller/{sensor_id}")
}

fn output_key(output_id: OutputId) -> String {
    format!("output/{output_id}")
}

fn profile_key(index: u32) -> String {
    format!("temp_profile/{index}")
}

/// Persistent device configuration. Values are JSON documents keyed by name.
pub struct SettingsDb {
    conn: Connection,
}

impl SettingsDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read setting {key}"))?;

        raw.map(|json| {
            serde_json::from_str(&json).with_context(|| format!("Corrupt setting {key}"))
        })
        .transpose()
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("Failed to serialize setting {key}"))?;

        self.conn
            .execute(
                r#"
                INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![key, json, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to write setting {key}"))?;

        Ok(())
    }

    /// Empty when the device has never been activated
    pub fn auth_token(&self) -> Result<String> {
        Ok(self.get::<String>(KEY_AUTH_TOKEN)?.unwrap_or_default())
    }

    pub fn set_auth_token(&self, token: &str) -> Result<()> {
        self.put(KEY_AUTH_TOKEN, &token)
    }

    pub fn net_settings(&self) -> Result<Option<NetSettings>> {
        self.get(KEY_NET_SETTINGS)
    }

    pub fn set_net_settings(&self, settings: &NetSettings) -> Result<()> {
        self.put(KEY_NET_SETTINGS, settings)
    }

    pub fn controller_settings(&self, sensor_id: SensorId) -> Result<ControllerSettings> {
        Ok(self
            .get(&controller_key(sensor_id))?
            .unwrap_or_else(|| ControllerSettings::default_for(sensor_id)))
    }

    pub fn set_controller_settings(&self, settings: &ControllerSettings) -> Result<()> {
        self.put(&controller_key(settings.sensor_id), settings)
    }

    pub fn output_settings(&self, output_id: OutputId) -> Result<OutputSettings> {
        Ok(self
            .get(&output_key(output_id))?
            .unwrap_or_else(|| OutputSettings::default_for(output_id)))
    }

    pub fn set_output_settings(&self, settings: &OutputSettings) -> Result<()> {
        self.put(&output_key(settings.output_id), settings)
    }

    pub fn temp_profile(&self, index: u32) -> Result<Option<TempProfile>> {
        self.get(&profile_key(index))
    }

    pub fn set_temp_profile(&self, index: u32, profile: &TempProfile) -> Result<()> {
        self.put(&profile_key(index), profile)
    }
}

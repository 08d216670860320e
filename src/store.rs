use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

const META_PATCH_KEY: &str = "meta_patch_marker";

#[derive(Debug, Clone)]
pub struct MatchRecord {
    pub puuid: String,
    pub recorded_at: String,
    pub score: f64,
    pub win: bool,
}

/// Small sqlite-backed settings store: per-advisor enable flags, the cached
/// meta-patch marker, and recent match records for the post-game advisor.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let store = Self { path };
        store.init_db()?;
        Ok(store)
    }

    pub fn open_default() -> Result<Self> {
        let base = dirs::config_dir()
            .context("unable to locate OS config directory for settings store")?
            .join("rift-coach");
        std::fs::create_dir_all(&base)
            .with_context(|| format!("failed creating store dir at {}", base.display()))?;
        Self::open(base.join("coach.db"))
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("failed opening sqlite db at {}", self.path.display()))
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT
);
CREATE TABLE IF NOT EXISTS match_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    puuid TEXT,
    recorded_at TEXT,
    score REAL,
    win INTEGER
);
"#,
        )
        .context("failed creating settings tables")?;
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| format!("failed reading setting {key}"))
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .with_context(|| format!("failed writing setting {key}"))?;
        Ok(())
    }

    /// Advisors default to enabled until a flag is persisted.
    pub fn advisor_enabled(&self, name: &str) -> Result<bool> {
        let key = format!("agent_{name}_enabled");
        Ok(self
            .get_setting(&key)?
            .map(|value| value != "false")
            .unwrap_or(true))
    }

    pub fn set_advisor_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let key = format!("agent_{name}_enabled");
        self.set_setting(&key, if enabled { "true" } else { "false" })
    }

    pub fn meta_patch_marker(&self) -> Result<Option<String>> {
        self.get_setting(META_PATCH_KEY)
    }

    pub fn set_meta_patch_marker(&self, marker: &str) -> Result<()> {
        self.set_setting(META_PATCH_KEY, marker)
    }

    pub fn insert_match_record(&self, puuid: &str, score: f64, win: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO match_records (puuid, recorded_at, score, win) VALUES (?1, ?2, ?3, ?4)",
            params![puuid, Utc::now().to_rfc3339(), score, win as i64],
        )
        .context("failed inserting match record")?;
        Ok(())
    }

    pub fn recent_match_records(&self, limit: usize) -> Result<Vec<MatchRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT puuid, recorded_at, score, win FROM match_records ORDER BY id DESC LIMIT ?1",
            )
            .context("failed preparing match record query")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(MatchRecord {
                    puuid: row.get(0)?,
                    recorded_at: row.get(1)?,
                    score: row.get(2)?,
                    win: row.get::<_, i64>(3)? != 0,
                })
            })
            .context("failed querying match records")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed decoding match record row")?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::SystemTime};

    use super::SettingsStore;

    fn temp_store() -> (SettingsStore, PathBuf) {
        let unique = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("rift_coach_store_{unique}.db"));
        let store = SettingsStore::open(path.clone()).expect("store should open");
        (store, path)
    }

    #[test]
    fn advisor_flags_default_to_enabled() {
        let (store, path) = temp_store();
        assert!(store.advisor_enabled("draft").expect("flag read"));
        store
            .set_advisor_enabled("draft", false)
            .expect("flag write");
        assert!(!store.advisor_enabled("draft").expect("flag read"));
        store.set_advisor_enabled("draft", true).expect("flag write");
        assert!(store.advisor_enabled("draft").expect("flag read"));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn meta_patch_marker_round_trips() {
        let (store, path) = temp_store();
        assert!(store.meta_patch_marker().expect("marker read").is_none());
        store.set_meta_patch_marker("14.3.1").expect("marker write");
        assert_eq!(
            store.meta_patch_marker().expect("marker read").as_deref(),
            Some("14.3.1")
        );
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn match_records_return_most_recent_first() {
        let (store, path) = temp_store();
        store
            .insert_match_record("puuid-1", 6.5, true)
            .expect("insert");
        store
            .insert_match_record("puuid-1", 3.2, false)
            .expect("insert");
        let records = store.recent_match_records(10).expect("query");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].puuid, "puuid-1");
        assert!(!records[0].recorded_at.is_empty());
        assert!((records[0].score - 3.2).abs() < f64::EPSILON);
        assert!(!records[0].win);
        assert!(records[1].win);
        std::fs::remove_file(path).ok();
    }
}

//! kapply persistence: the managed set of identities applied by the previous run.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use kapply_core::{Identity, ManagedSet, TypeCategory};
use metrics::{counter, histogram};
use tracing::debug;

/// Bookkeeping of identities applied by a previous run, read before a run
/// starts and written by a single writer once the apply phase completes.
pub trait ManagedSetStore: Send + Sync {
    fn load(&self) -> Result<ManagedSet>;
    fn save(&self, set: &ManagedSet) -> Result<()>;
}

/// SQLite-backed store scoped to one environment. Simple, synchronous.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
    env: String,
}

impl SqliteStore {
    pub fn open_default(env: &str) -> Result<Self> {
        let path = std::env::var("KAPPLY_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path, env)
    }

    pub fn open(path: &str, env: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS managed (
                env         TEXT NOT NULL,
                namespace   TEXT NOT NULL,
                name        TEXT NOT NULL,
                api_version TEXT NOT NULL,
                kind        TEXT NOT NULL,
                PRIMARY KEY (env, namespace, name)
            )",
            [],
        ).context("creating managed table")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS saves (
                env TEXT PRIMARY KEY,
                ts  INTEGER NOT NULL,
                n   INTEGER NOT NULL
            )",
            [],
        ).context("creating saves table")?;
        let me = Self { db: Mutex::new(db), env: env.to_string() };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    pub fn env(&self) -> &str { &self.env }

    /// Unix timestamp of the last save for this environment.
    pub fn last_saved(&self) -> Result<Option<i64>> {
        let db = self.db.lock().map_err(|_| anyhow!("managed-set db lock poisoned"))?;
        let mut stmt = db.prepare("SELECT ts FROM saves WHERE env = ?1")?;
        let mut rows = stmt.query([&self.env])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

impl ManagedSetStore for SqliteStore {
    fn load(&self) -> Result<ManagedSet> {
        let started = std::time::Instant::now();
        let db = self.db.lock().map_err(|_| anyhow!("managed-set db lock poisoned"))?;
        let mut stmt = db.prepare(
            "SELECT namespace, name, api_version, kind FROM managed WHERE env = ?1 ORDER BY namespace, name",
        )?;
        let mut rows = stmt.query([&self.env])?;
        let mut out = ManagedSet::new();
        while let Some(row) = rows.next()? {
            let namespace: String = row.get(0)?;
            let name: String = row.get(1)?;
            let api_version: String = row.get(2)?;
            let kind: String = row.get(3)?;
            out.insert(Identity { namespace, name }, TypeCategory::from_api_version(&api_version, &kind));
        }
        histogram!("persist_load_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(env = %self.env, count = out.len(), "loaded managed set");
        Ok(out)
    }

    fn save(&self, set: &ManagedSet) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.db.lock().map_err(|_| anyhow!("managed-set db lock poisoned"))?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM managed WHERE env = ?1", [&self.env])?;
        {
            let mut ins = tx.prepare(
                "INSERT INTO managed(env, namespace, name, api_version, kind) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (id, ty) in set.iter() {
                ins.execute((&self.env, &id.namespace, &id.name, ty.api_version(), &ty.kind))?;
            }
        }
        tx.execute(
            "INSERT INTO saves(env, ts, n) VALUES (?1, ?2, ?3)
             ON CONFLICT(env) DO UPDATE SET ts = excluded.ts, n = excluded.n",
            (&self.env, now_ts(), set.len() as i64),
        )?;
        tx.commit().context("committing managed set")?;
        histogram!("persist_save_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_save_total", 1u64);
        debug!(env = %self.env, count = set.len(), "saved managed set");
        Ok(())
    }
}

/// In-process store; contents live as long as the value.
#[derive(Default)]
pub struct MemoryStore {
    set: Mutex<ManagedSet>,
    saves: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn with(set: ManagedSet) -> Self {
        Self { set: Mutex::new(set), saves: Mutex::new(0) }
    }

    /// Number of `save` calls so far.
    pub fn saves(&self) -> u64 {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }
}

impl ManagedSetStore for MemoryStore {
    fn load(&self) -> Result<ManagedSet> {
        self.set.lock().map(|s| s.clone()).map_err(|_| anyhow!("managed-set lock poisoned"))
    }

    fn save(&self, set: &ManagedSet) -> Result<()> {
        *self.set.lock().map_err(|_| anyhow!("managed-set lock poisoned"))? = set.clone();
        if let Ok(mut n) = self.saves.lock() {
            *n += 1;
        }
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kapply");
        let _ = std::fs::create_dir_all(&p);
        p.push("kapply.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "kapply.db".to_string()
}

pub fn now_ts() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

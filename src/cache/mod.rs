//! Durable index of installed packages, keyed by (title, source).

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GdpmError, Result};

const CURRENT_SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageStatus {
    Installed,
    Pending,
    Failed,
    Stale,
}

impl PackageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageStatus::Installed => "installed",
            PackageStatus::Pending => "pending",
            PackageStatus::Failed => "failed",
            PackageStatus::Stale => "stale",
        }
    }
}

impl std::fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("unknown package status `{0}`")]
pub struct ParseStatusError(String);

impl FromStr for PackageStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "installed" => Ok(PackageStatus::Installed),
            "pending" => Ok(PackageStatus::Pending),
            "failed" => Ok(PackageStatus::Failed),
            "stale" => Ok(PackageStatus::Stale),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub title: String,
    pub source: String,
    pub asset_id: String,
    pub install_path: PathBuf,
    pub version: String,
    pub hash: String,
    pub installed_at: String,
    pub updated_at: String,
    pub status: PackageStatus,
}

impl InstalledPackage {
    pub fn new(title: impl Into<String>, source: impl Into<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            title: title.into(),
            source: source.into(),
            asset_id: String::new(),
            install_path: PathBuf::new(),
            version: String::new(),
            hash: String::new(),
            installed_at: now.clone(),
            updated_at: now,
            status: PackageStatus::Installed,
        }
    }
}

/// Optional constraints for [`Database::list`]
#[derive(Debug, Clone, Default)]
pub struct PackageFilter {
    /// Case-insensitive substring of the title
    pub title: Option<String>,
    pub source: Option<String>,
    pub status: Option<PackageStatus>,
}

pub struct Database {
    conn: Connection,
}

const SELECT_COLUMNS: &str = "title, source, asset_id, install_path, version, hash, installed_at, updated_at, status";

fn row_to_package(row: &Row<'_>) -> rusqlite::Result<InstalledPackage> {
    let install_path: String = row.get(3)?;
    let status: String = row.get(8)?;
    let status: PackageStatus = status.parse().map_err(|e: ParseStatusError| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(InstalledPackage {
        title: row.get(0)?,
        source: row.get(1)?,
        asset_id: row.get(2)?,
        install_path: PathBuf::from(install_path),
        version: row.get(4)?,
        hash: row.get(5)?,
        installed_at: row.get(6)?,
        updated_at: row.get(7)?,
        status,
    })
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GdpmError::store_io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

        let db = Database { conn };
        db.create_if_missing()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Database {
            conn: Connection::open_in_memory()?,
        };
        db.create_if_missing()?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        Ok(self.conn.execute_batch(sql)?)
    }

    /// Create or migrate the schema. Idempotent and never destructive.
    pub fn create_if_missing(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL,
                updated TEXT NOT NULL,
                PRIMARY KEY (version)
            )",
            (),
        )?;

        let version: i32 = match self.conn.query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        ) {
            Ok(v) => v,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                self.conn.execute(
                    "INSERT INTO schema_version (version, updated) VALUES (0, datetime('now'))",
                    [],
                )?;
                0
            }
            Err(e) => return Err(e.into()),
        };

        if version < CURRENT_SCHEMA_VERSION {
            self.migrate_schema(version)?;
        }
        Ok(())
    }

    fn migrate_schema(&self, from_version: i32) -> Result<()> {
        if from_version == 0 {
            let tx = self.conn.unchecked_transaction()?;
            tx.execute(
                "CREATE TABLE IF NOT EXISTS packages (
                    title TEXT NOT NULL,
                    source TEXT NOT NULL,
                    asset_id TEXT NOT NULL,
                    install_path TEXT NOT NULL,
                    version TEXT NOT NULL,
                    hash TEXT NOT NULL,
                    installed_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    status TEXT NOT NULL,
                    PRIMARY KEY (title, source)
                )",
                (),
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_version (version, updated) VALUES (1, datetime('now'))",
                [],
            )?;
            tx.commit()?;
        }
        Ok(())
    }

    /// Find one package by title.
    ///
    /// Without a source, the entry whose source comes first in `priority` wins; sources
    /// no longer in `priority` (orphans) follow in alphabetical order.
    pub fn lookup(
        &self,
        title: &str,
        source: Option<&str>,
        priority: &[String],
    ) -> Result<Option<InstalledPackage>> {
        if let Some(source) = source {
            let sql = format!("SELECT {SELECT_COLUMNS} FROM packages WHERE title = ?1 AND source = ?2");
            return Ok(self
                .conn
                .query_row(&sql, params![title, source], row_to_package)
                .optional()?);
        }

        let mut matches = self.lookup_all(title)?;
        matches.sort_by_key(|p| {
            let rank = priority
                .iter()
                .position(|s| *s == p.source)
                .unwrap_or(usize::MAX);
            (rank, p.source.clone())
        });
        Ok(matches.into_iter().next())
    }

    pub fn lookup_all(&self, title: &str) -> Result<Vec<InstalledPackage>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM packages WHERE title = ?1 ORDER BY source");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([title], row_to_package)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Upsert keyed by (title, source); the original install time is preserved
    pub fn insert_or_update(&mut self, pkg: &InstalledPackage) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO packages (title, source, asset_id, install_path, version, hash, installed_at, updated_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(title, source) DO UPDATE SET
                asset_id = excluded.asset_id,
                install_path = excluded.install_path,
                version = excluded.version,
                hash = excluded.hash,
                updated_at = excluded.updated_at,
                status = excluded.status",
            params![
                pkg.title,
                pkg.source,
                pkg.asset_id,
                pkg.install_path.to_string_lossy().into_owned(),
                pkg.version,
                pkg.hash,
                pkg.installed_at,
                now,
                pkg.status.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Returns `false` when no such record exists
    pub fn set_status(&mut self, title: &str, source: &str, status: PackageStatus) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE packages SET status = ?1, updated_at = ?2 WHERE title = ?3 AND source = ?4",
            params![status.as_str(), chrono::Utc::now().to_rfc3339(), title, source],
        )?;
        Ok(changed > 0)
    }

    /// Delete the record for (title, source), or for every source when `source` is `None`.
    ///
    /// Returns the removed records.
    pub fn remove(&mut self, title: &str, source: Option<&str>) -> Result<Vec<InstalledPackage>> {
        let tx = self.conn.transaction()?;
        let removed = {
            let (select, delete) = match source {
                Some(_) => (
                    format!("SELECT {SELECT_COLUMNS} FROM packages WHERE title = ?1 AND source = ?2"),
                    "DELETE FROM packages WHERE title = ?1 AND source = ?2",
                ),
                None => (
                    format!("SELECT {SELECT_COLUMNS} FROM packages WHERE title = ?1"),
                    "DELETE FROM packages WHERE title = ?1",
                ),
            };
            let args: Vec<&str> = std::iter::once(title).chain(source).collect();

            let mut stmt = tx.prepare(&select)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), row_to_package)?;
            let mut removed = Vec::new();
            for row in rows {
                removed.push(row?);
            }
            drop(stmt);

            tx.execute(delete, params_from_iter(args.iter()))?;
            removed
        };
        tx.commit()?;
        Ok(removed)
    }

    pub fn list(&self, filter: &PackageFilter) -> Result<Vec<InstalledPackage>> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(title) = &filter.title {
            args.push(format!("%{}%", title.to_lowercase()));
            clauses.push(format!("lower(title) LIKE ?{}", args.len()));
        }
        if let Some(source) = &filter.source {
            args.push(source.clone());
            clauses.push(format!("source = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", args.len()));
        }

        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM packages");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY title, source");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_package)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::hash::FileRecord;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    signature BLOB,
    revision INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS rules (
    permfile_dir TEXT NOT NULL,
    permfile_depth INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    path TEXT NOT NULL,
    user TEXT NOT NULL,
    can_read INTEGER NOT NULL,
    can_create INTEGER NOT NULL,
    can_write INTEGER NOT NULL,
    admin INTEGER NOT NULL,
    disallow INTEGER NOT NULL,
    terminal INTEGER NOT NULL,
    PRIMARY KEY (permfile_dir, priority)
);

CREATE INDEX IF NOT EXISTS idx_rules_dir_depth ON rules(permfile_dir, permfile_depth);
"#;

/// A row of the `files` relation: what the metadata store knows about one
/// replicated file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub mtime_ns: i128,
    pub signature: Option<Vec<u8>>,
    pub revision: i64,
}

/// A materialized permission rule row, as parsed from a permission file.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleRecord {
    pub permfile_dir: String,
    pub permfile_depth: i64,
    pub priority: i64,
    pub path: String,
    pub user: String,
    pub can_read: bool,
    pub can_create: bool,
    pub can_write: bool,
    pub admin: bool,
    pub disallow: bool,
    pub terminal: bool,
}

/// The transactional index of every known file and every materialized
/// permission rule, backed by a single SQLite database under `.data/`.
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join(".data");
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let db_path = dir.join("metadata.db");
        Self::open_at(&db_path)
    }

    pub fn open_at(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open metadata store {}", db_path.display()))?;
        conn.execute_batch(SCHEMA).context("init metadata schema")?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory metadata store")?;
        conn.execute_batch(SCHEMA).context("init metadata schema")?;
        Ok(Self { conn })
    }

    /// Inserts or replaces the record for `record.relative_path`, assigning
    /// the next revision for that path inside the same transaction.
    pub fn upsert(&mut self, record: &FileRecord) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let revision = next_revision(&tx, &record.relative_path)?;
        tx.execute(
            "INSERT INTO files (path, hash, size, mtime_ns, signature, revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                hash = excluded.hash,
                size = excluded.size,
                mtime_ns = excluded.mtime_ns,
                signature = excluded.signature,
                revision = excluded.revision",
            params![
                record.relative_path,
                record.hash,
                record.size_bytes as i64,
                record.mtime_ns.to_string(),
                record.signature,
                revision,
            ],
        )?;
        tx.commit()?;
        Ok(revision)
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM files WHERE path = ?1", params![path])?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<Option<FileMetadata>> {
        self.conn
            .query_row(
                "SELECT path, hash, size, mtime_ns, signature, revision FROM files WHERE path = ?1",
                params![path],
                row_to_metadata,
            )
            .optional()
            .context("query file metadata")
    }

    /// Every record whose path begins with `prefix`.
    pub fn list(&self, prefix: &str) -> Result<Vec<FileMetadata>> {
        let like = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = self.conn.prepare(
            "SELECT path, hash, size, mtime_ns, signature, revision FROM files
             WHERE path LIKE ?1 ESCAPE '\\' ORDER BY path",
        )?;
        let rows = stmt.query_map(params![like], row_to_metadata)?;
        rows.collect::<rusqlite::Result<_>>().context("list files")
    }

    /// Distinct top-level directories under `datasites/`.
    pub fn list_datasites(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM files WHERE path LIKE 'datasites/%'")?;
        let mut rows = stmt.query([])?;
        let mut seen = std::collections::BTreeSet::new();
        while let Some(row) = rows.next()? {
            let path: String = row.get(0)?;
            if let Some(rest) = path.strip_prefix("datasites/") {
                if let Some(email) = rest.split('/').next() {
                    seen.insert(email.to_string());
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Writes `data` to a temp file beside `origin_abs_path`, renames it
    /// into place, and updates the metadata row — all inside one
    /// transaction boundary so either both or neither take effect.
    pub fn move_atomic(
        &mut self,
        record: &FileRecord,
        origin_abs_path: &Path,
        data: &[u8],
    ) -> Result<i64> {
        if let Some(parent) = origin_abs_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create parent for {}", origin_abs_path.display()))?;
        }
        let tmp_path = origin_abs_path.with_extension(format!(
            "syft.tmp.{}",
            std::process::id()
        ));
        fs::write(&tmp_path, data)
            .with_context(|| format!("write temp file {}", tmp_path.display()))?;

        let tx = self.conn.transaction()?;
        let revision = next_revision(&tx, &record.relative_path)?;
        fs::rename(&tmp_path, origin_abs_path).with_context(|| {
            format!(
                "rename {} -> {}",
                tmp_path.display(),
                origin_abs_path.display()
            )
        })?;
        tx.execute(
            "INSERT INTO files (path, hash, size, mtime_ns, signature, revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                hash = excluded.hash,
                size = excluded.size,
                mtime_ns = excluded.mtime_ns,
                signature = excluded.signature,
                revision = excluded.revision",
            params![
                record.relative_path,
                record.hash,
                record.size_bytes as i64,
                record.mtime_ns.to_string(),
                record.signature,
                revision,
            ],
        )?;
        tx.commit()?;
        Ok(revision)
    }

    /// Replaces every rule row for `permfile_dir` in one transaction.
    /// Callers must pre-validate the whole rule set before calling this —
    /// a malformed file must never reach here, since any row written here
    /// is taken as authoritative.
    pub fn replace_rules(&mut self, permfile_dir: &str, rules: &[RuleRecord]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM rules WHERE permfile_dir = ?1",
            params![permfile_dir],
        )?;
        for rule in rules {
            tx.execute(
                "INSERT INTO rules (
                    permfile_dir, permfile_depth, priority, path, user,
                    can_read, can_create, can_write, admin, disallow, terminal
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    rule.permfile_dir,
                    rule.permfile_depth,
                    rule.priority,
                    rule.path,
                    rule.user,
                    rule.can_read,
                    rule.can_create,
                    rule.can_write,
                    rule.admin,
                    rule.disallow,
                    rule.terminal,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Every rule whose `permfile_dir` is an ancestor of, or equal to,
    /// `target_dir_ancestors` — the caller passes the full list of
    /// candidate ancestor directories (including the datasite root).
    pub fn rules_for_ancestors(&self, ancestors: &[String]) -> Result<Vec<RuleRecord>> {
        if ancestors.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=ancestors.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT permfile_dir, permfile_depth, priority, path, user,
                    can_read, can_create, can_write, admin, disallow, terminal
             FROM rules WHERE permfile_dir IN ({})
             ORDER BY permfile_depth ASC, priority ASC",
            placeholders.join(",")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> =
            ancestors.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_rule)?;
        rows.collect::<rusqlite::Result<_>>().context("list rules")
    }

    pub fn remove_rules_for_dir(&mut self, permfile_dir: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM rules WHERE permfile_dir = ?1",
            params![permfile_dir],
        )?;
        Ok(())
    }

    /// Startup crash recovery: every record whose stored hash disagrees
    /// with the file's current on-disk content is rehashed and re-upserted.
    pub fn heal(&mut self, snapshot_root: &Path) -> Result<usize> {
        let stale: Vec<FileMetadata> = self
            .list("")?
            .into_iter()
            .filter(|m| {
                let abs = snapshot_root.join(&m.path);
                match crate::hash::hash_file(&abs) {
                    Ok((hash, ..)) => hash != m.hash,
                    Err(_) => true,
                }
            })
            .collect();

        let mut healed = 0;
        for m in &stale {
            let abs = snapshot_root.join(&m.path);
            match crate::hash::hash_file(&abs) {
                Ok((hash, size, mtime_ns, signature)) => {
                    self.upsert(&FileRecord {
                        relative_path: m.path.clone(),
                        hash,
                        size_bytes: size,
                        mtime_ns,
                        signature,
                    })?;
                    healed += 1;
                }
                Err(_) => {
                    self.delete(&m.path)?;
                    healed += 1;
                }
            }
        }
        Ok(healed)
    }
}

fn next_revision(tx: &rusqlite::Transaction, path: &str) -> Result<i64> {
    let current: Option<i64> = tx
        .query_row(
            "SELECT revision FROM files WHERE path = ?1",
            params![path],
            |r| r.get(0),
        )
        .optional()?;
    Ok(current.unwrap_or(0) + 1)
}

fn row_to_metadata(row: &rusqlite::Row) -> rusqlite::Result<FileMetadata> {
    let mtime_str: String = row.get(3)?;
    Ok(FileMetadata {
        path: row.get(0)?,
        hash: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        mtime_ns: mtime_str.parse().unwrap_or(0),
        signature: row.get(4)?,
        revision: row.get(5)?,
    })
}

fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<RuleRecord> {
    Ok(RuleRecord {
        permfile_dir: row.get(0)?,
        permfile_depth: row.get(1)?,
        priority: row.get(2)?,
        path: row.get(3)?,
        user: row.get(4)?,
        can_read: row.get(5)?,
        can_create: row.get(6)?,
        can_write: row.get(7)?,
        admin: row.get(8)?,
        disallow: row.get(9)?,
        terminal: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, hash: &str) -> FileRecord {
        FileRecord {
            relative_path: path.to_string(),
            hash: hash.to_string(),
            size_bytes: 5,
            mtime_ns: 1,
            signature: vec![1, 2, 3],
        }
    }

    #[test]
    fn upsert_bumps_revision_on_each_write() {
        let mut store = MetadataStore::in_memory().unwrap();
        let r1 = store.upsert(&record("datasites/a@x.org/f.txt", "h1")).unwrap();
        let r2 = store.upsert(&record("datasites/a@x.org/f.txt", "h2")).unwrap();
        assert_eq!(r1, 1);
        assert_eq!(r2, 2);

        let got = store.get("datasites/a@x.org/f.txt").unwrap().unwrap();
        assert_eq!(got.hash, "h2");
        assert_eq!(got.revision, 2);
    }

    #[test]
    fn list_filters_by_prefix() {
        let mut store = MetadataStore::in_memory().unwrap();
        store.upsert(&record("datasites/a@x.org/one.txt", "h1")).unwrap();
        store.upsert(&record("datasites/b@x.org/two.txt", "h2")).unwrap();

        let only_a = store.list("datasites/a@x.org/").unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].path, "datasites/a@x.org/one.txt");
    }

    #[test]
    fn list_datasites_returns_distinct_top_level_dirs() {
        let mut store = MetadataStore::in_memory().unwrap();
        store.upsert(&record("datasites/a@x.org/one.txt", "h1")).unwrap();
        store.upsert(&record("datasites/a@x.org/two.txt", "h2")).unwrap();
        store.upsert(&record("datasites/b@x.org/three.txt", "h3")).unwrap();

        let sites = store.list_datasites().unwrap();
        assert_eq!(sites, vec!["a@x.org".to_string(), "b@x.org".to_string()]);
    }

    #[test]
    fn replace_rules_is_transactional_per_directory() {
        let mut store = MetadataStore::in_memory().unwrap();
        let rules = vec![RuleRecord {
            permfile_dir: "datasites/a@x.org".to_string(),
            permfile_depth: 1,
            priority: 0,
            path: "**".to_string(),
            user: "*".to_string(),
            can_read: true,
            can_create: false,
            can_write: false,
            admin: false,
            disallow: false,
            terminal: false,
        }];
        store.replace_rules("datasites/a@x.org", &rules).unwrap();

        let found = store
            .rules_for_ancestors(&["datasites/a@x.org".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].can_read);

        store.replace_rules("datasites/a@x.org", &[]).unwrap();
        let found = store
            .rules_for_ancestors(&["datasites/a@x.org".to_string()])
            .unwrap();
        assert!(found.is_empty());
    }
}

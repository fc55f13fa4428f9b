//! Persistent URL table with exclusive leases.
//!
//! Every entry handed out by [`UrlStore::fetch_entries`] is locked for its
//! owner until it comes back through [`UrlStore::return_entry`] or
//! [`UrlStore::unlock_urls`].

use crate::db::Database;
use crate::error::Result;
use crate::models::{from_timestamp, UrlEntry};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use std::sync::{Mutex, MutexGuard};

const SELECT: &str = "SELECT url.urlid, url.hostid, host.address, url.path, url.last_visited, \
     url.visit_count, url.update_freq, url.entity, url.pattern, url.working, url.score \
     FROM url JOIN host ON host.hostid = url.hostid";

/// Sortable columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlColumn {
    Id,
    Path,
    LastVisited,
    VisitCount,
    Score,
}

impl UrlColumn {
    fn sql(self) -> &'static str {
        match self {
            UrlColumn::Id => "url.urlid",
            UrlColumn::Path => "url.path",
            UrlColumn::LastVisited => "url.last_visited",
            UrlColumn::VisitCount => "url.visit_count",
            UrlColumn::Score => "url.score",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    ForHost(i64),
    ForPattern(String),
    Entity(bool),
    Working(bool),
    NotLocked,
    Due,
}

#[derive(Debug, Clone, PartialEq)]
enum Order {
    By(UrlColumn, Direction),
    SourcesFirst,
}

/// Composable filter over the URL table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UrlQuery {
    locked: bool,
    conditions: Vec<Condition>,
    order: Option<Order>,
    limit: Option<u32>,
}

impl UrlQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_host(host_id: i64) -> Self {
        Self::new().host(host_id)
    }

    pub fn host(mut self, host_id: i64) -> Self {
        self.conditions.push(Condition::ForHost(host_id));
        self
    }

    /// Only currently leased entries
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn not_locked(mut self) -> Self {
        self.conditions.push(Condition::NotLocked);
        self
    }

    /// Only entries whose update interval elapsed since the last visit
    pub fn due(mut self) -> Self {
        self.conditions.push(Condition::Due);
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.conditions.push(Condition::ForPattern(pattern.to_string()));
        self
    }

    pub fn entity(mut self, entity: bool) -> Self {
        self.conditions.push(Condition::Entity(entity));
        self
    }

    pub fn working(mut self, working: bool) -> Self {
        self.conditions.push(Condition::Working(working));
        self
    }

    pub fn order_by(mut self, column: UrlColumn, direction: Direction) -> Self {
        self.order = Some(Order::By(column, direction));
        self
    }

    /// Source entries before entity entries
    pub fn sources_first(mut self) -> Self {
        self.order = Some(Order::SourcesFirst);
        self
    }

    pub fn limit(mut self, count: u32) -> Self {
        self.limit = Some(count);
        self
    }

    /// SQL text and its parameters; `now` is bound for due-ness checks
    fn to_sql(&self, now: i64) -> (String, Vec<Value>) {
        let mut sql = String::from(SELECT);
        let mut values = Vec::new();
        if self.locked {
            sql.push_str(" JOIN url_lock ON url_lock.urlid = url.urlid");
        }

        let mut clauses = Vec::new();
        for condition in &self.conditions {
            match condition {
                Condition::ForHost(id) => {
                    clauses.push("url.hostid = ?");
                    values.push(Value::Integer(*id));
                }
                Condition::ForPattern(pattern) => {
                    clauses.push("url.pattern = ?");
                    values.push(Value::Text(pattern.clone()));
                }
                Condition::Entity(entity) => {
                    clauses.push("url.entity = ?");
                    values.push(Value::Integer(*entity as i64));
                }
                Condition::Working(working) => {
                    clauses.push("url.working = ?");
                    values.push(Value::Integer(*working as i64));
                }
                Condition::NotLocked => clauses
                    .push("NOT EXISTS (SELECT 1 FROM url_lock WHERE url_lock.urlid = url.urlid)"),
                Condition::Due => {
                    clauses.push("? > url.last_visited + url.update_freq");
                    values.push(Value::Integer(now));
                }
            }
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        match self.order {
            Some(Order::By(column, direction)) => {
                sql.push_str(" ORDER BY ");
                sql.push_str(column.sql());
                sql.push_str(match direction {
                    Direction::Asc => " ASC",
                    Direction::Desc => " DESC",
                });
            }
            Some(Order::SourcesFirst) => sql.push_str(" ORDER BY url.entity ASC, url.urlid ASC"),
            None => {}
        }

        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }
        (sql, values)
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<UrlEntry> {
    Ok(UrlEntry {
        id: row.get(0)?,
        host_id: row.get(1)?,
        host: row.get(2)?,
        path: row.get(3)?,
        last_visited: from_timestamp(row.get(4)?),
        visit_count: row.get(5)?,
        update_freq: row.get(6)?,
        entity: row.get(7)?,
        pattern: row.get(8)?,
        working: row.get(9)?,
        score: row.get(10)?,
    })
}

fn query_entries(conn: &Connection, query: &UrlQuery, now: DateTime<Utc>) -> Result<Vec<UrlEntry>> {
    let (sql, values) = query.to_sql(now.timestamp());
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), entry_from_row)?;

    let mut entries = Vec::new();
    for entry in rows {
        entries.push(entry?);
    }
    Ok(entries)
}

/// Lease manager over the `url` and `url_lock` tables.
///
/// Each store owns one connection; open one store per thread that needs
/// concurrent access.
pub struct UrlStore {
    conn: Mutex<Connection>,
}

impl UrlStore {
    pub fn open(db: &Database) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db.connect()?),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs the query and locks every returned entry for `owner`, in one
    /// immediate transaction so no other caller can lease the same rows
    pub fn fetch_entries(&self, query: &UrlQuery, owner: i64) -> Result<Vec<UrlEntry>> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entries = query_entries(&tx, query, Utc::now())?;
        {
            let mut lock = tx.prepare_cached(
                "INSERT OR REPLACE INTO url_lock (urlid, owner, time) VALUES (?, ?, ?)",
            )?;
            let now = Utc::now().timestamp();
            for entry in &entries {
                lock.execute(params![entry.id, owner, now])?;
            }
        }
        tx.commit()?;
        debug!("Leased {} URL entries for owner {}", entries.len(), owner);
        Ok(entries)
    }

    /// Read-only query, no leasing
    pub fn list(&self, query: &UrlQuery) -> Result<Vec<UrlEntry>> {
        self.list_at(query, Utc::now())
    }

    /// Like [`list`](Self::list), with `due` evaluated at `now`
    pub fn list_at(&self, query: &UrlQuery, now: DateTime<Utc>) -> Result<Vec<UrlEntry>> {
        let conn = self.lock();
        query_entries(&conn, query, now)
    }

    /// Persists the entry's crawl state
    pub fn update_entry(&self, entry: &UrlEntry) -> Result<()> {
        let conn = self.lock();
        update(&conn, entry)
    }

    /// Persists the entry and releases its lease
    pub fn return_entry(&self, entry: &UrlEntry) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        update(&tx, entry)?;
        tx.prepare_cached("DELETE FROM url_lock WHERE urlid = ?")?
            .execute(params![entry.id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn add_entry(&self, entry: &UrlEntry) -> Result<bool> {
        Ok(self.add_entries(std::slice::from_ref(entry))? > 0)
    }

    /// Inserts entries whose (host, path) is not stored yet; returns how many
    /// were new
    pub fn add_entries(&self, entries: &[UrlEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut added = 0;
        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO url
                    (hostid, path, last_visited, visit_count, update_freq, entity, pattern, working, score)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for entry in entries {
                added += insert.execute(params![
                    entry.host_id,
                    entry.path,
                    entry.last_visited.timestamp(),
                    entry.visit_count,
                    entry.update_freq,
                    entry.entity,
                    entry.pattern,
                    entry.working,
                    entry.score,
                ])?;
            }
        }
        tx.commit()?;
        Ok(added)
    }

    /// Releases leases without touching the entries
    pub fn unlock_urls(&self, entries: &[UrlEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut unlock = tx.prepare_cached("DELETE FROM url_lock WHERE urlid = ?")?;
            for entry in entries {
                unlock.execute(params![entry.id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_locked(&self) -> Result<Vec<UrlEntry>> {
        self.list(&UrlQuery::new().locked())
    }

    /// Releases every lease, e.g. ones left behind by a crashed run
    pub fn unlock_all(&self) -> Result<usize> {
        let conn = self.lock();
        let count = conn.execute("DELETE FROM url_lock", [])?;
        if count > 0 {
            warn!("Released {} stale URL locks", count);
        }
        Ok(count)
    }

    /// Entries flagged as not working, optionally for one host
    pub fn list_broken(&self, host_id: Option<i64>) -> Result<Vec<UrlEntry>> {
        let query = match host_id {
            Some(id) => UrlQuery::for_host(id),
            None => UrlQuery::new(),
        };
        self.list(&query.working(false).order_by(UrlColumn::Id, Direction::Asc))
    }
}

fn update(conn: &Connection, entry: &UrlEntry) -> Result<()> {
    conn.prepare_cached(
        "UPDATE url SET last_visited = ?, visit_count = ?, update_freq = ?, entity = ?,
            pattern = ?, working = ?, score = ?
         WHERE urlid = ?",
    )?
    .execute(params![
        entry.last_visited.timestamp(),
        entry.visit_count,
        entry.update_freq,
        entry.entity,
        entry.pattern,
        entry.working,
        entry.score,
        entry.id,
    ])?;
    Ok(())
}

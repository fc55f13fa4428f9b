use crate::error::Result;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How long a connection waits for a competing writer
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Crawl state database.
///
/// Holds one administrative connection (hosts table); URL stores open their
/// own connections through [`Database::connect`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Opens (and if needed creates) the database and its tables
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        info!("Opening database at {:?}", path);

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = open_connection(&path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        };
        db.init_tables()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A new connection to the same database
    pub fn connect(&self) -> Result<Connection> {
        open_connection(&self.path)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates the tables if they don't exist yet
    pub fn init_tables(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS host (
                hostid INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS url (
                urlid INTEGER PRIMARY KEY AUTOINCREMENT,
                hostid INTEGER NOT NULL REFERENCES host(hostid),
                path TEXT NOT NULL,
                last_visited INTEGER NOT NULL DEFAULT 0,
                visit_count INTEGER NOT NULL DEFAULT 0,
                update_freq INTEGER NOT NULL,
                entity INTEGER NOT NULL,
                pattern TEXT NOT NULL,
                working INTEGER NOT NULL DEFAULT 1,
                score INTEGER NOT NULL DEFAULT 0,
                UNIQUE(hostid, path)
            );
            CREATE TABLE IF NOT EXISTS url_lock (
                urlid INTEGER PRIMARY KEY REFERENCES url(urlid),
                owner INTEGER NOT NULL,
                time INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_url_host_pattern ON url(hostid, pattern);",
        )?;
        debug!("Database tables initialized");
        Ok(())
    }

    /// Id of a host address, registering it if unknown
    pub fn add_host(&self, address: &str) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO host (address) VALUES (?)",
            params![address],
        )?;
        let id = conn.query_row(
            "SELECT hostid FROM host WHERE address = ?",
            params![address],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn host_id(&self, address: &str) -> Result<Option<i64>> {
        let conn = self.lock();
        let id = conn
            .query_row(
                "SELECT hostid FROM host WHERE address = ?",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// All registered hosts as `(id, address)`, ordered by id
    pub fn list_hosts(&self) -> Result<Vec<(i64, String)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT hostid, address FROM host ORDER BY hostid")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut hosts = Vec::new();
        for host in rows {
            hosts.push(host?);
        }
        Ok(hosts)
    }

    /// Removes a host with all its URLs and locks. Returns the number of
    /// removed URL entries.
    pub fn remove_host(&self, host_id: i64) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM url_lock WHERE urlid IN (SELECT urlid FROM url WHERE hostid = ?)",
            params![host_id],
        )?;
        let urls = tx.execute("DELETE FROM url WHERE hostid = ?", params![host_id])?;
        tx.execute("DELETE FROM host WHERE hostid = ?", params![host_id])?;
        tx.commit()?;
        info!("Host {} removed with {} URL entries", host_id, urls);
        Ok(urls)
    }

    /// Removes every host, URL and lock. Returns the number of removed URL
    /// entries.
    pub fn reset(&self) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM url_lock", [])?;
        let urls = tx.execute("DELETE FROM url", [])?;
        tx.execute("DELETE FROM host", [])?;
        tx.commit()?;
        info!("{} URL entries removed", urls);
        Ok(urls)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // the pragma reports the resulting mode as a row
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    Ok(conn)
}

// src/core/state/db.rs

//! The state database: a single SQL-engine connection holding user tables
//! plus the internal bookkeeping tables.
//!
//! Durability comes from the replicated log, not from this file, so the
//! journal lives in memory and synchronous writes are off; the snapshot
//! subsystem produces the durable artifact.

use crate::core::errors::Result;
use crate::core::metric;
use crate::core::state::hooks;
use crate::core::state::session::Session;
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::{Connection, OpenFlags, backup, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Rows kept in `resql_log` before rotation.
const LOG_KEEP_ROWS: u64 = 1000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS resql_log
    (id INTEGER PRIMARY KEY, date TEXT, level TEXT, log TEXT);
CREATE TABLE IF NOT EXISTS resql_kv
    (key TEXT PRIMARY KEY, value BLOB);
CREATE TABLE IF NOT EXISTS resql_info (
    name TEXT PRIMARY KEY,
    connected TEXT,
    role TEXT,
    urls TEXT,
    version TEXT,
    git_branch TEXT,
    git_commit TEXT,
    machine TEXT,
    arch TEXT,
    pid TEXT,
    current_time TEXT,
    start_date TEXT,
    start_time TEXT,
    uptime_seconds TEXT,
    uptime_days TEXT,
    cpu_sys TEXT,
    cpu_user TEXT,
    network_recv_bytes TEXT,
    network_send_bytes TEXT,
    network_recv TEXT,
    network_send TEXT,
    total_memory_bytes TEXT,
    total_memory TEXT,
    used_memory_bytes TEXT,
    used_memory TEXT,
    fsync_max_ms TEXT,
    fsync_average_ms TEXT,
    snapshot_success TEXT,
    snapshot_size_bytes TEXT,
    snapshot_size TEXT,
    snapshot_max_ms TEXT,
    snapshot_average_ms TEXT,
    dir TEXT,
    disk_used_bytes TEXT,
    disk_used TEXT,
    disk_free_bytes TEXT,
    disk_free TEXT);
CREATE TABLE IF NOT EXISTS resql_clients (
    client_name TEXT PRIMARY KEY,
    client_id INTEGER,
    sequence INTEGER,
    local TEXT,
    remote TEXT,
    connect_time TEXT,
    resp BLOB);
CREATE TABLE IF NOT EXISTS resql_statements
    (id INTEGER PRIMARY KEY, client_id INTEGER, client_name TEXT, sql TEXT);
CREATE INDEX IF NOT EXISTS resql_statements_cid ON resql_statements(client_id);
";

fn authorize(ctx: AuthContext) -> Authorization {
    if !hooks::client_active() {
        return Authorization::Allow;
    }

    match ctx.action {
        AuthAction::Read {
            table_name,
            column_name,
        } => {
            if table_name == "resql_clients" && column_name == "resp" {
                Authorization::Ignore
            } else {
                Authorization::Allow
            }
        }
        AuthAction::Insert { table_name }
        | AuthAction::Delete { table_name }
        | AuthAction::DropTable { table_name }
        | AuthAction::CreateTable { table_name }
        | AuthAction::Update { table_name, .. }
        | AuthAction::AlterTable { table_name, .. } => {
            if table_name.starts_with("resql") {
                Authorization::Deny
            } else {
                Authorization::Allow
            }
        }
        _ => Authorization::Allow,
    }
}

/// A persisted session row with its prepared statements.
pub struct SessionRow {
    pub name: String,
    pub id: u64,
    pub seq: u64,
    pub local: String,
    pub remote: String,
    pub connect_time: String,
    pub resp: Vec<u8>,
    pub stmts: Vec<(u64, String)>,
}

pub struct StateDb {
    conn: Connection,
    path: Option<PathBuf>,
}

impl StateDb {
    pub fn open(path: &Path, create: bool) -> Result<StateDb> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        let conn = Connection::open_with_flags(path, flags)?;
        Self::configure(&conn)?;

        Ok(StateDb {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_memory() -> Result<StateDb> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;

        Ok(StateDb { conn, path: None })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode=MEMORY;
             PRAGMA locking_mode=EXCLUSIVE;
             PRAGMA synchronous=OFF;
             PRAGMA temp_store=MEMORY;",
        )?;
        conn.execute_batch(SCHEMA)?;
        hooks::register_config_fn(conn)?;
        conn.authorizer(Some(authorize));
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copies a database file into this (in-memory) database.
    pub fn load_from(&mut self, path: &Path) -> Result<()> {
        let src = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let backup = backup::Backup::new(&src, &mut self.conn)?;
        backup.run_to_completion(100, Duration::ZERO, None)?;
        Ok(())
    }

    pub fn begin(&self) -> Result<()> {
        self.conn.prepare_cached("BEGIN")?.execute([])?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.conn.prepare_cached("COMMIT")?.execute([])?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.conn.prepare_cached("ROLLBACK")?.execute([])?;
        Ok(())
    }

    pub fn set_max_pages(&self, pages: u64) -> Result<()> {
        self.conn
            .pragma_update(None, "max_page_count", pages.min(u32::MAX as u64))?;
        Ok(())
    }

    pub fn write_kv(&self, key: &str, value: &[u8]) -> Result<()> {
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO resql_kv VALUES (?, ?)")?
            .execute(params![key, value])?;
        Ok(())
    }

    pub fn read_kv(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM resql_kv WHERE key = ?")?;
        let mut rows = stmt.query(params![key])?;

        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Appends an audit line and rotates the table down to the most recent
    /// thousand rows. `date` comes from `datetime()` and therefore from the
    /// replicated clock.
    pub fn add_log(&self, id: u64, level: &str, log: &str) -> Result<()> {
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO resql_log VALUES (?, datetime(), ?, ?)")?
            .execute(params![id as i64, level, log])?;
        self.conn
            .prepare_cached(
                "DELETE FROM resql_log
                 WHERE id = (SELECT id
                             FROM resql_log
                             ORDER BY id DESC
                             LIMIT 1 OFFSET ?)",
            )?
            .execute(params![LOG_KEEP_ROWS as i64])?;
        Ok(())
    }

    pub fn clear_info(&self) -> Result<()> {
        self.conn.execute("DELETE FROM resql_info", [])?;
        Ok(())
    }

    /// Upserts one node's info row: identity columns plus the stat strings
    /// decoded from the metrics blob (all NULL when the blob is absent).
    pub fn write_info(
        &self,
        name: &str,
        connected: bool,
        role: &str,
        urls: &str,
        stats: &[u8],
    ) -> Result<()> {
        let placeholders = "?, ".repeat(36);
        let sql = format!("INSERT OR REPLACE INTO resql_info VALUES ({placeholders}?)");
        let mut stmt = self.conn.prepare_cached(&sql)?;

        stmt.raw_bind_parameter(1, name)?;
        stmt.raw_bind_parameter(2, if connected { "true" } else { "false" })?;
        stmt.raw_bind_parameter(3, role)?;
        stmt.raw_bind_parameter(4, urls)?;

        if let Some(fields) = metric::decode_fields(stats) {
            for (i, field) in fields.iter().enumerate() {
                stmt.raw_bind_parameter(5 + i, field.as_str())?;
            }
        }

        stmt.raw_execute()?;
        Ok(())
    }

    pub fn del_info(&self, name: &str) -> Result<()> {
        self.conn
            .prepare_cached("DELETE FROM resql_info WHERE name = ?")?
            .execute(params![name])?;
        Ok(())
    }

    pub fn clear_clients(&self) -> Result<()> {
        self.conn.execute("DELETE FROM resql_clients", [])?;
        Ok(())
    }

    pub fn write_client(&self, s: &Session) -> Result<()> {
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO resql_clients VALUES (?, ?, ?, ?, ?, ?, ?)")?
            .execute(params![
                s.name,
                s.id as i64,
                s.seq as i64,
                s.local,
                s.remote,
                s.connect_time,
                s.resp,
            ])?;
        Ok(())
    }

    pub fn del_client(&self, name: &str) -> Result<()> {
        self.conn
            .prepare_cached("DELETE FROM resql_clients WHERE client_name = ?")?
            .execute(params![name])?;
        Ok(())
    }

    pub fn add_stmt(&self, id: u64, client_id: u64, client_name: &str, sql: &str) -> Result<()> {
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO resql_statements VALUES (?, ?, ?, ?)")?
            .execute(params![id as i64, client_id as i64, client_name, sql])?;
        Ok(())
    }

    pub fn rm_stmt(&self, id: u64) -> Result<()> {
        self.conn
            .prepare_cached("DELETE FROM resql_statements WHERE id = ?")?
            .execute(params![id as i64])?;
        Ok(())
    }

    pub fn rm_client_stmts(&self, client_id: u64) -> Result<()> {
        self.conn
            .prepare_cached("DELETE FROM resql_statements WHERE client_id = ?")?
            .execute(params![client_id as i64])?;
        Ok(())
    }

    /// Loads every persisted session together with its prepared statements.
    pub fn read_clients(&self) -> Result<Vec<SessionRow>> {
        let mut out = Vec::new();

        let mut sess = self.conn.prepare(
            "SELECT client_name, client_id, sequence, local, remote, connect_time, resp
             FROM resql_clients",
        )?;
        let mut stmts = self
            .conn
            .prepare("SELECT id, sql FROM resql_statements WHERE client_id = ?")?;

        let mut rows = sess.query([])?;
        while let Some(row) = rows.next()? {
            let mut s = SessionRow {
                name: row.get(0)?,
                id: row.get::<_, i64>(1)? as u64,
                seq: row.get::<_, i64>(2)? as u64,
                local: row.get(3)?,
                remote: row.get(4)?,
                connect_time: row.get(5)?,
                resp: row.get::<_, Option<Vec<u8>>>(6)?.unwrap_or_default(),
                stmts: Vec::new(),
            };

            let mut srows = stmts.query(params![s.id as i64])?;
            while let Some(srow) = srows.next()? {
                s.stmts
                    .push((srow.get::<_, i64>(0)? as u64, srow.get(1)?));
            }

            out.push(s);
        }

        Ok(out)
    }
}

// src/core/state/exec.rs

//! Request batch execution: one transaction per replicated request, one or
//! more operations inside, each with its own parameter bindings. On any
//! statement error the transaction rolls back and a single error batch
//! replaces the partial result.

use crate::core::buffer::{Buf, RawBuf};
use crate::core::errors::{ResqlError, Result};
use crate::core::protocol::{bind, flag, param};
use crate::core::state::db::StateDb;
use crate::core::state::hooks;
use crate::core::state::session::Session;
use rusqlite::Statement;
use rusqlite::types::ValueRef;
use tracing::error;

enum ExecError {
    /// User-visible failure: rolls back, reported in the error batch.
    User(String),
    /// Engine-level failure that must stop the server.
    Fatal(ResqlError),
}

impl From<rusqlite::Error> for ExecError {
    fn from(e: rusqlite::Error) -> ExecError {
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::SystemIoFailure
                    || f.code == rusqlite::ErrorCode::CannotOpen =>
            {
                ExecError::Fatal(ResqlError::Fatal(format!("sql io: {e}")))
            }
            _ => ExecError::User(e.to_string()),
        }
    }
}

fn user(msg: &str) -> ExecError {
    ExecError::User(msg.to_owned())
}

/// Builds the single-error response batch.
pub fn encode_error(msg: &str) -> Vec<u8> {
    let mut resp = Buf::with_capacity(64);
    resp.put_u8(flag::ERROR);
    resp.put_str(msg);
    resp.put_u8(flag::MSG_END);
    resp.into_vec()
}

/// Executes a request batch against the state database, producing the
/// response body. Statement-level failures roll back and produce an error
/// body; only engine-fatal conditions surface as `Err`.
pub fn exec_request(
    db: &StateDb,
    session: &mut Session,
    index: u64,
    readonly: bool,
    req: &[u8],
) -> Result<Vec<u8>> {
    if let Err(e) = db.begin() {
        return Err(ResqlError::Fatal(format!("begin: {e}")));
    }

    match exec_ops(db, session, index, readonly, req) {
        Ok(resp) => {
            if let Err(e) = db.commit() {
                // A failed commit still needs the rollback below.
                let body = encode_error(&e.to_string());
                rollback(db);
                return Ok(body);
            }
            Ok(resp.into_vec())
        }
        Err(ExecError::User(msg)) => {
            rollback(db);
            Ok(encode_error(&msg))
        }
        Err(ExecError::Fatal(e)) => {
            rollback(db);
            Err(e)
        }
    }
}

fn rollback(db: &StateDb) {
    hooks::run_internal(|| {
        if let Err(e) = db.rollback() {
            error!("rollback: {e}");
        }
    });
}

fn exec_ops(
    db: &StateDb,
    session: &mut Session,
    index: u64,
    readonly: bool,
    req: &[u8],
) -> std::result::Result<Buf, ExecError> {
    let mut r = RawBuf::new(req);
    let mut resp = Buf::with_capacity(256);
    resp.put_u8(flag::OK);

    loop {
        let f = r.get_u8();
        if f != flag::OP {
            if f != flag::MSG_END || !r.valid() {
                return Err(user("Invalid message"));
            }
            break;
        }

        resp.put_u8(flag::OP);
        let len_pos = resp.wpos();
        resp.put_u32(0);

        let op = r.get_u8();

        if readonly && (op == flag::STMT_PREPARE || op == flag::STMT_DEL_PREPARED) {
            return Err(user("Not a readonly operation"));
        }

        match op {
            flag::STMT => {
                let sql = r.get_str();
                if !r.valid() {
                    return Err(user("Corrupt message"));
                }
                let mut stmt = db.conn().prepare(sql)?;
                exec_stmt(db, &mut stmt, readonly, &mut r, &mut resp)?;
            }
            flag::STMT_ID => {
                let id = r.get_u64();
                if !r.valid() {
                    return Err(user("Invalid message"));
                }
                let sql = session
                    .get_stmt(id)
                    .ok_or_else(|| user("Prepared statement does not exist."))?
                    .to_owned();
                let mut stmt = db.conn().prepare_cached(&sql)?;
                exec_stmt(db, &mut stmt, readonly, &mut r, &mut resp)?;
            }
            flag::STMT_PREPARE => {
                let sql = r.get_str();
                if !r.valid() {
                    return Err(user("Corrupt message"));
                }

                let id = match session.sql_to_id(sql) {
                    Some(id) => id,
                    None => {
                        // Compile now so a bad statement fails the prepare.
                        db.conn().prepare_cached(sql)?;
                        session.add_stmt(index, sql);
                        index
                    }
                };

                hooks::run_internal(|| db.add_stmt(id, session.id, &session.name, sql))
                    .map_err(|e| ExecError::Fatal(ResqlError::Fatal(format!("stmt: {e}"))))?;

                resp.put_u64(id);
            }
            flag::STMT_DEL_PREPARED => {
                let id = r.get_u64();
                if !r.valid() {
                    return Err(user("Corrupt message"));
                }
                if !session.del_stmt(id) {
                    return Err(user("Prepared statement does not exist."));
                }

                hooks::run_internal(|| db.rm_stmt(id))
                    .map_err(|e| ExecError::Fatal(ResqlError::Fatal(format!("stmt: {e}"))))?;
            }
            _ => return Err(user("Invalid message")),
        }

        if r.get_u8() != flag::OP_END {
            return Err(user("Invalid message"));
        }

        resp.put_u8(flag::OP_END);
        let total = (resp.wpos() - len_pos) as u32;
        resp.set_u32_at(len_pos, total);
    }

    resp.put_u8(flag::MSG_END);

    if !resp.valid() {
        return Err(user("Response is too big."));
    }

    Ok(resp)
}

fn exec_stmt(
    db: &StateDb,
    stmt: &mut Statement,
    readonly: bool,
    r: &mut RawBuf,
    resp: &mut Buf,
) -> std::result::Result<(), ExecError> {
    if readonly && !stmt.readonly() {
        return Err(user("Operation is not readonly."));
    }

    bind_params(stmt, r)?;

    let col = stmt.column_count();
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let change_pos = resp.wpos();
    resp.put_u32(0); // changes
    resp.put_u32(0); // last insert rowid, low half
    resp.put_u32(0); // last insert rowid, high half

    let mut rows = stmt.raw_query();
    let mut first = true;
    let mut count_pos = 0usize;
    let mut count = 0u32;

    while let Some(row) = rows.next().map_err(ExecError::from)? {
        if first {
            first = false;

            // Changes are observable after the first step.
            patch_changes(db, resp, change_pos);

            resp.put_u8(flag::ROW);
            resp.put_u32(col as u32);
            for name in &names {
                resp.put_str(name);
            }
            count_pos = resp.wpos();
            resp.put_u32(0);
        }

        count += 1;
        for i in 0..col {
            match row.get_ref(i).map_err(ExecError::from)? {
                ValueRef::Integer(v) => {
                    resp.put_u8(param::INTEGER);
                    resp.put_u64(v as u64);
                }
                ValueRef::Real(v) => {
                    resp.put_u8(param::FLOAT);
                    resp.put_f64(v);
                }
                ValueRef::Text(v) => {
                    resp.put_u8(param::TEXT);
                    resp.put_str(std::str::from_utf8(v).unwrap_or(""));
                }
                ValueRef::Blob(v) => {
                    resp.put_u8(param::BLOB);
                    resp.put_blob(v);
                }
                ValueRef::Null => resp.put_u8(param::NULL),
            }
        }
    }

    if first {
        // No rows: the statement still ran to completion.
        patch_changes(db, resp, change_pos);
    } else {
        resp.set_u32_at(count_pos, count);
    }

    Ok(())
}

fn patch_changes(db: &StateDb, resp: &mut Buf, pos: usize) {
    let changes = db.conn().changes() as u32;
    let rowid = db.conn().last_insert_rowid() as u64;

    resp.set_u32_at(pos, changes);
    resp.set_u32_at(pos + 4, (rowid & 0xFFFF_FFFF) as u32);
    resp.set_u32_at(pos + 8, (rowid >> 32) as u32);
}

fn bind_params(stmt: &mut Statement, r: &mut RawBuf) -> std::result::Result<(), ExecError> {
    loop {
        let kind = r.get_u8();
        if kind == bind::END {
            break;
        }

        let idx = match kind {
            // Zero-based on the wire, one-based in the engine.
            bind::INDEX => r.get_u32() as usize + 1,
            bind::NAME => {
                let name = r.get_str();
                match stmt.parameter_index(name).map_err(ExecError::from)? {
                    Some(i) => i,
                    None => return Err(user("Invalid parameter name")),
                }
            }
            _ => return Err(user("Invalid message")),
        };

        if !r.valid() {
            return Err(user("Corrupt message"));
        }

        match r.get_u8() {
            param::INTEGER => {
                let v = r.get_u64() as i64;
                stmt.raw_bind_parameter(idx, v).map_err(ExecError::from)?;
            }
            param::FLOAT => {
                let v = r.get_f64();
                stmt.raw_bind_parameter(idx, v).map_err(ExecError::from)?;
            }
            param::TEXT => {
                let v = r.get_str().to_owned();
                stmt.raw_bind_parameter(idx, v).map_err(ExecError::from)?;
            }
            param::BLOB => {
                let v = r.get_blob().to_vec();
                stmt.raw_bind_parameter(idx, v).map_err(ExecError::from)?;
            }
            param::NULL => {
                stmt.raw_bind_parameter(idx, rusqlite::types::Null)
                    .map_err(ExecError::from)?;
            }
            _ => return Err(user("Invalid message")),
        }

        if !r.valid() {
            return Err(user("Corrupt message"));
        }
    }

    Ok(())
}

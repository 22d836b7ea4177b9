// src/core/state/hooks.rs

//! Per-apply SQL-engine hooks.
//!
//! The engine's clock and randomness are virtualized so every replica sees
//! the replicated values: a process-global VFS forwards `xRandomness` and
//! `xCurrentTimeInt64` to a thread-local apply context that each applier
//! installs around `apply()` and tears down afterwards. The `resql()` scalar
//! function uses the same context to queue cluster-management jobs for the
//! consensus core to pick up after the apply returns.

use crate::core::errors::{ResqlError, Result};
use crate::core::state::random::DetRand;
use once_cell::sync::OnceCell;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, ffi};
use std::cell::RefCell;
use std::ffi::{CString, c_char, c_int};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Milliseconds between the julian-day epoch SQLite uses and the Unix epoch.
const UNIX_EPOCH_JULIAN_MS: i64 = 24_405_875 * 8_640_000;

/// A cluster-management request raised from SQL via `resql()`. Queued on the
/// apply context; the consensus core drains it at the next main-loop turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigJob {
    AddNode(String),
    RemoveNode(String),
    Shutdown(String),
}

/// State shared between the applier and the engine hooks for the duration of
/// one apply call (and across calls, for the persistent RNG streams). Only
/// ever touched from the thread that installed it.
pub struct ApplyShared {
    /// Replicated wall clock, milliseconds since the Unix epoch.
    pub realtime: AtomicU64,
    /// The current statement batch is readonly (uses the read RNG).
    pub readonly: AtomicBool,
    /// Client-issued SQL is running (authorizer active).
    pub client: AtomicBool,
    /// Page-count ceiling from `resql('max-size', n)`.
    pub max_page: AtomicU64,
    pub wrand: Mutex<DetRand>,
    pub rrand: Mutex<DetRand>,
    pub jobs: Mutex<Vec<ConfigJob>>,
}

impl ApplyShared {
    pub fn new(rand: DetRand) -> Arc<ApplyShared> {
        Arc::new(ApplyShared {
            realtime: AtomicU64::new(0),
            readonly: AtomicBool::new(false),
            client: AtomicBool::new(false),
            max_page: AtomicU64::new(u64::MAX),
            wrand: Mutex::new(rand.clone()),
            rrand: Mutex::new(rand),
            jobs: Mutex::new(Vec::new()),
        })
    }

    pub fn realtime_ms(&self) -> u64 {
        self.realtime.load(Ordering::Relaxed)
    }

    pub fn set_realtime_ms(&self, ms: u64) {
        self.realtime.store(ms, Ordering::Relaxed);
    }

    pub fn set_readonly(&self, v: bool) {
        self.readonly.store(v, Ordering::Relaxed);
    }

    pub fn set_client(&self, v: bool) {
        self.client.store(v, Ordering::Relaxed);
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ApplyShared>>> = const { RefCell::new(None) };
}

/// Installs `shared` as this thread's apply context until the guard drops.
pub struct ApplyGuard;

pub fn install(shared: &Arc<ApplyShared>) -> ApplyGuard {
    CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(shared)));
    ApplyGuard
}

impl Drop for ApplyGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = None);
    }
}

fn with_current<T>(f: impl FnOnce(&ApplyShared) -> T) -> Option<T> {
    CURRENT.with(|c| c.borrow().as_ref().map(|sh| f(sh)))
}

/// True when client-issued SQL is executing on this thread; drives the
/// authorizer.
pub fn client_active() -> bool {
    with_current(|sh| sh.client.load(Ordering::Relaxed)).unwrap_or(false)
}

/// Runs `f` with the authorizer disabled, for internal bookkeeping writes
/// in the middle of a client request.
pub fn run_internal<T>(f: impl FnOnce() -> T) -> T {
    let prev = with_current(|sh| {
        let p = sh.client.load(Ordering::Relaxed);
        sh.set_client(false);
        p
    });
    let out = f();
    if let Some(p) = prev {
        with_current(|sh| sh.set_client(p));
    }
    out
}

struct VfsHolder {
    vfs: *mut ffi::sqlite3_vfs,
    _name: CString,
}

// The vfs pointer is only handed to sqlite3_vfs_register once and never
// mutated afterwards.
unsafe impl Send for VfsHolder {}
unsafe impl Sync for VfsHolder {}

static VFS: OnceCell<VfsHolder> = OnceCell::new();
static ORIG_VFS: OnceCell<usize> = OnceCell::new();

unsafe extern "C" fn vfs_randomness(
    vfs: *mut ffi::sqlite3_vfs,
    len: c_int,
    out: *mut c_char,
) -> c_int {
    let filled = with_current(|sh| {
        let buf = unsafe { std::slice::from_raw_parts_mut(out as *mut u8, len as usize) };
        if sh.readonly.load(Ordering::Relaxed) {
            sh.rrand.lock().unwrap().fill(buf);
        } else {
            sh.wrand.lock().unwrap().fill(buf);
        }
    });

    if filled.is_none() {
        // No applier on this thread; defer to the stock implementation.
        let orig = *ORIG_VFS.get().unwrap() as *mut ffi::sqlite3_vfs;
        if let Some(f) = unsafe { (*orig).xRandomness } {
            return unsafe { f(vfs, len, out) };
        }
    }

    len
}

unsafe extern "C" fn vfs_current_time(vfs: *mut ffi::sqlite3_vfs, out: *mut i64) -> c_int {
    let wrote = with_current(|sh| {
        unsafe { *out = UNIX_EPOCH_JULIAN_MS + sh.realtime_ms() as i64 };
    });

    if wrote.is_none() {
        let orig = *ORIG_VFS.get().unwrap() as *mut ffi::sqlite3_vfs;
        if let Some(f) = unsafe { (*orig).xCurrentTimeInt64 } {
            return unsafe { f(vfs, out) };
        }
    }

    ffi::SQLITE_OK
}

/// Registers the `resql` VFS as the process default: a copy of the stock VFS
/// with randomness and wall clock routed through the apply context. Safe to
/// call repeatedly; registration happens once.
pub fn global_init() -> Result<()> {
    VFS.get_or_try_init(|| -> Result<VfsHolder> {
        unsafe {
            let orig = ffi::sqlite3_vfs_find(std::ptr::null());
            if orig.is_null() {
                return Err(ResqlError::Internal("no default sqlite vfs".to_owned()));
            }
            ORIG_VFS.set(orig as usize).ok();

            let name = CString::new("resql").unwrap();
            let vfs = Box::into_raw(Box::new(*orig));
            (*vfs).zName = name.as_ptr();
            (*vfs).xRandomness = Some(vfs_randomness);
            (*vfs).xCurrentTimeInt64 = Some(vfs_current_time);

            let rc = ffi::sqlite3_vfs_register(vfs, 1);
            if rc != ffi::SQLITE_OK {
                return Err(ResqlError::Internal(format!(
                    "sqlite3_vfs_register: {rc}"
                )));
            }

            Ok(VfsHolder { vfs, _name: name })
        }
    })?;

    Ok(())
}

const USAGE_DEFAULT: &str = "usage : SELECT resql('config-name', 'param');";
const USAGE_ADD_NODE: &str = "usage : SELECT resql('add-node', 'tcp://name@127.0.0.1:8085');";
const USAGE_REMOVE_NODE: &str = "usage : SELECT resql('remove-node', 'node0');";
const USAGE_SHUTDOWN: &str = "usage : SELECT resql('shutdown', 'node0');";
const USAGE_MAX_SIZE: &str = "usage : SELECT resql('max-size', 5000000);";

fn user_err(msg: &str) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(msg.into())
}

/// Registers the `resql(command, arg)` scalar config function on a
/// connection.
pub fn register_config_fn(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "resql",
        -1,
        FunctionFlags::SQLITE_UTF8,
        |ctx| -> rusqlite::Result<rusqlite::types::Value> {
            use rusqlite::types::Value;

            if ctx.len() == 0 {
                return Err(user_err(USAGE_DEFAULT));
            }

            let cmd: String = ctx.get(0)?;
            match cmd.as_str() {
                "add-node" => {
                    if ctx.len() != 2 {
                        return Err(user_err(USAGE_ADD_NODE));
                    }
                    let url: String = ctx.get(1)?;
                    with_current(|sh| sh.jobs.lock().unwrap().push(ConfigJob::AddNode(url)));
                    Ok(Value::Text(
                        "Config change is in progress. Check resql_log table for details."
                            .to_owned(),
                    ))
                }
                "remove-node" => {
                    if ctx.len() != 2 {
                        return Err(user_err(USAGE_REMOVE_NODE));
                    }
                    let name: String = ctx.get(1)?;
                    with_current(|sh| {
                        sh.jobs.lock().unwrap().push(ConfigJob::RemoveNode(name))
                    });
                    Ok(Value::Text(
                        "Config change is in progress. Check resql_log table for details."
                            .to_owned(),
                    ))
                }
                "shutdown" => {
                    if ctx.len() != 2 {
                        return Err(user_err(USAGE_SHUTDOWN));
                    }
                    let name: String = ctx.get(1)?;
                    with_current(|sh| sh.jobs.lock().unwrap().push(ConfigJob::Shutdown(name)));
                    Ok(Value::Text("Shutdown in progress.".to_owned()))
                }
                "max-size" => {
                    if ctx.len() > 2 {
                        return Err(user_err(USAGE_MAX_SIZE));
                    }
                    if ctx.len() == 2 {
                        let val: i64 = ctx.get(1)?;
                        if val < 0 {
                            return Err(user_err("Max size cannot be negative"));
                        }
                        with_current(|sh| {
                            sh.max_page.store(val as u64 / 4096, Ordering::Relaxed)
                        });
                    }
                    let pages = with_current(|sh| sh.max_page.load(Ordering::Relaxed))
                        .unwrap_or(u64::MAX);
                    Ok(Value::Integer(
                        pages.saturating_mul(4096).min(i64::MAX as u64) as i64,
                    ))
                }
                _ => Err(user_err("Unknown command")),
            }
        },
    )
}

/// Drains jobs queued by `resql()` during the last apply.
pub fn take_jobs(shared: &ApplyShared) -> Vec<ConfigJob> {
    std::mem::take(&mut *shared.jobs.lock().unwrap())
}

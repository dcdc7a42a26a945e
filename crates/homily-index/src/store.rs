//! Read-only access to the SQLite corpus.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, InterruptHandle, OpenFlags};
use tracing::debug;

use crate::error::StorageError;
use crate::hierarchy::{self, BlockNode, SermonOutline};

/// Default number of read connections.
const DEFAULT_POOL_SIZE: usize = 4;

/// Maximum number of read connections.
const MAX_POOL_SIZE: usize = 8;

/// A pooled connection and the handle that interrupts its running statement.
struct Slot {
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
}

/// Progress of one `run` call, shared with its blocking task.
#[derive(Default)]
struct CallState {
    abandoned: bool,
    running: bool,
}

/// Interrupts the statement of a `run` call whose future is dropped.
struct InterruptOnDrop {
    store: Arc<SermonStore>,
    idx: usize,
    state: Arc<Mutex<CallState>>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.abandoned = true;
        // The task clears `running` under this lock before it releases the
        // connection, so the interrupt cannot reach another caller's query.
        if state.running {
            debug!(connection = self.idx, "Interrupting abandoned query");
            self.store.slots[self.idx].interrupt.interrupt();
        }
    }
}

/// A small round-robin pool of read-only connections to the corpus.
///
/// Lexical search, its count query and hydration each take their own
/// connection, so they can run on blocking threads at the same time.
pub struct SermonStore {
    slots: Vec<Slot>,
    next: AtomicUsize,
    path: PathBuf,
}

impl SermonStore {
    /// Open `pool_size` read-only connections to the database at `path`.
    pub fn open(path: &Path, pool_size: usize) -> Result<Self, StorageError> {
        let size = pool_size.clamp(1, MAX_POOL_SIZE);
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| StorageError(format!("cannot open {}: {}", path.display(), e)))?;
            conn.busy_timeout(Duration::from_secs(5))?;
            slots.push(Slot {
                interrupt: conn.get_interrupt_handle(),
                conn: Mutex::new(conn),
            });
        }
        debug!(path = %path.display(), connections = size, "Opened sermon store");
        Ok(Self {
            slots,
            next: AtomicUsize::new(0),
            path: path.to_path_buf(),
        })
    }

    /// Open with the default pool size.
    pub fn open_default(path: &Path) -> Result<Self, StorageError> {
        Self::open(path, DEFAULT_POOL_SIZE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of connections in the pool.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn next_index(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len()
    }

    fn lock(&self, idx: usize) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.slots[idx]
            .conn
            .lock()
            .map_err(|e| StorageError(format!("connection lock poisoned: {e}")))
    }

    /// Execute a closure with a connection from the pool (round-robin).
    pub fn with_conn<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StorageError>,
    {
        let guard = self.lock(self.next_index())?;
        f(&guard)
    }

    /// Run a closure on a blocking thread with a pooled connection.
    ///
    /// Dropping the returned future interrupts the closure's statement, or
    /// skips the closure if it has not started yet.
    pub async fn run<F, T, E>(self: &Arc<Self>, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StorageError> + Send + 'static,
    {
        let idx = self.next_index();
        let state = Arc::new(Mutex::new(CallState::default()));
        let mut guard = InterruptOnDrop {
            store: Arc::clone(self),
            idx,
            state: Arc::clone(&state),
            armed: true,
        };

        let store = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || store.run_on(idx, &state, f))
            .await
            .map_err(|e| E::from(StorageError(format!("blocking task failed: {e}"))));
        guard.armed = false;
        result?
    }

    fn run_on<F, T, E>(&self, idx: usize, state: &Mutex<CallState>, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StorageError>,
    {
        let conn = self.lock(idx)?;
        {
            let mut state = state
                .lock()
                .map_err(|e| StorageError(format!("call state poisoned: {e}")))?;
            if state.abandoned {
                return Err(StorageError("query abandoned".to_string()).into());
            }
            state.running = true;
        }
        let result = f(&conn);
        if let Ok(mut state) = state.lock() {
            state.running = false;
        }
        drop(conn);
        result
    }

    /// Load a sermon and its full section/paragraph/block hierarchy.
    pub async fn load_sermon(
        self: &Arc<Self>,
        uid: &str,
    ) -> Result<Option<SermonOutline>, StorageError> {
        let uid = uid.to_string();
        self.run(move |conn| hierarchy::load_sermon(conn, &uid)).await
    }

    /// Ordered blocks of one paragraph.
    pub async fn paragraph_blocks(
        self: &Arc<Self>,
        paragraph_uid: &str,
    ) -> Result<Vec<BlockNode>, StorageError> {
        let uid = paragraph_uid.to_string();
        self.run(move |conn| hierarchy::paragraph_blocks(conn, &uid)).await
    }
}

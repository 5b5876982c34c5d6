//! # Database Adapter
//!
//! SQLite's `Connection` is `!Sync`, so the adapter gives it a dedicated OS
//! thread and talks to it over an async channel. Callers submit closures
//! that run on the connection; results come back on oneshot channels.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Tokio Tasks                         │
//! │   satellite loop ──┐                                 │
//! │   subscriptions ───┼── mpsc<Job> ──► dedicated thread│
//! │   tests ───────────┘                 owns Connection │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! `transaction` wraps the closure in BEGIN/COMMIT and hands it the open
//! transaction, so multi-step flows (the snapshot, the applier) execute as
//! one ACID unit and still return a value.

use std::thread::{self, JoinHandle};

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// Pending-job bound; submitters briefly back-pressure past this.
const JOB_CHANNEL_SIZE: usize = 256;

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

// =============================================================================
// Adapter
// =============================================================================

/// Async handle to the connection-owning thread. Cloneable; all clones share
/// the thread. The thread exits when every handle is dropped.
#[derive(Clone)]
pub struct Adapter {
    job_tx: mpsc::Sender<Job>,
}

impl Adapter {
    /// Spawns the adapter thread around `conn`.
    pub fn new(conn: Connection) -> Self {
        let (job_tx, job_rx) = mpsc::channel(JOB_CHANNEL_SIZE);
        let _handle: JoinHandle<()> = thread::Builder::new()
            .name("satlite-db".to_string())
            .spawn(move || run_adapter(conn, job_rx))
            .expect("failed to spawn database adapter thread");
        Self { job_tx }
    }

    /// Runs `f` on the connection thread and returns its result.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let _ = response_tx.send(f(conn));
        });
        self.job_tx.send(job).await.map_err(|_| Error::Stopped)?;
        response_rx.await.map_err(|_| Error::Stopped)?
    }

    /// Executes one statement; returns the affected-row count.
    pub async fn run(&self, sql: impl Into<String>) -> Result<usize> {
        let sql = sql.into();
        self.call(move |conn| Ok(conn.execute(&sql, [])?)).await
    }

    /// Executes a multi-statement batch.
    pub async fn run_batch(&self, sql: impl Into<String>) -> Result<()> {
        let sql = sql.into();
        self.call(move |conn| Ok(conn.execute_batch(&sql)?)).await
    }

    /// Runs `f` inside a single database transaction, committing on `Ok` and
    /// rolling back on `Err`, and returns the closure's value.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&rusqlite::Transaction<'a>) -> Result<T> + Send + 'static,
    {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }
}

fn run_adapter(mut conn: Connection, mut job_rx: mpsc::Receiver<Job>) {
    while let Some(job) = job_rx.blocking_recv() {
        job(&mut conn);
    }
}

// =============================================================================
// Tests
// =============================================================================

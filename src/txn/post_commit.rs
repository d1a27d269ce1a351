//! Post-Commit Daemon
//!
//! Background worker that frees pages left empty by committed deletes.
//!
//! ```text
//! commit ──► enqueue(ReclaimPage) ──► channel ──► worker ──► reclaim_page()
//!                                                   │
//!                                   Weak<work> ─────┘ (exits once the database is gone)
//! ```
//!
//! Reclaim is best effort: a page that cannot be locked right away is skipped
//! and left to `compress`.

use std::sync::Weak;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, VaultError};
use crate::{ContainerId, PageNumber};

/// Work the daemon performs against the database
pub(crate) trait PostCommitWork: Send + Sync + 'static {
    fn reclaim_page(&self, container: ContainerId, page: PageNumber) -> Result<()>;
}

pub(crate) enum PostCommitTask {
    ReclaimPage {
        container: ContainerId,
        page: PageNumber,
    },
    /// Answered once every earlier task has run
    Barrier(Sender<()>),
}

/// Handle on the worker thread
#[derive(Default)]
pub(crate) struct PostCommitDaemon {
    sender: Mutex<Option<Sender<PostCommitTask>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PostCommitDaemon {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn the worker
    pub(crate) fn start<W: PostCommitWork>(&self, work: Weak<W>) -> Result<()> {
        let (sender, receiver) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("pagevault-post-commit".to_string())
            .spawn(move || run_worker(work, receiver))?;
        *self.sender.lock() = Some(sender);
        *self.handle.lock() = Some(handle);
        info!("post-commit daemon started");
        Ok(())
    }

    pub(crate) fn enqueue(&self, task: PostCommitTask) {
        match self.sender.lock().as_ref() {
            Some(sender) => {
                if sender.send(task).is_err() {
                    debug!("post-commit daemon gone, task dropped");
                }
            }
            None => debug!("post-commit daemon not running, task dropped"),
        }
    }

    /// Block until every task queued so far has been processed
    pub(crate) fn wait_idle(&self) -> Result<()> {
        let (done_tx, done_rx) = channel::bounded(1);
        {
            let sender = self.sender.lock();
            let Some(sender) = sender.as_ref() else {
                return Ok(());
            };
            sender
                .send(PostCommitTask::Barrier(done_tx))
                .map_err(|_| VaultError::DatabaseFatal("post-commit daemon stopped".to_string()))?;
        }
        done_rx
            .recv()
            .map_err(|_| VaultError::DatabaseFatal("post-commit daemon stopped".to_string()))
    }

    /// Close the queue and join the worker
    pub(crate) fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                // Last database handle dropped on the worker itself
                return;
            }
            if handle.join().is_err() {
                warn!("post-commit daemon panicked");
            }
        }
    }
}

fn run_worker<W: PostCommitWork>(work: Weak<W>, receiver: Receiver<PostCommitTask>) {
    for task in receiver {
        match task {
            PostCommitTask::ReclaimPage { container, page } => {
                let Some(work) = work.upgrade() else {
                    break;
                };
                if let Err(err) = work.reclaim_page(container, page) {
                    warn!(container, page, error = %err, "post-commit reclaim failed");
                }
            }
            PostCommitTask::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("post-commit daemon stopped");
}

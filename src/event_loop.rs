use crate::connection::Connection;
use crate::error::ReceiveError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

/// Lifecycle of an [`EventLoop`]. A loop runs once: `Idle` until
/// [`run`](EventLoop::run), then `Running`, then `Stopped` for good.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Event loop has already run")]
    NotIdle,
    #[error(transparent)]
    Receive(#[from] ReceiveError),
}

#[derive(Default)]
struct StopFlag {
    requested: AtomicBool,
    notify: Notify,
}

/// Cloneable handle to stop a running [`EventLoop`].
///
/// Safe to call from inside a signal callback: the request is honored after
/// the callback returns, between frame dispatches, never pre-emptively.
#[derive(Clone)]
pub struct LoopHandle {
    flag: Arc<StopFlag>,
}

impl LoopHandle {
    pub fn stop(&self) {
        self.flag.requested.store(true, Ordering::SeqCst);
        // notify_one leaves a permit behind, so a stop request just before
        // the loop blocks is not lost.
        self.flag.notify.notify_one();
    }
}

/// Drives a [`Connection`]: receives frames and dispatches them to the
/// registered subscriptions until stopped or the connection closes.
///
/// The loop is the only driver of I/O while it runs; callbacks execute
/// synchronously on its task.
pub struct EventLoop {
    connection: Option<Connection>,
    state: LoopState,
    stop: Arc<StopFlag>,
}

impl EventLoop {
    pub fn new(connection: Connection) -> EventLoop {
        EventLoop {
            connection: Some(connection),
            state: LoopState::Idle,
            stop: Arc::new(StopFlag::default()),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// A handle for stopping the loop, usable from inside callbacks.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            flag: self.stop.clone(),
        }
    }

    /// Run until [`LoopHandle::stop`] is observed or the connection closes;
    /// both end with `Ok(())`. Decode and I/O failures end the loop with an
    /// error. Callback errors are logged by the dispatch layer and do not
    /// stop the loop.
    pub async fn run(&mut self) -> Result<(), RunError> {
        if self.state != LoopState::Idle {
            return Err(RunError::NotIdle);
        }
        let connection = match self.connection.clone() {
            Some(connection) => connection,
            None => return Err(RunError::NotIdle),
        };

        self.state = LoopState::Running;
        let result = self.drive(&connection).await;
        self.state = LoopState::Stopped;
        // Terminal state: release the loop's connection reference.
        self.connection = None;
        result
    }

    async fn drive(&self, connection: &Connection) -> Result<(), RunError> {
        loop {
            // Stop requests are observed here, between frame dispatches.
            if self.stop.requested.load(Ordering::SeqCst) {
                debug!("event loop stopped");
                return Ok(());
            }
            let msg = tokio::select! {
                msg = connection.receive_next() => msg,
                _ = self.stop.notify.notified() => continue,
            };
            match msg {
                Ok(msg) => connection.dispatch(&msg),
                Err(ReceiveError::Closed) => {
                    debug!("connection closed, event loop done");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

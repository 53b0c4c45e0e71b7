//! The data manager contract over the overlay.

use crate::error::CoreError;
use crate::network::messages::{DirectMessage, PeerAddress};
use crate::network::parameters::{Parameters, VersionKey};
use crate::network::content::NetworkContent;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Reply of a peer to a directly sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptanceReply {
    Ok,
    Failure,
    FutureFailure,
}

/// A record read from the overlay: the content envelope plus the version
/// metadata of the stored record.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub content: NetworkContent,
    pub version_key: Option<VersionKey>,
    pub based_on_key: Option<VersionKey>,
}

/// Receiver side of direct messages, registered per local peer address.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &DirectMessage) -> AcceptanceReply;
}

/// Thin contract over the overlay: key/value records with version chaining
/// and protection keys, plus direct peer messaging. Blocking calls inherit
/// the overlay's own timeouts.
pub trait DataManager: Send + Sync {
    /// Read a record. `Ok(None)` means absence; transport errors are
    /// `CoreError::GetFailed`.
    fn get(&self, params: &Parameters) -> Result<Option<FetchedContent>, CoreError>;

    /// Write a record. The overlay rejects stale based-on keys and puts
    /// lacking the record's protection keys with `CoreError::PutFailed`.
    fn put(&self, params: &Parameters) -> Result<(), CoreError>;

    /// Delete a record, subject to the same protection rules as `put`.
    fn remove(&self, params: &Parameters) -> Result<(), CoreError>;

    /// Deliver a message directly to a peer and collect its reply. A
    /// non-`Ok` reply means the peer denied or could not process the
    /// message; transport-level failure is `CoreError::SendFailed`.
    fn send_direct(
        &self,
        peer: &PeerAddress,
        message: DirectMessage,
    ) -> Result<AcceptanceReply, CoreError>;

    /// Register the receiver for messages addressed to `peer` on this node.
    fn register_receiver(&self, peer: &PeerAddress, handler: Arc<dyn MessageHandler>);

    /// Remove the receiver of `peer`.
    fn unregister_receiver(&self, peer: &PeerAddress);
}

/// Awaitable handle of a non-blocking put.
#[derive(Clone)]
pub struct PutFuture {
    inner: Arc<PutFutureInner>,
}

type CompletionListener = Box<dyn FnOnce(&Result<(), String>) + Send>;

struct PutFutureInner {
    cancelled: AtomicBool,
    done: Mutex<Option<Result<(), String>>>,
    cond: Condvar,
    listeners: Mutex<Vec<CompletionListener>>,
}

impl PutFuture {
    fn new() -> Self {
        Self {
            inner: Arc::new(PutFutureInner {
                cancelled: AtomicBool::new(false),
                done: Mutex::new(None),
                cond: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Request cancellation. The backend observes the flag at its own
    /// suspension points; an already-started put may still complete.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block until the put completed.
    pub fn await_result(&self) -> Result<(), CoreError> {
        let mut done = self.inner.done.lock();
        loop {
            if let Some(result) = done.as_ref() {
                return match result {
                    Ok(()) => Ok(()),
                    Err(message) => Err(CoreError::PutFailed(message.clone())),
                };
            }
            self.inner.cond.wait(&mut done);
        }
    }

    /// Register a completion callback. Runs immediately when the put has
    /// already completed.
    pub fn on_complete(&self, listener: impl FnOnce(&Result<(), String>) + Send + 'static) {
        let done = self.inner.done.lock();
        if let Some(result) = done.as_ref() {
            listener(result);
            return;
        }
        self.inner.listeners.lock().push(Box::new(listener));
    }

    fn complete(&self, result: Result<(), CoreError>) {
        let stored = result.map_err(|e| e.to_string());
        {
            let mut done = self.inner.done.lock();
            *done = Some(stored.clone());
        }
        self.inner.cond.notify_all();
        for listener in self.inner.listeners.lock().drain(..) {
            listener(&stored);
        }
    }
}

/// Start a put on a worker thread and return its handle.
pub fn put_unblocked(data_manager: Arc<dyn DataManager>, params: Parameters) -> PutFuture {
    let future = PutFuture::new();
    let handle = future.clone();
    std::thread::spawn(move || {
        if handle.is_cancelled() {
            debug!("unblocked put cancelled before start");
            handle.complete(Err(CoreError::PutFailed("put cancelled".to_string())));
            return;
        }
        handle.complete(data_manager.put(&params));
    });
    future
}

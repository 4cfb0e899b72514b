//! Completion delivery for asynchronous calls.
//!
//! Every asynchronous call registers its [`Callback`] in [`PendingCalls`]
//! under a call id of its own, so two calls carrying the same message never
//! share a slot. Exactly one of completion, failure, or expiry removes the
//! entry and delivers to the callback; whichever comes later finds nothing
//! and is dropped.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use soapflow_core::{Fault, MessageContext, Payload};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::operation::DispatchError;

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// The response of a completed asynchronous call.
#[derive(Debug, Clone)]
pub struct AsyncResult {
    response: MessageContext,
}

impl AsyncResult {
    #[must_use]
    pub fn new(response: MessageContext) -> Self {
        Self { response }
    }

    #[must_use]
    pub fn response(&self) -> &MessageContext {
        &self.response
    }

    /// Body of the response message.
    #[must_use]
    pub fn response_payload(&self) -> &Payload {
        &self.response.payload
    }

    #[must_use]
    pub fn into_response(self) -> MessageContext {
        self.response
    }
}

/// Why an asynchronous call produced no response.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(
        "no response within {waited_ms}ms; the server may be down or the response took too long"
    )]
    Timeout { waited_ms: u64 },
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error("dispatch failed: {0}")]
    Dispatch(#[source] DispatchError),
    #[error("transport failure: {0}")]
    Transport(#[source] anyhow::Error),
    #[error("call task ended without delivering a result")]
    Abandoned,
}

impl CallError {
    pub(crate) fn timeout(waited: Duration) -> Self {
        CallError::Timeout {
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<DispatchError> for CallError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Fault(fault) => CallError::Fault(fault),
            other => CallError::Dispatch(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Callback
// ---------------------------------------------------------------------------

/// Receiver of an asynchronous call's result.
///
/// Both methods consume the callback, so at most one of them ever runs.
pub trait Callback: Send + 'static {
    fn on_complete(self: Box<Self>, result: AsyncResult);

    fn report_error(self: Box<Self>, error: CallError);
}

/// Adapts a closure into a [`Callback`].
pub struct FnCallback<F>(F);

impl<F> Callback for FnCallback<F>
where
    F: FnOnce(Result<AsyncResult, CallError>) + Send + 'static,
{
    fn on_complete(self: Box<Self>, result: AsyncResult) {
        let FnCallback(f) = *self;
        f(Ok(result));
    }

    fn report_error(self: Box<Self>, error: CallError) {
        let FnCallback(f) = *self;
        f(Err(error));
    }
}

/// Boxes `f` as a callback receiving either the result or the error.
pub fn callback_fn<F>(f: F) -> Box<dyn Callback>
where
    F: FnOnce(Result<AsyncResult, CallError>) + Send + 'static,
{
    Box::new(FnCallback(f))
}

// ---------------------------------------------------------------------------
// PendingCalls
// ---------------------------------------------------------------------------

/// How a pending call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Completed,
    Failed,
    TimedOut,
}

struct Slot {
    message_id: Uuid,
    callback: Box<dyn Callback>,
    done: oneshot::Sender<CallStatus>,
}

/// Outstanding asynchronous calls keyed by call id.
///
/// Callbacks are only `Send`; each slot sits behind a mutex so the table
/// can be shared between tasks.
#[derive(Default)]
pub struct PendingCalls {
    slots: DashMap<Uuid, Mutex<Slot>>,
}

impl PendingCalls {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for call `id` carrying request `message_id`. The
    /// receiver resolves once the call ends, however it ends.
    ///
    /// Call ids must be unique; a registration never replaces another, so a
    /// reused id leaves the existing call in place and the new callback
    /// receives `CallError::Abandoned`.
    pub fn register(
        &self,
        id: Uuid,
        message_id: Uuid,
        callback: Box<dyn Callback>,
    ) -> oneshot::Receiver<CallStatus> {
        let (done, status) = oneshot::channel();
        if let Entry::Vacant(slot) = self.slots.entry(id) {
            slot.insert(Mutex::new(Slot {
                message_id,
                callback,
                done,
            }));
            return status;
        }
        warn!(call_id = %id, message_id = %message_id, "call id already pending");
        callback.report_error(CallError::Abandoned);
        let _ = done.send(CallStatus::Failed);
        status
    }

    /// Delivers the result of call `id`.
    ///
    /// Returns `false` when the call already ended, in which case the result
    /// is discarded.
    pub fn complete(&self, id: Uuid, result: Result<AsyncResult, CallError>) -> bool {
        let Some(slot) = self.take(id) else {
            debug!(call_id = %id, "late result discarded");
            return false;
        };
        let status = match result {
            Ok(result) => {
                slot.callback.on_complete(result);
                CallStatus::Completed
            }
            Err(error) => {
                slot.callback.report_error(error);
                CallStatus::Failed
            }
        };
        // The waiter may have gone away; the callback has already run.
        let _ = slot.done.send(status);
        true
    }

    /// Ends call `id` with a timeout after `waited`.
    ///
    /// Returns `false` when the call already ended.
    pub fn expire(&self, id: Uuid, waited: Duration) -> bool {
        let Some(slot) = self.take(id) else {
            return false;
        };
        warn!(
            call_id = %id,
            message_id = %slot.message_id,
            waited = ?waited,
            "asynchronous call timed out"
        );
        slot.callback.report_error(CallError::timeout(waited));
        let _ = slot.done.send(CallStatus::TimedOut);
        true
    }

    fn take(&self, id: Uuid) -> Option<Slot> {
        self.slots.remove(&id).map(|(_, slot)| slot.into_inner())
    }

    #[must_use]
    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.slots.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ---------------------------------------------------------------------------
// PendingCall
// ---------------------------------------------------------------------------

/// Handle to one outstanding asynchronous call.
///
/// Dropping the handle does not cancel the call; the callback still runs.
pub struct PendingCall {
    id: Uuid,
    message_id: Uuid,
    status: oneshot::Receiver<CallStatus>,
    calls: std::sync::Arc<PendingCalls>,
    poll_interval: Duration,
    max_checks: u32,
}

impl PendingCall {
    pub(crate) fn new(
        id: Uuid,
        message_id: Uuid,
        status: oneshot::Receiver<CallStatus>,
        calls: std::sync::Arc<PendingCalls>,
        poll_interval: Duration,
        max_checks: u32,
    ) -> Self {
        Self {
            id,
            message_id,
            status,
            calls,
            poll_interval,
            max_checks,
        }
    }

    /// Id under which the call is tracked in [`PendingCalls`].
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Message id of the request.
    #[must_use]
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Waits for the call to end, checking once per poll interval.
    ///
    /// After the configured number of checks the call is expired, so its
    /// callback receives a timeout and any later result is dropped. The
    /// expiry runs on a task of its own, never on the waiting one.
    ///
    /// # Errors
    ///
    /// `CallError::Timeout` if the call timed out, `CallError::Abandoned` if
    /// it ended without a status.
    pub async fn wait(mut self) -> Result<CallStatus, CallError> {
        let bound = self.poll_interval * self.max_checks;
        for _ in 0..self.max_checks {
            match tokio::time::timeout(self.poll_interval, &mut self.status).await {
                Ok(Ok(status)) => return settle(status, bound),
                Ok(Err(_)) => return Err(CallError::Abandoned),
                Err(_) => {}
            }
        }

        let calls = std::sync::Arc::clone(&self.calls);
        let id = self.id;
        tokio::spawn(async move {
            calls.expire(id, bound);
        });
        // Resolves with the expiry, or with a result that won the race.
        match self.status.await {
            Ok(status) => settle(status, bound),
            Err(_) => Err(CallError::Abandoned),
        }
    }
}

fn settle(status: CallStatus, bound: Duration) -> Result<CallStatus, CallError> {
    match status {
        CallStatus::TimedOut => Err(CallError::timeout(bound)),
        other => Ok(other),
    }
}

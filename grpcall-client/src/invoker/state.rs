//! Shared state of one call.
//!
//! Every handle the caller holds and the background driver point at the same
//! [`CallCore`]. Results are published through write-once [`Gate`]s so the
//! first outcome wins and every waiter observes the same value.

use std::sync::{Arc, Mutex, PoisonError};

use grpcall_core::{Metadata, Status};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::deadline::{CancelReason, CancelSignal};
use crate::marshaller::MethodKind;

/// Lifecycle of a call.
///
/// States only move forward. `Completed` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallState {
    Created,
    RequestSent,
    HeadersReceived,
    StreamingBody,
    Completed,
    Canceled,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Completed | CallState::Canceled)
    }
}

/// Final outcome of a call: its status and the trailers that carried it.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: Status,
    pub trailers: Metadata,
}

/// Write-once cell with async waiters.
pub(crate) struct Gate<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Gate<T> {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Publish `value` unless something was published already.
    pub(crate) fn resolve(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    pub(crate) fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub(crate) async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        let value = rx
            .wait_for(Option::is_some)
            .await
            .expect("gate sender lives as long as the gate");
        value.clone().expect("wait_for returned an empty gate")
    }
}

pub(crate) struct CallCore {
    method: Arc<str>,
    kind: MethodKind,
    state: Mutex<CallState>,
    pub(crate) signal: CancelSignal,
    /// Fired once the completion is committed.
    pub(crate) done: CancellationToken,
    headers: Gate<Result<Metadata, Status>>,
    completion: Gate<Completion>,
}

impl CallCore {
    pub(crate) fn new(method: Arc<str>, kind: MethodKind, signal: CancelSignal) -> Self {
        Self {
            method,
            kind,
            state: Mutex::new(CallState::Created),
            signal,
            done: CancellationToken::new(),
            headers: Gate::new(),
            completion: Gate::new(),
        }
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn kind(&self) -> MethodKind {
        self.kind
    }

    pub(crate) fn state(&self) -> CallState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to a later non-terminal state. Earlier or equal states and any
    /// transition out of a terminal state are ignored.
    pub(crate) fn advance(&self, next: CallState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_terminal() || next.is_terminal() || next <= *state {
            return;
        }
        tracing::trace!(method = %self.method, from = ?*state, to = ?next, "call state");
        *state = next;
    }

    /// Publish the response headers. Returns `false` if they were already
    /// settled, for example by an earlier failure.
    pub(crate) fn resolve_headers(&self, headers: Metadata) -> bool {
        let resolved = self.headers.resolve(Ok(headers));
        if resolved {
            self.advance(CallState::HeadersReceived);
        }
        resolved
    }

    pub(crate) async fn headers(&self) -> Result<Metadata, Status> {
        self.headers.wait().await
    }

    pub(crate) fn completion(&self) -> Option<Completion> {
        self.completion.peek()
    }

    pub(crate) async fn wait_completion(&self) -> Completion {
        self.completion.wait().await
    }

    /// Commit the final status. First caller wins; later calls return
    /// `false` and change nothing.
    pub(crate) fn complete(&self, status: Status, trailers: Metadata) -> bool {
        self.finish(status, trailers, CallState::Completed)
    }

    /// Fire the cancellation signal and commit the matching status.
    pub(crate) fn cancel(&self, reason: CancelReason) -> bool {
        if self.completion.peek().is_some() {
            return false;
        }
        let recorded = self.signal.cancel(reason);
        self.finish(recorded.to_status(), Metadata::default(), CallState::Canceled)
    }

    fn finish(&self, status: Status, trailers: Metadata, terminal: CallState) -> bool {
        {
            // state readers block until the gates below are settled
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_terminal() {
                return false;
            }
            *state = terminal;
            // headers settle first so nobody observes trailers without them
            self.headers.resolve(Err(status.clone()));
            self.completion.resolve(Completion {
                status: status.clone(),
                trailers,
            });
        }
        self.done.cancel();
        if status.is_ok() {
            tracing::debug!(method = %self.method, state = ?terminal, "call completed");
        } else {
            tracing::debug!(
                method = %self.method,
                state = ?terminal,
                code = %status.code(),
                detail = status.message().unwrap_or_default(),
                "call completed with error"
            );
        }
        true
    }

    /// Whether the caller's reads should stop with the final status right
    /// away, without waiting for buffered messages.
    pub(crate) fn is_canceled(&self) -> bool {
        self.state() == CallState::Canceled
    }
}

/// Cancels the call once the last caller-side handle is gone.
pub(crate) struct CallGuard {
    core: Arc<CallCore>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.core.cancel(CancelReason::Cancelled) {
            tracing::debug!(method = %self.core.method(), "call dropped before completion");
        }
    }
}

/// Status, metadata and cancellation access for a call.
///
/// Cheap to clone. Dropping every handle of an unfinished call cancels it.
#[derive(Clone)]
pub struct CallHandle {
    core: Arc<CallCore>,
    _guard: Arc<CallGuard>,
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("method", &self.core.method())
            .field("kind", &self.core.kind())
            .field("state", &self.core.state())
            .finish()
    }
}

impl CallHandle {
    pub(crate) fn new(core: Arc<CallCore>) -> Self {
        let guard = Arc::new(CallGuard { core: core.clone() });
        Self {
            core,
            _guard: guard,
        }
    }

    pub(crate) fn core(&self) -> &Arc<CallCore> {
        &self.core
    }

    /// Full method path, `/<service>/<method>`.
    pub fn method(&self) -> &str {
        self.core.method()
    }

    pub fn kind(&self) -> MethodKind {
        self.core.kind()
    }

    pub fn state(&self) -> CallState {
        self.core.state()
    }

    /// Response headers, or the status the call ended with before they
    /// arrived.
    pub async fn response_headers(&self) -> Result<Metadata, Status> {
        self.core.headers().await
    }

    /// Final status. Resolves even if the response body is never read.
    pub async fn status(&self) -> Status {
        self.core.wait_completion().await.status
    }

    /// Response trailers, available together with the status. Empty when
    /// the call ended locally.
    pub async fn trailers(&self) -> Metadata {
        self.core.wait_completion().await.trailers
    }

    /// Status and trailers together.
    pub async fn completion(&self) -> Completion {
        self.core.wait_completion().await
    }

    /// Final status if the call has completed.
    pub fn get_status(&self) -> Option<Status> {
        self.core.completion().map(|c| c.status)
    }

    /// Trailers if the call has completed.
    pub fn get_trailers(&self) -> Option<Metadata> {
        self.core.completion().map(|c| c.trailers)
    }

    /// Cancel the call. Pending operations complete with `Cancelled`.
    /// No-op once the call has completed.
    pub fn cancel(&self) {
        self.core.cancel(CancelReason::Cancelled);
    }

    pub fn is_complete(&self) -> bool {
        self.core.state().is_terminal()
    }
}

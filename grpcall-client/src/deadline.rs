//! Deadlines and the shared cancellation signal.
//!
//! A call owns one [`CancelSignal`]. The caller (through a call handle or a
//! linked [`CancellationToken`]) and the [`DeadlineManager`] timer both fire
//! the same signal; whichever fires first records the [`CancelReason`].

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use grpcall_core::Status;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Largest value the `grpc-timeout` header can carry (eight digits).
pub const MAX_TIMEOUT_VALUE: u128 = 99_999_999;

const UNITS: [(char, u128); 6] = [
    ('n', 1),
    ('u', 1_000),
    ('m', 1_000_000),
    ('S', 1_000_000_000),
    ('M', 60 * 1_000_000_000),
    ('H', 3_600 * 1_000_000_000),
];

/// Encode a timeout as a `grpc-timeout` value.
///
/// Picks the finest unit whose value fits in eight digits, rounding up so
/// the server never sees a shorter deadline than the client. Anything
/// beyond the hour range is clamped; zero is sent as `1n`.
pub fn encode_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();
    if nanos == 0 {
        return "1n".to_string();
    }
    for (unit, size) in UNITS {
        let value = nanos.div_ceil(size);
        if value <= MAX_TIMEOUT_VALUE {
            return format!("{value}{unit}");
        }
    }
    format!("{MAX_TIMEOUT_VALUE}H")
}

/// Parse a `grpc-timeout` value.
pub fn decode_timeout(value: &str) -> Option<Duration> {
    let unit = value.chars().last()?;
    let digits = &value[..value.len() - unit.len_utf8()];
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let size = UNITS.iter().find(|(u, _)| *u == unit)?.1 as u64;
    Some(Duration::from_nanos(amount.checked_mul(size)?))
}

/// Why a call was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled the call or its linked token.
    Cancelled,
    /// The deadline elapsed first.
    DeadlineExceeded,
}

impl CancelReason {
    pub fn to_status(self) -> Status {
        match self {
            CancelReason::Cancelled => Status::cancelled("Call canceled by the client."),
            CancelReason::DeadlineExceeded => Status::deadline_exceeded("Deadline Exceeded"),
        }
    }
}

/// One-shot cancellation signal carrying the reason of whoever fired first.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that also fires when `parent` is cancelled. Parent
    /// cancellation is recorded as [`CancelReason::Cancelled`].
    pub fn linked(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            reason: Arc::default(),
        }
    }

    /// Fire the signal. Returns the reason that ends up recorded, which is
    /// `reason` only if nobody fired before.
    pub fn cancel(&self, reason: CancelReason) -> CancelReason {
        let recorded = if self.token.is_cancelled() {
            *self.reason.get_or_init(|| CancelReason::Cancelled)
        } else {
            *self.reason.get_or_init(|| reason)
        };
        self.token.cancel();
        recorded
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Recorded reason, once fired.
    pub fn reason(&self) -> Option<CancelReason> {
        self.is_cancelled()
            .then(|| *self.reason.get_or_init(|| CancelReason::Cancelled))
    }

    /// Wait until the signal fires.
    pub async fn cancelled(&self) -> CancelReason {
        self.token.cancelled().await;
        *self.reason.get_or_init(|| CancelReason::Cancelled)
    }
}

/// Deadline of one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineManager {
    deadline: Option<Instant>,
}

impl DeadlineManager {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Start the deadline timer. Fires `signal` with
    /// [`CancelReason::DeadlineExceeded`] unless `done` or the signal itself
    /// fires first. No deadline, no timer.
    pub fn start(&self, signal: CancelSignal, done: CancellationToken) -> Option<JoinHandle<()>> {
        let deadline = self.deadline?;
        Some(tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = done.cancelled() => {}
                _ = signal.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let reason = signal.cancel(CancelReason::DeadlineExceeded);
                    tracing::debug!(?reason, "call deadline elapsed");
                }
            }
        }))
    }
}

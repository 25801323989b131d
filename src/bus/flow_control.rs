//! Global admission control: sliding-window rate limiting with priority
//! queued waiters
//!
//! The rate window is split into ten equal sub-windows whose counts are
//! summed to approximate a rolling count. Over-limit admissions either wait
//! in a priority queue (higher priority served first, FIFO among equals) or
//! are rejected immediately for non-blocking envelopes. Every granted ticket
//! must be released at dispatch completion; the ticket is a guard that
//! releases on drop.

use crate::config::FlowConfig;
use crate::error::BusError;
use crate::message::Envelope;
use crate::metrics::SharedMetrics;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

const SUB_WINDOWS: usize = 10;
/// Waiters older than this are promoted one priority band per maintenance
/// pass, bounding starvation.
const AGING_INTERVAL: Duration = Duration::from_secs(1);
const MAX_PROMOTIONS: u32 = 20;

/// Soft backpressure signal surfaced to transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureLevel {
    /// Admission is keeping up
    Normal,
    /// The waiter queue is deep; subscribers should throttle deliveries
    Busy,
}

struct Waiter {
    tx: oneshot::Sender<()>,
    enqueued_at: Instant,
    promotions: u32,
}

struct FlowState {
    slots: [u64; SUB_WINDOWS],
    slot_index: usize,
    slot_started: Instant,
    in_flight: usize,
    waiters: BTreeMap<i32, VecDeque<Waiter>>,
    waiter_count: usize,
    closed: bool,
}

impl FlowState {
    fn advance(&mut self, now: Instant, slot_len: Duration) {
        if slot_len.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.slot_started);
        let steps = (elapsed.as_nanos() / slot_len.as_nanos()) as usize;
        if steps == 0 {
            return;
        }
        for _ in 0..steps.min(SUB_WINDOWS) {
            self.slot_index = (self.slot_index + 1) % SUB_WINDOWS;
            self.slots[self.slot_index] = 0;
        }
        self.slot_started += slot_len * u32::try_from(steps.min(u32::MAX as usize)).unwrap_or(u32::MAX);
    }

    fn window_count(&self) -> u64 {
        self.slots.iter().sum()
    }

    fn pop_highest_priority(&mut self) -> Option<Waiter> {
        let key = *self.waiters.keys().next_back()?;
        let bucket = self.waiters.get_mut(&key)?;
        let waiter = bucket.pop_front();
        if bucket.is_empty() {
            self.waiters.remove(&key);
        }
        if waiter.is_some() {
            self.waiter_count -= 1;
        }
        waiter
    }
}

/// Global admission gate combining a sliding-window rate limiter with a
/// bounded in-flight cap
pub struct FlowController {
    config: FlowConfig,
    state: Mutex<FlowState>,
    backpressure_tx: watch::Sender<BackpressureLevel>,
    metrics: SharedMetrics,
}

/// Grant returned by [`FlowController::admit`]; releases its slot on drop
pub struct AdmissionTicket {
    controller: Weak<FlowController>,
}

impl AdmissionTicket {
    /// Releases the slot now
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.upgrade() {
            controller.release_slot();
        }
    }
}

impl FlowController {
    /// Creates a controller from configuration
    #[must_use]
    pub fn new(config: FlowConfig, metrics: SharedMetrics) -> Arc<Self> {
        let (backpressure_tx, _) = watch::channel(BackpressureLevel::Normal);
        Arc::new(Self {
            config,
            state: Mutex::new(FlowState {
                slots: [0; SUB_WINDOWS],
                slot_index: 0,
                slot_started: Instant::now(),
                in_flight: 0,
                waiters: BTreeMap::new(),
                waiter_count: 0,
                closed: false,
            }),
            backpressure_tx,
            metrics,
        })
    }

    fn slot_len(&self) -> Duration {
        self.config.window.as_duration() / SUB_WINDOWS as u32
    }

    /// Subscribes to the soft-backpressure signal
    #[must_use]
    pub fn subscribe_backpressure(&self) -> watch::Receiver<BackpressureLevel> {
        self.backpressure_tx.subscribe()
    }

    /// Current number of admitted-but-unreleased dispatches
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().expect("flow state poisoned").in_flight
    }

    /// Current number of queued waiters
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().expect("flow state poisoned").waiter_count
    }

    /// Rate budget visible to an admission at this priority: the full
    /// window minus shares reserved for strictly higher priority bands.
    fn rate_budget(&self, priority: i32) -> u64 {
        let reserved_above: f64 = self
            .config
            .reservations
            .iter()
            .filter(|r| r.min_priority > priority)
            .map(|r| r.ratio)
            .sum();
        let total = self.config.max_throughput.as_u64();
        let budget = (total as f64 * (1.0 - reserved_above)).floor() as u64;
        budget.min(total)
    }

    fn try_admit_locked(&self, state: &mut FlowState, now: Instant, priority: i32) -> bool {
        state.advance(now, self.slot_len());
        if state.in_flight < self.config.max_in_flight
            && state.window_count() < self.rate_budget(priority)
        {
            state.slots[state.slot_index] += 1;
            state.in_flight += 1;
            true
        } else {
            false
        }
    }

    fn update_backpressure(&self, state: &FlowState) {
        let level = if state.waiter_count >= self.config.backpressure_threshold {
            BackpressureLevel::Busy
        } else {
            BackpressureLevel::Normal
        };
        self.backpressure_tx.send_if_modified(|current| {
            if *current == level {
                false
            } else {
                *current = level;
                true
            }
        });
    }

    /// Requests admission for an envelope.
    ///
    /// Under the limit this returns a ticket immediately. Over the limit,
    /// blocking envelopes wait up to `max_wait` in the priority queue;
    /// non-blocking envelopes are rejected at once. Cancelling the caller's
    /// token while waiting abandons the waiter without starving the queue.
    ///
    /// # Errors
    ///
    /// `BusError::Rejected` on denial or wait timeout, `BusError::Cancelled`
    /// when the caller's token fires first.
    pub async fn admit(
        self: &Arc<Self>,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<AdmissionTicket, BusError> {
        let deadline = Instant::now() + self.config.max_wait.as_duration();
        let priority = envelope.priority.as_i32();
        loop {
            let rx = {
                let mut state = self.state.lock().expect("flow state poisoned");
                if state.closed {
                    return Err(BusError::Rejected {
                        reason: "flow controller is closed".to_string(),
                    });
                }
                if self.try_admit_locked(&mut state, Instant::now(), priority) {
                    self.update_backpressure(&state);
                    self.metrics.incr("flow.admitted", 1);
                    return Ok(AdmissionTicket {
                        controller: Arc::downgrade(self),
                    });
                }
                if envelope.non_blocking {
                    self.metrics.incr("flow.rejected", 1);
                    return Err(BusError::Rejected {
                        reason: "throughput limit reached".to_string(),
                    });
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.entry(priority).or_default().push_back(Waiter {
                    tx,
                    enqueued_at: Instant::now(),
                    promotions: 0,
                });
                state.waiter_count += 1;
                self.update_backpressure(&state);
                rx
            };

            tokio::select! {
                woken = rx => {
                    if woken.is_err() {
                        return Err(BusError::Rejected {
                            reason: "flow controller is closed".to_string(),
                        });
                    }
                    // Woken: loop back and compete for the freed slot.
                }
                () = cancel.cancelled() => {
                    // The dropped receiver makes the wake path skip this
                    // waiter; the maintenance pass prunes the carcass.
                    return Err(BusError::Cancelled);
                }
                () = tokio::time::sleep_until(deadline.into()) => {
                    self.metrics.incr("flow.wait_timeout", 1);
                    return Err(BusError::Rejected {
                        reason: "admission wait timed out".to_string(),
                    });
                }
            }
        }
    }

    fn release_slot(&self) {
        let mut state = self.state.lock().expect("flow state poisoned");
        state.in_flight = state.in_flight.saturating_sub(1);
        self.wake_waiters(&mut state);
        self.update_backpressure(&state);
    }

    fn wake_waiters(&self, state: &mut FlowState) {
        state.advance(Instant::now(), self.slot_len());
        let rate_room = self
            .config
            .max_throughput
            .as_u64()
            .saturating_sub(state.window_count());
        let flight_room = self.config.max_in_flight.saturating_sub(state.in_flight) as u64;
        let mut available = rate_room.min(flight_room);
        while available > 0 {
            match state.pop_highest_priority() {
                Some(waiter) => {
                    if waiter.tx.send(()).is_ok() {
                        available -= 1;
                    }
                    // A closed sender is an abandoned waiter: skip it
                    // without consuming capacity.
                }
                None => break,
            }
        }
    }

    fn run_maintenance_pass(&self) {
        let mut state = self.state.lock().expect("flow state poisoned");
        // Prune abandoned waiters and promote long waiters one band.
        let buckets: Vec<(i32, VecDeque<Waiter>)> = std::mem::take(&mut state.waiters)
            .into_iter()
            .collect();
        state.waiter_count = 0;
        for (priority, bucket) in buckets {
            for waiter in bucket {
                if waiter.tx.is_closed() {
                    continue;
                }
                let due_promotion = waiter.enqueued_at.elapsed()
                    >= AGING_INTERVAL * (waiter.promotions + 1)
                    && waiter.promotions < MAX_PROMOTIONS;
                let (key, promotions) = if due_promotion {
                    (priority + 1, waiter.promotions + 1)
                } else {
                    (priority, waiter.promotions)
                };
                state.waiters.entry(key).or_default().push_back(Waiter {
                    promotions,
                    ..waiter
                });
                state.waiter_count += 1;
            }
        }
        self.wake_waiters(&mut state);
        self.update_backpressure(&state);
    }

    /// Runs the maintenance loop (window advancement, waiter wakeups, aging)
    /// until the token is cancelled
    pub async fn run_maintenance(self: Arc<Self>, shutdown: CancellationToken) {
        let tick = self.slot_len().max(Duration::from_millis(10));
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(tick) => {}
            }
            self.run_maintenance_pass();
            trace!(
                in_flight = self.in_flight(),
                waiting = self.waiting(),
                "flow controller maintenance pass"
            );
        }
    }

    /// Closes the controller: pending and future admissions are rejected
    pub fn close(&self) {
        let mut state = self.state.lock().expect("flow state poisoned");
        state.closed = true;
        state.waiters.clear();
        state.waiter_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{MaxThroughput, MessagePriority, TimeoutMs};
    use crate::metrics::AtomicMetrics;

    fn controller(max_throughput: u64, max_in_flight: usize, max_wait_ms: u64) -> Arc<FlowController> {
        FlowController::new(
            FlowConfig {
                max_throughput: MaxThroughput::try_new(max_throughput).unwrap(),
                window: TimeoutMs::try_new(1000).unwrap(),
                max_wait: TimeoutMs::try_new(max_wait_ms).unwrap(),
                max_in_flight,
                backpressure_threshold: 2,
                reservations: Vec::new(),
            },
            Arc::new(AtomicMetrics::new()),
        )
    }

    fn envelope() -> Envelope {
        Envelope::command("test.cmd", serde_json::json!({})).unwrap()
    }

    #[tokio::test]
    async fn admission_under_limit_is_immediate() {
        let flow = controller(100, 10, 50);
        let cancel = CancellationToken::new();
        let ticket = flow.admit(&envelope(), &cancel).await.unwrap();
        assert_eq!(flow.in_flight(), 1);
        ticket.release();
        assert_eq!(flow.in_flight(), 0);
    }

    #[tokio::test]
    async fn non_blocking_over_limit_is_rejected() {
        let flow = controller(100, 1, 1000);
        let cancel = CancellationToken::new();
        let _held = flow.admit(&envelope(), &cancel).await.unwrap();

        let result = flow.admit(&envelope().non_blocking(), &cancel).await;
        assert!(matches!(result, Err(BusError::Rejected { .. })));
    }

    #[tokio::test]
    async fn blocked_waiter_wakes_on_release() {
        let flow = controller(100, 1, 2000);
        let cancel = CancellationToken::new();
        let held = flow.admit(&envelope(), &cancel).await.unwrap();

        let flow2 = flow.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { flow2.admit(&envelope(), &cancel2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(flow.waiting(), 1);

        held.release();
        let ticket = waiter.await.unwrap().unwrap();
        assert_eq!(flow.in_flight(), 1);
        drop(ticket);
    }

    #[tokio::test]
    async fn wait_timeout_rejects() {
        let flow = controller(100, 1, 50);
        let cancel = CancellationToken::new();
        let _held = flow.admit(&envelope(), &cancel).await.unwrap();

        let start = Instant::now();
        let result = flow.admit(&envelope(), &cancel).await;
        assert!(matches!(result, Err(BusError::Rejected { .. })));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn cancellation_while_waiting_surfaces_cancelled() {
        let flow = controller(100, 1, 5000);
        let cancel = CancellationToken::new();
        let _held = flow.admit(&envelope(), &cancel).await.unwrap();

        let flow2 = flow.clone();
        let child = cancel.child_token();
        let child2 = child.clone();
        let waiter = tokio::spawn(async move { flow2.admit(&envelope(), &child2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        child.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(BusError::Cancelled)));
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_starve_the_queue() {
        let flow = controller(100, 1, 5000);
        let cancel = CancellationToken::new();
        let held = flow.admit(&envelope(), &cancel).await.unwrap();

        // First waiter cancels before ever being woken.
        let doomed_token = CancellationToken::new();
        let flow2 = flow.clone();
        let doomed2 = doomed_token.clone();
        let doomed = tokio::spawn(async move { flow2.admit(&envelope(), &doomed2).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        doomed_token.cancel();
        assert!(matches!(doomed.await.unwrap(), Err(BusError::Cancelled)));

        // Second waiter must still be served after release.
        let flow3 = flow.clone();
        let cancel3 = cancel.clone();
        let survivor = tokio::spawn(async move { flow3.admit(&envelope(), &cancel3).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        held.release();
        assert!(survivor.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn higher_priority_waiters_are_served_first() {
        let flow = controller(100, 1, 5000);
        let cancel = CancellationToken::new();
        let held = flow.admit(&envelope(), &cancel).await.unwrap();

        let low_env = envelope();
        let high_env = envelope().with_priority(MessagePriority::try_new(50).unwrap());

        let flow_low = flow.clone();
        let cancel_low = cancel.clone();
        let low = tokio::spawn(async move { flow_low.admit(&low_env, &cancel_low).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let flow_high = flow.clone();
        let cancel_high = cancel.clone();
        let high = tokio::spawn(async move { flow_high.admit(&high_env, &cancel_high).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flow.waiting(), 2);

        // Release exactly one slot: the high-priority waiter wins it.
        held.release();
        let high_ticket = tokio::time::timeout(Duration::from_millis(500), high)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(flow.waiting(), 1);

        drop(high_ticket);
        assert!(low.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn rate_window_limits_burst() {
        // Throughput 3/s: the fourth rapid admission must not pass the
        // window even though in-flight slots are free.
        let flow = controller(3, 100, 30);
        let cancel = CancellationToken::new();
        let mut tickets = Vec::new();
        for _ in 0..3 {
            tickets.push(flow.admit(&envelope(), &cancel).await.unwrap());
        }
        // Release so in-flight is not the limiting factor.
        tickets.clear();

        let result = flow.admit(&envelope().non_blocking(), &cancel).await;
        assert!(matches!(result, Err(BusError::Rejected { .. })));
    }

    #[tokio::test]
    async fn reserved_share_is_closed_to_low_priority() {
        // Half the window is reserved for priority >= 50.
        let flow = FlowController::new(
            FlowConfig {
                max_throughput: MaxThroughput::try_new(4).unwrap(),
                window: TimeoutMs::try_new(1000).unwrap(),
                max_wait: TimeoutMs::try_new(50).unwrap(),
                max_in_flight: 100,
                backpressure_threshold: 100,
                reservations: vec![crate::config::PriorityReservation {
                    min_priority: 50,
                    ratio: 0.5,
                }],
            },
            Arc::new(AtomicMetrics::new()),
        );
        let cancel = CancellationToken::new();

        // Low priority may use only half the window: two admissions.
        let mut held = Vec::new();
        for _ in 0..2 {
            held.push(flow.admit(&envelope(), &cancel).await.unwrap());
        }
        let low = flow.admit(&envelope().non_blocking(), &cancel).await;
        assert!(matches!(low, Err(BusError::Rejected { .. })));

        // The reserved share is still open to high priority.
        let urgent = envelope()
            .non_blocking()
            .with_priority(MessagePriority::try_new(60).unwrap());
        assert!(flow.admit(&urgent, &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn backpressure_signal_trips_on_queue_depth() {
        let flow = controller(100, 1, 5000);
        let cancel = CancellationToken::new();
        let mut signal = flow.subscribe_backpressure();
        assert_eq!(*signal.borrow(), BackpressureLevel::Normal);

        let _held = flow.admit(&envelope(), &cancel).await.unwrap();
        let mut waiters = Vec::new();
        for _ in 0..2 {
            let flow2 = flow.clone();
            let cancel2 = cancel.clone();
            waiters.push(tokio::spawn(async move {
                let _ = flow2.admit(&envelope(), &cancel2).await;
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.changed().await.unwrap();
        assert_eq!(*signal.borrow(), BackpressureLevel::Busy);

        cancel.cancel();
        for waiter in waiters {
            let _ = waiter.await;
        }
    }
}

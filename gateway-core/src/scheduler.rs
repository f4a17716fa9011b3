//! The per-game event scheduler (spec.md §4.6).
//!
//! Grounded on `original_source/src/gary/llm/scheduler2.py` and
//! `original_source/src/gary/llm/events.py` for the priority-queue shape
//! (`Priority.FORCE < HIGH < NORMAL < LOW`, FIFO within a level), and on
//! `original_source/src/gary/llm/scheduler.py`'s `on_action`/`on_context`
//! for which events reset which timers. This module owns queueing, timers,
//! and mute composition; it knows nothing about what an event *means* -
//! that dispatch lives with [`crate::game::Game`], which is what keeps the
//! single-worker invariant (§5) simple: one `Scheduler::run` call per game,
//! driven by one task.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use protocol::{Action, ActionResultData, ForceActionData};

use crate::timer::PeriodicTimer;

/// A scheduled unit of work. Priority is fixed per-variant (see
/// [`SchedulerEvent::priority`]); within a priority level, events drain
/// FIFO.
///
/// `RegisterActions`/`UnregisterActions`/`ActionResult` are not part of
/// spec.md §3's event list verbatim - they mutate the action table and
/// pending map, which §5 says only the single worker may touch, so wire
/// commands that do so are routed through this same queue rather than
/// mutating `Game` from the connection's read task. See DESIGN.md.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// `force_message = None` means "force any currently registered
    /// action", the idle-force-timer path (`_force_any_action` in the
    /// original).
    Force { force_message: Option<ForceActionData> },
    RegisterActions(Vec<Action>),
    UnregisterActions(Vec<String>),
    ActionResult(ActionResultData),
    Context {
        text: String,
        silent: bool,
        ephemeral: bool,
        persistent: bool,
        notify: bool,
    },
    /// `actions`/`allow_yapping` overrides, `None` meaning "use the game's
    /// current set / config default".
    TryAction {
        allow_yapping: Option<bool>,
    },
    Say {
        message: Option<String>,
    },
    Sleep {
        duration: Duration,
    },
    ClearContext,
    Mute,
    Unmute,
}

impl SchedulerEvent {
    fn priority(&self) -> u8 {
        match self {
            SchedulerEvent::Force { .. }
            | SchedulerEvent::RegisterActions(_)
            | SchedulerEvent::UnregisterActions(_)
            | SchedulerEvent::ActionResult(_) => 0,
            SchedulerEvent::Context { .. } => 1,
            SchedulerEvent::TryAction { .. } => 2,
            SchedulerEvent::Say { .. } | SchedulerEvent::Sleep { .. } => 3,
            SchedulerEvent::ClearContext | SchedulerEvent::Mute | SchedulerEvent::Unmute => 4,
        }
    }

    fn is_try_action(&self) -> bool {
        matches!(self, SchedulerEvent::TryAction { .. })
    }
}

struct QueueEntry {
    priority: u8,
    seq: u64,
    event: SchedulerEvent,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap; we want the lowest priority value and
    // lowest seq (earliest) to sort "greatest" so it pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    pending_try_action: bool,
}

/// The priority queue shared between producers (connection read loop,
/// timers, operator actions) and the single worker.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    seq: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                pending_try_action: false,
            }),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Enqueues an event. `TryAction` is coalesced: if one is already
    /// pending, the new one is dropped silently (spec.md §4.6 "Coalescing").
    pub fn push(&self, event: SchedulerEvent) {
        let mut inner = self.inner.lock().unwrap();
        if event.is_try_action() {
            if inner.pending_try_action {
                debug!("dropping coalesced TryAction");
                return;
            }
            inner.pending_try_action = true;
        }
        let priority = event.priority();
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        inner.heap.push(QueueEntry { priority, seq, event });
        drop(inner);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<SchedulerEvent> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.heap.pop()?;
        if entry.event.is_try_action() {
            inner.pending_try_action = false;
        }
        Some(entry.event)
    }

    pub async fn pop(&self) -> SchedulerEvent {
        loop {
            if let Some(event) = self.try_pop() {
                return event;
            }
            let notified = self.notify.notified();
            if let Some(event) = self.try_pop() {
                return event;
            }
            notified.await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().heap.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the queue, the idle timers, and mute/sleep composition for one
/// game. `can_act = ¬(muted_web ∨ muted_game ∨ sleeping)` (§4.6); losing
/// `can_act` stops both timers, regaining it restarts them and enqueues a
/// catch-up `TryAction`.
pub struct Scheduler {
    queue: Arc<EventQueue>,
    busy: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    muted_web: bool,
    muted_game: bool,
    sleeping: bool,
    try_timer: PeriodicTimer,
    force_timer: PeriodicTimer,
}

impl Scheduler {
    pub fn new(idle_try: Duration, idle_force: Duration) -> Self {
        let queue = Arc::new(EventQueue::new());

        let try_queue = Arc::clone(&queue);
        let try_timer = PeriodicTimer::new(idle_try, "try_timer", move || {
            let q = Arc::clone(&try_queue);
            async move {
                q.push(SchedulerEvent::TryAction { allow_yapping: None });
                true
            }
        });

        let force_queue = Arc::clone(&queue);
        let force_timer = PeriodicTimer::new(idle_force, "force_timer", move || {
            let q = Arc::clone(&force_queue);
            async move {
                q.push(SchedulerEvent::Force { force_message: None });
                true
            }
        });

        Self {
            queue,
            busy: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            muted_web: false,
            muted_game: false,
            sleeping: false,
            try_timer,
            force_timer,
        }
    }

    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    pub fn enqueue(&self, event: SchedulerEvent) {
        self.queue.push(event);
    }

    pub fn busy(&self) -> bool {
        self.busy.load(AtomicOrdering::SeqCst)
    }

    fn can_act(&self) -> bool {
        !(self.muted_web || self.muted_game || self.sleeping)
    }

    fn apply_can_act_transition(&mut self, was_acting: bool) {
        let now_acting = self.can_act();
        if was_acting == now_acting {
            return;
        }
        if now_acting {
            self.try_timer.start();
            self.force_timer.start();
            self.queue.push(SchedulerEvent::TryAction { allow_yapping: None });
        } else {
            self.try_timer.stop();
            self.force_timer.stop();
        }
    }

    /// Operator-facing mute, independent of the game's own `mute`/`unmute`.
    pub fn set_muted_web(&mut self, muted: bool) {
        let was = self.can_act();
        self.muted_web = muted;
        self.apply_can_act_transition(was);
    }

    fn set_muted_game(&mut self, muted: bool) {
        let was = self.can_act();
        self.muted_game = muted;
        self.apply_can_act_transition(was);
    }

    /// Brackets a `Sleep` event's duration; call before awaiting the sleep.
    pub fn enter_sleep(&mut self) {
        let was = self.can_act();
        self.sleeping = true;
        self.apply_can_act_transition(was);
    }

    /// Call after a `Sleep` event's duration has elapsed.
    pub fn exit_sleep(&mut self) {
        let was = self.can_act();
        self.sleeping = false;
        self.apply_can_act_transition(was);
    }

    fn apply_mute_transition(&mut self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::Mute => self.set_muted_game(true),
            SchedulerEvent::Unmute => self.set_muted_game(false),
            _ => {}
        }
    }

    /// Resets both timers - an outbound `action` event happened.
    pub fn on_action(&mut self) {
        self.try_timer.reset();
        self.force_timer.reset();
    }

    /// Resets `try_timer` alone - an inbound `context` event happened.
    pub fn on_context(&mut self) {
        self.try_timer.reset();
    }

    /// Requests the worker loop to stop after its current dispatch (if
    /// any) completes. Matches spec.md §5: an in-flight generation is
    /// allowed to finish.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// A cloneable handle that can request a stop from outside the worker
    /// task, once `Scheduler` itself has been moved into `Game::run`.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopped: Arc::clone(&self.stopped),
            notify: Arc::clone(&self.stop_notify),
        }
    }

    /// Runs the worker loop: pop, apply mute-state side effects, dispatch,
    /// repeat, until [`Scheduler::stop`] is called. `dispatch` is supplied
    /// by the owning `Game` and knows what each event means; its
    /// [`DispatchOutcome`] tells the scheduler which timer-reset or sleep
    /// side effect to run (dispatch itself never touches `Scheduler`
    /// fields directly, which is what lets `Game::run` borrow its
    /// `Scheduler` and its other state disjointly - see `game.rs`).
    pub async fn run<D, Fut>(&mut self, mut dispatch: D)
    where
        D: FnMut(SchedulerEvent) -> Fut,
        Fut: std::future::Future<Output = DispatchOutcome>,
    {
        self.try_timer.start();
        self.force_timer.start();
        loop {
            let event = {
                let pop = self.queue.pop();
                tokio::select! {
                    ev = pop => ev,
                    _ = self.stop_notify.notified() => break,
                }
            };
            self.apply_mute_transition(&event);
            self.busy.store(true, AtomicOrdering::SeqCst);
            let outcome = dispatch(event).await;
            match outcome {
                DispatchOutcome::ActionSent => self.on_action(),
                DispatchOutcome::ContextAppended => self.on_context(),
                DispatchOutcome::Sleep(duration) => {
                    self.enter_sleep();
                    tokio::time::sleep(duration).await;
                    self.exit_sleep();
                }
                DispatchOutcome::None => {}
            }
            self.busy.store(false, AtomicOrdering::SeqCst);
            if self.stopped.load(AtomicOrdering::SeqCst) {
                break;
            }
        }
        self.try_timer.stop();
        self.force_timer.stop();
    }
}

/// Lets the registry ask a game's worker to stop without owning the
/// `Scheduler` (which is moved into `Game::run`'s spawned task).
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_one();
    }
}

/// What a dispatched event caused, so the scheduler can apply the matching
/// timer-reset or sleep side effect without reaching into `Game` state.
#[derive(Debug)]
pub enum DispatchOutcome {
    None,
    ActionSent,
    ContextAppended,
    Sleep(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_is_force_then_context_then_try_then_low() {
        let queue = EventQueue::new();
        queue.push(SchedulerEvent::Sleep {
            duration: Duration::from_secs(1),
        });
        queue.push(SchedulerEvent::TryAction { allow_yapping: None });
        queue.push(SchedulerEvent::Context {
            text: "hi".into(),
            silent: false,
            ephemeral: false,
            persistent: false,
            notify: true,
        });
        queue.push(SchedulerEvent::Force { force_message: None });

        assert!(matches!(
            queue.try_pop().unwrap(),
            SchedulerEvent::Force { .. }
        ));
        assert!(matches!(
            queue.try_pop().unwrap(),
            SchedulerEvent::Context { .. }
        ));
        assert!(matches!(
            queue.try_pop().unwrap(),
            SchedulerEvent::TryAction { .. }
        ));
        assert!(matches!(
            queue.try_pop().unwrap(),
            SchedulerEvent::Sleep { .. }
        ));
    }

    #[test]
    fn fifo_within_same_priority() {
        let queue = EventQueue::new();
        queue.push(SchedulerEvent::Context {
            text: "first".into(),
            silent: false,
            ephemeral: false,
            persistent: false,
            notify: true,
        });
        queue.push(SchedulerEvent::Context {
            text: "second".into(),
            silent: false,
            ephemeral: false,
            persistent: false,
            notify: true,
        });
        let SchedulerEvent::Context { text, .. } = queue.try_pop().unwrap() else {
            panic!("expected context");
        };
        assert_eq!(text, "first");
    }

    #[test]
    fn try_action_is_coalesced() {
        let queue = EventQueue::new();
        queue.push(SchedulerEvent::TryAction { allow_yapping: None });
        queue.push(SchedulerEvent::TryAction { allow_yapping: None });
        assert!(queue.try_pop().is_some());
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn try_action_coalescing_clears_after_pop() {
        let queue = EventQueue::new();
        queue.push(SchedulerEvent::TryAction { allow_yapping: None });
        let _ = queue.try_pop();
        queue.push(SchedulerEvent::TryAction { allow_yapping: None });
        assert!(queue.try_pop().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn mute_stops_timers_until_unmuted() {
        let mut scheduler = Scheduler::new(Duration::from_secs(1), Duration::from_secs(1000));
        scheduler.set_muted_web(true);
        assert!(!scheduler.try_timer.active());
        scheduler.set_muted_web(false);
        assert!(scheduler.try_timer.active());
    }
}

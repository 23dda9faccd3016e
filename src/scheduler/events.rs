//! Scheduler-internal event coalescing.
//!
//! Producers call [`EventDispatcher::trigger`], which never blocks. The actor
//! owns the matching [`EventInbox`] and runs processing passes: everything
//! queued is drained into a set (duplicate kinds collapse), dispatched in
//! kind order, and the inbox is re-checked before the pass returns. Events
//! triggered by a handler land in the same pass, never in a nested one.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Kinds of scheduler event. Carry no payload; handlers read the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedulerEvent {
    /// Capacity was freed; re-run admission
    PageClosed,
    /// A session finished opening; click start on ready tasks
    TaskInitialized,
    /// Some cached status changed; re-check the mining ceiling
    TaskStatusChanged,
    /// A task completed; close completed sessions
    TaskCompleted,
    /// A task began mining; re-check the ceiling then admission
    TaskMiningStarted,
    /// A task entered Error; sweep it back to Pending
    TaskError,
}

impl fmt::Display for SchedulerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerEvent::PageClosed => "page_closed",
            SchedulerEvent::TaskInitialized => "task_initialized",
            SchedulerEvent::TaskStatusChanged => "task_status_changed",
            SchedulerEvent::TaskCompleted => "task_completed",
            SchedulerEvent::TaskMiningStarted => "task_mining_started",
            SchedulerEvent::TaskError => "task_error",
        };
        f.write_str(name)
    }
}

/// Receives coalesced events during a processing pass
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: SchedulerEvent) -> Result<()>;
}

/// Producer side. Cheap to share; triggering never blocks.
#[derive(Debug)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
    suppressed: AtomicBool,
}

impl EventDispatcher {
    pub fn new() -> (Self, EventInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            tx,
            suppressed: AtomicBool::new(false),
        };
        (dispatcher, EventInbox { rx })
    }

    pub fn trigger(&self, event: SchedulerEvent) {
        if self.is_suppressed() {
            tracing::trace!(%event, "Event suppressed");
            return;
        }
        if self.tx.send(event).is_err() {
            tracing::debug!(%event, "Event dropped, inbox closed");
        }
    }

    /// Drop every trigger until [`resume`](Self::resume) is called
    pub fn suppress(&self) {
        self.suppressed.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.suppressed.store(false, Ordering::Release);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::Acquire)
    }
}

/// What a processing pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Handler invocations
    pub handled: usize,
    /// Drain-and-dispatch rounds, including re-checks that found new events
    pub rounds: usize,
    /// Triggers that collapsed into an already pending kind
    pub collapsed: usize,
}

/// Consumer side, owned by whoever runs processing passes
#[derive(Debug)]
pub struct EventInbox {
    rx: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl EventInbox {
    pub async fn recv(&mut self) -> Option<SchedulerEvent> {
        self.rx.recv().await
    }

    /// Discard everything queued
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    fn drain_into(&mut self, pending: &mut BTreeSet<SchedulerEvent>) -> usize {
        let mut collapsed = 0;
        while let Ok(event) = self.rx.try_recv() {
            if !pending.insert(event) {
                collapsed += 1;
            }
        }
        collapsed
    }

    /// Run one processing pass starting with `first`.
    ///
    /// Handler errors are logged and never abort the pass.
    pub async fn process<H: EventHandler + ?Sized>(&mut self, first: SchedulerEvent, handler: &H) -> PassStats {
        let mut stats = PassStats::default();
        let mut pending = BTreeSet::from([first]);
        stats.collapsed += self.drain_into(&mut pending);

        while !pending.is_empty() {
            stats.rounds += 1;
            for event in std::mem::take(&mut pending) {
                stats.handled += 1;
                if let Err(e) = handler.handle(event).await {
                    tracing::error!(%event, error = %e, "Event handler failed");
                }
            }
            stats.collapsed += self.drain_into(&mut pending);
        }

        tracing::trace!(
            handled = stats.handled,
            rounds = stats.rounds,
            collapsed = stats.collapsed,
            "Event pass finished"
        );
        stats
    }

    /// Run a pass only if something is queued
    pub async fn process_queued<H: EventHandler + ?Sized>(&mut self, handler: &H) -> Option<PassStats> {
        match self.rx.try_recv() {
            Ok(first) => Some(self.process(first, handler).await),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MinerError;
    use std::sync::Mutex;

    /// Records every dispatch; optionally re-triggers from inside a handler.
    struct Recorder {
        seen: Mutex<Vec<SchedulerEvent>>,
        retrigger: Option<(SchedulerEvent, SchedulerEvent)>,
        dispatcher: Option<EventDispatcher>,
        fail_on: Option<SchedulerEvent>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                retrigger: None,
                dispatcher: None,
                fail_on: None,
            }
        }

        fn seen(&self) -> Vec<SchedulerEvent> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: SchedulerEvent) -> Result<()> {
            self.seen.lock().unwrap().push(event);
            if let (Some((on, then)), Some(dispatcher)) = (self.retrigger, &self.dispatcher)
                && on == event
            {
                dispatcher.trigger(then);
            }
            if self.fail_on == Some(event) {
                return Err(MinerError::TaskNotFound(0));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_duplicate_triggers_collapse() {
        let (dispatcher, mut inbox) = EventDispatcher::new();
        dispatcher.trigger(SchedulerEvent::PageClosed);
        dispatcher.trigger(SchedulerEvent::PageClosed);
        dispatcher.trigger(SchedulerEvent::PageClosed);

        let recorder = Recorder::new();
        let stats = inbox.process_queued(&recorder).await.unwrap();
        assert_eq!(recorder.seen(), vec![SchedulerEvent::PageClosed]);
        assert_eq!(stats.collapsed, 2);
        assert_eq!(stats.rounds, 1);
    }

    #[tokio::test]
    async fn test_reentrant_trigger_runs_in_same_pass() {
        let (dispatcher, mut inbox) = EventDispatcher::new();
        // Handler triggers through the same channel the inbox reads
        let recorder = Recorder {
            retrigger: Some((SchedulerEvent::TaskCompleted, SchedulerEvent::PageClosed)),
            dispatcher: Some(EventDispatcher {
                tx: dispatcher.tx.clone(),
                suppressed: AtomicBool::new(false),
            }),
            ..Recorder::new()
        };

        dispatcher.trigger(SchedulerEvent::TaskCompleted);
        let stats = inbox.process_queued(&recorder).await.unwrap();
        assert_eq!(
            recorder.seen(),
            vec![SchedulerEvent::TaskCompleted, SchedulerEvent::PageClosed]
        );
        assert_eq!(stats.rounds, 2);
        assert!(inbox.process_queued(&recorder).await.is_none());
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_pass() {
        let (dispatcher, mut inbox) = EventDispatcher::new();
        dispatcher.trigger(SchedulerEvent::PageClosed);
        dispatcher.trigger(SchedulerEvent::TaskError);

        let recorder = Recorder {
            fail_on: Some(SchedulerEvent::PageClosed),
            ..Recorder::new()
        };
        let stats = inbox.process_queued(&recorder).await.unwrap();
        assert_eq!(stats.handled, 2);
        assert_eq!(recorder.seen().len(), 2);
    }

    #[tokio::test]
    async fn test_suppressed_triggers_are_dropped() {
        let (dispatcher, mut inbox) = EventDispatcher::new();
        dispatcher.suppress();
        dispatcher.trigger(SchedulerEvent::PageClosed);
        dispatcher.resume();
        assert_eq!(inbox.clear(), 0);

        dispatcher.trigger(SchedulerEvent::TaskError);
        assert_eq!(inbox.clear(), 1);
    }

    #[test]
    fn test_events_dispatch_in_kind_order() {
        let set = BTreeSet::from([SchedulerEvent::TaskError, SchedulerEvent::PageClosed]);
        assert_eq!(set.into_iter().next(), Some(SchedulerEvent::PageClosed));
    }
}

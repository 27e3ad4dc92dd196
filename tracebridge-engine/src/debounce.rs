//! Debounce/Coalescing Scheduler
//!
//! Ensures a burst of N updates to the same logical unit produces exactly
//! one downstream handler invocation carrying the last update's payload,
//! once the unit has been quiet for a fixed duration. Each arrival
//! replaces the key's pending event and restarts its timer; replacement is
//! atomic with respect to a concurrently expiring timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use tracebridge_event::SessionEvent;

/// Default quiet period before a key's latest event is processed.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(10);

/// Consumer of finalized events.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: SessionEvent);
}

struct PendingEntry {
    event: SessionEvent,
    generation: u64,
    timer: tokio::task::AbortHandle,
}

/// Per-key timer management.
///
/// At most one pending event and one live timer exist per key. Expiry
/// removes the entry only if its generation still matches the timer's,
/// so a timer firing at the same instant a new event arrives can neither
/// double-dispatch nor drop the key.
pub struct DebounceScheduler<H> {
    pending: Arc<DashMap<String, PendingEntry>>,
    handler: Arc<H>,
    quiet_period: Duration,
    generation: AtomicU64,
    coalesced: AtomicU64,
}

impl<H: EventHandler> DebounceScheduler<H> {
    pub fn new(quiet_period: Duration, handler: Arc<H>) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            handler,
            quiet_period,
            generation: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Buffer `event` under its key, replacing any pending event for that
    /// key and restarting the key's quiet-period timer.
    pub fn submit(&self, event: SessionEvent) {
        let key = event.key();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // Fixed at arrival; the spawned task may only be polled later.
        let deadline = tokio::time::Instant::now() + self.quiet_period;

        let timer = {
            let pending = self.pending.clone();
            let handler = self.handler.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                // Claim the entry only if it is still ours; a concurrent
                // replacement bumps the generation and wins.
                if let Some((_, entry)) = pending.remove_if(&key, |_, e| e.generation == generation)
                {
                    handler.handle(entry.event).await;
                }
            })
        };

        let previous = self.pending.insert(
            key.clone(),
            PendingEntry {
                event,
                generation,
                timer: timer.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Coalesced pending event");
        }
    }

    /// Number of keys currently waiting out their quiet period.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Events discarded because a newer update for their key arrived.
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Cancel all timers and push every pending latest event through the
    /// handler immediately. Used at shutdown.
    pub async fn drain(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.pending.remove(&key) {
                entry.timer.abort();
                self.handler.handle(entry.event).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracebridge_event::PartPayload;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<SessionEvent>>,
    }

    #[async_trait::async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: SessionEvent) {
            self.seen.lock().unwrap().push(event);
        }
    }

    fn part(part_id: &str, content: &str, at_ms: u64) -> SessionEvent {
        SessionEvent::PartUpdated {
            session_id: "s1".into(),
            message_id: "m1".into(),
            part_id: part_id.into(),
            payload: PartPayload::Text {
                content: content.into(),
            },
            at_ms,
        }
    }

    fn text_of(event: &SessionEvent) -> &str {
        match event {
            SessionEvent::PartUpdated {
                payload: PartPayload::Text { content },
                ..
            } => content,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_last_event() {
        let handler = Arc::new(RecordingHandler::default());
        let scheduler = DebounceScheduler::new(Duration::from_secs(10), handler.clone());

        // 50 updates of the same part within one second.
        let full = "x".repeat(50);
        let texts: Vec<String> = (1..=50).map(|n| full[..n].to_owned()).collect();
        for (i, text) in texts.iter().enumerate() {
            scheduler.submit(part("p1", text, i as u64 * 20));
            tokio::time::advance(Duration::from_millis(20)).await;
        }
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(text_of(&seen[0]), texts.last().unwrap());
        drop(seen);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.coalesced_count(), 49);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_period_counts_from_submission() {
        let handler = Arc::new(RecordingHandler::default());
        let scheduler = DebounceScheduler::new(Duration::from_secs(10), handler.clone());

        // Cross the quiet period before the timer task gets its first
        // poll; the deadline must already have been fixed at submit time.
        scheduler.submit(part("p1", "a", 0));
        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        assert_eq!(handler.seen.lock().unwrap().len(), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gaps_longer_than_quiet_period_dispatch_each() {
        let handler = Arc::new(RecordingHandler::default());
        let scheduler = DebounceScheduler::new(Duration::from_secs(10), handler.clone());

        for n in 0..3 {
            scheduler.submit(part("p1", &format!("v{n}"), n));
            tokio::time::advance(Duration::from_secs(11)).await;
            tokio::task::yield_now().await;
        }

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(text_of(&seen[0]), "v0");
        assert_eq!(text_of(&seen[2]), "v2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_interfere() {
        let handler = Arc::new(RecordingHandler::default());
        let scheduler = DebounceScheduler::new(Duration::from_secs(10), handler.clone());

        scheduler.submit(part("p1", "a", 0));
        scheduler.submit(part("p2", "b", 1));
        assert_eq!(scheduler.pending_count(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        assert_eq!(handler.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_flushes_latest_without_waiting() {
        let handler = Arc::new(RecordingHandler::default());
        let scheduler = DebounceScheduler::new(Duration::from_secs(10), handler.clone());

        scheduler.submit(part("p1", "h", 0));
        scheduler.submit(part("p1", "hi", 1));
        scheduler.drain().await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(text_of(&seen[0]), "hi");
        drop(seen);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_restarts_quiet_period() {
        let handler = Arc::new(RecordingHandler::default());
        let scheduler = DebounceScheduler::new(Duration::from_secs(10), handler.clone());

        scheduler.submit(part("p1", "h", 0));
        tokio::time::advance(Duration::from_secs(9)).await;
        scheduler.submit(part("p1", "hi", 1));
        tokio::time::advance(Duration::from_secs(9)).await;
        tokio::task::yield_now().await;

        // 18s elapsed overall but only 9s since the replacement.
        assert!(handler.seen.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(text_of(&seen[0]), "hi");
    }
}

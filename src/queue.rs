//! Priority-ordered session queue with bounded retention.
//!
//! Holding area for deferred session-creation work. Items are kept
//! stable-sorted by priority after each insert, so `dequeue_next` returns the
//! lowest priority value first with ties broken by insertion order. Terminal
//! items (completed/failed) are retained for inspection up to a configured
//! cap; the cleanup pass after every terminal transition drops the oldest
//! terminal items first and never touches pending or in-flight work.
//!
//! `dequeue_next` does not change item state: the coordinator calls
//! `mark_processing` when it actually starts work, so an item whose consumer
//! died can be picked up again.

use crate::clock::{Clock, MonotonicClock};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Lifecycle state of a queued session request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    /// Terminal items are eligible for retention cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }
}

/// A queued session-creation request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueItem {
    pub id: Uuid,
    /// Opaque session configuration forwarded to the upstream API.
    pub payload: serde_json::Value,
    /// Lower value dequeues first.
    pub priority: i32,
    pub status: QueueStatus,
    /// Clock millis when the item was enqueued.
    pub added_at: u64,
    /// Clock millis when the item reached a terminal state.
    pub finished_at: Option<u64>,
    /// Foreign session identifier (or other result) recorded on completion.
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Errors returned by queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("session queue is full (limit {0})")]
    Full(usize),
    #[error("queue item {0} not found")]
    UnknownItem(Uuid),
    #[error("queue item {id} is already terminal ({status:?})")]
    AlreadyTerminal { id: Uuid, status: QueueStatus },
}

impl From<QueueError> for crate::error::GateError<QueueError> {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full(capacity) => crate::error::GateError::CapacityExceeded {
                resource: "session queue",
                capacity,
            },
            other => crate::error::GateError::Inner(other),
        }
    }
}

/// Read-only counters for operational dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Bounded, priority-ordered holding area for deferred session work.
#[derive(Debug)]
pub struct SessionQueue {
    items: Mutex<Vec<QueueItem>>,
    max_pending: usize,
    max_retained: usize,
    clock: Arc<dyn Clock>,
}

impl SessionQueue {
    /// Create a queue admitting at most `max_pending` live (pending +
    /// processing) items and retaining at most `max_retained` terminal items.
    pub fn new(max_pending: usize, max_retained: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            max_pending,
            max_retained,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Add a session request. Returns the created item, or `Full` when the
    /// live-item bound is reached.
    pub fn enqueue(
        &self,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<QueueItem, QueueError> {
        let mut items = self.items.lock().unwrap();

        let live = items.iter().filter(|i| !i.status.is_terminal()).count();
        if live >= self.max_pending {
            return Err(QueueError::Full(self.max_pending));
        }

        let item = QueueItem {
            id: Uuid::new_v4(),
            payload,
            priority,
            status: QueueStatus::Pending,
            added_at: self.clock.now_millis(),
            finished_at: None,
            result: None,
            error: None,
        };
        items.push(item.clone());
        // Stable sort keeps insertion order within a priority class.
        items.sort_by_key(|i| i.priority);

        tracing::debug!(id = %item.id, priority, "session request queued");
        Ok(item)
    }

    /// The lowest-priority pending item, if any. State is unchanged.
    pub fn dequeue_next(&self) -> Option<QueueItem> {
        let items = self.items.lock().unwrap();
        items.iter().find(|i| i.status == QueueStatus::Pending).cloned()
    }

    /// Transition an item to `Processing`.
    pub fn mark_processing(&self, id: Uuid) -> Result<(), QueueError> {
        let mut items = self.items.lock().unwrap();
        let item = Self::find_live(&mut items, id)?;
        item.status = QueueStatus::Processing;
        Ok(())
    }

    /// Transition an item to `Completed`, recording its result.
    pub fn mark_complete(&self, id: Uuid, result: serde_json::Value) -> Result<(), QueueError> {
        let now = self.clock.now_millis();
        let mut items = self.items.lock().unwrap();
        {
            let item = Self::find_live(&mut items, id)?;
            item.status = QueueStatus::Completed;
            item.finished_at = Some(now);
            item.result = Some(result);
        }
        self.cleanup_terminal(&mut items);
        Ok(())
    }

    /// Transition an item to `Failed`, recording the error.
    pub fn mark_failed(&self, id: Uuid, error: impl Into<String>) -> Result<(), QueueError> {
        let now = self.clock.now_millis();
        let mut items = self.items.lock().unwrap();
        {
            let item = Self::find_live(&mut items, id)?;
            item.status = QueueStatus::Failed;
            item.finished_at = Some(now);
            item.error = Some(error.into());
        }
        self.cleanup_terminal(&mut items);
        Ok(())
    }

    /// Snapshot of every retained item, in priority order.
    pub fn list(&self) -> Vec<QueueItem> {
        self.items.lock().unwrap().clone()
    }

    /// Remove all pending items, returning how many were removed.
    /// Processing and terminal items are untouched.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|i| i.status != QueueStatus::Pending);
        before - items.len()
    }

    /// Counters by lifecycle state.
    pub fn stats(&self) -> QueueStats {
        let items = self.items.lock().unwrap();
        let mut stats =
            QueueStats { pending: 0, processing: 0, completed: 0, failed: 0, total: items.len() };
        for item in items.iter() {
            match item.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    fn find_live(items: &mut [QueueItem], id: Uuid) -> Result<&mut QueueItem, QueueError> {
        let item = items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(QueueError::UnknownItem(id))?;
        if item.status.is_terminal() {
            return Err(QueueError::AlreadyTerminal { id, status: item.status });
        }
        Ok(item)
    }

    /// Cap retained terminal items, dropping the oldest-finished first.
    fn cleanup_terminal(&self, items: &mut Vec<QueueItem>) {
        let terminal = items.iter().filter(|i| i.status.is_terminal()).count();
        if terminal <= self.max_retained {
            return;
        }

        let mut finished: Vec<(u64, Uuid)> = items
            .iter()
            .filter(|i| i.status.is_terminal())
            .map(|i| (i.finished_at.unwrap_or(i.added_at), i.id))
            .collect();
        finished.sort_by_key(|(at, _)| *at);

        let drop_count = terminal - self.max_retained;
        let doomed: Vec<Uuid> = finished.into_iter().take(drop_count).map(|(_, id)| id).collect();
        items.retain(|i| !doomed.contains(&i.id));
        tracing::debug!(dropped = drop_count, "trimmed terminal queue items");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn queue() -> SessionQueue {
        SessionQueue::new(100, 10)
    }

    #[test]
    fn dequeues_lowest_priority_first() {
        let queue = queue();
        queue.enqueue(json!({"repo": "a"}), 5).unwrap();
        let low = queue.enqueue(json!({"repo": "b"}), 1).unwrap();
        queue.enqueue(json!({"repo": "c"}), 3).unwrap();

        let next = queue.dequeue_next().expect("item available");
        assert_eq!(next.id, low.id);
        assert_eq!(next.priority, 1);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let queue = queue();
        let first = queue.enqueue(json!({"n": 1}), 2).unwrap();
        let _second = queue.enqueue(json!({"n": 2}), 2).unwrap();

        assert_eq!(queue.dequeue_next().unwrap().id, first.id);
    }

    #[test]
    fn dequeue_skips_non_pending_items() {
        let queue = queue();
        let a = queue.enqueue(json!({"n": 1}), 1).unwrap();
        let b = queue.enqueue(json!({"n": 2}), 2).unwrap();

        queue.mark_processing(a.id).unwrap();
        assert_eq!(queue.dequeue_next().unwrap().id, b.id);

        queue.mark_complete(a.id, json!({"session_id": "s-1"})).unwrap();
        queue.mark_processing(b.id).unwrap();
        assert!(queue.dequeue_next().is_none());
    }

    #[test]
    fn lifecycle_records_result_and_error() {
        let queue = queue();
        let ok = queue.enqueue(json!({}), 1).unwrap();
        let bad = queue.enqueue(json!({}), 1).unwrap();

        queue.mark_processing(ok.id).unwrap();
        queue.mark_complete(ok.id, json!({"session_id": "s-42"})).unwrap();
        queue.mark_failed(bad.id, "upstream rejected config").unwrap();

        let items = queue.list();
        let ok_item = items.iter().find(|i| i.id == ok.id).unwrap();
        assert_eq!(ok_item.status, QueueStatus::Completed);
        assert_eq!(ok_item.result, Some(json!({"session_id": "s-42"})));
        assert!(ok_item.finished_at.is_some());

        let bad_item = items.iter().find(|i| i.id == bad.id).unwrap();
        assert_eq!(bad_item.status, QueueStatus::Failed);
        assert_eq!(bad_item.error.as_deref(), Some("upstream rejected config"));
    }

    #[test]
    fn terminal_items_cannot_transition_again() {
        let queue = queue();
        let item = queue.enqueue(json!({}), 1).unwrap();
        queue.mark_complete(item.id, json!(null)).unwrap();

        let err = queue.mark_failed(item.id, "too late").unwrap_err();
        assert!(matches!(err, QueueError::AlreadyTerminal { .. }));
    }

    #[test]
    fn unknown_item_errors() {
        let queue = queue();
        let err = queue.mark_processing(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, QueueError::UnknownItem(_)));
    }

    #[test]
    fn enqueue_rejects_when_full() {
        let queue = SessionQueue::new(2, 10);
        queue.enqueue(json!({}), 1).unwrap();
        queue.enqueue(json!({}), 1).unwrap();

        let err = queue.enqueue(json!({}), 1).unwrap_err();
        assert_eq!(err, QueueError::Full(2));
    }

    #[test]
    fn terminal_items_free_live_capacity() {
        let queue = SessionQueue::new(1, 10);
        let item = queue.enqueue(json!({}), 1).unwrap();
        assert!(queue.enqueue(json!({}), 1).is_err());

        queue.mark_complete(item.id, json!(null)).unwrap();
        assert!(queue.enqueue(json!({}), 1).is_ok());
    }

    #[test]
    fn retention_cap_drops_oldest_terminal_only() {
        let clock = ManualClock::new();
        let queue = SessionQueue::new(100, 1).with_clock(clock.clone());

        let pending = queue.enqueue(json!({"keep": true}), 9).unwrap();
        let first = queue.enqueue(json!({}), 1).unwrap();
        let second = queue.enqueue(json!({}), 1).unwrap();

        queue.mark_complete(first.id, json!(null)).unwrap();
        clock.advance(10);
        queue.mark_complete(second.id, json!(null)).unwrap();

        let items = queue.list();
        assert_eq!(items.len(), 2);
        assert!(items.iter().any(|i| i.id == pending.id), "pending item untouched");
        assert!(items.iter().any(|i| i.id == second.id), "most recent terminal retained");
        assert!(!items.iter().any(|i| i.id == first.id), "oldest terminal dropped");
    }

    #[test]
    fn clear_removes_only_pending() {
        let queue = queue();
        let processing = queue.enqueue(json!({}), 1).unwrap();
        queue.mark_processing(processing.id).unwrap();
        queue.enqueue(json!({}), 2).unwrap();
        queue.enqueue(json!({}), 3).unwrap();

        let removed = queue.clear();

        assert_eq!(removed, 2);
        let stats = queue.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processing, 1);
    }

    #[test]
    fn stats_count_by_status() {
        let queue = queue();
        let a = queue.enqueue(json!({}), 1).unwrap();
        let b = queue.enqueue(json!({}), 2).unwrap();
        queue.enqueue(json!({}), 3).unwrap();

        queue.mark_processing(a.id).unwrap();
        queue.mark_failed(b.id, "boom").unwrap();

        let stats = queue.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.total, 3);
    }

    #[test]
    fn ids_are_unique() {
        let queue = queue();
        let a = queue.enqueue(json!({}), 1).unwrap();
        let b = queue.enqueue(json!({}), 1).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn items_serialize_for_status_endpoints() {
        let queue = queue();
        let item = queue.enqueue(json!({ "prompt": "hi" }), 2).unwrap();

        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["id"], json!(item.id.to_string()));
        assert_eq!(value["status"], "pending");
        assert_eq!(value["priority"], 2);
        assert_eq!(value["payload"]["prompt"], "hi");
    }

    #[test]
    fn full_error_maps_into_the_capacity_taxonomy() {
        use crate::error::GateError;

        let queue = SessionQueue::new(1, 10);
        queue.enqueue(json!({}), 1).unwrap();

        let err: GateError<QueueError> = queue.enqueue(json!({}), 1).unwrap_err().into();
        assert!(err.is_capacity_exceeded());
        assert!(err.to_string().contains("session queue"));

        let other: GateError<QueueError> = QueueError::UnknownItem(Uuid::new_v4()).into();
        assert!(other.is_inner());
    }
}

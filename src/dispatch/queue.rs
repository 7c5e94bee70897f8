//! Bounded two-level priority queue

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::command::{CommandEnvelope, Priority};
use crate::{Error, Result};

#[derive(Default)]
struct Lanes {
    critical: VecDeque<CommandEnvelope>,
    normal: VecDeque<CommandEnvelope>,
}

impl Lanes {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<CommandEnvelope> {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::Normal => &mut self.normal,
        }
    }
}

/// FIFO per priority; a normal item is only taken while the critical lane is empty
pub struct PriorityQueue {
    lanes: Mutex<Lanes>,
    critical_ready: Notify,
    normal_ready: Notify,
    capacity: usize,
}

impl PriorityQueue {
    /// Create a queue holding at most `capacity` items per priority
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            critical_ready: Notify::new(),
            normal_ready: Notify::new(),
            capacity,
        }
    }

    const fn ready(&self, priority: Priority) -> &Notify {
        match priority {
            Priority::Critical => &self.critical_ready,
            Priority::Normal => &self.normal_ready,
        }
    }

    /// Append an envelope to its priority lane
    ///
    /// # Errors
    ///
    /// Returns `Error::Rejected` if the lane is full
    pub async fn push(&self, envelope: CommandEnvelope) -> Result<()> {
        let priority = envelope.priority();
        {
            let mut lanes = self.lanes.lock().await;
            let lane = lanes.lane_mut(priority);
            if lane.len() >= self.capacity {
                return Err(Error::Rejected(format!(
                    "{} queue is full ({} items)",
                    priority.as_str(),
                    self.capacity
                )));
            }
            lane.push_back(envelope);
        }
        self.ready(priority).notify_one();
        Ok(())
    }

    /// Take the next envelope of either priority without waiting
    pub async fn try_pop(&self) -> Option<CommandEnvelope> {
        if let Some(envelope) = self.try_pop_lane(Priority::Critical).await {
            return Some(envelope);
        }
        self.try_pop_lane(Priority::Normal).await
    }

    /// Take the next envelope from one lane without waiting
    ///
    /// The normal lane yields nothing while critical work is queued.
    pub async fn try_pop_lane(&self, priority: Priority) -> Option<CommandEnvelope> {
        let mut lanes = self.lanes.lock().await;
        match priority {
            Priority::Critical => {
                let envelope = lanes.critical.pop_front();
                if lanes.critical.is_empty() && !lanes.normal.is_empty() {
                    self.normal_ready.notify_one();
                }
                envelope
            }
            Priority::Normal if lanes.critical.is_empty() => lanes.normal.pop_front(),
            Priority::Normal => None,
        }
    }

    /// Wait for and take the next envelope from one lane
    pub async fn pop_lane(&self, priority: Priority) -> CommandEnvelope {
        loop {
            if let Some(envelope) = self.try_pop_lane(priority).await {
                return envelope;
            }
            self.ready(priority).notified().await;
        }
    }

    /// Remove a queued envelope by ID; returns whether it was queued
    pub async fn remove(&self, id: &str) -> bool {
        let mut lanes = self.lanes.lock().await;
        for priority in [Priority::Critical, Priority::Normal] {
            let lane = lanes.lane_mut(priority);
            if let Some(pos) = lane.iter().position(|e| e.id() == id) {
                lane.remove(pos);
                if lanes.critical.is_empty() && !lanes.normal.is_empty() {
                    self.normal_ready.notify_one();
                }
                return true;
            }
        }
        false
    }

    /// Number of queued envelopes as `(critical, normal)`
    pub async fn depth(&self) -> (usize, usize) {
        let lanes = self.lanes.lock().await;
        (lanes.critical.len(), lanes.normal.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::command::{CommandKind, Target};

    fn envelope(id: &str, priority: Priority) -> CommandEnvelope {
        CommandEnvelope::new(
            id,
            CommandKind::GetSystemInfo,
            priority,
            serde_json::Value::Null,
            Target::Node("h1".into()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn critical_drains_before_normal() {
        let queue = PriorityQueue::new(10);
        queue.push(envelope("n1", Priority::Normal)).await.unwrap();
        queue.push(envelope("n2", Priority::Normal)).await.unwrap();
        queue.push(envelope("c1", Priority::Critical)).await.unwrap();
        queue.push(envelope("c2", Priority::Critical)).await.unwrap();

        let mut order = Vec::new();
        while let Some(e) = queue.try_pop().await {
            order.push(e.id().to_string());
        }
        assert_eq!(order, vec!["c1", "c2", "n1", "n2"]);
    }

    #[tokio::test]
    async fn full_lane_rejects() {
        let queue = PriorityQueue::new(1);
        queue.push(envelope("n1", Priority::Normal)).await.unwrap();
        assert!(queue.push(envelope("n2", Priority::Normal)).await.is_err());
        // The other lane is independent
        queue.push(envelope("c1", Priority::Critical)).await.unwrap();
        assert_eq!(queue.depth().await, (1, 1));
    }

    #[tokio::test]
    async fn remove_by_id() {
        let queue = PriorityQueue::new(10);
        queue.push(envelope("n1", Priority::Normal)).await.unwrap();
        assert!(queue.remove("n1").await);
        assert!(!queue.remove("n1").await);
        assert!(queue.try_pop().await.is_none());
    }

    #[tokio::test]
    async fn pop_lane_waits_for_push() {
        let queue = Arc::new(PriorityQueue::new(10));
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop_lane(Priority::Critical).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(envelope("c1", Priority::Critical)).await.unwrap();

        let popped = waiter.await.unwrap();
        assert_eq!(popped.id(), "c1");
    }

    #[tokio::test]
    async fn normal_lane_waits_for_critical_to_empty() {
        let queue = Arc::new(PriorityQueue::new(10));
        queue.push(envelope("c1", Priority::Critical)).await.unwrap();
        queue.push(envelope("n1", Priority::Normal)).await.unwrap();

        assert!(queue.try_pop_lane(Priority::Normal).await.is_none());

        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop_lane(Priority::Normal).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        assert_eq!(queue.pop_lane(Priority::Critical).await.id(), "c1");
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.id(), "n1");
    }
}

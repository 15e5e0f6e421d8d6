//! Pending notifications

use crate::connection::Notification;
use std::collections::{HashSet, VecDeque};

/// FIFO of notifications awaiting dispatch.
///
/// A notification identical to one already queued is dropped: a row touched several
/// times within one drain interval only needs to be reported once.
#[derive(Debug, Default)]
pub struct NotificationQueue {
    items: VecDeque<Notification>,
    /// Mirrors `items`.
    pending: HashSet<Notification>,
}

impl NotificationQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `notification` unless an identical one is pending. Returns whether it was added.
    pub fn push(&mut self, notification: Notification) -> bool {
        if !self.pending.insert(notification.clone()) {
            return false;
        }
        self.items.push_back(notification);
        true
    }

    /// Takes everything queued so far, oldest first.
    pub fn drain(&mut self) -> Vec<Notification> {
        self.pending.clear();
        self.items.drain(..).collect()
    }

    /// Pending notifications.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// No notifications pending.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

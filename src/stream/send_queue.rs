use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::stream::frames::DataMessageStanza;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageSendStatus {
    /// accepted, will be written as soon as the stream allows
    Queued,
    /// acknowledged by the server
    Sent,
    QueueSizeLimitReached,
    AppQueueSizeLimitReached,
    MessageTooLarge,
    /// a message with a TTL of 0 can only be sent while logged in
    NoConnectionOnZeroTtl,
    TtlExceeded,
}

#[derive(Clone, Debug)]
pub struct PendingMessage {
    pub stanza: DataMessageStanza,
    /// `None` for messages that wait indefinitely
    pub expires_at: Option<Instant>,
    /// outgoing stream id the message was written with, if it was written on the current connection
    pub stream_id: Option<u32>,
}
impl PendingMessage {
    pub fn new(stanza: DataMessageStanza, now: Instant) -> PendingMessage {
        let expires_at = if stanza.ttl == 0 {
            None
        }
        else {
            Some(now + std::time::Duration::from_secs(stanza.ttl as u64))
        };

        PendingMessage {
            stanza,
            expires_at,
            stream_id: None,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.stanza.category
    }

    pub fn message_id(&self) -> &str {
        &self.stanza.id
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Outgoing messages: `to_send` holds messages not yet written, `to_resend` holds messages written
///  on the current connection but not yet acknowledged. Both are in submission order.
pub struct SendQueue {
    to_send: VecDeque<PendingMessage>,
    to_resend: VecDeque<PendingMessage>,
    per_app: FxHashMap<String, usize>,
    max_size: usize,
    max_app_size: usize,
}
impl SendQueue {
    pub fn new(max_size: usize, max_app_size: usize) -> SendQueue {
        SendQueue {
            to_send: Default::default(),
            to_resend: Default::default(),
            per_app: Default::default(),
            max_size,
            max_app_size,
        }
    }

    pub fn send_len(&self) -> usize {
        self.to_send.len()
    }

    pub fn resend_len(&self) -> usize {
        self.to_resend.len()
    }

    /// Returns the reason a new message for the app would be rejected, if any
    pub fn check_capacity(&self, app_id: &str) -> Option<MessageSendStatus> {
        if self.to_send.len() + self.to_resend.len() >= self.max_size {
            return Some(MessageSendStatus::QueueSizeLimitReached);
        }
        if self.per_app.get(app_id).copied().unwrap_or(0) >= self.max_app_size {
            return Some(MessageSendStatus::AppQueueSizeLimitReached);
        }
        None
    }

    pub fn push(&mut self, message: PendingMessage) {
        *self.per_app.entry(message.app_id().to_string()).or_default() += 1;
        self.to_send.push_back(message);
    }

    pub fn pop_to_send(&mut self) -> Option<PendingMessage> {
        let result = self.to_send.pop_front()?;
        self.release(&result);
        Some(result)
    }

    pub fn mark_written(&mut self, message: PendingMessage) {
        *self.per_app.entry(message.app_id().to_string()).or_default() += 1;
        self.to_resend.push_back(message);
    }

    /// Removes and returns all written messages with a stream id up to and including `stream_id`
    pub fn ack_up_to(&mut self, stream_id: u32) -> Vec<PendingMessage> {
        let mut result = Vec::new();
        while self.to_resend.front().is_some_and(|m| m.stream_id.is_some_and(|id| id <= stream_id)) {
            if let Some(message) = self.to_resend.pop_front() {
                self.release(&message);
                result.push(message);
            }
        }
        result
    }

    pub fn ack_persistent_ids(&mut self, persistent_ids: &[String]) -> Vec<PendingMessage> {
        let (acked, remaining): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.to_resend)
            .into_iter()
            .partition(|m| !m.stanza.persistent_id.is_empty() && persistent_ids.contains(&m.stanza.persistent_id));
        self.to_resend = remaining;

        let acked = acked.into_iter().collect::<Vec<_>>();
        for message in &acked {
            self.release(message);
        }
        acked
    }

    /// Moves all unacknowledged messages back in front of the unsent ones, preserving submission
    ///  order. They will be written again on the next connection.
    pub fn requeue_unacked(&mut self) {
        while let Some(mut message) = self.to_resend.pop_back() {
            message.stream_id = None;
            self.to_send.push_front(message);
        }
    }

    /// Removes and returns unsent messages whose TTL has passed
    pub fn expire(&mut self, now: Instant) -> Vec<PendingMessage> {
        let (expired, remaining): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.to_send)
            .into_iter()
            .partition(|m| m.is_expired(now));
        self.to_send = remaining;

        let expired = expired.into_iter().collect::<Vec<_>>();
        for message in &expired {
            self.release(message);
        }
        expired
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.to_send.iter()
            .filter_map(|m| m.expires_at)
            .min()
    }

    fn release(&mut self, message: &PendingMessage) {
        if let Some(count) = self.per_app.get_mut(message.app_id()) {
            *count -= 1;
            if *count == 0 {
                self.per_app.remove(message.app_id());
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::time::Instant;
    use super::*;

    fn message(app_id: &str, id: &str, ttl: u32, now: Instant) -> PendingMessage {
        PendingMessage::new(DataMessageStanza {
            id: id.to_string(),
            category: app_id.to_string(),
            ttl,
            ..Default::default()
        }, now)
    }

    fn ids(messages: &[PendingMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.message_id()).collect()
    }

    #[test]
    fn test_capacity() {
        let now = Instant::now();
        let mut queue = SendQueue::new(3, 2);
        assert_eq!(queue.check_capacity("a"), None);

        queue.push(message("a", "1", 10, now));
        queue.push(message("a", "2", 10, now));
        assert_eq!(queue.check_capacity("a"), Some(MessageSendStatus::AppQueueSizeLimitReached));
        assert_eq!(queue.check_capacity("b"), None);

        queue.push(message("b", "3", 10, now));
        assert_eq!(queue.check_capacity("c"), Some(MessageSendStatus::QueueSizeLimitReached));

        // written but unacknowledged messages still count
        let mut m = queue.pop_to_send().unwrap();
        m.stream_id = Some(1);
        queue.mark_written(m);
        assert_eq!(queue.check_capacity("a"), Some(MessageSendStatus::QueueSizeLimitReached));

        queue.ack_up_to(1);
        assert_eq!(queue.check_capacity("a"), None);
    }

    #[test]
    fn test_ack_up_to() {
        let now = Instant::now();
        let mut queue = SendQueue::new(10, 10);
        for (i, id) in ["1", "2", "3"].iter().enumerate() {
            queue.push(message("a", id, 10, now));
            let mut m = queue.pop_to_send().unwrap();
            m.stream_id = Some(i as u32 + 2);
            queue.mark_written(m);
        }

        assert!(queue.ack_up_to(1).is_empty());
        assert_eq!(ids(&queue.ack_up_to(3)), vec!["1", "2"]);
        assert_eq!(queue.resend_len(), 1);
        assert_eq!(ids(&queue.ack_up_to(10)), vec!["3"]);
        assert_eq!(queue.resend_len(), 0);
    }

    #[test]
    fn test_ack_persistent_ids() {
        let now = Instant::now();
        let mut queue = SendQueue::new(10, 10);
        for id in ["1", "2", "3"] {
            let mut m = message("a", id, 10, now);
            m.stanza.persistent_id = format!("p{}", id);
            m.stream_id = Some(5);
            queue.mark_written(m);
        }

        assert_eq!(ids(&queue.ack_persistent_ids(&["p2".to_string(), "p9".to_string()])), vec!["2"]);
        assert_eq!(queue.resend_len(), 2);
    }

    #[test]
    fn test_requeue_preserves_order() {
        let now = Instant::now();
        let mut queue = SendQueue::new(10, 10);
        for id in ["1", "2", "3", "4"] {
            queue.push(message("a", id, 10, now));
        }
        for stream_id in [1, 2] {
            let mut m = queue.pop_to_send().unwrap();
            m.stream_id = Some(stream_id);
            queue.mark_written(m);
        }

        queue.requeue_unacked();
        assert_eq!(queue.resend_len(), 0);

        let mut order = Vec::new();
        while let Some(m) = queue.pop_to_send() {
            assert_eq!(m.stream_id, None);
            order.push(m.message_id().to_string());
        }
        assert_eq!(order, vec!["1", "2", "3", "4"]);
        assert_eq!(queue.check_capacity("a"), None);
    }

    #[test]
    fn test_expire() {
        let now = Instant::now();
        let mut queue = SendQueue::new(10, 10);
        queue.push(message("a", "short", 1, now));
        queue.push(message("a", "long", 60, now));
        queue.push(message("a", "zero", 0, now));

        assert_eq!(queue.next_expiry(), Some(now + Duration::from_secs(1)));
        assert!(queue.expire(now).is_empty());

        assert_eq!(ids(&queue.expire(now + Duration::from_secs(1))), vec!["short"]);
        assert_eq!(queue.next_expiry(), Some(now + Duration::from_secs(60)));
        assert_eq!(queue.send_len(), 2);
    }
}

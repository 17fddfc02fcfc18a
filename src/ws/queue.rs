use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;

/// A message waiting to be written to the socket.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Sent verbatim
    Text(String),
    /// Serialised to JSON text when it is written
    Json(Value),
}

impl Outbound {
    /// Captures any serialisable value as a JSON message.
    pub fn json<T: Serialize>(value: &T) -> crate::Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    pub(crate) fn to_text(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Text(text) => Ok(text.clone()),
            Self::Json(value) => serde_json::to_string(value),
        }
    }
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Value> for Outbound {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// FIFO of messages written while the socket is not open.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: VecDeque<Outbound>,
    capacity: Option<usize>,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity,
        }
    }

    /// Appends a message, dropping the oldest one first if the queue is full.
    ///
    /// Returns the dropped message, if any.
    pub fn push_back(&mut self, message: Outbound) -> Option<Outbound> {
        let dropped = match self.capacity {
            Some(0) => return Some(message),
            Some(capacity) if self.messages.len() >= capacity => self.messages.pop_front(),
            _ => None,
        };
        self.messages.push_back(message);
        dropped
    }

    /// Puts a message that failed to send back at the head of the queue.
    pub fn push_front(&mut self, message: Outbound) {
        self.messages.push_front(message);
    }

    pub fn pop_front(&mut self) -> Option<Outbound> {
        self.messages.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn preserves_order_with_requeue_at_head() {
        let mut queue = OutboundQueue::new(None);
        queue.push_back("a".into());
        queue.push_back("b".into());
        queue.push_back("c".into());

        let first = queue.pop_front().unwrap();
        queue.push_front(first);

        let drained: Vec<_> = std::iter::from_fn(|| queue.pop_front()).collect();
        assert_eq!(
            drained,
            vec![Outbound::from("a"), Outbound::from("b"), Outbound::from("c")]
        );
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut queue = OutboundQueue::new(Some(2));
        assert!(queue.push_back("a".into()).is_none());
        assert!(queue.push_back("b".into()).is_none());

        assert_eq!(queue.push_back("c".into()), Some("a".into()));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front(), Some("b".into()));
    }

    #[test]
    fn json_messages_serialise_compactly() {
        let message = Outbound::json(&json!({"event": "ping-app"})).unwrap();

        assert_eq!(message.to_text().unwrap(), r#"{"event":"ping-app"}"#);
        assert_eq!(Outbound::from("ping").to_text().unwrap(), "ping");
    }
}

use crate::core::packet::QoS;
use crate::core::topics::TopicMatcher;

/// One accepted topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Arrival order, used to keep listings stable.
    pub order: u64,
    pub filter: String,
    pub qos: QoS,
}

/// A session's filters, in the order they were first subscribed.
#[derive(Debug, Default)]
pub struct Subscriptions {
    entries: Vec<Subscription>,
    next_order: u64,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `filter`, or updates the granted QoS of an identical filter.
    pub fn subscribe(&mut self, filter: &str, qos: QoS) {
        if let Some(existing) = self.entries.iter_mut().find(|s| s.filter == filter) {
            existing.qos = qos;
            return;
        }
        self.entries.push(Subscription {
            order: self.next_order,
            filter: filter.to_string(),
            qos,
        });
        self.next_order += 1;
    }

    /// Removes an exact filter. Returns whether it was present.
    pub fn unsubscribe(&mut self, filter: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| s.filter != filter);
        self.entries.len() != before
    }

    /// Highest QoS granted by any subscription selecting `topic`.
    pub fn granted_qos(&self, topic: &str, matcher: &TopicMatcher) -> Option<QoS> {
        self.entries
            .iter()
            .filter(|s| matcher.matches(&s.filter, topic).unwrap_or(false))
            .map(|s| s.qos)
            .max()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

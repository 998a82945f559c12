use dashmap::DashMap;
use tracing::debug;

use crate::core::packet::Publish;
use crate::core::topics::matcher::{filtered, TopicMatcher};

/// [`RetainedStore`] keeps the last retained PUBLISH per exact topic name.
///
/// Uses DashMap internally so publishers on different connections never
/// serialize on one lock.
#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: DashMap<String, Publish>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
        }
    }

    /// Records a retained publish. An empty payload clears the topic.
    pub fn retain(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            if self.messages.remove(&publish.topic).is_some() {
                debug!(topic = %publish.topic, "retained message cleared");
            }
            return;
        }
        let mut stored = publish.clone();
        stored.dup = false;
        stored.packet_id = None;
        stored.retain = true;
        debug!(topic = %publish.topic, bytes = stored.payload.len(), "retained message stored");
        self.messages.insert(publish.topic.clone(), stored);
    }

    pub fn get(&self, topic: &str) -> Option<Publish> {
        self.messages.get(topic).map(|entry| entry.value().clone())
    }

    /// Every retained message whose topic is selected by `filter`, ordered
    /// by topic. An invalid filter selects nothing.
    pub fn matching(&self, filter: &str, matcher: &TopicMatcher) -> Vec<Publish> {
        // literal part of the filter up to its first `+`
        let head = filtered(filter);
        let head = head.find('+').map_or(head, |i| &head[..i]);

        let mut found: Vec<Publish> = self
            .messages
            .iter()
            .filter(|entry| entry.key().starts_with(head))
            .filter(|entry| matcher.matches(filter, entry.key()).unwrap_or(false))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.topic.cmp(&b.topic));
        found
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::QoS;

    fn retained(topic: &str, payload: &'static str) -> Publish {
        let mut publish = Publish::new(topic, payload);
        publish.retain = true;
        publish
    }

    #[test]
    fn latest_publish_wins_and_empty_payload_clears() {
        let store = RetainedStore::new();
        store.retain(&retained("home/temp", "20"));
        store.retain(&retained("home/temp", "21"));
        assert_eq!(store.len(), 1);
        assert_eq!(&store.get("home/temp").unwrap().payload[..], b"21");

        store.retain(&retained("home/temp", ""));
        assert!(store.get("home/temp").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn stored_copy_drops_delivery_state() {
        let store = RetainedStore::new();
        let mut publish = retained("a", "x");
        publish.qos = QoS::AtLeastOnce;
        publish.packet_id = Some(9);
        publish.dup = true;
        store.retain(&publish);

        let stored = store.get("a").unwrap();
        assert_eq!(stored.packet_id, None);
        assert!(!stored.dup);
        assert_eq!(stored.qos, QoS::AtLeastOnce);
    }

    #[test]
    fn matching_uses_wildcards() {
        let store = RetainedStore::new();
        let matcher = TopicMatcher::default();
        for topic in ["home/kitchen/temp", "home/hall/temp", "home/hall/light", "$SYS/up"] {
            store.retain(&retained(topic, "v"));
        }

        let topics = |filter: &str| -> Vec<String> {
            store
                .matching(filter, &matcher)
                .into_iter()
                .map(|p| p.topic)
                .collect()
        };
        assert_eq!(topics("home/+/temp"), vec!["home/hall/temp", "home/kitchen/temp"]);
        assert_eq!(topics("home/hall/#"), vec!["home/hall/light", "home/hall/temp"]);
        assert_eq!(topics("#").len(), 3);
        assert_eq!(topics("home/hall/light"), vec!["home/hall/light"]);
        assert!(topics("home/#/x").is_empty());
    }
}

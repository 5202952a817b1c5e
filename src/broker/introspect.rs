use chrono::{DateTime, Utc};
use serde::Serialize;

use super::BrokerCore;

/// Снимок состояния брокера: только чтение, ядро не мутируется.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerDump {
    pub generated_at: DateTime<Utc>,
    pub topics: Vec<TopicDump>,
    pub sessions: usize,
    pub exact_subscriptions: usize,
    pub query_subscriptions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicDump {
    pub name: String,
    pub state: String,
    pub subscribers: usize,
    pub history_len: usize,
    pub cache_entries: usize,
    pub cache_bytes: usize,
    pub created_at: DateTime<Utc>,
}

impl BrokerCore {
    pub(crate) fn dump(&self) -> BrokerDump {
        let handles: Vec<_> = self.topics.iter().map(|e| e.value().clone()).collect();
        let mut topics = Vec::with_capacity(handles.len());
        for th in handles {
            let topic = th.inner.lock();
            topics.push(TopicDump {
                name: topic.name.to_string(),
                state: topic.state.to_string(),
                subscribers: topic.subscribers.len(),
                history_len: topic.history.len(),
                cache_entries: topic.store.len(),
                cache_bytes: topic.store.bytes_used(),
                created_at: topic.created_at,
            });
        }
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        let (exact, query) = self.registry.counts();
        BrokerDump {
            generated_at: Utc::now(),
            topics,
            sessions: self.sessions.len(),
            exact_subscriptions: exact,
            query_subscriptions: query,
        }
    }
}

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{error::BrokerResult, query::TopicMeta, topic::TopicConfig};

/// Снимок записи для персистентного слоя.
///
/// Хранится по одной (самой свежей) записи на тему: при старте она
/// воспроизводится через обычный publish-тракт с флагом from_persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentEntry {
    pub topic: String,
    pub payload: Bytes,
    pub meta: TopicMeta,
    pub attrs: BTreeMap<String, String>,
    pub priority: u8,
    pub topic_config: Option<TopicConfig>,
}

/// Порт персистентного слоя.
///
/// Используется только на старте (восстановление) и как write-through для
/// публикаций с флагом persistent.
pub trait TopicPersistence: Send + Sync {
    fn store(&self, entry: &PersistentEntry) -> BrokerResult<()>;
    fn erase(&self, topic: &str) -> BrokerResult<()>;
    fn fetch_all_oids(&self) -> BrokerResult<Vec<String>>;
    fn fetch(&self, topic: &str) -> BrokerResult<Option<PersistentEntry>>;
}

/// Заглушка: ничего не хранит.
#[derive(Debug, Default, Clone)]
pub struct NoPersistence;

impl TopicPersistence for NoPersistence {
    fn store(&self, _entry: &PersistentEntry) -> BrokerResult<()> {
        Ok(())
    }

    fn erase(&self, _topic: &str) -> BrokerResult<()> {
        Ok(())
    }

    fn fetch_all_oids(&self) -> BrokerResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn fetch(&self, _topic: &str) -> BrokerResult<Option<PersistentEntry>> {
        Ok(None)
    }
}

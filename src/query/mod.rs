//! Сопоставление query-подписок с метаданными тем.
//!
//! Язык запросов подключаемый: брокер видит только непрозрачный предикат
//! `QueryEvaluator`. По умолчанию используется `GlobAttrEvaluator`.

pub mod glob;

pub use glob::GlobAttrEvaluator;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::BrokerResult;

/// Метаданные темы, против которых вычисляются query-подписки.
///
/// Привязываются к теме при первой публикации и дальше не меняются.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMeta {
    pub content_type: Option<String>,
    pub attrs: BTreeMap<String, String>,
}

impl TopicMeta {
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// Подключаемый предикат query-подписок.
pub trait QueryEvaluator: Send + Sync {
    /// Проверка синтаксиса при регистрации подписки.
    fn validate(&self, query: &str) -> BrokerResult<()>;

    /// Совпадает ли тема `topic` с метаданными `meta` с запросом `query`.
    fn matches(&self, query: &str, topic: &str, meta: &TopicMeta) -> BrokerResult<bool>;
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Конфигурация темы.
///
/// Привязывается при первой публикации (из `PublishQos::topic_config` или
/// из настроек брокера) и действует до смерти темы.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Ёмкость очереди истории; 0 — история отключена.
    pub history_max: usize,
    /// Сколько тема живёт в состоянии UNREFERENCED до сноса.
    pub destroy_delay: Duration,
    /// Запрещать публикации после первой записи в истории.
    pub read_only: bool,
    /// Разрешён ли подписчикам начальный replay истории.
    pub history_on_subscribe: bool,
    /// Писать в историю и публикации с неизменившимся содержимым.
    pub record_unchanged: bool,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            history_max: 16,
            destroy_delay: Duration::from_secs(60),
            read_only: false,
            history_on_subscribe: true,
            record_unchanged: true,
        }
    }
}

impl TopicConfig {
    /// Конфигурация без истории.
    pub fn no_history() -> Self {
        Self {
            history_max: 0,
            ..Self::default()
        }
    }
}

use std::{collections::BTreeMap, time::Duration};

use crate::{dispatch::SessionId, query::TopicMeta, topic::TopicConfig};

pub const PRIORITY_MIN: u8 = 0;
pub const PRIORITY_NORM: u8 = 5;
pub const PRIORITY_MAX: u8 = 9;

/// Параметры публикации.
///
/// `ttl == None` — запись живёт, пока на неё есть ссылки;
/// `ttl == Some(0)` — volatile: запись не попадает в историю и умирает
/// сразу после раздачи по очередям доставки.
#[derive(Debug, Clone)]
pub struct PublishQos {
    pub priority: u8,
    pub ttl: Option<Duration>,
    pub persistent: bool,
    /// Доставлять даже при неизменившемся содержимом.
    pub force_update: bool,
    /// По истечении ttl уничтожить сразу, не дожидаясь освобождения ссылок.
    pub force_destroy: bool,
    /// Сообщение воспроизводится из персистентного слоя при старте.
    pub from_persistence: bool,
    /// Конфигурация темы; применяется при первой публикации.
    pub topic_config: Option<TopicConfig>,
    /// Метаданные темы для query-подписок; применяются при первой публикации.
    pub meta: TopicMeta,
    /// Свойства этого сообщения, доставляются подписчику как есть.
    pub attrs: BTreeMap<String, String>,
    /// Непустой список адресатов переключает публикацию в режим PtP.
    pub destinations: Vec<Destination>,
}

impl Default for PublishQos {
    fn default() -> Self {
        Self {
            priority: PRIORITY_NORM,
            ttl: None,
            persistent: false,
            force_update: false,
            force_destroy: false,
            from_persistence: false,
            topic_config: None,
            meta: TopicMeta::default(),
            attrs: BTreeMap::new(),
            destinations: Vec::new(),
        }
    }
}

impl PublishQos {
    /// Volatile-публикация: без истории, живёт только в очередях доставки.
    pub fn volatile() -> Self {
        Self {
            ttl: Some(Duration::ZERO),
            ..Self::default()
        }
    }

    pub fn is_ptp(&self) -> bool {
        !self.destinations.is_empty()
    }

    pub fn is_volatile(&self) -> bool {
        self.ttl == Some(Duration::ZERO)
    }
}

/// Адресат PtP-публикации.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub session: SessionId,
    /// Разрешить парковку сообщения до подключения адресата.
    pub force_queuing: bool,
}

impl Destination {
    pub fn new(session: impl Into<SessionId>) -> Self {
        Self {
            session: session.into(),
            force_queuing: false,
        }
    }

    pub fn queued(session: impl Into<SessionId>) -> Self {
        Self {
            session: session.into(),
            force_queuing: true,
        }
    }
}

/// Параметры синхронного чтения.
#[derive(Debug, Clone)]
pub struct GetQos {
    /// Сколько последних записей истории вернуть.
    pub depth: usize,
    /// true — от новых к старым, false — в хронологическом порядке.
    pub newest_first: bool,
}

impl Default for GetQos {
    fn default() -> Self {
        Self {
            depth: 1,
            newest_first: true,
        }
    }
}

/// Параметры удаления темы.
#[derive(Debug, Clone, Default)]
pub struct EraseQos {
    /// Снести немедленно, не дожидаясь освобождения ссылок из очередей.
    pub force_destroy: bool,
}

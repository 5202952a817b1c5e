//! Тема: конечный автомат жизненного цикла и алгоритм публикации.
//!
//! - `config`: конфигурация темы (история, destroy-delay, read-only).
//! - `state`: состояния темы и таблица допустимых переходов.
//! - `intern` (приватный): пул `Arc<str>` для имён тем.
//! - `topic`: сама тема — хранилище, история, подписчики, таймеры.

pub mod config;
pub mod state;
pub mod topic;

mod intern;

pub use config::TopicConfig;
pub use state::TopicState;
pub use topic::{StateChange, Topic, TopicHandle};

pub(crate) use intern::intern_topic;
pub(crate) use topic::AttachedSub;

//! Хранилище сообщений одной темы.
//!
//! - `timestamp`: уникальные монотонные идентификаторы записей.
//! - `qos`: параметры публикации, чтения и удаления.
//! - `entry`: неизменяемое содержимое опубликованного сообщения.
//! - `store`: владеющий контейнер со счётчиками ссылок и handle'ами.
//! - `history`: ограниченная FIFO-история ссылок на записи.

pub mod entry;
pub mod history;
pub mod qos;
pub mod store;
pub mod timestamp;

pub use entry::{EntryData, EntryState};
pub use history::HistoryQueue;
pub use qos::{Destination, EraseQos, GetQos, PublishQos, PRIORITY_MAX, PRIORITY_MIN, PRIORITY_NORM};
pub use store::{EntryHandle, ExpireOutcome, MessageStore, RefOrigin, Released};
pub use timestamp::EntryId;

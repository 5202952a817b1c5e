//! Порты внешних соучастников брокера.
//!
//! Эти трейты описывают границы ядра: авторизацию и персистентный слой.
//! Реализации живут снаружи; здесь — контракты и no-op заглушки.

pub mod authorization;
pub mod persistence;

pub use authorization::{Action, AllowAll, Authorizer};
pub use persistence::{NoPersistence, PersistentEntry, TopicPersistence};

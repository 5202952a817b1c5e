//! Доставка: каналы подписчиков, таймеры и dead-letter тракт.
//!
//! - `channel`: контракт транспорта (`DeliveryChannel`), элементы доставки
//!   и внутрипроцессный `LoopbackChannel`.
//! - `timer`: отменяемый одноразовый таймер с проверкой поколения.
//! - `error_handler`: политика обработки недоставленных сообщений.

pub mod channel;
pub mod error_handler;
pub mod timer;

pub use channel::{
    loopback, DeliveryChannel, DeliveryItem, DeliveryUpdate, LoopbackChannel, LoopbackReceiver,
    SessionId, UpdateKind,
};
pub use error_handler::DEAD_LETTER_TOPIC;

pub(crate) use channel::{FanoutFailure, UpdateGuard};
pub(crate) use timer::OneShotTimer;

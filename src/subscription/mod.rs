//! Подписки: цели, опции и глобальный реестр.
//!
//! Точные подписки дополнительно привязываются к своей теме (доставка не
//! требует сканирования); query-подписки индексируются глобально и
//! вычисляются один раз на тему — в момент её конфигурации.

pub mod options;
pub mod registry;
pub mod subscription;

pub use options::{SubscriptionOptions, TargetSpec};
pub use registry::SubscriptionRegistry;
pub use subscription::{Subscription, SubscriptionId};

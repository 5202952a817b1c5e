//! Фасад брокера: publish / subscribe / unsubscribe / get / erase.

pub mod broker;
pub mod introspect;

pub use broker::{Broker, BrokerEvent, BrokerOptions, PublishAck};
pub use introspect::{BrokerDump, TopicDump};

pub(crate) use broker::{system_session, BrokerCore};

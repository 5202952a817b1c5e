/// Ports for external collaborators (authorization, persistence).
pub mod application;
/// Broker facade: publish / subscribe / unsubscribe / get / erase.
pub mod broker;
/// Broker configuration loading.
pub mod config;
/// Delivery: subscriber channels, timers, dead-letter handling.
pub mod dispatch;
/// Common error types: request taxonomy and delivery rejections.
pub mod error;
/// Flexible logging (console and file sinks).
pub mod logging;
/// Per-topic message storage: entries, reference counts, history.
pub mod msgstore;
/// Pluggable query matching over topic metadata.
pub mod query;
/// Subscriptions: targets, options, global registry.
pub mod subscription;
/// Topic lifecycle state machine.
pub mod topic;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// External collaborator ports and their no-op defaults.
pub use application::{
    Action, AllowAll, Authorizer, NoPersistence, PersistentEntry, TopicPersistence,
};
/// Broker facade, options, events, introspection dump.
pub use broker::{Broker, BrokerDump, BrokerEvent, BrokerOptions, PublishAck, TopicDump};
/// config
pub use config::{Settings, TopicSettings};
/// Delivery channel contract and the in-process loopback implementation.
pub use dispatch::{
    loopback, DeliveryChannel, DeliveryItem, DeliveryUpdate, LoopbackChannel, LoopbackReceiver,
    SessionId, UpdateKind, DEAD_LETTER_TOPIC,
};
/// Operation errors and result types.
pub use error::{BrokerError, BrokerResult, RejectReason, RejectedDestination};
/// Logging initialization.
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
/// Message entries, QoS and the reference-counted store.
pub use msgstore::{
    Destination, EntryData, EntryHandle, EntryId, EntryState, EraseQos, GetQos, HistoryQueue,
    MessageStore, PublishQos,
};
/// Query evaluation.
pub use query::{GlobAttrEvaluator, QueryEvaluator, TopicMeta};
/// Subscription API.
pub use subscription::{Subscription, SubscriptionId, SubscriptionOptions, TargetSpec};
/// Topic lifecycle.
pub use topic::{TopicConfig, TopicState};

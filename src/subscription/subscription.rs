use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{SubscriptionOptions, TargetSpec};
use crate::dispatch::SessionId;

/// Идентификатор подписки.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Arc<str>);

impl SubscriptionId {
    pub(crate) fn generate() -> Self {
        Self(Arc::from(format!("sub:{}", Uuid::new_v4())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Запись о подписке в реестре.
///
/// Повторная подписка того же сеанса на ту же цель не создаёт дубликата —
/// растёт `multiplicity`; реальное удаление происходит, когда счётчик
/// доходит до нуля. Материализованные из query подписки несут `parent`,
/// а query-родитель помнит своих детей для каскадного снятия.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub session: SessionId,
    pub target: TargetSpec,
    pub options: SubscriptionOptions,
    pub created_at: DateTime<Utc>,
    pub multiplicity: u32,
    pub parent: Option<SubscriptionId>,
    pub children: Vec<SubscriptionId>,
}

impl Subscription {
    pub(crate) fn new(session: SessionId, target: TargetSpec, options: SubscriptionOptions) -> Self {
        Self {
            id: SubscriptionId::generate(),
            session,
            target,
            options,
            created_at: Utc::now(),
            multiplicity: 1,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Подписка, материализованная совпадением query с новой темой.
    pub(crate) fn materialized(
        session: SessionId,
        topic: &str,
        options: SubscriptionOptions,
        parent: SubscriptionId,
    ) -> Self {
        let mut sub = Self::new(session, TargetSpec::exact(topic), options);
        sub.parent = Some(parent);
        sub
    }

    pub fn is_materialized(&self) -> bool {
        self.parent.is_some()
    }
}

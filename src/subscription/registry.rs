use std::collections::HashSet;

use dashmap::DashMap;

use super::{Subscription, SubscriptionId};
use crate::dispatch::SessionId;

/// Глобальный реестр подписок.
///
/// Три индекса:
/// - по id — основная таблица;
/// - (session, target) -> id — для multiplicity при повторной подписке;
///   материализованные подписки сюда не попадают, чтобы не затирать
///   прямые подписки того же сеанса на ту же тему;
/// - по сеансу — для зачистки при отключении;
/// - query-подписки отдельным набором — их перебирают при конфигурации
///   каждой новой темы.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subs: DashMap<SubscriptionId, Subscription>,
    by_target: DashMap<(SessionId, String), SubscriptionId>,
    by_session: DashMap<SessionId, HashSet<SubscriptionId>>,
    query_index: DashMap<SubscriptionId, String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sub: Subscription) {
        if !sub.is_materialized() {
            self.by_target
                .insert((sub.session.clone(), sub.target.key()), sub.id.clone());
        }
        if let super::TargetSpec::Query(q) = &sub.target {
            self.query_index.insert(sub.id.clone(), q.clone());
        }
        self.by_session
            .entry(sub.session.clone())
            .or_default()
            .insert(sub.id.clone());
        self.subs.insert(sub.id.clone(), sub);
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.subs.get(id).map(|s| s.clone())
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.subs.contains_key(id)
    }

    /// Прямая (нематериализованная) подписка сеанса на цель.
    pub fn find_target(&self, session: &SessionId, target_key: &str) -> Option<SubscriptionId> {
        self.by_target
            .get(&(session.clone(), target_key.to_string()))
            .map(|id| id.clone())
    }

    /// Повторная подписка: инкремент multiplicity, возвращает новое значение.
    pub fn bump_multiplicity(&self, id: &SubscriptionId) -> Option<u32> {
        self.subs.get_mut(id).map(|mut s| {
            s.multiplicity += 1;
            s.multiplicity
        })
    }

    /// Декремент multiplicity; вызывающий удаляет подписку при нуле.
    pub fn decrement_multiplicity(&self, id: &SubscriptionId) -> Option<u32> {
        self.subs.get_mut(id).map(|mut s| {
            s.multiplicity = s.multiplicity.saturating_sub(1);
            s.multiplicity
        })
    }

    /// Привязывает материализованного ребёнка к query-родителю.
    pub fn add_child(&self, parent: &SubscriptionId, child: &SubscriptionId) {
        if let Some(mut p) = self.subs.get_mut(parent) {
            p.children.push(child.clone());
        }
    }

    /// Снимает подписку со всех индексов.
    pub fn remove(&self, id: &SubscriptionId) -> Option<Subscription> {
        let (_, sub) = self.subs.remove(id)?;
        if !sub.is_materialized() {
            self.by_target
                .remove(&(sub.session.clone(), sub.target.key()));
        }
        self.query_index.remove(id);
        if let Some(mut set) = self.by_session.get_mut(&sub.session) {
            set.remove(id);
        }
        if let Some(parent) = &sub.parent {
            if let Some(mut p) = self.subs.get_mut(parent) {
                p.children.retain(|c| c != id);
            }
        }
        Some(sub)
    }

    /// Все query-подписки (копии записей).
    pub fn query_subs(&self) -> Vec<Subscription> {
        self.query_index
            .iter()
            .filter_map(|entry| self.get(entry.key()))
            .collect()
    }

    /// Подписки сеанса (включая материализованные).
    pub fn session_subs(&self, session: &SessionId) -> Vec<SubscriptionId> {
        self.by_session
            .get(session)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// (точные, query) — для интроспекции.
    pub fn counts(&self) -> (usize, usize) {
        let query = self.query_index.len();
        (self.subs.len() - query, query)
    }
}

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use super::{TopicConfig, TopicState};
use crate::{
    broker::BrokerCore,
    dispatch::{
        DeliveryChannel, DeliveryItem, DeliveryUpdate, FanoutFailure, OneShotTimer, SessionId,
        UpdateGuard, UpdateKind,
    },
    msgstore::{EntryHandle, EntryId, EntryState, HistoryQueue, MessageStore, RefOrigin},
    query::{QueryEvaluator, TopicMeta},
    subscription::{SubscriptionId, SubscriptionOptions},
};

/// Совершённый переход состояния темы.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub topic: Arc<str>,
    pub from: TopicState,
    pub to: TopicState,
}

/// Подписка, прикреплённая к теме: доставка не требует поиска в реестре.
pub(crate) struct AttachedSub {
    pub session: SessionId,
    pub channel: Arc<dyn DeliveryChannel>,
    pub options: SubscriptionOptions,
}

/// Тема с собственным замком: несвязанные темы не конкурируют.
pub struct TopicHandle {
    pub(crate) name: Arc<str>,
    pub(crate) inner: Mutex<Topic>,
}

impl TopicHandle {
    pub(crate) fn new(name: Arc<str>, defaults: TopicConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.clone(),
            inner: Mutex::new(Topic::new(name, defaults)),
        })
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }
}

/// Состояние одной темы. Все методы вызываются под замком `TopicHandle`.
pub struct Topic {
    pub(crate) name: Arc<str>,
    pub(crate) state: TopicState,
    pub(crate) config: TopicConfig,
    pub(crate) meta: TopicMeta,
    pub(crate) store: MessageStore,
    pub(crate) history: HistoryQueue,
    pub(crate) subscribers: HashMap<SubscriptionId, AttachedSub>,
    pub(crate) destroy_timer: OneShotTimer,
    pub(crate) expiry_timers: HashMap<EntryId, OneShotTimer>,
    pub(crate) created_at: DateTime<Utc>,
}

impl Topic {
    pub(crate) fn new(name: Arc<str>, defaults: TopicConfig) -> Self {
        Self {
            name,
            state: TopicState::Unconfigured,
            history: HistoryQueue::new(0),
            config: defaults,
            meta: TopicMeta::default(),
            store: MessageStore::new(),
            subscribers: HashMap::new(),
            destroy_timer: OneShotTimer::new(),
            expiry_timers: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Единственная точка смены состояния.
    ///
    /// Недопустимый переход — нарушение инварианта: логируется, тема
    /// принудительно приводится к ближайшему безопасному состоянию (DEAD).
    pub(crate) fn transition(&mut self, to: TopicState) -> StateChange {
        let from = self.state;
        if !from.can_transition(to) {
            error!(topic = %self.name, %from, %to, "illegal topic state transition, forcing DEAD");
            self.teardown();
            self.state = TopicState::Dead;
            return StateChange {
                topic: self.name.clone(),
                from,
                to: TopicState::Dead,
            };
        }
        match to {
            TopicState::Alive => self.destroy_timer.cancel(),
            TopicState::Dead => self.teardown(),
            _ => {}
        }
        debug!(topic = %self.name, %from, %to, "topic state transition");
        self.state = to;
        StateChange {
            topic: self.name.clone(),
            from,
            to,
        }
    }

    /// Освобождение всех ресурсов при переходе в DEAD.
    fn teardown(&mut self) {
        self.destroy_timer.cancel();
        for (_, mut timer) in self.expiry_timers.drain() {
            timer.cancel();
        }
        self.history.drain_all();
        self.store.clear();
    }

    /// Привязывает конфигурацию при первой публикации.
    pub(crate) fn configure(&mut self, config: Option<TopicConfig>, meta: TopicMeta) {
        if let Some(cfg) = config {
            self.config = cfg;
        }
        self.history = HistoryQueue::new(self.config.history_max);
        self.meta = meta;
    }

    /// Изменилось ли содержимое относительно самой свежей записи истории.
    /// Пустая история считается изменением.
    pub(crate) fn detect_change(&self, payload: &Bytes) -> bool {
        match self.history.newest().and_then(|h| self.store.get(h.id)) {
            Some(newest) => newest.payload != *payload,
            None => true,
        }
    }

    /// Освобождает ссылку; при уничтожении записи гасит её таймер ttl.
    pub(crate) fn release_ref(&mut self, handle: EntryHandle, origin: RefOrigin) -> bool {
        let destroyed = self.store.release(handle, origin).destroyed;
        if destroyed {
            if let Some(mut timer) = self.expiry_timers.remove(&handle.id) {
                timer.cancel();
            }
        }
        destroyed
    }

    /// Ставит таймер ttl записи.
    pub(crate) fn schedule_expiry(
        &mut self,
        rt: &Handle,
        core: Weak<BrokerCore>,
        th: &Arc<TopicHandle>,
        id: EntryId,
        ttl: Duration,
    ) {
        let th = th.clone();
        let timer = self.expiry_timers.entry(id).or_default();
        timer.schedule(rt, ttl, move |generation| {
            if let Some(core) = core.upgrade() {
                core.on_entry_expiry(th, id, generation);
            }
        });
    }

    /// Раздаёт запись по очередям текущих подписчиков.
    ///
    /// Каждая успешная постановка удерживает +1 ссылку на запись; отказы
    /// возвращаются вызывающему для dead-letter обработки после снятия
    /// замка темы.
    pub(crate) fn fan_out(
        &mut self,
        core: &Weak<BrokerCore>,
        th: &Arc<TopicHandle>,
        evaluator: &dyn QueryEvaluator,
        publisher: &SessionId,
        handle: EntryHandle,
        kind: UpdateKind,
    ) -> Vec<FanoutFailure> {
        let Some(data) = self.store.get(handle.id) else {
            return Vec::new();
        };
        let mut failures = Vec::new();
        for (sub_id, sub) in self.subscribers.iter() {
            if sub.options.no_local && &sub.session == publisher {
                continue;
            }
            if let Some(filter) = &sub.options.filter {
                let entry_meta = TopicMeta {
                    content_type: data.content_type.clone(),
                    attrs: data.attrs.clone(),
                };
                match evaluator.matches(filter, &self.name, &entry_meta) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(topic = %self.name, subscription = %sub_id, %e, "content filter failed, skipping delivery");
                        continue;
                    }
                }
            }
            if !self.store.retain(handle, RefOrigin::Delivery) {
                break;
            }
            let guard = UpdateGuard::new(Arc::downgrade(th), core.clone(), handle);
            let update =
                DeliveryUpdate::new(self.name.clone(), data.clone(), kind, guard);
            if let Err((item, reason)) = sub.channel.enqueue(DeliveryItem::Update(update)) {
                failures.push(FanoutFailure {
                    session: sub.session.clone(),
                    sub_id: Some(sub_id.clone()),
                    item,
                    reason,
                });
            }
        }
        failures
    }

    /// Синхронный начальный replay истории для свежей подписки.
    ///
    /// Если история пуста, а публикация ещё в полёте (volatile), доставляет
    /// `inflight`. Первая же неудача возвращается наружу — подписка будет
    /// откатана целиком.
    pub(crate) fn replay_history(
        &mut self,
        core: &Weak<BrokerCore>,
        th: &Arc<TopicHandle>,
        evaluator: &dyn QueryEvaluator,
        sub_id: &SubscriptionId,
        inflight: Option<EntryHandle>,
    ) -> Result<usize, Box<FanoutFailure>> {
        let Some(sub) = self.subscribers.get(sub_id) else {
            return Ok(0);
        };
        let (channel, options, session) =
            (sub.channel.clone(), sub.options.clone(), sub.session.clone());
        if !options.want_initial || !self.config.history_on_subscribe {
            return Ok(0);
        }

        let mut handles = self.history.newest_n(options.initial_depth);
        if handles.is_empty() {
            handles.extend(inflight);
        }
        if !options.newest_first {
            handles.reverse();
        }

        let mut delivered = 0;
        for handle in handles {
            if self.store.state_of(handle.id) != Some(EntryState::Alive) {
                continue;
            }
            let Some(data) = self.store.get(handle.id) else {
                continue;
            };
            if let Some(filter) = &options.filter {
                let entry_meta = TopicMeta {
                    content_type: data.content_type.clone(),
                    attrs: data.attrs.clone(),
                };
                if !matches!(evaluator.matches(filter, &self.name, &entry_meta), Ok(true)) {
                    continue;
                }
            }
            if !self.store.retain(handle, RefOrigin::Delivery) {
                continue;
            }
            let guard = UpdateGuard::new(Arc::downgrade(th), core.clone(), handle);
            let update = DeliveryUpdate::new(
                self.name.clone(),
                data,
                UpdateKind::InitialHistory,
                guard,
            );
            match channel.enqueue(DeliveryItem::Update(update)) {
                Ok(()) => delivered += 1,
                Err((item, reason)) => {
                    return Err(Box::new(FanoutFailure {
                        session,
                        sub_id: Some(sub_id.clone()),
                        item,
                        reason,
                    }))
                }
            }
        }
        Ok(delivered)
    }

    /// Прощальные уведомления подписчикам при erase. Отказы только логируются:
    /// сеанс и так лишается подписки.
    pub(crate) fn notify_erased(&self) {
        for (sub_id, sub) in self.subscribers.iter() {
            let item = DeliveryItem::TopicErased {
                topic: self.name.clone(),
            };
            if let Err((_, reason)) = sub.channel.enqueue(item) {
                warn!(topic = %self.name, subscription = %sub_id, %reason, "erase notification dropped");
            }
        }
    }

    /// Переоценка жизненного цикла после убытия ссылки или подписчика.
    ///
    /// ALIVE без подписчиков и записей уходит в UNREFERENCED и заводит
    /// destroy-таймер; SOFT_ERASED с осушённым хранилищем умирает;
    /// UNCONFIGURED без подписчиков умирает сразу.
    pub(crate) fn check_lifecycle(
        &mut self,
        rt: &Handle,
        core: &Weak<BrokerCore>,
        th: &Arc<TopicHandle>,
    ) -> Option<StateChange> {
        match self.state {
            TopicState::Alive
                if self.subscribers.is_empty()
                    && self.history.is_empty()
                    && self.store.is_empty() =>
            {
                let change = self.transition(TopicState::Unreferenced);
                let delay = self.config.destroy_delay;
                let core = core.clone();
                let th = th.clone();
                self.destroy_timer.schedule(rt, delay, move |generation| {
                    if let Some(core) = core.upgrade() {
                        core.on_destroy_timer(th, generation);
                    }
                });
                Some(change)
            }
            TopicState::SoftErased if self.store.is_empty() => {
                Some(self.transition(TopicState::Dead))
            }
            TopicState::Unconfigured if self.subscribers.is_empty() => {
                Some(self.transition(TopicState::Dead))
            }
            _ => None,
        }
    }

    pub fn state(&self) -> TopicState {
        self.state
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

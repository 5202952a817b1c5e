use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::{runtime::Handle, sync::broadcast};
use tracing::{debug, info, warn};

use crate::{
    application::{Action, AllowAll, Authorizer, NoPersistence, PersistentEntry, TopicPersistence},
    config::Settings,
    dispatch::{
        DeliveryChannel, DeliveryItem, DeliveryUpdate, FanoutFailure, SessionId, UpdateGuard,
        UpdateKind,
    },
    error::{BrokerError, BrokerResult, RejectReason, RejectedDestination},
    msgstore::{
        EntryData, EntryId, EntryState, EraseQos, GetQos, PublishQos, RefOrigin, PRIORITY_MAX,
    },
    query::{GlobAttrEvaluator, QueryEvaluator},
    subscription::{
        Subscription, SubscriptionId, SubscriptionOptions, SubscriptionRegistry, TargetSpec,
    },
    topic::{intern_topic, AttachedSub, StateChange, Topic, TopicConfig, TopicHandle, TopicState},
};

/// Служебный сеанс самого брокера (dead letters, восстановление).
static SYSTEM_SESSION: Lazy<SessionId> = Lazy::new(|| SessionId::new("__sys__broker"));

pub(crate) fn system_session() -> &'static SessionId {
    &SYSTEM_SESSION
}

/// Событие жизненного цикла — типизированный канал вместо наборов
/// слушателей: потребители подключаются через `Broker::events()`.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    TopicState {
        topic: Arc<str>,
        from: TopicState,
        to: TopicState,
    },
    DeadLetter {
        topic: Arc<str>,
        entry: EntryId,
        session: SessionId,
        reason: String,
    },
    SessionTerminated {
        session: SessionId,
    },
}

/// Результат публикации.
#[derive(Debug, Clone)]
pub struct PublishAck {
    pub id: EntryId,
    pub topic: Arc<str>,
    /// PtP: адресаты, по которым доставка не состоялась.
    pub rejected: Vec<RejectedDestination>,
}

/// Параметры сборки брокера.
pub struct BrokerOptions {
    pub defaults: TopicConfig,
    /// Глубина истории системной dead-letter темы.
    pub dead_letter_history: usize,
    /// Ёмкость парковки PtP-сообщений для ещё не подключённых адресатов.
    pub parked_capacity: usize,
    pub event_capacity: usize,
    pub authorizer: Arc<dyn Authorizer>,
    pub persistence: Arc<dyn TopicPersistence>,
    pub query_evaluator: Arc<dyn QueryEvaluator>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            defaults: TopicConfig::default(),
            dead_letter_history: 32,
            parked_capacity: 64,
            event_capacity: 256,
            authorizer: Arc::new(AllowAll),
            persistence: Arc::new(NoPersistence),
            query_evaluator: Arc::new(GlobAttrEvaluator),
        }
    }
}

impl BrokerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            defaults: settings.topic_defaults(),
            dead_letter_history: settings.dead_letter_history,
            parked_capacity: settings.queue_capacity,
            event_capacity: settings.event_capacity,
            ..Self::default()
        }
    }
}

/// Внутреннее состояние брокера.
///
/// Таблица тем — конкурентная map имя -> тема; каждый `TopicHandle` несёт
/// собственный замок, общего замка брокера нет.
pub(crate) struct BrokerCore {
    pub(crate) me: Weak<BrokerCore>,
    pub(crate) topics: DashMap<Arc<str>, Arc<TopicHandle>>,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) sessions: DashMap<SessionId, Arc<dyn DeliveryChannel>>,
    pub(crate) parked: DashMap<SessionId, Vec<DeliveryItem>>,
    pub(crate) defaults: TopicConfig,
    pub(crate) dead_letter_history: usize,
    pub(crate) parked_capacity: usize,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) persistence: Arc<dyn TopicPersistence>,
    pub(crate) query_eval: Arc<dyn QueryEvaluator>,
    pub(crate) events: broadcast::Sender<BrokerEvent>,
    pub(crate) rt: Handle,
}

enum PublishAttempt {
    /// Тема умерла под руками — убрать из таблицы и попробовать заново.
    Stale,
    Done {
        id: EntryId,
        changes: Vec<StateChange>,
        failures: Vec<FanoutFailure>,
    },
}

impl BrokerCore {
    fn authorize(&self, subject: &SessionId, action: Action, topic: &str) -> BrokerResult<()> {
        if self.authorizer.is_authorized(subject, action, topic) {
            return Ok(());
        }
        warn!(subject = %subject, %action, topic, "authorization denied");
        Err(BrokerError::Authorization {
            subject: subject.to_string(),
            action: action.to_string(),
            topic: topic.to_string(),
        })
    }

    fn get_or_create_topic(&self, name: &str) -> (Arc<TopicHandle>, bool) {
        if let Some(existing) = self.topics.get(name) {
            return (existing.clone(), false);
        }
        let interned = intern_topic(name);
        match self.topics.entry(interned.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let th = TopicHandle::new(interned, self.defaults.clone());
                v.insert(th.clone());
                debug!(topic = name, "topic created");
                (th, true)
            }
        }
    }

    /// Пост-обработка переходов: смерть темы убирает её из таблицы и из
    /// персистентного слоя, каждый переход уходит в канал событий.
    pub(crate) fn finalize(&self, th: &Arc<TopicHandle>, changes: Vec<StateChange>) {
        for change in changes {
            if change.to == TopicState::Dead {
                self.topics.remove_if(&th.name, |_, v| Arc::ptr_eq(v, th));
                if let Err(e) = self.persistence.erase(&th.name) {
                    warn!(topic = %th.name, %e, "persistence erase failed");
                }
                info!(topic = %change.topic, "topic dead, resources released");
            }
            let _ = self.events.send(BrokerEvent::TopicState {
                topic: change.topic.clone(),
                from: change.from,
                to: change.to,
            });
        }
    }

    // ---- таймеры -----------------------------------------------------------

    /// Destroy-таймер UNREFERENCED темы. Проигравший гонку с отменой
    /// колбэк обязан уйти no-op — отсюда проверка состояния и поколения.
    pub(crate) fn on_destroy_timer(&self, th: Arc<TopicHandle>, generation: u64) {
        let mut changes = Vec::new();
        {
            let mut topic = th.inner.lock();
            if topic.state != TopicState::Unreferenced
                || topic.destroy_timer.generation() != generation
            {
                return;
            }
            changes.push(topic.transition(TopicState::Dead));
        }
        self.finalize(&th, changes);
    }

    /// Таймер ttl записи: изъять из истории, пометить EXPIRED (или снести
    /// при force-destroy) и переоценить жизненный цикл темы.
    pub(crate) fn on_entry_expiry(&self, th: Arc<TopicHandle>, id: EntryId, generation: u64) {
        let mut changes = Vec::new();
        {
            let mut topic = th.inner.lock();
            let current = topic
                .expiry_timers
                .get(&id)
                .map(|t| t.generation() == generation)
                .unwrap_or(false);
            if !current {
                return;
            }
            topic.expiry_timers.remove(&id);
            if let Some(h) = topic.history.purge(id) {
                topic.release_ref(h, RefOrigin::History);
            }
            if let Some(outcome) = topic.store.expire(id) {
                debug!(topic = %th.name, entry = %id, ?outcome, "entry ttl elapsed");
            }
            if let Some(c) = topic.check_lifecycle(&self.rt, &self.me, &th) {
                changes.push(c);
            }
        }
        self.finalize(&th, changes);
    }

    /// Снятие ссылки очереди доставки (ack или Drop у подписчика).
    pub(crate) fn release_queue_ref(&self, th: &Arc<TopicHandle>, handle: crate::msgstore::EntryHandle) {
        let mut changes = Vec::new();
        {
            let mut topic = th.inner.lock();
            topic.release_ref(handle, RefOrigin::Delivery);
            if let Some(c) = topic.check_lifecycle(&self.rt, &self.me, th) {
                changes.push(c);
            }
        }
        self.finalize(th, changes);
    }

    // ---- публикация --------------------------------------------------------

    pub(crate) fn publish(
        &self,
        publisher: &SessionId,
        name: &str,
        payload: Bytes,
        qos: PublishQos,
    ) -> BrokerResult<PublishAck> {
        if name.is_empty() {
            return Err(BrokerError::Validation("empty topic name".into()));
        }
        if qos.priority > PRIORITY_MAX {
            return Err(BrokerError::Validation(format!(
                "priority {} out of range 0..={PRIORITY_MAX}",
                qos.priority
            )));
        }
        if !qos.from_persistence {
            self.authorize(publisher, Action::Publish, name)?;
        }
        self.publish_unchecked(publisher, name, payload, qos)
    }

    /// Publish-тракт после авторизации; сюда же входят dead letters и
    /// восстановление из персистентного слоя.
    pub(crate) fn publish_unchecked(
        &self,
        publisher: &SessionId,
        name: &str,
        payload: Bytes,
        qos: PublishQos,
    ) -> BrokerResult<PublishAck> {
        if qos.is_ptp() {
            return self.publish_ptp(publisher, name, payload, qos);
        }
        let mut attempts = 0;
        loop {
            let (th, _created) = self.get_or_create_topic(name);
            match self.publish_on_topic(&th, publisher, &payload, &qos)? {
                PublishAttempt::Stale => {
                    self.topics.remove_if(&th.name, |_, v| Arc::ptr_eq(v, &th));
                    attempts += 1;
                    if attempts > 8 {
                        return Err(BrokerError::Internal(format!(
                            "topic '{name}' kept dying during publish"
                        )));
                    }
                }
                PublishAttempt::Done {
                    id,
                    changes,
                    failures,
                } => {
                    self.finalize(&th, changes);
                    self.handle_delivery_failures(failures);
                    self.write_through(name, &payload, &qos);
                    return Ok(PublishAck {
                        id,
                        topic: th.name.clone(),
                        rejected: Vec::new(),
                    });
                }
            }
        }
    }

    /// Алгоритм публикации pub/sub под замком темы.
    ///
    /// Порядок жёсткий: конфигурация -> read-only -> детекция изменения ->
    /// вытеснение истории -> вставка с искусственной ссылкой -> история ->
    /// fan-out -> материализация query-подписок (для свежей темы) ->
    /// снятие искусственной ссылки. Запись не видна ни одной очереди
    /// прежде, чем счётчик учёл эту видимость.
    fn publish_on_topic(
        &self,
        th: &Arc<TopicHandle>,
        publisher: &SessionId,
        payload: &Bytes,
        qos: &PublishQos,
    ) -> BrokerResult<PublishAttempt> {
        let mut topic = th.inner.lock();
        let mut changes = Vec::new();
        match topic.state {
            TopicState::Dead | TopicState::SoftErased => return Ok(PublishAttempt::Stale),
            TopicState::Unconfigured => {
                topic.configure(qos.topic_config.clone(), qos.meta.clone());
                changes.push(topic.transition(TopicState::Alive));
            }
            TopicState::Unreferenced => {
                changes.push(topic.transition(TopicState::Alive));
            }
            TopicState::Alive => {}
        }
        let became_alive = changes
            .iter()
            .any(|c| c.from == TopicState::Unconfigured && c.to == TopicState::Alive);

        if topic.config.read_only && !topic.history.is_empty() {
            return Err(BrokerError::ReadOnly(topic.name.to_string()));
        }

        let changed = topic.detect_change(payload);
        let data = Arc::new(EntryData::new(topic.name.clone(), payload.clone(), qos));
        let id = data.id;
        let handle = topic.store.put(data, qos.force_destroy);
        if let Some(ttl) = qos.ttl {
            if !ttl.is_zero() {
                topic.schedule_expiry(&self.rt, self.me.clone(), th, id, ttl);
            }
        }

        if topic.config.history_max > 0
            && !qos.is_volatile()
            && (changed || qos.force_update || topic.config.record_unchanged)
        {
            if topic.history.is_full() {
                if let Some(oldest) = topic.history.evict_oldest() {
                    topic.release_ref(oldest, RefOrigin::History);
                }
            }
            topic.store.retain(handle, RefOrigin::History);
            topic.history.push(handle);
        }

        let mut failures = Vec::new();
        if changed || qos.force_update {
            failures = topic.fan_out(
                &self.me,
                th,
                self.query_eval.as_ref(),
                publisher,
                handle,
                UpdateKind::Publish,
            );
        } else {
            debug!(topic = %topic.name, "content unchanged, delivery suppressed");
        }

        if became_alive {
            failures.extend(self.materialize_query_matches(&mut topic, th, Some(handle)));
        }

        topic.release_ref(handle, RefOrigin::Delivery);
        if let Some(c) = topic.check_lifecycle(&self.rt, &self.me, th) {
            changes.push(c);
        }
        Ok(PublishAttempt::Done {
            id,
            changes,
            failures,
        })
    }

    /// PtP-публикация: подписчики темы не участвуют, сообщение уходит
    /// напрямую в очереди перечисленных адресатов. Неизвестный адресат без
    /// force_queuing — отказ только по этому адресату.
    fn publish_ptp(
        &self,
        _publisher: &SessionId,
        name: &str,
        payload: Bytes,
        qos: PublishQos,
    ) -> BrokerResult<PublishAck> {
        let mut attempts = 0;
        loop {
            let (th, _created) = self.get_or_create_topic(name);
            let mut changes = Vec::new();
            let mut failures = Vec::new();
            let mut rejected = Vec::new();
            let id;
            {
                let mut topic = th.inner.lock();
                match topic.state {
                    TopicState::Dead | TopicState::SoftErased => {
                        drop(topic);
                        self.topics.remove_if(&th.name, |_, v| Arc::ptr_eq(v, &th));
                        attempts += 1;
                        if attempts > 8 {
                            return Err(BrokerError::Internal(format!(
                                "topic '{name}' kept dying during PtP publish"
                            )));
                        }
                        continue;
                    }
                    TopicState::Unconfigured => {
                        topic.configure(qos.topic_config.clone(), qos.meta.clone());
                        changes.push(topic.transition(TopicState::Alive));
                    }
                    TopicState::Unreferenced => {
                        changes.push(topic.transition(TopicState::Alive));
                    }
                    TopicState::Alive => {}
                }
                let became_alive = changes
                    .iter()
                    .any(|c| c.from == TopicState::Unconfigured && c.to == TopicState::Alive);

                let data = Arc::new(EntryData::new(topic.name.clone(), payload.clone(), &qos));
                id = data.id;
                let handle = topic.store.put(data.clone(), qos.force_destroy);
                if let Some(ttl) = qos.ttl {
                    if !ttl.is_zero() {
                        topic.schedule_expiry(&self.rt, self.me.clone(), &th, id, ttl);
                    }
                }

                for dest in &qos.destinations {
                    let channel = self.sessions.get(&dest.session).map(|c| c.clone());
                    if channel.is_none() && !dest.force_queuing {
                        rejected.push(RejectedDestination {
                            destination: dest.session.clone(),
                            reason: RejectReason::UnknownDestination,
                        });
                        continue;
                    }
                    if !topic.store.retain(handle, RefOrigin::Delivery) {
                        break;
                    }
                    let guard = UpdateGuard::new(Arc::downgrade(&th), self.me.clone(), handle);
                    let update = DeliveryUpdate::new(
                        topic.name.clone(),
                        data.clone(),
                        UpdateKind::PointToPoint,
                        guard,
                    );
                    let item = DeliveryItem::Update(update);
                    match channel {
                        Some(ch) => {
                            if let Err((item, reason)) = ch.enqueue(item) {
                                rejected.push(RejectedDestination {
                                    destination: dest.session.clone(),
                                    reason: reason.clone(),
                                });
                                failures.push(FanoutFailure {
                                    session: dest.session.clone(),
                                    sub_id: None,
                                    item,
                                    reason,
                                });
                            }
                        }
                        None => {
                            // адресат ещё не подключён — паркуем до register_session
                            let mut slot = self.parked.entry(dest.session.clone()).or_default();
                            if slot.len() >= self.parked_capacity {
                                rejected.push(RejectedDestination {
                                    destination: dest.session.clone(),
                                    reason: RejectReason::QueueFull,
                                });
                                failures.push(FanoutFailure {
                                    session: dest.session.clone(),
                                    sub_id: None,
                                    item,
                                    reason: RejectReason::QueueFull,
                                });
                            } else {
                                slot.push(item);
                            }
                        }
                    }
                }

                if became_alive {
                    failures.extend(self.materialize_query_matches(&mut topic, &th, None));
                }

                topic.release_ref(handle, RefOrigin::Delivery);
                if let Some(c) = topic.check_lifecycle(&self.rt, &self.me, &th) {
                    changes.push(c);
                }
            }
            self.finalize(&th, changes);
            self.handle_delivery_failures(failures);
            self.write_through(name, &payload, &qos);
            return Ok(PublishAck {
                id,
                topic: th.name.clone(),
                rejected,
            });
        }
    }

    fn write_through(&self, name: &str, payload: &Bytes, qos: &PublishQos) {
        if !qos.persistent || qos.from_persistence {
            return;
        }
        let record = PersistentEntry {
            topic: name.to_string(),
            payload: payload.clone(),
            meta: qos.meta.clone(),
            attrs: qos.attrs.clone(),
            priority: qos.priority,
            topic_config: qos.topic_config.clone(),
        };
        if let Err(e) = self.persistence.store(&record) {
            warn!(topic = name, %e, "persistence write-through failed");
        }
    }

    // ---- подписки ----------------------------------------------------------

    pub(crate) fn subscribe(
        &self,
        session: &SessionId,
        spec: TargetSpec,
        options: SubscriptionOptions,
    ) -> BrokerResult<SubscriptionId> {
        let label = match &spec {
            TargetSpec::Exact(name) => name.clone(),
            TargetSpec::Query(query) => query.clone(),
        };
        self.authorize(session, Action::Subscribe, &label)?;
        if !self.sessions.contains_key(session) {
            return Err(BrokerError::Validation(format!(
                "session '{session}' has no delivery channel registered"
            )));
        }
        if let Some(existing) = self.registry.find_target(session, &spec.key()) {
            let multiplicity = self.registry.bump_multiplicity(&existing);
            debug!(session = %session, subscription = %existing, ?multiplicity, "duplicate subscribe, multiplicity bumped");
            return Ok(existing);
        }
        match spec {
            TargetSpec::Exact(name) => self.subscribe_exact(session, name, options),
            TargetSpec::Query(query) => self.subscribe_query(session, query, options),
        }
    }

    fn subscribe_exact(
        &self,
        session: &SessionId,
        name: String,
        options: SubscriptionOptions,
    ) -> BrokerResult<SubscriptionId> {
        if name.is_empty() {
            return Err(BrokerError::Validation("empty topic name".into()));
        }
        let channel = self
            .sessions
            .get(session)
            .map(|c| c.clone())
            .ok_or_else(|| {
                BrokerError::Validation(format!("session '{session}' has no delivery channel"))
            })?;
        let mut attempts = 0;
        loop {
            let (th, _created) = self.get_or_create_topic(&name);
            let mut changes = Vec::new();
            let mut rollback: Option<FanoutFailure> = None;
            let sub_id;
            {
                let mut topic = th.inner.lock();
                if matches!(topic.state, TopicState::Dead | TopicState::SoftErased) {
                    drop(topic);
                    self.topics.remove_if(&th.name, |_, v| Arc::ptr_eq(v, &th));
                    attempts += 1;
                    if attempts > 8 {
                        return Err(BrokerError::Internal(format!(
                            "topic '{name}' kept dying during subscribe"
                        )));
                    }
                    continue;
                }
                if topic.state == TopicState::Unreferenced {
                    changes.push(topic.transition(TopicState::Alive));
                }
                let sub =
                    Subscription::new(session.clone(), TargetSpec::exact(&name), options.clone());
                sub_id = sub.id.clone();
                topic.subscribers.insert(
                    sub_id.clone(),
                    AttachedSub {
                        session: session.clone(),
                        channel: channel.clone(),
                        options: options.clone(),
                    },
                );
                self.registry.insert(sub);
                if let Err(failure) = topic.replay_history(
                    &self.me,
                    &th,
                    self.query_eval.as_ref(),
                    &sub_id,
                    None,
                ) {
                    // подписка откатывается целиком, а не остаётся полуживой
                    topic.subscribers.remove(&sub_id);
                    self.registry.remove(&sub_id);
                    if let Some(c) = topic.check_lifecycle(&self.rt, &self.me, &th) {
                        changes.push(c);
                    }
                    rollback = Some(*failure);
                }
            }
            self.finalize(&th, changes);
            if let Some(failure) = rollback {
                let reason = failure.reason.clone();
                self.handle_delivery_failures(vec![failure]);
                return Err(BrokerError::Delivery(reason.to_string()));
            }
            info!(topic = %name, session = %session, subscription = %sub_id, "exact subscription registered");
            return Ok(sub_id);
        }
    }

    fn subscribe_query(
        &self,
        session: &SessionId,
        query: String,
        options: SubscriptionOptions,
    ) -> BrokerResult<SubscriptionId> {
        self.query_eval.validate(&query)?;
        let parent = Subscription::new(session.clone(), TargetSpec::query(&query), options);
        let parent_snapshot = parent.clone();
        let parent_id = parent.id.clone();
        self.registry.insert(parent);
        info!(query = %query, session = %session, subscription = %parent_id, "query subscription registered");

        // однократный проход по уже сконфигурированным темам; дальше query
        // вычисляется один раз на тему — в момент её конфигурации
        let handles: Vec<Arc<TopicHandle>> =
            self.topics.iter().map(|e| e.value().clone()).collect();
        let mut all_failures = Vec::new();
        for th in handles {
            let mut changes = Vec::new();
            {
                let mut topic = th.inner.lock();
                if !matches!(topic.state, TopicState::Alive | TopicState::Unreferenced) {
                    continue;
                }
                if let Some(failure) =
                    self.materialize_parent(&mut topic, &th, &parent_snapshot, None)
                {
                    all_failures.push(failure);
                }
                if !topic.subscribers.is_empty() && topic.state == TopicState::Unreferenced {
                    changes.push(topic.transition(TopicState::Alive));
                }
            }
            self.finalize(&th, changes);
        }
        self.handle_delivery_failures(all_failures);
        Ok(parent_id)
    }

    /// Материализация одной query-подписки на одной теме.
    ///
    /// Неудача начального replay откатывает только этого ребёнка;
    /// родительская query-подписка остаётся.
    fn materialize_parent(
        &self,
        topic: &mut Topic,
        th: &Arc<TopicHandle>,
        parent: &Subscription,
        inflight: Option<crate::msgstore::EntryHandle>,
    ) -> Option<FanoutFailure> {
        let TargetSpec::Query(query) = &parent.target else {
            return None;
        };
        let channel = self.sessions.get(&parent.session).map(|c| c.clone())?;
        match self.query_eval.matches(query, &topic.name, &topic.meta) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(topic = %topic.name, query = %query, %e, "query evaluation failed");
                return None;
            }
        }
        // повторная материализация того же родителя на той же теме не нужна
        let already = topic.subscribers.keys().any(|id| {
            self.registry
                .get(id)
                .map(|s| s.parent.as_ref() == Some(&parent.id))
                .unwrap_or(false)
        });
        if already {
            return None;
        }

        let child = Subscription::materialized(
            parent.session.clone(),
            &topic.name,
            parent.options.clone(),
            parent.id.clone(),
        );
        let child_id = child.id.clone();
        topic.subscribers.insert(
            child_id.clone(),
            AttachedSub {
                session: parent.session.clone(),
                channel,
                options: child.options.clone(),
            },
        );
        self.registry.insert(child);
        self.registry.add_child(&parent.id, &child_id);
        debug!(topic = %topic.name, parent = %parent.id, child = %child_id, "query subscription materialized");

        match topic.replay_history(&self.me, th, self.query_eval.as_ref(), &child_id, inflight) {
            Ok(_) => None,
            Err(failure) => {
                topic.subscribers.remove(&child_id);
                self.registry.remove(&child_id);
                Some(*failure)
            }
        }
    }

    /// Вычисление всех query-подписок против свежесконфигурированной темы.
    fn materialize_query_matches(
        &self,
        topic: &mut Topic,
        th: &Arc<TopicHandle>,
        inflight: Option<crate::msgstore::EntryHandle>,
    ) -> Vec<FanoutFailure> {
        let mut failures = Vec::new();
        for parent in self.registry.query_subs() {
            if let Some(failure) = self.materialize_parent(topic, th, &parent, inflight) {
                failures.push(failure);
            }
        }
        failures
    }

    pub(crate) fn unsubscribe(
        &self,
        session: &SessionId,
        id: &SubscriptionId,
    ) -> BrokerResult<()> {
        let sub = self
            .registry
            .get(id)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(id.to_string()))?;
        if &sub.session != session {
            return Err(BrokerError::Validation(format!(
                "subscription {id} belongs to session '{}'",
                sub.session
            )));
        }
        if sub.parent.is_none() && sub.multiplicity > 1 {
            let multiplicity = self.registry.decrement_multiplicity(id);
            debug!(subscription = %id, ?multiplicity, "unsubscribe decremented multiplicity");
            return Ok(());
        }
        self.remove_subscription(id);
        Ok(())
    }

    pub(crate) fn unsubscribe_target(
        &self,
        session: &SessionId,
        spec: &TargetSpec,
    ) -> BrokerResult<()> {
        let id = self
            .registry
            .find_target(session, &spec.key())
            .ok_or_else(|| BrokerError::SubscriptionNotFound(spec.to_string()))?;
        self.unsubscribe(session, &id)
    }

    /// Полное снятие подписки: каскадом по материализованным детям,
    /// с переоценкой жизненного цикла затронутых тем.
    pub(crate) fn remove_subscription(&self, id: &SubscriptionId) {
        let Some(sub) = self.registry.remove(id) else {
            return;
        };
        for child in &sub.children {
            self.remove_subscription(child);
        }
        if let TargetSpec::Exact(name) = &sub.target {
            if let Some(th) = self.topics.get(name.as_str()).map(|e| e.clone()) {
                let mut changes = Vec::new();
                {
                    let mut topic = th.inner.lock();
                    topic.subscribers.remove(id);
                    if let Some(c) = topic.check_lifecycle(&self.rt, &self.me, &th) {
                        changes.push(c);
                    }
                }
                self.finalize(&th, changes);
            }
        }
        debug!(subscription = %id, "subscription removed");
    }

    // ---- чтение и удаление -------------------------------------------------

    pub(crate) fn get(
        &self,
        requester: &SessionId,
        spec: &TargetSpec,
        qos: &GetQos,
    ) -> BrokerResult<Vec<Arc<EntryData>>> {
        match spec {
            TargetSpec::Exact(name) => {
                self.authorize(requester, Action::Get, name)?;
                let th = self
                    .topics
                    .get(name.as_str())
                    .map(|e| e.clone())
                    .ok_or_else(|| BrokerError::TopicNotFound(name.clone()))?;
                let topic = th.inner.lock();
                if topic.state.is_dead() {
                    return Err(BrokerError::TopicNotFound(name.clone()));
                }
                Ok(read_history(&topic, qos))
            }
            TargetSpec::Query(query) => {
                self.authorize(requester, Action::Get, query)?;
                self.query_eval.validate(query)?;
                let handles: Vec<Arc<TopicHandle>> =
                    self.topics.iter().map(|e| e.value().clone()).collect();
                let mut out = Vec::new();
                for th in handles {
                    let topic = th.inner.lock();
                    if topic.state != TopicState::Alive {
                        continue;
                    }
                    match self.query_eval.matches(query, &topic.name, &topic.meta) {
                        Ok(true) => out.extend(read_history(&topic, qos)),
                        Ok(false) => {}
                        Err(e) => {
                            warn!(topic = %topic.name, query = %query, %e, "query evaluation failed")
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    pub(crate) fn erase(
        &self,
        requester: &SessionId,
        spec: &TargetSpec,
        qos: &EraseQos,
    ) -> BrokerResult<Vec<Arc<str>>> {
        let targets: Vec<Arc<TopicHandle>> = match spec {
            TargetSpec::Exact(name) => {
                self.authorize(requester, Action::Erase, name)?;
                let th = self
                    .topics
                    .get(name.as_str())
                    .map(|e| e.clone())
                    .ok_or_else(|| BrokerError::TopicNotFound(name.clone()))?;
                vec![th]
            }
            TargetSpec::Query(query) => {
                self.authorize(requester, Action::Erase, query)?;
                self.query_eval.validate(query)?;
                let handles: Vec<Arc<TopicHandle>> =
                    self.topics.iter().map(|e| e.value().clone()).collect();
                handles
                    .into_iter()
                    .filter(|th| {
                        let topic = th.inner.lock();
                        topic.state == TopicState::Alive
                            && matches!(
                                self.query_eval.matches(query, &topic.name, &topic.meta),
                                Ok(true)
                            )
                    })
                    .collect()
            }
        };
        let mut affected = Vec::new();
        for th in targets {
            if self.erase_topic(&th, qos.force_destroy) {
                affected.push(th.name.clone());
            }
        }
        Ok(affected)
    }

    /// Erase одной темы: уведомить подписчиков, отцепить их, очистить
    /// историю; при force или осушённом хранилище — сразу DEAD, иначе
    /// SOFT_ERASED до дренажа ссылок очередей.
    fn erase_topic(&self, th: &Arc<TopicHandle>, force: bool) -> bool {
        // тему сразу отцепляем от таблицы: новые операции создадут свежую
        self.topics.remove_if(&th.name, |_, v| Arc::ptr_eq(v, th));
        let mut changes = Vec::new();
        let sub_ids: Vec<SubscriptionId>;
        let soft;
        {
            let mut topic = th.inner.lock();
            if topic.state.is_dead() {
                return false;
            }
            topic.notify_erased();
            sub_ids = topic.subscribers.keys().cloned().collect();
            topic.subscribers.clear();
            for h in topic.history.drain_all() {
                topic.release_ref(h, RefOrigin::History);
            }
            soft = !force && !topic.store.is_empty();
            if soft {
                changes.push(topic.transition(TopicState::SoftErased));
            } else {
                changes.push(topic.transition(TopicState::Dead));
            }
        }
        for id in sub_ids {
            self.registry.remove(&id);
        }
        self.finalize(th, changes);
        if soft {
            if let Err(e) = self.persistence.erase(&th.name) {
                warn!(topic = %th.name, %e, "persistence erase failed");
            }
        }
        true
    }

    // ---- сеансы ------------------------------------------------------------

    pub(crate) fn register_session(&self, session: SessionId, channel: Arc<dyn DeliveryChannel>) {
        self.sessions.insert(session.clone(), channel.clone());
        info!(session = %session, "session registered");
        if let Some((_, items)) = self.parked.remove(&session) {
            let mut failures = Vec::new();
            for item in items {
                if let Err((item, reason)) = channel.enqueue(item) {
                    failures.push(FanoutFailure {
                        session: session.clone(),
                        sub_id: None,
                        item,
                        reason,
                    });
                }
            }
            self.handle_delivery_failures(failures);
        }
    }

    /// Транспорт сообщил о смерти сеанса: канал закрывается, его остатки и
    /// припаркованные сообщения уходят в dead letters, подписки снимаются.
    pub(crate) fn terminate_session(&self, session: &SessionId, reason: &str) {
        let mut doomed: Vec<DeliveryItem> = Vec::new();
        if let Some((_, channel)) = self.sessions.remove(session) {
            doomed.extend(channel.terminate());
        }
        if let Some((_, parked)) = self.parked.remove(session) {
            doomed.extend(parked);
        }
        for item in doomed {
            self.dead_letter(item, session, reason);
        }
        for sub_id in self.registry.session_subs(session) {
            self.remove_subscription(&sub_id);
        }
        let _ = self.events.send(BrokerEvent::SessionTerminated {
            session: session.clone(),
        });
        info!(session = %session, reason, "session terminated");
    }

    // ---- восстановление ----------------------------------------------------

    pub(crate) fn recover(&self) -> BrokerResult<usize> {
        let oids = self.persistence.fetch_all_oids()?;
        let mut recovered = 0;
        for oid in oids {
            let Some(record) = self.persistence.fetch(&oid)? else {
                continue;
            };
            let qos = PublishQos {
                priority: record.priority,
                persistent: true,
                from_persistence: true,
                topic_config: record.topic_config.clone(),
                meta: record.meta.clone(),
                attrs: record.attrs.clone(),
                ..PublishQos::default()
            };
            self.publish_unchecked(system_session(), &record.topic, record.payload.clone(), qos)?;
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "recovered persistent topics");
        }
        Ok(recovered)
    }
}

fn read_history(topic: &Topic, qos: &GetQos) -> Vec<Arc<EntryData>> {
    let mut handles = topic.history.newest_n(qos.depth);
    if !qos.newest_first {
        handles.reverse();
    }
    handles
        .into_iter()
        .filter(|h| topic.store.state_of(h.id) == Some(EntryState::Alive))
        .filter_map(|h| topic.store.get(h.id))
        .collect()
}

/// Фасад брокера.
///
/// Все операции синхронны и захватывают только замок затронутой темы;
/// таймеры (destroy-delay, ttl) исполняются на tokio-runtime, захваченном
/// при создании.
pub struct Broker {
    core: Arc<BrokerCore>,
}

impl Broker {
    /// Собирает брокера. Вызывать внутри tokio-runtime: его Handle
    /// забирается для таймеров.
    pub fn new(options: BrokerOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(8));
        let core = Arc::new_cyclic(|me| BrokerCore {
            me: me.clone(),
            topics: DashMap::new(),
            registry: SubscriptionRegistry::new(),
            sessions: DashMap::new(),
            parked: DashMap::new(),
            defaults: options.defaults,
            dead_letter_history: options.dead_letter_history,
            parked_capacity: options.parked_capacity,
            authorizer: options.authorizer,
            persistence: options.persistence,
            query_eval: options.query_evaluator,
            events,
            rt: Handle::current(),
        });
        Self { core }
    }

    /// Регистрирует канал доставки сеанса; припаркованные PtP-сообщения
    /// доезжают сразу.
    pub fn register_session(&self, session: SessionId, channel: Arc<dyn DeliveryChannel>) {
        self.core.register_session(session, channel);
    }

    /// Уведомление транспорта об обрыве сеанса.
    pub fn session_terminated(&self, session: &SessionId) {
        self.core.terminate_session(session, "session disconnected");
    }

    pub fn subscribe(
        &self,
        session: &SessionId,
        spec: TargetSpec,
        options: SubscriptionOptions,
    ) -> BrokerResult<SubscriptionId> {
        self.core.subscribe(session, spec, options)
    }

    pub fn unsubscribe(&self, session: &SessionId, id: &SubscriptionId) -> BrokerResult<()> {
        self.core.unsubscribe(session, id)
    }

    /// Отписка по цели (а не по id) — удобно для транспортов без
    /// состояния.
    pub fn unsubscribe_target(&self, session: &SessionId, spec: &TargetSpec) -> BrokerResult<()> {
        self.core.unsubscribe_target(session, spec)
    }

    pub fn publish(
        &self,
        publisher: &SessionId,
        topic: &str,
        payload: Bytes,
        qos: PublishQos,
    ) -> BrokerResult<PublishAck> {
        self.core.publish(publisher, topic, payload, qos)
    }

    /// Синхронное чтение текущего содержимого без регистрации подписки.
    pub fn get(
        &self,
        requester: &SessionId,
        spec: &TargetSpec,
        qos: &GetQos,
    ) -> BrokerResult<Vec<Arc<EntryData>>> {
        self.core.get(requester, spec, qos)
    }

    pub fn erase(
        &self,
        requester: &SessionId,
        spec: &TargetSpec,
        qos: &EraseQos,
    ) -> BrokerResult<Vec<Arc<str>>> {
        self.core.erase(requester, spec, qos)
    }

    /// Воспроизводит сохранённые темы через обычный publish-тракт.
    pub fn recover(&self) -> BrokerResult<usize> {
        self.core.recover()
    }

    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.core.events.subscribe()
    }

    pub fn dump(&self) -> crate::broker::BrokerDump {
        self.core.dump()
    }

    /// Текущее состояние темы; None — темы нет (или уже DEAD).
    pub fn topic_state(&self, name: &str) -> Option<TopicState> {
        self.core.topics.get(name).map(|th| th.inner.lock().state())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::dispatch::loopback;

    fn register(broker: &Broker, name: &str, capacity: usize) -> (SessionId, crate::dispatch::LoopbackReceiver) {
        let session = SessionId::new(name);
        let (channel, rx) = loopback(capacity);
        broker.register_session(session.clone(), channel);
        (session, rx)
    }

    async fn recv_update(rx: &crate::dispatch::LoopbackReceiver) -> DeliveryUpdate {
        let item = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match item {
            DeliveryItem::Update(update) => update,
            other => panic!("expected update, got {other:?}"),
        }
    }

    /// Тест проверяет круговой маршрут: publish, затем get возвращает
    /// байт-в-байт тот же payload.
    #[tokio::test]
    async fn test_publish_get_roundtrip() {
        let broker = Broker::new(BrokerOptions::default());
        let (alice, _rx) = register(&broker, "alice", 8);

        broker
            .publish(&alice, "X", Bytes::from_static(b"payload-42"), PublishQos::default())
            .unwrap();

        let got = broker
            .get(&alice, &TargetSpec::exact("X"), &GetQos::default())
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, Bytes::from_static(b"payload-42"));
    }

    /// Тест проверяет, что get по несуществующей теме — NotFound,
    /// а по существующей без данных — пустой список.
    #[tokio::test]
    async fn test_get_not_found_vs_empty() {
        let broker = Broker::new(BrokerOptions::default());
        let (alice, _rx) = register(&broker, "alice", 8);

        assert!(matches!(
            broker.get(&alice, &TargetSpec::exact("nope"), &GetQos::default()),
            Err(BrokerError::TopicNotFound(_))
        ));

        // подписка создаёт тему в UNCONFIGURED: данных нет, но тема есть
        broker
            .subscribe(&alice, TargetSpec::exact("pre"), SubscriptionOptions::default())
            .unwrap();
        assert_eq!(broker.topic_state("pre"), Some(TopicState::Unconfigured));
        let got = broker
            .get(&alice, &TargetSpec::exact("pre"), &GetQos::default())
            .unwrap();
        assert!(got.is_empty());
    }

    /// Тест проверяет доставку публикации существующему подписчику.
    #[tokio::test]
    async fn test_subscribe_then_publish_delivers_once() {
        let broker = Broker::new(BrokerOptions::default());
        let (alice, rx) = register(&broker, "alice", 8);

        broker
            .subscribe(&alice, TargetSpec::exact("A"), SubscriptionOptions::default())
            .unwrap();
        broker
            .publish(&alice, "A", Bytes::from_static(b"hello"), PublishQos::default())
            .unwrap();

        let update = recv_update(&rx).await;
        assert_eq!(update.entry.payload, Bytes::from_static(b"hello"));
        assert_eq!(update.kind, UpdateKind::Publish);
        update.ack();
        assert!(rx.is_empty());
    }

    /// Тест проверяет multiplicity: повторная подписка возвращает тот же id,
    /// а реальное снятие происходит на втором unsubscribe.
    #[tokio::test]
    async fn test_duplicate_subscribe_multiplicity() {
        let broker = Broker::new(BrokerOptions::default());
        let (alice, rx) = register(&broker, "alice", 8);

        let id1 = broker
            .subscribe(&alice, TargetSpec::exact("A"), SubscriptionOptions::default())
            .unwrap();
        let id2 = broker
            .subscribe(&alice, TargetSpec::exact("A"), SubscriptionOptions::default())
            .unwrap();
        assert_eq!(id1, id2);

        broker.unsubscribe(&alice, &id1).unwrap();
        // подписка всё ещё действует
        broker
            .publish(&alice, "A", Bytes::from_static(b"still"), PublishQos::default())
            .unwrap();
        let update = recv_update(&rx).await;
        assert_eq!(update.entry.payload, Bytes::from_static(b"still"));
        drop(update);

        broker.unsubscribe(&alice, &id1).unwrap();
        assert!(matches!(
            broker.unsubscribe(&alice, &id1),
            Err(BrokerError::SubscriptionNotFound(_))
        ));
    }

    /// Тест проверяет, что read-only тема отклоняет вторую публикацию.
    #[tokio::test]
    async fn test_read_only_topic() {
        let broker = Broker::new(BrokerOptions::default());
        let (alice, _rx) = register(&broker, "alice", 8);

        let qos = PublishQos {
            topic_config: Some(TopicConfig {
                read_only: true,
                ..TopicConfig::default()
            }),
            ..PublishQos::default()
        };
        broker
            .publish(&alice, "frozen", Bytes::from_static(b"v1"), qos)
            .unwrap();
        assert!(matches!(
            broker.publish(&alice, "frozen", Bytes::from_static(b"v2"), PublishQos::default()),
            Err(BrokerError::ReadOnly(_))
        ));
    }

    /// Тест проверяет erase: подписчик получает прощальное уведомление,
    /// тема исчезает, get отвечает NotFound.
    #[tokio::test]
    async fn test_erase_notifies_and_removes() {
        let broker = Broker::new(BrokerOptions::default());
        let (alice, rx) = register(&broker, "alice", 8);

        broker
            .subscribe(&alice, TargetSpec::exact("E"), SubscriptionOptions::default())
            .unwrap();
        broker
            .publish(&alice, "E", Bytes::from_static(b"x"), PublishQos::default())
            .unwrap();
        recv_update(&rx).await.ack();

        let affected = broker
            .erase(&alice, &TargetSpec::exact("E"), &EraseQos::default())
            .unwrap();
        assert_eq!(affected.len(), 1);
        assert_eq!(&*affected[0], "E");

        let farewell = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert!(matches!(farewell, DeliveryItem::TopicErased { .. }));

        assert_eq!(broker.topic_state("E"), None);
        assert!(matches!(
            broker.get(&alice, &TargetSpec::exact("E"), &GetQos::default()),
            Err(BrokerError::TopicNotFound(_))
        ));
    }

    /// Тест проверяет отказ авторизации без изменения состояния.
    #[tokio::test]
    async fn test_authorization_denied() {
        struct DenyPublish;
        impl Authorizer for DenyPublish {
            fn is_authorized(&self, _s: &SessionId, action: Action, _t: &str) -> bool {
                action != Action::Publish
            }
        }
        let broker = Broker::new(BrokerOptions {
            authorizer: Arc::new(DenyPublish),
            ..BrokerOptions::default()
        });
        let (alice, _rx) = register(&broker, "alice", 8);

        assert!(matches!(
            broker.publish(&alice, "A", Bytes::from_static(b"x"), PublishQos::default()),
            Err(BrokerError::Authorization { .. })
        ));
        assert_eq!(broker.topic_state("A"), None);
    }
}

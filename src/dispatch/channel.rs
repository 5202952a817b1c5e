use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    broker::BrokerCore,
    error::RejectReason,
    msgstore::{EntryData, EntryHandle},
    subscription::SubscriptionId,
    topic::TopicHandle,
};

/// Идентификатор сеанса подписчика/издателя.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Какой тракт породил доставку.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Обычная публикация.
    Publish,
    /// Начальный replay истории при подписке.
    InitialHistory,
    /// Адресная PtP-доставка.
    PointToPoint,
}

/// Элемент очереди доставки.
#[derive(Debug)]
pub enum DeliveryItem {
    Update(DeliveryUpdate),
    /// Прощальное уведомление: тема удалена.
    TopicErased { topic: Arc<str> },
}

impl DeliveryItem {
    pub fn topic(&self) -> &Arc<str> {
        match self {
            DeliveryItem::Update(u) => &u.topic,
            DeliveryItem::TopicErased { topic } => topic,
        }
    }
}

/// Одно доставляемое сообщение.
///
/// Держит ссылку очереди на запись через guard: ссылка снимается при
/// `ack()` либо автоматически при Drop.
#[derive(Debug)]
pub struct DeliveryUpdate {
    pub topic: Arc<str>,
    pub entry: Arc<EntryData>,
    pub kind: UpdateKind,
    guard: UpdateGuard,
}

impl DeliveryUpdate {
    pub(crate) fn new(
        topic: Arc<str>,
        entry: Arc<EntryData>,
        kind: UpdateKind,
        guard: UpdateGuard,
    ) -> Self {
        Self {
            topic,
            entry,
            kind,
            guard,
        }
    }

    /// Подтверждает обработку и освобождает ссылку очереди.
    pub fn ack(self) {
        drop(self);
    }
}

/// Guard ссылки очереди доставки на запись.
///
/// Инвариант: guard нельзя дропать, удерживая замок темы-владельца —
/// освобождение само берёт этот замок.
pub(crate) struct UpdateGuard {
    topic: Weak<TopicHandle>,
    core: Weak<BrokerCore>,
    handle: EntryHandle,
    released: bool,
}

impl UpdateGuard {
    pub(crate) fn new(
        topic: Weak<TopicHandle>,
        core: Weak<BrokerCore>,
        handle: EntryHandle,
    ) -> Self {
        Self {
            topic,
            core,
            handle,
            released: false,
        }
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let (Some(core), Some(topic)) = (self.core.upgrade(), self.topic.upgrade()) {
            core.release_queue_ref(&topic, self.handle);
        }
    }
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}

impl fmt::Debug for UpdateGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateGuard")
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish()
    }
}

/// Неудачная постановка в очередь: элемент возвращается брокеру для
/// dead-letter обработки.
#[derive(Debug)]
pub(crate) struct FanoutFailure {
    pub session: SessionId,
    pub sub_id: Option<SubscriptionId>,
    pub item: DeliveryItem,
    pub reason: RejectReason,
}

/// Контракт транспорта на стороне подписчика.
///
/// Реализация не должна синхронно вызывать брокера из `enqueue` —
/// постановка происходит под замком темы.
pub trait DeliveryChannel: Send + Sync {
    /// Ставит элемент в очередь; при отказе возвращает элемент обратно
    /// вместе с причиной.
    fn enqueue(&self, item: DeliveryItem) -> Result<(), (DeliveryItem, RejectReason)>;

    /// Закрывает канал и возвращает недоставленные элементы.
    fn terminate(&self) -> Vec<DeliveryItem>;

    fn is_open(&self) -> bool;
}

struct LoopbackState {
    items: VecDeque<DeliveryItem>,
    closed: bool,
}

struct LoopbackShared {
    state: Mutex<LoopbackState>,
    notify: Notify,
}

/// Внутрипроцессный канал доставки с ограниченной очередью.
///
/// Переполнение — это отказ (`QueueFull`), а не тихий дроп: вызывающий
/// обязан отработать его через dead-letter тракт.
pub struct LoopbackChannel {
    shared: Arc<LoopbackShared>,
    capacity: usize,
}

/// Потребительская сторона `LoopbackChannel`.
pub struct LoopbackReceiver {
    shared: Arc<LoopbackShared>,
}

/// Создаёт пару (канал, приёмник) с заданной ёмкостью очереди.
pub fn loopback(capacity: usize) -> (Arc<LoopbackChannel>, LoopbackReceiver) {
    let shared = Arc::new(LoopbackShared {
        state: Mutex::new(LoopbackState {
            items: VecDeque::new(),
            closed: false,
        }),
        notify: Notify::new(),
    });
    (
        Arc::new(LoopbackChannel {
            shared: shared.clone(),
            capacity,
        }),
        LoopbackReceiver { shared },
    )
}

impl DeliveryChannel for LoopbackChannel {
    fn enqueue(&self, item: DeliveryItem) -> Result<(), (DeliveryItem, RejectReason)> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err((item, RejectReason::Closed));
            }
            if state.items.len() >= self.capacity {
                return Err((item, RejectReason::QueueFull));
            }
            state.items.push_back(item);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    fn terminate(&self) -> Vec<DeliveryItem> {
        let drained = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.shared.notify.notify_waiters();
        drained
    }

    fn is_open(&self) -> bool {
        !self.shared.state.lock().closed
    }
}

impl LoopbackReceiver {
    /// Ожидает следующий элемент; None — канал закрыт и пуст.
    pub async fn recv(&self) -> Option<DeliveryItem> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Забирает элемент без ожидания.
    pub fn try_recv(&self) -> Option<DeliveryItem> {
        self.shared.state.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

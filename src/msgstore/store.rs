use std::{collections::HashMap, sync::Arc};

use tracing::error;

use super::{EntryData, EntryId, EntryState};

/// Откуда пришло изменение счётчика ссылок.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOrigin {
    /// Ссылка из очереди истории темы.
    History,
    /// Ссылка из очереди доставки (или искусственная начальная ссылка).
    Delivery,
}

/// Лёгкий handle на запись: id + поколение слота.
///
/// Handle с устаревшим поколением безопасно игнорируется — это защита от
/// повторного освобождения после force-destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    pub id: EntryId,
    pub(crate) generation: u32,
}

/// Результат освобождения ссылки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    /// true, если эта операция уничтожила запись.
    pub destroyed: bool,
}

/// Результат срабатывания таймера ttl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    /// Запись помечена EXPIRED и будет уничтожена, когда ссылки иссякнут.
    Expired,
    /// force-destroy: запись снесена немедленно.
    Destroyed,
}

#[derive(Debug)]
struct Slot {
    data: Arc<EntryData>,
    state: EntryState,
    total_refs: i64,
    history_refs: i64,
    generation: u32,
    size: usize,
    force_destroy: bool,
}

/// Владеющий контейнер записей одной темы.
///
/// Единственная точка мутации счётчиков — `retain`/`release`. Уничтожение
/// при достижении нуля происходит синхронно внутри `release`, поэтому окно
/// "запись видна, но счётчик её не учитывает" отсутствует. Учёт занятых
/// байт ведётся инкрементально, O(1) на запись.
#[derive(Debug, Default)]
pub struct MessageStore {
    slots: HashMap<EntryId, Slot>,
    bytes_used: usize,
    next_generation: u32,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Вставляет запись с искусственной начальной ссылкой (total_refs == 1).
    ///
    /// Начальная ссылка удерживает запись, пока заполняются очереди
    /// доставки; снимается вызовом `release` с `RefOrigin::Delivery`.
    pub fn put(&mut self, data: Arc<EntryData>, force_destroy: bool) -> EntryHandle {
        let size = data.estimate_size();
        let id = data.id;
        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;
        self.bytes_used += size;
        self.slots.insert(
            id,
            Slot {
                data,
                state: EntryState::Alive,
                total_refs: 1,
                history_refs: 0,
                generation,
                size,
                force_destroy,
            },
        );
        EntryHandle { id, generation }
    }

    pub fn get(&self, id: EntryId) -> Option<Arc<EntryData>> {
        self.slots.get(&id).map(|s| s.data.clone())
    }

    pub fn state_of(&self, id: EntryId) -> Option<EntryState> {
        self.slots.get(&id).map(|s| s.state)
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Счётчики (total, history) — для инвариант-проверок в тестах и дампе.
    pub fn ref_counts(&self, id: EntryId) -> Option<(i64, i64)> {
        self.slots.get(&id).map(|s| (s.total_refs, s.history_refs))
    }

    /// Захватывает ссылку. false — handle устарел или запись уничтожена.
    pub fn retain(&mut self, handle: EntryHandle, origin: RefOrigin) -> bool {
        match self.slots.get_mut(&handle.id) {
            Some(slot)
                if slot.generation == handle.generation
                    && slot.state != EntryState::Destroyed =>
            {
                slot.total_refs += 1;
                if origin == RefOrigin::History {
                    slot.history_refs += 1;
                }
                if slot.history_refs > slot.total_refs {
                    error!(
                        id = %handle.id,
                        total = slot.total_refs,
                        history = slot.history_refs,
                        "history reference count exceeds total, clamping"
                    );
                    slot.history_refs = slot.total_refs;
                }
                true
            }
            _ => false,
        }
    }

    /// Освобождает ссылку; при достижении нуля синхронно уничтожает запись.
    ///
    /// Отрицательный счётчик — нарушение инварианта: логируется и запись
    /// принудительно уничтожается (ближайшее безопасное состояние).
    pub fn release(&mut self, handle: EntryHandle, origin: RefOrigin) -> Released {
        let destroy = match self.slots.get_mut(&handle.id) {
            Some(slot) if slot.generation == handle.generation => {
                slot.total_refs -= 1;
                if origin == RefOrigin::History {
                    slot.history_refs -= 1;
                }
                if slot.total_refs < 0 || slot.history_refs < 0 {
                    error!(
                        id = %handle.id,
                        total = slot.total_refs,
                        history = slot.history_refs,
                        "reference count went negative, forcing destroy"
                    );
                    slot.total_refs = 0;
                }
                slot.total_refs <= 0
            }
            _ => false,
        };
        if destroy {
            self.remove(handle.id);
        }
        Released { destroyed: destroy }
    }

    /// Срабатывание таймера ttl.
    ///
    /// Без force-destroy запись лишь помечается EXPIRED: очереди доставки,
    /// уже держащие ссылку, дочитают её и освободят обычным путём.
    pub fn expire(&mut self, id: EntryId) -> Option<ExpireOutcome> {
        let force = self.slots.get(&id)?.force_destroy;
        if force {
            self.remove(id);
            Some(ExpireOutcome::Destroyed)
        } else {
            let slot = self.slots.get_mut(&id)?;
            slot.state = EntryState::Expired;
            Some(ExpireOutcome::Expired)
        }
    }

    /// Текущий handle записи, если она ещё в хранилище.
    pub fn handle_of(&self, id: EntryId) -> Option<EntryHandle> {
        self.slots.get(&id).map(|s| EntryHandle {
            id,
            generation: s.generation,
        })
    }

    /// Полная очистка (teardown темы). Возвращает число снесённых записей.
    pub fn clear(&mut self) -> usize {
        let n = self.slots.len();
        self.slots.clear();
        self.bytes_used = 0;
        n
    }

    fn remove(&mut self, id: EntryId) {
        if let Some(slot) = self.slots.remove(&id) {
            self.bytes_used = self.bytes_used.saturating_sub(slot.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::msgstore::PublishQos;

    fn put_entry(store: &mut MessageStore, payload: &'static [u8]) -> EntryHandle {
        let data = Arc::new(EntryData::new(
            Arc::from("kin"),
            Bytes::from_static(payload),
            &PublishQos::default(),
        ));
        store.put(data, false)
    }

    /// Тест проверяет, что запись уничтожается ровно при обнулении счётчика.
    #[test]
    fn test_release_destroys_exactly_at_zero() {
        let mut store = MessageStore::new();
        let h = put_entry(&mut store, b"data");

        assert!(store.retain(h, RefOrigin::Delivery));
        assert_eq!(store.ref_counts(h.id), Some((2, 0)));

        // искусственная начальная ссылка
        assert!(!store.release(h, RefOrigin::Delivery).destroyed);
        // последняя ссылка очереди
        assert!(store.release(h, RefOrigin::Delivery).destroyed);
        assert!(!store.contains(h.id));
        assert_eq!(store.bytes_used(), 0);
    }

    /// Тест проверяет, что устаревший handle — безопасный no-op.
    #[test]
    fn test_stale_handle_noop() {
        let mut store = MessageStore::new();
        let h = put_entry(&mut store, b"data");
        assert!(store.release(h, RefOrigin::Delivery).destroyed);

        // запись снесена: повторные операции ничего не делают
        assert!(!store.retain(h, RefOrigin::Delivery));
        assert!(!store.release(h, RefOrigin::Delivery).destroyed);
    }

    /// Тест проверяет учёт history-ссылок отдельно от общего счётчика.
    #[test]
    fn test_history_refs_subset_of_total() {
        let mut store = MessageStore::new();
        let h = put_entry(&mut store, b"data");

        assert!(store.retain(h, RefOrigin::History));
        let (total, history) = store.ref_counts(h.id).unwrap();
        assert_eq!((total, history), (2, 1));
        assert!(history <= total);

        assert!(!store.release(h, RefOrigin::History).destroyed);
        assert_eq!(store.ref_counts(h.id), Some((1, 0)));
    }

    /// Тест проверяет инкрементальный учёт занятых байт.
    #[test]
    fn test_bytes_accounting() {
        let mut store = MessageStore::new();
        let h1 = put_entry(&mut store, b"aaaa");
        let used_one = store.bytes_used();
        assert!(used_one > 0);

        let h2 = put_entry(&mut store, b"bbbb");
        assert!(store.bytes_used() > used_one);

        store.release(h1, RefOrigin::Delivery);
        assert_eq!(store.bytes_used(), used_one);
        store.release(h2, RefOrigin::Delivery);
        assert_eq!(store.bytes_used(), 0);
    }

    /// Тест проверяет, что expire без force-destroy оставляет запись,
    /// а с force-destroy сносит немедленно.
    #[test]
    fn test_expire_modes() {
        let mut store = MessageStore::new();
        let soft = put_entry(&mut store, b"soft");
        assert_eq!(store.expire(soft.id), Some(ExpireOutcome::Expired));
        assert_eq!(store.state_of(soft.id), Some(EntryState::Expired));
        // запись умирает, когда иссякают ссылки
        assert!(store.release(soft, RefOrigin::Delivery).destroyed);

        let data = Arc::new(EntryData::new(
            Arc::from("kin"),
            Bytes::from_static(b"hard"),
            &PublishQos::default(),
        ));
        let hard = store.put(data, true);
        assert_eq!(store.expire(hard.id), Some(ExpireOutcome::Destroyed));
        assert!(!store.contains(hard.id));
        // ссылка, пережившая force-destroy, освобождается вхолостую
        assert!(!store.release(hard, RefOrigin::Delivery).destroyed);
    }

    /// Тест проверяет, что clear сбрасывает и записи, и учёт байт.
    #[test]
    fn test_clear() {
        let mut store = MessageStore::new();
        put_entry(&mut store, b"a");
        put_entry(&mut store, b"b");
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert_eq!(store.bytes_used(), 0);
    }
}

use std::collections::VecDeque;

use super::{EntryHandle, EntryId};

/// Ограниченная FIFO-история ссылок на записи темы.
///
/// Хранит только handle'ы — счётчиками ссылок управляет владелец
/// (`Topic`), который обязан сделать `retain` перед `push` и `release`
/// после каждого вытесненного или изъятого handle.
#[derive(Debug, Default)]
pub struct HistoryQueue {
    entries: VecDeque<EntryHandle>,
    max_len: usize,
}

impl HistoryQueue {
    /// `max_len == 0` — история отключена.
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_len.min(64)),
            max_len,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.max_len > 0 && self.entries.len() >= self.max_len
    }

    /// Вытесняет самый старый handle; вызывается перед `push` при заполнении.
    pub fn evict_oldest(&mut self) -> Option<EntryHandle> {
        self.entries.pop_front()
    }

    pub fn push(&mut self, handle: EntryHandle) {
        debug_assert!(!self.is_full(), "push в заполненную историю");
        self.entries.push_back(handle);
    }

    /// Изымает запись по id (например, при истечении ttl).
    pub fn purge(&mut self, id: EntryId) -> Option<EntryHandle> {
        let pos = self.entries.iter().position(|h| h.id == id)?;
        self.entries.remove(pos)
    }

    /// Самая свежая запись.
    pub fn newest(&self) -> Option<EntryHandle> {
        self.entries.back().copied()
    }

    /// До `n` самых свежих записей, от новых к старым.
    pub fn newest_n(&self, n: usize) -> Vec<EntryHandle> {
        self.entries.iter().rev().take(n).copied().collect()
    }

    /// Полная очистка (erase/teardown): все handle'ы возвращаются владельцу
    /// для освобождения ссылок.
    pub fn drain_all(&mut self) -> Vec<EntryHandle> {
        self.entries.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryHandle> {
        self.entries.iter()
    }
}

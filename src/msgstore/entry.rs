use std::{collections::BTreeMap, fmt, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{qos::PublishQos, timestamp, EntryId};

/// Состояние записи в хранилище.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Alive,
    Expired,
    Destroyed,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryState::Alive => "ALIVE",
            EntryState::Expired => "EXPIRED",
            EntryState::Destroyed => "DESTROYED",
        };
        f.write_str(s)
    }
}

/// Неизменяемое содержимое одного опубликованного сообщения.
///
/// Байты payload никогда не мутируются на месте: новое значение темы —
/// это всегда новая запись. Очереди доставки и история делят одну и ту же
/// `Arc<EntryData>`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryData {
    pub id: EntryId,
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub priority: u8,
    pub persistent: bool,
    pub attrs: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl EntryData {
    pub(crate) fn new(topic: Arc<str>, payload: Bytes, qos: &PublishQos) -> Self {
        Self {
            id: timestamp::next_entry_id(),
            topic,
            payload,
            content_type: qos.meta.content_type.clone(),
            priority: qos.priority,
            persistent: qos.persistent,
            attrs: qos.attrs.clone(),
            received_at: Utc::now(),
        }
    }

    /// Оценка размера записи в байтах.
    ///
    /// Считается один раз при вставке в хранилище; дальше учёт размера
    /// ведётся только сложением/вычитанием готовых значений.
    pub fn estimate_size(&self) -> usize {
        const FIXED_OVERHEAD: usize = 96;
        let attrs: usize = self
            .attrs
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        FIXED_OVERHEAD
            + self.payload.len()
            + self.topic.len()
            + self.content_type.as_deref().map(str::len).unwrap_or(0)
            + attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: &'static [u8]) -> EntryData {
        EntryData::new(
            Arc::from("kin"),
            Bytes::from_static(payload),
            &PublishQos::default(),
        )
    }

    /// Тест проверяет, что запись наследует поля QoS.
    #[test]
    fn test_entry_from_qos() {
        let mut qos = PublishQos::default();
        qos.priority = 7;
        qos.attrs.insert("origin".into(), "unit".into());
        let entry = EntryData::new(Arc::from("news"), Bytes::from_static(b"x"), &qos);

        assert_eq!(&*entry.topic, "news");
        assert_eq!(entry.priority, 7);
        assert_eq!(entry.attrs.get("origin").unwrap(), "unit");
        assert!(!entry.persistent);
    }

    /// Тест проверяет, что размер растёт вместе с payload и атрибутами.
    #[test]
    fn test_size_estimate_monotonic() {
        let small = sample(b"a").estimate_size();
        let big = sample(b"aaaaaaaaaaaaaaaa").estimate_size();
        assert!(big > small);

        let mut qos = PublishQos::default();
        qos.attrs.insert("key".into(), "value".into());
        let with_attrs =
            EntryData::new(Arc::from("kin"), Bytes::from_static(b"a"), &qos).estimate_size();
        assert!(with_attrs > small);
    }

    /// Тест проверяет уникальность id у последовательных записей.
    #[test]
    fn test_entry_ids_unique() {
        let a = sample(b"1");
        let b = sample(b"2");
        assert!(b.id > a.id);
    }
}

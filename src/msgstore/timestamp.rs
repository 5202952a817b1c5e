use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Уникальный идентификатор записи: наносекундная метка приёма.
///
/// Метки строго возрастают в пределах процесса, поэтому id одновременно
/// служит ключом сортировки "старее/новее". Повторное использование id
/// невозможно.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    /// Наносекунды с эпохи Unix.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Последняя выданная метка.
static LAST_NANOS: AtomicU64 = AtomicU64::new(0);

/// Выдаёт следующую уникальную монотонную метку.
///
/// Если системные часы не продвинулись (или пошли назад), берётся
/// `последняя + 1` — уникальность важнее привязки к стенным часам.
pub(crate) fn next_entry_id() -> EntryId {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut last = LAST_NANOS.load(Ordering::Relaxed);
    loop {
        let candidate = if now > last { now } else { last + 1 };
        match LAST_NANOS.compare_exchange_weak(
            last,
            candidate,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return EntryId(candidate),
            Err(observed) => last = observed,
        }
    }
}

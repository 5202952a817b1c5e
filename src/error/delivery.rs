use thiserror::Error;

use crate::dispatch::SessionId;

/// Причина отказа канала доставки принять элемент.
///
/// `Closed` означает, что канал подписчика мёртв целиком — такая ошибка
/// терминальна для сеанса. Остальные варианты касаются только одного
/// сообщения.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("delivery queue is full")]
    QueueFull,

    #[error("delivery channel is closed")]
    Closed,

    #[error("unknown destination (queuing not requested)")]
    UnknownDestination,

    #[error("content rejected by subscriber: {0}")]
    Content(String),
}

impl RejectReason {
    /// Терминальна ли ошибка для всего сеанса подписчика.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, RejectReason::Closed)
    }
}

/// Отказ по одному PtP-адресату: остальные адресаты не затронуты.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDestination {
    pub destination: SessionId,
    pub reason: RejectReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что только Closed терминальна для сеанса.
    #[test]
    fn test_session_fatal_classification() {
        assert!(RejectReason::Closed.is_session_fatal());
        assert!(!RejectReason::QueueFull.is_session_fatal());
        assert!(!RejectReason::UnknownDestination.is_session_fatal());
        assert!(!RejectReason::Content("bad".into()).is_session_fatal());
    }

    /// Тест проверяет текст отображения причин отказа.
    #[test]
    fn test_display() {
        assert_eq!(RejectReason::QueueFull.to_string(), "delivery queue is full");
        assert_eq!(
            RejectReason::Content("oops".into()).to_string(),
            "content rejected by subscriber: oops"
        );
    }
}

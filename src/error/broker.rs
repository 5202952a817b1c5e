use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Синхронная таксономия ошибок брокера.
///
/// Ошибки валидации, авторизации и "не найдено" всегда возвращаются
/// вызывающему до какого-либо изменения состояния. Ошибки доставки после
/// принятия сообщения сюда не попадают — они уходят в dead-letter тракт
/// (см. `error::delivery`).
#[derive(Debug, Error)]
pub enum BrokerError {
    // ==== Валидация (отклонено до изменения состояния) ====
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    // ==== Не найдено ====
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    // ==== Авторизация ====
    #[error("Not authorized: '{subject}' may not {action} on '{topic}'")]
    Authorization {
        subject: String,
        action: String,
        topic: String,
    },

    #[error("Topic '{0}' is read-only")]
    ReadOnly(String),

    // ==== Доставка (только синхронный начальный replay при подписке) ====
    #[error("Initial update delivery failed: {0}")]
    Delivery(String),

    // ==== Инфраструктура ====
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет текст отображения основных вариантов.
    #[test]
    fn test_display_strings() {
        assert_eq!(
            BrokerError::TopicNotFound("kin".into()).to_string(),
            "Topic not found: kin"
        );
        assert_eq!(
            BrokerError::ReadOnly("dza".into()).to_string(),
            "Topic 'dza' is read-only"
        );
        let err = BrokerError::Authorization {
            subject: "alice".into(),
            action: "publish".into(),
            topic: "news".into(),
        };
        assert_eq!(
            err.to_string(),
            "Not authorized: 'alice' may not publish on 'news'"
        );
    }

    /// Тест проверяет конверсию io::Error в таксономию.
    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: BrokerError = io.into();
        assert!(matches!(err, BrokerError::Io(_)));
    }
}

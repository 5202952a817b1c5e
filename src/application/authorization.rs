use std::fmt;

use crate::dispatch::SessionId;

/// Действие, запрашивающее авторизацию.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Publish,
    Subscribe,
    Get,
    Erase,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Publish => "publish",
            Action::Subscribe => "subscribe",
            Action::Get => "get",
            Action::Erase => "erase",
        };
        f.write_str(s)
    }
}

/// Порт авторизации: опрашивается до того, как операция меняет состояние.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, subject: &SessionId, action: Action, topic: &str) -> bool;
}

/// Разрешает всё; реализация по умолчанию.
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self, _subject: &SessionId, _action: Action, _topic: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что AllowAll разрешает любые действия.
    #[test]
    fn test_allow_all() {
        let auth = AllowAll;
        let subject = SessionId::new("alice");
        for action in [Action::Publish, Action::Subscribe, Action::Get, Action::Erase] {
            assert!(auth.is_authorized(&subject, action, "any"));
        }
    }

    /// Тест проверяет текст отображения действий (идёт в журнал аудита).
    #[test]
    fn test_action_display() {
        assert_eq!(Action::Publish.to_string(), "publish");
        assert_eq!(Action::Erase.to_string(), "erase");
    }
}

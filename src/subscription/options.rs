use std::fmt;

/// Цель подписки: точное имя темы или запрос по метаданным.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetSpec {
    Exact(String),
    Query(String),
}

impl TargetSpec {
    pub fn exact(name: impl Into<String>) -> Self {
        TargetSpec::Exact(name.into())
    }

    pub fn query(q: impl Into<String>) -> Self {
        TargetSpec::Query(q.into())
    }

    pub fn is_query(&self) -> bool {
        matches!(self, TargetSpec::Query(_))
    }

    /// Ключ для индекса (session, target) -> подписка.
    pub(crate) fn key(&self) -> String {
        match self {
            TargetSpec::Exact(name) => format!("oid:{name}"),
            TargetSpec::Query(q) => format!("query:{q}"),
        }
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::Exact(name) => write!(f, "oid '{name}'"),
            TargetSpec::Query(q) => write!(f, "query '{q}'"),
        }
    }
}

/// Опции подписки.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Доставить последние записи истории синхронно при подписке.
    pub want_initial: bool,
    /// Сколько записей истории доставить при подписке.
    pub initial_depth: usize,
    /// Порядок начального replay: от новых к старым или хронологический.
    pub newest_first: bool,
    /// Фильтр содержимого; вычисляется подключаемым `QueryEvaluator`
    /// по метаданным каждой записи.
    pub filter: Option<String>,
    /// Не доставлять собственные публикации сеанса.
    pub no_local: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            want_initial: true,
            initial_depth: 1,
            newest_first: true,
            filter: None,
            no_local: false,
        }
    }
}

use globset::Glob;

use super::{QueryEvaluator, TopicMeta};
use crate::error::{BrokerError, BrokerResult};

/// Вычислитель запросов по умолчанию.
///
/// Два вида запросов:
/// - `attr=value` — точное сравнение атрибута метаданных темы;
/// - любой другой текст — glob-шаблон по имени темы (`sensors.*`, `a?c`).
#[derive(Debug, Default, Clone)]
pub struct GlobAttrEvaluator;

impl GlobAttrEvaluator {
    fn as_attr_query(query: &str) -> Option<(&str, &str)> {
        query.split_once('=')
    }
}

impl QueryEvaluator for GlobAttrEvaluator {
    fn validate(&self, query: &str) -> BrokerResult<()> {
        if query.trim().is_empty() {
            return Err(BrokerError::InvalidQuery("empty query".into()));
        }
        if Self::as_attr_query(query).is_some() {
            return Ok(());
        }
        Glob::new(query)
            .map(|_| ())
            .map_err(|e| BrokerError::InvalidQuery(e.to_string()))
    }

    fn matches(&self, query: &str, topic: &str, meta: &TopicMeta) -> BrokerResult<bool> {
        if let Some((key, value)) = Self::as_attr_query(query) {
            return Ok(meta
                .attrs
                .get(key.trim())
                .map(|v| v == value.trim())
                .unwrap_or(false));
        }
        let glob = Glob::new(query).map_err(|e| BrokerError::InvalidQuery(e.to_string()))?;
        Ok(glob.compile_matcher().is_match(topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет сравнение по атрибуту `attr=value`.
    #[test]
    fn test_attr_equality() {
        let eval = GlobAttrEvaluator;
        let meta = TopicMeta::default().with_attr("region", "west");

        assert!(eval.matches("region=west", "sensors.b", &meta).unwrap());
        assert!(!eval.matches("region=east", "sensors.b", &meta).unwrap());
        assert!(!eval.matches("zone=west", "sensors.b", &meta).unwrap());
        // пробелы вокруг ключа и значения не мешают
        assert!(eval.matches("region = west", "sensors.b", &meta).unwrap());
    }

    /// Тест проверяет glob-совпадение по имени темы.
    #[test]
    fn test_glob_over_topic_name() {
        let eval = GlobAttrEvaluator;
        let meta = TopicMeta::default();

        assert!(eval.matches("sensors.*", "sensors.b", &meta).unwrap());
        assert!(eval.matches("s?nsors.b", "sensors.b", &meta).unwrap());
        assert!(!eval.matches("alarms.*", "sensors.b", &meta).unwrap());
    }

    /// Тест проверяет валидацию: пустой запрос и битый glob отклоняются.
    #[test]
    fn test_validate() {
        let eval = GlobAttrEvaluator;
        assert!(eval.validate("region=west").is_ok());
        assert!(eval.validate("sensors.*").is_ok());
        assert!(matches!(
            eval.validate(""),
            Err(BrokerError::InvalidQuery(_))
        ));
        assert!(matches!(
            eval.validate("[invalid["),
            Err(BrokerError::InvalidQuery(_))
        ));
    }

    /// Тест проверяет, что битый glob в matches тоже даёт InvalidQuery.
    #[test]
    fn test_matches_invalid_glob() {
        let eval = GlobAttrEvaluator;
        let meta = TopicMeta::default();
        assert!(matches!(
            eval.matches("[oops[", "kin", &meta),
            Err(BrokerError::InvalidQuery(_))
        ));
    }
}

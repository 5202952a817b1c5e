use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Пул для повторного использования Arc<str> по одинаковым именам тем.
static TOPIC_INTERN: Lazy<DashMap<String, Arc<str>>> = Lazy::new(DashMap::new);

/// Возвращает interned Arc<str> для данного имени темы.
#[inline(always)]
pub(crate) fn intern_topic<S: AsRef<str>>(name: S) -> Arc<str> {
    let key = name.as_ref();
    if let Some(existing) = TOPIC_INTERN.get(key) {
        existing.clone()
    } else {
        let s = key.to_string();
        let arc: Arc<str> = Arc::from(s.clone());
        TOPIC_INTERN.insert(s, arc.clone());
        arc
    }
}

use std::fmt;

/// Состояния жизненного цикла темы.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    /// Создана подпиской на незнакомое имя; публикаций ещё не было.
    Unconfigured,
    /// Есть конфигурация, тема участвует в доставке.
    Alive,
    /// Ни подписчиков, ни записей; идёт отсчёт destroy-delay.
    Unreferenced,
    /// Erase принят, но записи ещё удерживаются очередями доставки.
    SoftErased,
    /// Терминальное состояние: ресурсы освобождены.
    Dead,
}

impl TopicState {
    /// Таблица допустимых переходов. Принудительный erase (переход в DEAD)
    /// разрешён из любого состояния, кроме самого DEAD.
    pub fn can_transition(self, to: TopicState) -> bool {
        use TopicState::*;
        match (self, to) {
            (Dead, _) => false,
            (_, Dead) => true,
            (Unconfigured, Alive) => true,
            (Alive, Unreferenced) => true,
            (Unreferenced, Alive) => true,
            (Alive, SoftErased) | (Unreferenced, SoftErased) => true,
            _ => false,
        }
    }

    pub fn is_dead(self) -> bool {
        self == TopicState::Dead
    }

    pub fn is_alive(self) -> bool {
        self == TopicState::Alive
    }
}

impl fmt::Display for TopicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopicState::Unconfigured => "UNCONFIGURED",
            TopicState::Alive => "ALIVE",
            TopicState::Unreferenced => "UNREFERENCED",
            TopicState::SoftErased => "SOFT_ERASED",
            TopicState::Dead => "DEAD",
        };
        f.write_str(s)
    }
}

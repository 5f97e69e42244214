// Логирование
//
// Ядро пишет только через `tracing`; подписчика ставит приложение.
// Здесь вспомогательная инициализация для бинарей и тестов.

use tracing_subscriber::EnvFilter;

/// Установить fmt-подписчик с фильтром из `RUST_LOG` или `default_filter`.
///
/// Повторный вызов не ошибка: если подписчик уже установлен, возвращает `false`.
pub fn init_logging(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging("debug");
        assert!(!init_logging("debug"));
    }
}

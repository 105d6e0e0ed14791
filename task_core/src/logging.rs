use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

pub const DEFAULT_DIRECTIVE: &str = "task_core=info";

pub fn init(default_directive: &str) -> bool {
    static INSTALLED: OnceLock<bool> = OnceLock::new();
    *INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_target(true)
            .try_init()
            .is_ok()
    })
}

pub fn init_default() -> bool {
    init(DEFAULT_DIRECTIVE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let first = init("task_core=debug");
        let second = init("task_core=trace");
        assert_eq!(first, second);
        tracing::debug!("logging initialised");
    }
}

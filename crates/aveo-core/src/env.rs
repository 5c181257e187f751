//! Environment variable helpers.
//!
//! All of spec.md's configuration knobs (`VE_NODE_NUMBER`, `VE_CORE_NUMBER`,
//! `VEO_SENDFRAG`, ...) are read through these functions rather than scattered
//! `std::env::var` calls.

use std::str::FromStr;

pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

pub fn env_get_str(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // std::env is process-global; serialize the tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_var_returns_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("AVEO_TEST_MISSING");
        assert_eq!(env_get("AVEO_TEST_MISSING", 42u32), 42);
        assert_eq!(env_get_opt::<u32>("AVEO_TEST_MISSING"), None);
        assert!(!env_is_set("AVEO_TEST_MISSING"));
    }

    #[test]
    fn parses_set_var() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("AVEO_TEST_NUM", "7");
        assert_eq!(env_get("AVEO_TEST_NUM", 0u32), 7);
        assert_eq!(env_get_opt::<u32>("AVEO_TEST_NUM"), Some(7));
        std::env::remove_var("AVEO_TEST_NUM");
    }

    #[test]
    fn bool_accepts_common_spellings() {
        let _guard = ENV_LOCK.lock().unwrap();
        for (val, expect) in [("1", true), ("true", true), ("YES", true), ("on", true), ("0", false), ("nah", false)] {
            std::env::set_var("AVEO_TEST_BOOL", val);
            assert_eq!(env_get_bool("AVEO_TEST_BOOL", false), expect, "val={val}");
        }
        std::env::remove_var("AVEO_TEST_BOOL");
    }
}

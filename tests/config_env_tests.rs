//! Environment-driven configuration
//!
//! These tests mutate process environment and run serially.

use calltrack::config::{ConfigError, TrackerConfig, INTERN_CAPACITY_ENV, MAX_INTERN_CAPACITY};
use calltrack::session::{Delivery, Tracker};
use serial_test::serial;

fn with_env<T>(value: Option<&str>, f: impl FnOnce() -> T) -> T {
    match value {
        Some(v) => std::env::set_var(INTERN_CAPACITY_ENV, v),
        None => std::env::remove_var(INTERN_CAPACITY_ENV),
    }
    let result = f();
    std::env::remove_var(INTERN_CAPACITY_ENV);
    result
}

#[test]
#[serial]
fn test_unset_env_gives_default() {
    let config = with_env(None, TrackerConfig::from_env).unwrap();
    assert_eq!(config, TrackerConfig::default());
}

#[test]
#[serial]
fn test_env_sets_intern_capacity() {
    let config = with_env(Some("300"), TrackerConfig::from_env).unwrap();
    assert_eq!(config.intern_capacity(), 300);
    assert_eq!(config.effective_intern_capacity(), 512);
}

#[test]
#[serial]
fn test_env_value_is_trimmed() {
    let config = with_env(Some(" 64 \n"), TrackerConfig::from_env).unwrap();
    assert_eq!(config.intern_capacity(), 64);
}

#[test]
#[serial]
fn test_env_zero_selects_default_capacity() {
    let config = with_env(Some("0"), TrackerConfig::from_env).unwrap();
    assert_eq!(config.effective_intern_capacity(), calltrack::interning::DEFAULT_CAPACITY);
}

#[test]
#[serial]
fn test_invalid_env_is_an_error() {
    let err = with_env(Some("-5"), TrackerConfig::from_env).unwrap_err();
    assert_eq!(
        err,
        ConfigError::InvalidInternCapacity {
            value: "-5".to_string()
        }
    );
}

#[test]
#[serial]
fn test_oversized_env_capacity_is_an_error() {
    let err = with_env(Some("4611686018427387904"), TrackerConfig::from_env).unwrap_err();
    assert_eq!(
        err,
        ConfigError::InternCapacityTooLarge {
            value: 1 << 62,
            max: MAX_INTERN_CAPACITY
        }
    );
}

#[test]
#[serial]
fn test_env_config_drives_tracker() {
    let config = with_env(Some("8"), TrackerConfig::from_env).unwrap();
    let tracker = Tracker::new(config);
    assert_eq!(tracker.config().effective_intern_capacity(), 8);

    tracker.start(Delivery::Batched).unwrap();
    let mut worker = tracker.register_worker();
    for i in 0..100 {
        tracker.dispatch(
            &mut worker,
            calltrack::event::ProducerEvent::call("grow.py", i, format!("f{i}").as_str()),
        );
    }
    let captured = tracker.stop().unwrap().into_captured().unwrap();
    assert_eq!(captured.interned_strings, 101);
}

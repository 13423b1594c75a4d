use super::*;
use serial_test::serial;

fn clear_env() {
    for name in [
        "NIGHTSHIFT_HOME",
        "NIGHTSHIFT_MAX_WORKERS",
        "NIGHTSHIFT_POLL_INTERVAL",
        "NIGHTSHIFT_AUTO_START",
        "NIGHTSHIFT_AGENT_BINARY",
        "NIGHTSHIFT_TASK_TIMEOUT",
        "NIGHTSHIFT_PLANNER_TIMEOUT",
    ] {
        env::remove_var(name);
    }
}

#[test]
#[serial]
fn defaults_applied() {
    clear_env();
    env::set_var("NIGHTSHIFT_HOME", "/tmp/nightshift-test");
    let config = Config::load().unwrap();
    assert_eq!(config.executor.max_workers, 3);
    assert!((config.executor.poll_interval_secs - 1.0).abs() < f64::EPSILON);
    assert!(config.executor.auto_start);
    assert_eq!(config.agent.default_timeout_seconds, 900);
    assert_eq!(
        config.database_path(),
        PathBuf::from("/tmp/nightshift-test/database/nightshift.db")
    );
    clear_env();
}

#[test]
#[serial]
fn overrides_respected() {
    clear_env();
    env::set_var("NIGHTSHIFT_HOME", "/tmp/nightshift-test");
    env::set_var("NIGHTSHIFT_MAX_WORKERS", "7");
    env::set_var("NIGHTSHIFT_POLL_INTERVAL", "0.25");
    env::set_var("NIGHTSHIFT_AUTO_START", "false");
    let config = Config::load().unwrap();
    assert_eq!(config.executor.max_workers, 7);
    assert!((config.executor.poll_interval_secs - 0.25).abs() < f64::EPSILON);
    assert!(!config.executor.auto_start);
    clear_env();
}

#[test]
#[serial]
fn zero_workers_rejected() {
    clear_env();
    env::set_var("NIGHTSHIFT_HOME", "/tmp/nightshift-test");
    env::set_var("NIGHTSHIFT_MAX_WORKERS", "0");
    assert!(Config::load().is_err());
    clear_env();
}

#[test]
#[serial]
fn garbage_value_rejected() {
    clear_env();
    env::set_var("NIGHTSHIFT_HOME", "/tmp/nightshift-test");
    env::set_var("NIGHTSHIFT_POLL_INTERVAL", "fast");
    assert!(Config::load().is_err());
    clear_env();
}

#[test]
fn artifact_paths_use_task_id() {
    let config = Config::test_config(Path::new("/tmp/ns"));
    assert_eq!(
        config.output_artifact_path("task_0011aabb"),
        PathBuf::from("/tmp/ns/output/task_0011aabb_output.json")
    );
    assert_eq!(
        config.notification_path("task_0011aabb"),
        PathBuf::from("/tmp/ns/notifications/task_0011aabb_notification.json")
    );
}

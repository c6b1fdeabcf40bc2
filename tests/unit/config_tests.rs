use preview_pool::config::{seconds_delta, GlobalConfig, MAX_DURATION_SECONDS};
use preview_pool::AppError;

fn minimal_toml(data_dir: &str) -> String {
    format!(
        r#"
data_dir = '{data_dir}'

[preview]
command = "node"
workspaces_root = '{data_dir}'
"#
    )
}

fn full_toml(data_dir: &str) -> String {
    format!(
        r#"
data_dir = '{data_dir}'
http_port = 9100
retention_days = 7

[pool]
capacity = 12
idle_threshold_seconds = 600
idle_after_seconds = 120
sweep_interval_seconds = 30
reclaim_interval_seconds = 90
max_candidates_per_pass = 20
start_timeout_seconds = 20
stop_timeout_seconds = 5

[preview]
command = "node"
args = ["server.js"]
workspaces_root = '{data_dir}'
port_range_start = 4000
port_range_end = 4100
health_path = "/ready"
health_timeout_ms = 1500
ready_timeout_seconds = 15

[cloud]
endpoint = "http://cloud.local"
task_definition = "preview:3"

[cache]
endpoint = "http://cdn.local"
distribution_id = "E123"
"#
    )
}

fn parse_with(
    data_dir: &str,
    edit: impl FnOnce(String) -> String,
) -> Result<GlobalConfig, AppError> {
    GlobalConfig::from_toml_str(&edit(full_toml(data_dir)))
}

#[test]
fn minimal_config_uses_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let config = GlobalConfig::from_toml_str(&minimal_toml(dir)).expect("config parses");

    assert_eq!(config.http_port, 8790);
    assert_eq!(config.retention_days, 30);
    assert_eq!(config.pool.capacity, 100);
    assert_eq!(config.pool.idle_threshold_seconds, 300);
    assert_eq!(config.pool.idle_after_seconds, 60);
    assert_eq!(config.pool.max_candidates_per_pass, 50);
    assert_eq!(config.preview.port_range_start, 3001);
    assert_eq!(config.preview.port_range_end, 8000);
    assert_eq!(config.preview.health_path, "/health");
    assert_eq!(config.preview.health_timeout_ms, 2000);
    assert!(config.cloud.is_none());
    assert!(config.cache.is_none());
}

#[test]
fn full_config_parses_every_section() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let config = GlobalConfig::from_toml_str(&full_toml(dir)).expect("config parses");

    assert_eq!(config.http_port, 9100);
    assert_eq!(config.pool.capacity, 12);
    assert_eq!(config.pool.idle_threshold().num_seconds(), 600);
    assert_eq!(config.pool.idle_after().num_seconds(), 120);
    assert_eq!(config.pool.start_timeout().as_secs(), 20);
    assert_eq!(config.preview.args, vec!["server.js".to_owned()]);
    assert_eq!(config.preview.health_timeout().as_millis(), 1500);

    let cloud = config.cloud.as_ref().expect("cloud section");
    assert_eq!(cloud.cluster, "playcanvas-multiplayer");
    assert_eq!(cloud.task_definition, "preview:3");
    assert!(cloud.token.is_none(), "token is never read from TOML");

    let cache = config.cache.as_ref().expect("cache section");
    assert_eq!(cache.distribution_id, "E123");
    assert_eq!(cache.request_timeout_seconds, 10);
}

#[test]
fn data_dir_is_canonicalized_and_db_path_derived() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let config = GlobalConfig::from_toml_str(&minimal_toml(dir)).expect("config parses");

    let expected = temp.path().canonicalize().expect("canonical");
    assert_eq!(config.data_dir, expected);
    assert_eq!(config.db_path(), expected.join("preview-pool.db"));
}

#[test]
fn load_from_path_reads_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");
    let file = temp.path().join("config.toml");
    std::fs::write(&file, minimal_toml(dir)).expect("write config");

    let config = GlobalConfig::load_from_path(&file).expect("config loads");
    assert_eq!(config.preview.command, "node");
}

#[test]
fn missing_file_is_config_error() {
    let result = GlobalConfig::load_from_path("/definitely/not/here.toml");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn zero_capacity_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let result = parse_with(dir, |t| t.replace("capacity = 12", "capacity = 0"));
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("capacity")));
}

#[test]
fn idle_after_must_be_below_threshold() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let result = parse_with(dir, |t| {
        t.replace("idle_after_seconds = 120", "idle_after_seconds = 600")
    });
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("idle_after")));
}

#[test]
fn zero_candidates_per_pass_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let result = parse_with(dir, |t| {
        t.replace("max_candidates_per_pass = 20", "max_candidates_per_pass = 0")
    });
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn zero_sweep_interval_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let result = parse_with(dir, |t| {
        t.replace("sweep_interval_seconds = 30", "sweep_interval_seconds = 0")
    });
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn idle_threshold_above_one_day_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let result = parse_with(dir, |t| {
        t.replace(
            "idle_threshold_seconds = 600",
            "idle_threshold_seconds = 9223372036854775807",
        )
    });
    assert!(
        matches!(result, Err(AppError::Config(msg)) if msg.contains("idle_threshold_seconds"))
    );

    let at_cap = parse_with(dir, |t| {
        t.replace(
            "idle_threshold_seconds = 600",
            &format!("idle_threshold_seconds = {MAX_DURATION_SECONDS}"),
        )
    });
    assert!(at_cap.is_ok());
}

#[test]
fn oversized_timeouts_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let start = parse_with(dir, |t| {
        t.replace("start_timeout_seconds = 20", "start_timeout_seconds = 86401")
    });
    assert!(matches!(start, Err(AppError::Config(msg)) if msg.contains("start_timeout")));

    let cloud = parse_with(dir, |t| {
        t.replace(
            "task_definition = \"preview:3\"",
            "task_definition = \"preview:3\"\nrequest_timeout_seconds = 100000",
        )
    });
    assert!(matches!(cloud, Err(AppError::Config(msg)) if msg.contains("cloud.request_timeout")));
}

#[test]
fn seconds_delta_saturates() {
    assert_eq!(seconds_delta(90), chrono::Duration::seconds(90));
    assert_eq!(seconds_delta(u64::MAX), chrono::Duration::MAX);
}

#[test]
fn inverted_port_range_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let result = parse_with(dir, |t| t.replace("port_range_end = 4100", "port_range_end = 3999"));
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("port range")));
}

#[test]
fn health_timeout_above_two_seconds_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let result = parse_with(dir, |t| {
        t.replace("health_timeout_ms = 1500", "health_timeout_ms = 2500")
    });
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("health_timeout_ms")));
}

#[test]
fn relative_health_path_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let result = parse_with(dir, |t| {
        t.replace("health_path = \"/ready\"", "health_path = \"ready\"")
    });
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn empty_command_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let result = parse_with(dir, |t| t.replace("command = \"node\"", "command = \"  \""));
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("command")));
}

#[test]
fn missing_data_dir_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let missing = temp.path().join("nope");
    let toml = minimal_toml(missing.to_str().expect("utf8 path"));

    let result = GlobalConfig::from_toml_str(&toml);
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("data_dir")));
}

#[test]
fn malformed_toml_is_config_error() {
    let result = GlobalConfig::from_toml_str("data_dir = [");
    assert!(matches!(result, Err(AppError::Config(_))));
}

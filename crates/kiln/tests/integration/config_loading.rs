use kiln::config::{Config, ConfigError};

use super::FIXTURES_PATH;

fn config_fixture(name: &str) -> String {
    format!("{FIXTURES_PATH}/configs/{name}")
}

#[test]
fn test_load_minimal_config() {
    let config = Config::from_file(config_fixture("minimal.toml")).expect("Failed to load config");

    let limits = config.effective_limits(None);
    assert_eq!(limits.wall_time_ms, Some(3_000));
    assert_eq!(limits.cpu_time_ms, Some(2_000));
    assert_eq!(config.compiler.source_name, "main.c");
    assert_eq!(config.server.path, "/CompilerServlet");
}

#[test]
fn test_load_full_config() {
    let config = Config::from_file(config_fixture("full.toml")).expect("Failed to load config");

    assert!(config.cgroup);
    assert_eq!(config.sandbox.pool_size, 8);
    assert_eq!(config.sandbox.first_box_id, 100);
    assert_eq!(config.limits.memory_bytes, Some(128 * 1024 * 1024));
    assert_eq!(config.compiler.command[0], "clang");
    assert_eq!(config.compiler.source_name, "prog.c");
    assert!(!config.validator.reject_dangerous);
    assert_eq!(config.admission.max_queued_jobs, 0);
    assert!(config.render.include_warnings);
    assert_eq!(config.server.bind, "0.0.0.0:9000");
    assert_eq!(config.server.path, "/compile");
}

#[test]
fn test_compiler_command_needs_placeholders() {
    let result = Config::from_file(config_fixture("no_placeholder.toml"));
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_bad_validator_pattern() {
    let result = Config::from_file(config_fixture("bad_pattern.toml"));
    assert!(matches!(result, Err(ConfigError::Pattern { .. })));
}

#[test]
fn test_load_missing_file() {
    let path = config_fixture("does_not_exist.toml");
    let result = Config::load(Some(path.as_ref()));
    assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
}

#[test]
fn test_example_config_round_trips() {
    let config = Config::parse_toml(kiln::EXAMPLE_CONFIG).unwrap();
    assert!(!config.validator.dangerous_patterns.is_empty());
    assert_eq!(config.admission.max_concurrent_jobs, 4);
}

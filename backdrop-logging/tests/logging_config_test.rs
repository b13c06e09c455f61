use backdrop_config::{LogFormat, LogLevel, LoggingConfig};
use backdrop_logging::{init_logging_from_config, init_simple_tracing, init_worker_tracing};

#[test]
fn test_logging_config_integration() {
    let yaml_config = r#"
level: debug
format: json
filter: "backdrop_execution=trace"
"#;

    let config: LoggingConfig = serde_yaml::from_str(yaml_config).unwrap();
    assert_eq!(config.level, LogLevel::Debug);
    assert_eq!(config.format, LogFormat::Json);

    init_logging_from_config(&config).unwrap();
    tracing::info!("subscriber installed");
}

#[test]
fn test_repeated_initialization_is_harmless() {
    init_simple_tracing("info").unwrap();
    init_simple_tracing("debug").unwrap();
    init_worker_tracing("warn").unwrap();
    init_logging_from_config(&LoggingConfig::default()).unwrap();
}

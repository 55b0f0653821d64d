use crate::config::LogFormat;
use chrono::{DateTime, Utc};
use log::Record;
use serde_json::json;
use std::io::Write;

/// Default filter for the given verbosity. `RUST_LOG` still takes precedence.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

pub fn init(verbose: bool, format: LogFormat) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter(verbose)),
    );

    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", format_json(record)));
    }

    builder.try_init()
}

fn format_json(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let log_entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "file": record.file().unwrap_or("unknown"),
        "line": record.line().unwrap_or(0),
        "message": record.args().to_string(),
    });

    serde_json::to_string(&log_entry).unwrap_or_else(|_| {
        json!({"error": "Failed to serialize log entry", "raw_message": record.args().to_string()})
            .to_string()
    })
}

//! Structured logging setup, mirroring the rolling-file + env-driven
//! configuration pattern used throughout this crate's CLI tooling.

use log::LevelFilter;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::{
    CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::{Path, PathBuf};

/// Initializes logging from `log4rs.yaml` in the working directory, if present.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let _ = log4rs::init_file("log4rs.yaml", log4rs::config::Deserializers::default());
    Ok(())
}

/// Configures logging with an explicit directory, level, and retention count.
pub fn configure_logging(dir: Option<&Path>, level: Option<&str>, retention: Option<usize>) {
    let base = dir
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let keep = retention.unwrap_or(7) as u32;
    let lvl = match level.unwrap_or("info").to_ascii_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
    let roller = match FixedWindowRoller::builder()
        .build(&format!("{}", base.join("fwup.{}.log").display()), keep)
    {
        Ok(r) => r,
        Err(_) => return,
    };
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(10 * 1024 * 1024)), Box::new(roller));
    let Ok(appender) = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(base.join("fwup.log"), Box::new(policy))
    else {
        return;
    };

    let Ok(config) = Config::builder()
        .appender(Appender::builder().build("fwup", Box::new(appender)))
        .build(Root::builder().appender("fwup").build(lvl))
    else {
        return;
    };
    let _ = log4rs::init_config(config);
}

/// Configures logging from `FWUP_LOG_DIR`, `FWUP_LOG_LEVEL`, `FWUP_LOG_RETENTION`.
pub fn configure_from_env() {
    let dir = std::env::var("FWUP_LOG_DIR").ok().map(PathBuf::from);
    let level = std::env::var("FWUP_LOG_LEVEL").ok();
    let retention = std::env::var("FWUP_LOG_RETENTION").ok().and_then(|s| s.parse::<usize>().ok());
    configure_logging(dir.as_deref(), level.as_deref(), retention);
}

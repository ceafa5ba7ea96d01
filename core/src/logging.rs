use anyhow::Result;
use std::str::FromStr;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

fn filter_for(level: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::from_str(&format!(
        "mi_replay={},gdbmi={}",
        level, level
    ))?)
}

pub fn setup_logging(
    app_name: &str,
    log_dir: &str,
    enable_console_logging: bool,
    console_level: &str,
    file_level: &str,
) -> Result<WorkerGuard> {
    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, log_dir, format!("{}.log", app_name));

    // The file gets the session's MI traffic: routed lines at trace,
    // outgoing commands at debug, bad lines and orphans at warn
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // stdout carries the replay's JSON lines, so console logs go to stderr
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_filter(filter_for(console_level)?);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(non_blocking)
        .with_filter(filter_for(file_level)?);

    let t = tracing_subscriber::registry().with(file_layer);

    if enable_console_logging {
        t.with(console_layer).try_init()?;
    } else {
        t.try_init()?;
    }

    Ok(guard)
}

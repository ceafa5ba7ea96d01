mod arg;
mod common;
mod logging;
mod replay;

use anyhow::{Context, Result};
use clap::Parser;
use common::{default_vals::APP_NAME, Config};
use tokio::io::BufReader;
use tracing::info;

fn main() -> Result<()> {
    let args = arg::Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let log_dir = config.conf.log_dir();
    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
    // Keep the guard to ensure the async logger is running.
    let _guard = logging::setup_logging(
        APP_NAME,
        &log_dir.to_string_lossy(),
        args.console_log,
        &args.console_level,
        &args.file_level,
    )?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .thread_name("mi-replay")
        .build()
        .context("Failed to build runtime")?;

    let summary = rt.block_on(async {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        match &args.transcript {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                replay::replay(BufReader::new(file), &mut out, &config).await
            }
            None => replay::replay(BufReader::new(tokio::io::stdin()), &mut out, &config).await,
        }
    })?;

    info!("Done: {:?}", summary);
    Ok(())
}

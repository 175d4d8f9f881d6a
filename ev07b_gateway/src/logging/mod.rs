pub mod csv;

pub use csv::FrameAudit;

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn env_filter() -> Result<EnvFilter> {
    Ok(EnvFilter::from_default_env()
        .add_directive("ev07b_gateway=info".parse()?)
        .add_directive("ev07b_protocol=info".parse()?)
        .add_directive("tokio=warn".parse()?))
}

/// Compact stdout logging, or a daily-rolling file under `log_dir`. Keep the
/// returned guard alive for the life of the process.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter()?).compact();
    match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "gateway.log"));
            builder.with_writer(writer).with_ansi(false).init();
            Ok(Some(guard))
        }
        None => {
            builder.init();
            Ok(None)
        }
    }
}

mod calendar;
mod error;
mod host;
mod relay;
mod sensors;
mod triggers;

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match host::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("fatal: {err:#}");
            ExitCode::from(err.exit_code())
        }
    }
}

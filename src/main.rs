use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use forking_service::{
    exit_code_for_service_error, init_logging, ForkingService, ProcessExecutor, ServiceConfig,
    ServiceError,
};

mod cli;

use crate::cli::Cli;

fn build_info() -> String {
    format!(
        "forking-service v{} ({}, {}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("FORKING_SERVICE_BUILD_TARGET"),
        env!("FORKING_SERVICE_BUILD_PROFILE"),
        env!("FORKING_SERVICE_BUILD_DATE"),
    )
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let cfg = ServiceConfig::from_env().context("invalid FORKING_SERVICE_* environment")?;
    let cfg = cli.apply(cfg);
    let socket = cfg.socket_path.clone();
    let mut service =
        ForkingService::new(cfg, ProcessExecutor).context("invalid service configuration")?;
    let report = service
        .serve()
        .with_context(|| format!("forking service on {} failed", socket.display()))?;
    if !report.immortal.is_empty() {
        warn!(
            "{} children could not be reaped and were abandoned",
            report.immortal.len()
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    info!("{}", build_info());

    match run(&cli) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("forking-service: {e:#}");
            let code = e
                .downcast_ref::<ServiceError>()
                .map(exit_code_for_service_error)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

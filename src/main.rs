use anyhow::{Context as _, Result};
use calltrace::{cli::Cli, demo, fetch, inject_with, Context};
use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let config = args.load_config()?;
    tracing::debug!(?config, "configuration loaded");

    let work = Duration::from_millis(args.work_ms);
    let body = args.body.as_deref().unwrap_or(demo::SAMPLE_BODY);

    for n in 0..args.requests {
        let request_id = format!("req-{:04}", n);
        let ctx = inject_with(&Context::background(), &config);

        let result = demo::handle(&ctx, &request_id, body, work);

        // The report is printed whether or not the request succeeded
        println!("{}", fetch(&ctx));
        result.with_context(|| format!("Request {} failed", request_id))?;
    }

    Ok(())
}

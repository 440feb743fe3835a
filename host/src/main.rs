#[cfg(target_os = "linux")]
mod attach;
#[cfg(target_os = "linux")]
mod cli;
#[cfg(target_os = "linux")]
mod consumer;
#[cfg(target_os = "linux")]
mod error;
#[cfg(target_os = "linux")]
mod lifecycle;
#[cfg(target_os = "linux")]
mod shutdown;

#[cfg(target_os = "linux")]
use std::{io, process::ExitCode};

#[cfg(target_os = "linux")]
use anyhow::{Context, Result};
#[cfg(target_os = "linux")]
use aya::include_bytes_aligned;
#[cfg(target_os = "linux")]
use clap::Parser;
#[cfg(target_os = "linux")]
use tracing_subscriber::EnvFilter;

#[cfg(target_os = "linux")]
use crate::{
    attach::{Attachment, XdpLoader},
    cli::Cli,
    consumer::EventPrinter,
    lifecycle::Lifecycle,
};

#[cfg(target_os = "linux")]
const BPF_OBJECT: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/pingwall-xdp"));

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
async fn run(cli: Cli) -> Result<()> {
    let attachment = Attachment::resolve(&cli.iface, cli.mode())?;
    let mut shutdown = shutdown::listen().context("failed to install signal handlers")?;

    let mut lifecycle = Lifecycle::new(XdpLoader::new(BPF_OBJECT));
    lifecycle.start(attachment)?;
    if let Some(attachment) = lifecycle.attachment() {
        tracing::info!(
            iface = %attachment.iface,
            if_index = attachment.if_index,
            mode = %attachment.mode,
            "dropping ICMP echo requests, press Ctrl-C to stop"
        );
    }

    let mut printer = EventPrinter::new(io::stdout());
    let result = lifecycle
        .run(&mut shutdown, cli.poll_timeout(), |event| printer.print(&event))
        .await;
    lifecycle.teardown();
    tracing::info!(
        state = ?lifecycle.state(),
        delivered = lifecycle.delivered(),
        unwritten = printer.failed(),
        "pingwall stopped"
    );

    result.context("stopped on event channel fault")
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("pingwall currently supports Linux only.");
    std::process::exit(1);
}

use clap::Parser;
use guestd::config::{Cli, Config};
use guestd::server::{self, Server};
use guestd::sysroot::{Sysroot, SysrootMode};
use guestd::transport::Transport;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    // Relative paths must never resolve against wherever we were started.
    std::env::set_current_dir("/")?;

    let transport = Transport::connect(&config.channel)?;
    let mode = if config.test_mode {
        SysrootMode::Prefix
    } else {
        SysrootMode::Chroot
    };
    let sysroot = Sysroot::new(config.sysroot.clone(), mode);
    let autosync = config.autosync;

    let mut server = Server::new(transport, sysroot, config);
    server.announce()?;
    server.serve()?;

    if autosync {
        server::autosync(server.sysroot());
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, notes) = match Config::load(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            init_logging(cli.verbose);
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.verbose);
    for note in &notes {
        tracing::debug!("{}", note);
    }

    tracing::info!(
        "Starting guestd (sysroot {}, channel {})",
        config.sysroot.display(),
        config.channel
    );

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

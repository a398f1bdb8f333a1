#[macro_use]
extern crate log;

mod cli;

use std::sync::atomic::{AtomicUsize, Ordering};

use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use proxyx_command_lib::{
    config::ConfigError,
    logging::{setup_logging, LogError},
};
use proxyx_lib::{
    server::{Server, HARD_STOP},
    ServerError,
};

use crate::cli::Args;

/// 0 while running, then one step per signal: [`proxyx_lib::server::SOFT_STOP`]
/// after a SIGQUIT, [`HARD_STOP`] or more otherwise
static STOP: AtomicUsize = AtomicUsize::new(0);

#[derive(thiserror::Error, Debug)]
enum MainError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("could not set up logging: {0}")]
    Logging(#[from] LogError),
    #[error("could not install the signal handlers: {0}")]
    Signal(nix::Error),
    #[error("{0}")]
    Server(#[from] ServerError),
}

extern "C" fn handle_signal(signal: libc::c_int) {
    if signal == libc::SIGQUIT {
        // graceful the first time, immediate the second
        STOP.fetch_add(1, Ordering::SeqCst);
    } else {
        STOP.fetch_max(HARD_STOP, Ordering::SeqCst);
    }
}

fn install_signal_handlers() -> Result<(), MainError> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
        // the handler only touches an atomic
        unsafe { sigaction(signal, &action) }.map_err(MainError::Signal)?;
    }
    Ok(())
}

fn run(args: Args) -> Result<(), MainError> {
    let config = args.to_config()?;
    setup_logging(&config.log_target, config.effective_log_level(), "MAIN")?;
    info!(
        "starting proxyx on {}:{}, timeout {}s",
        config.listen_address, config.listen_port, config.timeout
    );

    let mut server = Server::try_new_from_config(&config)?;
    install_signal_handlers()?;
    server.run(&STOP)?;

    info!("proxyx stopped");
    log::logger().flush();
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("{}", e);
        log::logger().flush();
        // logging may not be set up yet
        eprintln!("proxyx: {e}");
        std::process::exit(1);
    }
}

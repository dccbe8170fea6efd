//! boardd - board control daemon.
//!
//! One process serves one controlling client: frames arrive on stdin,
//! responses and console output leave on stdout, diagnostics go to stderr.
//! Typically spawned per-connection by sshd (`ForceCommand`) or a socket
//! activator, with the client identity passed through `BOARDD_USER`.

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use boardd_server::config;
use boardd_server::device::Registry;
use boardd_server::reactor::{self, Reactor};
use boardd_server::session::sink::{MessageSink, StdoutSink};
use boardd_server::session::Session;

#[derive(Parser, Debug)]
#[command(name = "boardd-server", version, about = "Lab board control daemon")]
struct Args {
    /// Path to the board configuration file.
    #[arg(short, long, env = "BOARDD_CONFIG")]
    config: Option<PathBuf>,

    /// Username to evaluate board access lists against.
    #[arg(short, long, env = "BOARDD_USER")]
    user: Option<String>,
}

extern "C" fn on_signal(_signal: i32) {
    reactor::request_shutdown();
}

/// SIGPIPE means the client side of stdout is gone; SIGINT/SIGTERM are
/// operator shutdowns.  All of them must still power the board off, so they
/// flag the reactor instead of killing the process.
fn install_signal_handlers() -> anyhow::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGPIPE] {
        // SAFETY: the handler only stores to an atomic flag.
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("failed to install {signal} handler"))?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // stdout carries the protocol stream, so diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    install_signal_handlers()?;

    let config = config::load(args.config.as_deref()).context("failed to load configuration")?;
    let registry = Registry::from_config(config);

    let reactor = Rc::new(Reactor::new());
    let sink: Rc<dyn MessageSink> = Rc::new(StdoutSink);
    let session = Session::new(registry, args.user, sink, Rc::clone(&reactor));
    Session::attach(&session, &reactor).context("failed to attach session input")?;

    info!("boardd ready");
    let result = reactor.run();

    // Hardware is released on every exit path, fatal errors included.
    session.borrow_mut().shutdown(&reactor);

    match result {
        Ok(()) => {
            info!("session closed");
            Ok(())
        }
        Err(err) => {
            error!("session failed: {err}");
            Err(err.into())
        }
    }
}

use {
    error_reporter::Report,
    pipegraph::{context::ContextError, event_loop::LoopError},
    std::io,
    thiserror::Error,
};

mod cli;
mod daemon;

#[derive(Debug, Error)]
enum DaemonError {
    #[error("could not set up signal handling")]
    Signals(#[source] io::Error),
    #[error("could not create the event loop")]
    CreateLoop(#[source] LoopError),
    #[error("could not watch the signal fd")]
    WatchSignals(#[source] LoopError),
    #[error("could not create the daemon context")]
    CreateContext(#[source] ContextError),
    #[error("could not bind the well-known socket")]
    Listen(#[source] ContextError),
    #[error("the main loop failed")]
    Run(#[source] LoopError),
}

fn main() -> Result<(), Report<DaemonError>> {
    cli::main().map_err(Report::new)
}

use {
    crate::{DaemonError, daemon},
    clap::{ArgAction, CommandFactory, Parser, ValueHint},
    clap_complete::Shell,
    std::io::stdout,
};

/// The pipegraph daemon.
///
/// Hosts the media graph and accepts clients on the well-known
/// socket under XDG_RUNTIME_DIR.
#[derive(Parser, Debug)]
struct Pipegraphd {
    /// Generate shell completions instead of running the daemon.
    #[clap(long, value_enum, value_name = "SHELL")]
    generate_completion: Option<Shell>,
    /// The socket name to listen on.
    ///
    /// Defaults to $PIPEGRAPH_CORE or pipegraph-0.
    #[clap(short, long, value_hint = ValueHint::Other)]
    name: Option<String>,
    /// Log more. Can be repeated.
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
}

pub fn main() -> Result<(), DaemonError> {
    let args = Pipegraphd::parse();
    if let Some(shell) = args.generate_completion {
        let stdout = stdout();
        let mut stdout = stdout.lock();
        clap_complete::generate(shell, &mut Pipegraphd::command(), "pipegraphd", &mut stdout);
        return Ok(());
    }
    daemon::main(args.name, args.verbose)
}

//! Command-line front end.
//!
//! Parses the import updates, then hands the target command line to the
//! debug session. The target inherits this console, so output lands in the
//! terminal the tool was started from.

use std::process::ExitCode;

use clap::Parser;

use imprewire::{Forwarding, ImportUpdate, parse_import_updates};

#[derive(Parser)]
#[command(
    name = "imprewire",
    version,
    about = "Rewrites the import table of a freshly launched PE process",
    after_help = "UPDATE forms:\n  \
        dll_name.dll!FunctionName          import by name\n  \
        dll_name.dll#ordinal               import by ordinal\n  \
        from_spec:to_spec                  forward one import to another\n\n\
        Example:\n  \
        imprewire -i shim.dll!InstallHooks -i comctl32.dll#332:shim.dll!TaskDialogShim target.exe --flag"
)]
struct Cli {
    /// Import update to apply; may be repeated.
    #[arg(short = 'i', long = "import", value_name = "UPDATE", required = true)]
    imports: Vec<String>,

    /// Print allocation and rewrite details.
    #[arg(short, long)]
    verbose: bool,

    /// The target executable and its arguments.
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

#[cfg(feature = "tracing")]
fn setup_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose {
        "imprewire=debug"
    } else {
        "imprewire=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();
}

#[cfg(not(feature = "tracing"))]
fn setup_logging(_verbose: bool) {}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> imprewire::Result<()> {
    let (updates, forwardings) = parse_import_updates(&cli.imports)?;
    launch(updates, forwardings, &cli.command)
}

#[cfg(windows)]
fn launch(
    updates: Vec<ImportUpdate>,
    forwardings: Vec<Forwarding>,
    command: &[String],
) -> imprewire::Result<()> {
    imprewire::DebugSession::new(updates, forwardings).run(command)
}

#[cfg(not(windows))]
fn launch(
    _updates: Vec<ImportUpdate>,
    _forwardings: Vec<Forwarding>,
    _command: &[String],
) -> imprewire::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "launching a debugged process requires Windows",
    )
    .into())
}

//! Iris demo CLI
//!
//! Drives the iris concurrency core from the command line: a standalone
//! receiver counting messages, and a coordinator mixing exclusive,
//! concurrent and teardown receivers.

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::SchedulerArgs;

#[derive(Parser)]
#[command(name = "iris")]
#[command(
    about = "Ports, receivers and coordinators on a work-stealing scheduler",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Print the final report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// More log output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Colored output: auto, always or never
    #[arg(long, global = true, value_name = "WHEN")]
    color: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Post messages to a standalone receiver and count them
    Basic {
        /// Number of messages to post
        #[arg(short, long, default_value_t = 10_000)]
        messages: u64,

        #[command(flatten)]
        scheduler: SchedulerArgs,
    },

    /// Mix exclusive, concurrent and teardown receivers under one coordinator
    Coordinator {
        /// Number of messages to post before teardown
        #[arg(short, long, default_value_t = 1_000)]
        iterations: u64,

        /// Every K-th message goes to the exclusive receiver
        #[arg(short = 'k', long, default_value_t = 10)]
        exclusive_every: u64,

        /// Hold new concurrent work while an exclusive message waits
        #[arg(long)]
        drain: bool,

        #[command(flatten)]
        scheduler: SchedulerArgs,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut out = output::StyledOutput::new(output::resolve_color_choice(cli.color.as_deref()));

    let result = match cli.command {
        Commands::Basic { messages, scheduler } => {
            commands::basic::execute(messages, &scheduler, cli.json, &mut out)
        }
        Commands::Coordinator {
            iterations,
            exclusive_every,
            drain,
            scheduler,
        } => commands::coordinator::execute(
            commands::coordinator::CoordinatorOptions {
                iterations,
                exclusive_every,
                drain,
            },
            &scheduler,
            cli.json,
            &mut out,
        ),
    };

    if let Err(e) = result {
        out.error_line(&format!("Error: {:#}", e));
        std::process::exit(1);
    }
}

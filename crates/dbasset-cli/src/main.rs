//! dbasset CLI - query database tables as files from the command line

mod commands;

use clap::{Parser, Subcommand};
use commands::{FieldsCommand, QueryCommand, TablesCommand};
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "DBASSET_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full
    #[arg(
        long,
        default_value = "compact",
        env = "DBASSET_LOG_FORMAT",
        global = true
    )]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a select against a table and print the encoded result
    Query(QueryCommand),
    /// Print the fields of a table as JSON
    Fields(FieldsCommand),
    /// List the tables reachable through a database URI
    Tables(TablesCommand),
}

fn init_logging(level: &str, format: &str) -> anyhow::Result<()> {
    // RUST_LOG takes over entirely when set
    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::try_from_default_env()?
    } else {
        tracing_subscriber::EnvFilter::try_new(format!(
            "dbasset={level},\
             dbasset_query={level},\
             dbasset_query_sql={level},\
             dbasset_query_postgres={level},\
             dbasset_query_mysql={level},\
             dbasset_query_sqlite={level},\
             dbasset_query_mongodb={level},\
             sqlx=warn,\
             tokio_postgres=warn,\
             mongodb=warn",
        ))?
    };

    let fmt_layer = match format {
        "full" => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, &cli.log_format)?;

    match cli.command {
        Commands::Query(cmd) => cmd.execute(),
        Commands::Fields(cmd) => cmd.execute(),
        Commands::Tables(cmd) => cmd.execute(),
    }
}

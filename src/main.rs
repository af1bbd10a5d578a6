//! Binary entrypoint for the meshwatch CLI.
//!
//! Commands:
//! - `start` - connect to the broker and run the tracker until Ctrl-C
//! - `init` - create a starter `meshwatch.toml`
//! - `status` - print a summary of the node database without connecting
//!
//! See the library crate docs for module-level details: `meshwatch::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use meshwatch::config::Config;
use meshwatch::nodedb::NodeDb;
use meshwatch::tracker::TrackerServer;

#[derive(Parser)]
#[command(name = "meshwatch")]
#[command(about = "MQTT node tracker and auto-responder for Meshtastic mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshwatch.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the tracker
    Start,
    /// Initialize a new configuration file
    Init,
    /// Show node database statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config early to configure logging (except for Init which writes it)
    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start => {
            let config = pre_config.unwrap_or(Config::load(&cli.config).await?);
            info!("Starting meshwatch v{}", env!("CARGO_PKG_VERSION"));
            let mut tracker = TrackerServer::new(config)?;
            tracker.run().await?;
        }
        Commands::Init => {
            info!("Initializing new meshwatch configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
            println!(
                "Wrote {}. Edit the [mqtt] section for your broker, then add trigger \
                 phrases and reply identities under [responder].",
                cli.config
            );
        }
        Commands::Status => {
            let config = pre_config.unwrap_or(Config::load(&cli.config).await?);
            let db = NodeDb::load(std::path::Path::new(&config.storage.nodedb_path))?;
            println!("Node database: {}", config.storage.nodedb_path);
            println!("Nodes known:   {}", db.nodes.len());
            match db.last_write {
                Some(ts) => println!("Last write:    {}", ts.format("%Y-%m-%dT%H:%M:%SZ")),
                None => println!("Last write:    never"),
            }
            let mut totals: std::collections::BTreeMap<&str, u64> = std::collections::BTreeMap::new();
            for record in db.nodes.values() {
                for (kind, stat) in &record.message_type_stats {
                    *totals.entry(kind.as_str()).or_default() += stat.count;
                }
            }
            if !totals.is_empty() {
                println!("Messages by kind:");
                for (kind, count) in totals {
                    println!("  {:<12} {}", kind, count);
                }
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .map(|cfg| cfg.logging.level.parse().unwrap_or(log::LevelFilter::Info))
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config.as_ref().and_then(|cfg| cfg.logging.file.clone());
    if let Some(file) = log_file {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));

            // When stdout is a terminal, echo log lines to the console too;
            // under a supervisor only the file gets them.
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());

                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }

                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        } else {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}

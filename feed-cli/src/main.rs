use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use scroll_feed::{
    FeedConfig, FeedEvent, HttpSource, Record, ScrollController,
};

#[derive(Parser, Debug)]
#[clap(name = "feed-cli")]
#[clap(about = "Scroll a paginated listing with lazily loaded avatars", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Make rows visible one after another, as a list view would
    Scroll {
        #[clap(long, default_value_t = 30)]
        rows: usize,

        #[clap(long)]
        config: Option<PathBuf>,
    },

    /// Print the default configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Cli::parse();
    match args.command {
        Command::Scroll { rows, config } => {
            let config = match config {
                Some(path) => FeedConfig::load(&path).with_context(|| {
                    format!("loading config from {}", path.display())
                })?,
                None => FeedConfig::default(),
            };
            scroll(config, rows).await
        }
        Command::Config => {
            let json = serde_json::to_string_pretty(&FeedConfig::default())?;
            println!("{}", json);
            Ok(())
        }
    }
}

async fn scroll(config: FeedConfig, rows: usize) -> anyhow::Result<()> {
    let source = Arc::new(HttpSource::new(&config)?);
    let mut feed = ScrollController::new(source, config)?;

    feed.on_start();
    report(feed.settle().await);

    for position in 0..rows {
        if position >= feed.records().len() {
            report(feed.settle().await);
        }
        let id = match feed.records().get(position) {
            Some(record) => record.id,
            None => {
                println!("listing ends after {} rows", feed.records().len());
                break;
            }
        };
        feed.on_row_visible(id, position);
    }
    report(feed.settle().await);

    for record in feed.records().iter().take(rows) {
        print_row(record);
    }

    let stats = feed.download_stats();
    println!(
        "{} pages, {} avatars cached, {} downloads ({} cancelled, {} failed)",
        feed.pages_loaded(),
        feed.cached_avatars(),
        stats.started,
        stats.cancelled,
        stats.failed
    );
    Ok(())
}

fn report(events: Vec<FeedEvent>) {
    for event in events {
        match event {
            FeedEvent::PageFailed { cursor, error } => {
                eprintln!("page {} failed: {}", cursor, error)
            }
            FeedEvent::ImageFailed { id, error } => {
                eprintln!("avatar of {} failed: {}", id, error)
            }
            _ => {}
        }
    }
}

fn print_row(record: &Record) {
    let image = match &record.image {
        Some(avatar) => format!("{}x{}", avatar.width(), avatar.height()),
        None => "-".to_string(),
    };
    println!("{:>10} {:<24} {}", record.id, record.display_name, image);
}

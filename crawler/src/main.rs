use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use semcrawl_crawler::{
    CrawlerConfig, CrawlerParams, Database, DocumentWriter, HtmlCrawler, WriterParams,
};
use semcrawl_pipe::{Pipe, ProcessingContext, StatsWriter, StatsWriterConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: LevelFilter,

    /// Directory relative file names are resolved against
    #[arg(short, long, default_value = ".")]
    working_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl the configured hosts until no URL is due
    Crawl {
        /// Crawler configuration file
        #[arg(short, long)]
        conf: PathBuf,

        /// Seed URL list, renamed to `<file>.old` once read
        #[arg(short, long, default_value = semcrawl_crawler::crawler::DEF_BOOTSTRAP_FILE)]
        bootstrap: PathBuf,

        /// Output file for entity documents
        #[arg(short, long, default_value = semcrawl_crawler::writer::DEF_OUTPUT_FILE)]
        out: PathBuf,

        /// Stats file, `stdout` or `stderr`
        #[arg(short, long)]
        stats: Option<String>,

        /// Seconds between stats snapshots, 0 for a final one only
        #[arg(long, default_value_t = 0)]
        stats_interval: u64,
    },

    /// Manage hosts known to the URL store
    Hosts {
        /// Crawler configuration file
        #[arg(short, long)]
        conf: PathBuf,

        #[command(subcommand)]
        action: HostAction,
    },
}

#[derive(Subcommand)]
enum HostAction {
    /// List stored hosts
    List,
    /// Remove a host with its URLs
    Remove { id: i64 },
    /// Remove every host and URL
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

fn crawl(
    ctx: ProcessingContext,
    conf: PathBuf,
    bootstrap: PathBuf,
    out: PathBuf,
    stats: Option<String>,
    stats_interval: u64,
) -> Result<()> {
    let crawler = HtmlCrawler::new(CrawlerParams { conf, bootstrap });
    let writer = DocumentWriter::new(WriterParams { out });
    let mut pipe = Pipe::with_context(vec![Box::new(crawler), Box::new(writer)], ctx);
    if let Some(file) = stats {
        pipe.attach(Arc::new(StatsWriter::new(StatsWriterConfig {
            file,
            interval: stats_interval,
            filter: String::new(),
        })));
    }
    let stopper = pipe.stop_handle();
    ctrlc::set_handler(move || {
        if stopper.stop() {
            info!("Interrupted, finishing pending pages");
        }
    })
    .context("Failed to install the Ctrl-C handler")?;
    pipe.start(true).context("Crawl could not start")?;
    info!("Crawl finished");
    Ok(())
}

fn open_store(ctx: &ProcessingContext, conf: &Path) -> Result<Database> {
    let conf = CrawlerConfig::load(ctx.resolve(conf)).context("Failed to load configuration")?;
    Database::new(ctx.resolve(&conf.database)).context("Failed to open URL store")
}

fn hosts(ctx: &ProcessingContext, conf: &Path, action: HostAction) -> Result<()> {
    let db = open_store(ctx, conf)?;
    match action {
        HostAction::List => {
            for (id, address) in db.list_hosts()? {
                println!("{}\t{}", id, address);
            }
        }
        HostAction::Remove { id } => {
            let removed = db.remove_host(id)?;
            println!("Removed host {} ({} URLs)", id, removed);
        }
        HostAction::Reset { yes } => {
            if !yes {
                bail!("reset drops every host and URL, pass --yes to confirm");
            }
            let removed = db.reset()?;
            println!("Removed {} URLs", removed);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .init();

    let ctx = ProcessingContext::new();
    ctx.set_working_dir(&args.working_dir);

    match args.command {
        Command::Crawl {
            conf,
            bootstrap,
            out,
            stats,
            stats_interval,
        } => crawl(ctx, conf, bootstrap, out, stats, stats_interval),
        Command::Hosts { conf, action } => hosts(&ctx, &conf, action),
    }
}

use clap::{Parser, Subcommand, ValueEnum};
use crawl_core::{CrawlMode, CrawlRequest, ModeOptions, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "crawl-core")]
#[command(about = "Immediate and cron-scheduled crawls through a WebDriver browser")]
#[command(version)]
pub struct Args {
    /// JSON engine configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Crawl one URL and print the result as JSON
    Crawl {
        url: String,

        #[arg(short, long, value_enum, default_value_t = ModeArg::Headless)]
        mode: ModeArg,

        /// Mode options as a JSON object, e.g. '{"screenshot": false}'
        #[arg(short, long)]
        options: Option<String>,

        /// Identity the rate limit is applied to
        #[arg(long, default_value = "cli")]
        client: String,
    },

    /// Run the scheduler until interrupted
    Serve {
        /// Seconds between maintenance passes
        #[arg(long, default_value_t = 60)]
        maintenance_interval: u64,
    },

    /// Add or replace a scheduled job
    AddJob {
        id: String,

        url: String,

        /// 5-field cron expression, e.g. "*/15 * * * *"
        schedule: String,

        #[arg(short, long, value_enum, default_value_t = ModeArg::Headless)]
        mode: ModeArg,

        #[arg(short, long)]
        options: Option<String>,

        #[arg(long, default_value = "cli")]
        owner: String,
    },

    /// List stored jobs
    ListJobs,

    /// Delete a scheduled job
    RemoveJob { id: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Headless,
    Structured,
    ApiDiscovery,
}

impl From<ModeArg> for CrawlMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Headless => CrawlMode::Headless,
            ModeArg::Structured => CrawlMode::Structured,
            ModeArg::ApiDiscovery => CrawlMode::ApiDiscovery,
        }
    }
}

/// Build a request from CLI arguments
pub fn build_request(url: &str, mode: ModeArg, options: Option<&str>) -> Result<CrawlRequest> {
    let options = options
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()?;
    let options = ModeOptions::from_parts(mode.into(), options)?;
    CrawlRequest::parse(url, options)
}

use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;

use clap::{Parser, Subcommand, ValueEnum};
use claimwalk::types::{OutputFormat, ScrapeRequest};
use claimwalk::{AgentConfig, ScrapeTarget, WebScraper};
use log::LevelFilter;

#[derive(Parser)]
#[command(name = "claimwalk")]
#[command(about = "A paginated claims register scraper", long_about = None)]
struct Cli {
    #[arg(
        short = 'l',
        long = "log-level",
        value_enum,
        default_value = "info",
        global = true,
        help = "Set the logging level"
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Walk a claims listing page by page, collecting claims and their amounts
    Scrape {
        #[arg(help = "URL of the first listing page")]
        url: String,

        #[arg(
            short = 'd',
            long,
            default_value_t = 1,
            help = "Number of listing pages to walk (capped by max_depth)"
        )]
        depth: u32,

        #[arg(
            short = 'c',
            long,
            value_name = "FILE",
            help = "Agent configuration (JSON, comments allowed)"
        )]
        config: PathBuf,

        #[arg(
            short = 'o',
            long = "output",
            default_value = "text",
            value_parser = parse_output_format,
            help = "Output format: text or json"
        )]
        format: OutputFormat,

        #[arg(
            long,
            value_name = "VALUE",
            help = "Authorization header value, e.g. after an authentication challenge"
        )]
        auth: Option<String>,
    },
    /// Check whether a URL is on the configured allow-list without fetching it
    Check {
        #[arg(help = "URL to check")]
        url: String,

        #[arg(
            short = 'c',
            long,
            value_name = "FILE",
            help = "Agent configuration (JSON, comments allowed)"
        )]
        config: PathBuf,
    },
}

fn parse_output_format(s: &str) -> Result<OutputFormat, String> {
    OutputFormat::from_str(s).map_err(|e| e.to_string())
}

fn load_config(path: &Path) -> AgentConfig {
    AgentConfig::from_file(path).unwrap_or_else(|e| {
        log::error!("Error loading config {}: {}", path.display(), e);
        process::exit(1);
    })
}

fn serialize_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            log::error!("Error serializing to JSON: {}", e);
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.clone().into())
        .init();

    match cli.command {
        Commands::Scrape {
            url,
            depth,
            config,
            format,
            auth,
        } => {
            let config = load_config(&config);

            let mut scraper = WebScraper::new(&config).unwrap_or_else(|e| {
                log::error!("Error creating scraper: {}", e);
                process::exit(1);
            });
            if let Some(auth) = auth {
                scraper = scraper.with_authorization(auth);
            }

            let request = ScrapeRequest::new(url, depth).with_output_format(format);
            let report = scraper
                .scrape(&request)
                .await
                .unwrap_or_else(|e| {
                    log::error!("Error scraping: {}", e);
                    process::exit(1);
                });

            if let Some(challenge) = report.authentication_challenge() {
                log::warn!(
                    "Server asked for credentials ({}); rerun with --auth",
                    challenge
                );
            }

            match request.output_format {
                OutputFormat::Json => serialize_json(&report),
                OutputFormat::Text => {
                    if report.claims.is_empty() {
                        println!("No claims to display.");
                    }
                    print!("{}", report);
                }
            }
        }

        Commands::Check { url, config } => {
            let config = load_config(&config);

            match ScrapeTarget::resolve(&url, &config) {
                Ok(target) => {
                    println!("allowed: {}", target);
                    println!("  base:      {}", target.base());
                    println!("  file:      {}{}", target.file(), target.extension());
                    for (key, value) in target.query_params() {
                        println!("  param:     {} = {}", key, value);
                    }
                }
                Err(e) => {
                    log::error!("{}", e);
                    process::exit(1);
                }
            }
        }
    }
}

mod commands;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] fastget_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Service(#[from] fastget_core::ServiceError),
    #[error(transparent)]
    Cdm(#[from] fastget_core::CdmError),
    #[error(transparent)]
    Plan(#[from] fastget_core::PlanError),
    #[error(transparent)]
    Orchestrator(#[from] fastget_core::OrchestratorError),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("{failed} of {total} titles failed")]
    TitlesFailed { failed: usize, total: usize },
    #[error("batch file: {0}")]
    Batch(String),
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Downloader for free ad-supported streaming services",
    long_about = None
)]
pub struct Cli {
    /// Project root holding config.yaml, services/ and utils/
    #[arg(long, default_value = ".")]
    pub base_dir: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download titles from a catalog, episode or movie URL
    Get(GetArgs),
    /// Query the search APIs of the selected services
    Search(SearchArgs),
    /// Store credentials for a service
    Profile(ProfileArgs),
    /// Print the service registry, or one entry
    #[command(name = "service-info")]
    ServiceInfo(ServiceInfoArgs),
    /// Delete every per-service download cache
    #[command(name = "clear-cache")]
    ClearCache,
    /// Execute a file of invocations, one per line
    File(FileArgs),
}

#[derive(Args, Debug, Clone)]
pub struct GetArgs {
    /// Catalog, episode or movie URL
    pub url: String,
    /// Selection: SxxEyy, SxxEyy-SzzEww, comma list, free text, or an
    /// episode URL
    #[arg(long)]
    pub episode: Option<String>,
    /// Season selection: Sxx or a comma list
    #[arg(long)]
    pub season: Option<String>,
    /// Select every episode
    #[arg(long)]
    pub complete: bool,
    /// Select the catalog's movies
    #[arg(long)]
    pub movie: bool,
    /// List titles without downloading
    #[arg(long)]
    pub titles: bool,
    /// Print a per-title info panel without downloading
    #[arg(long)]
    pub info: bool,
    /// Preferred video height (e.g. 1080)
    #[arg(long)]
    pub quality: Option<u64>,
    #[arg(long)]
    pub select_video: Option<String>,
    #[arg(long)]
    pub select_audio: Option<String>,
    #[arg(long)]
    pub select_subtitle: Option<String>,
    #[arg(long)]
    pub drop_video: Option<String>,
    #[arg(long)]
    pub drop_audio: Option<String>,
    #[arg(long)]
    pub drop_subtitle: Option<String>,
    #[arg(long)]
    pub threads: Option<u32>,
    #[arg(long)]
    pub format: Option<String>,
    #[arg(long)]
    pub muxer: Option<String>,
    #[arg(long)]
    pub use_shaka_packager: bool,
    #[arg(long)]
    pub no_mux: bool,
    #[arg(long)]
    pub save_name: Option<String>,
    #[arg(long)]
    pub save_dir: Option<PathBuf>,
    #[arg(long)]
    pub sub_only: bool,
    #[arg(long)]
    pub sub_no_mux: bool,
    #[arg(long)]
    pub sub_no_fix: bool,
    /// Seconds to sleep between titles
    #[arg(long)]
    pub slowdown: Option<u64>,
    #[arg(long)]
    pub no_cache: bool,
    #[arg(long)]
    pub proxy: Option<String>,
    /// Renumber episodes ordinally within each season
    #[arg(long)]
    pub force_numbering: bool,
    /// Append the service id to the filename
    #[arg(long)]
    pub append_id: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Comma-separated service aliases (e.g. ctv,pluto)
    pub services: String,
    /// Search keywords
    #[arg(required = true)]
    pub keywords: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ProfileArgs {
    #[arg(long)]
    pub service: String,
    #[arg(long)]
    pub username: String,
    #[arg(long)]
    pub password: String,
}

#[derive(Args, Debug, Clone)]
pub struct ServiceInfoArgs {
    /// Service name or alias; all entries when omitted
    pub service: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct FileArgs {
    /// File of invocations, one per line
    pub path: PathBuf,
}

pub fn run(cli: Cli) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(&cli.base_dir, &cli.command))
}

/// Boxed so the `file` subcommand can re-enter with parsed lines.
pub(crate) fn dispatch<'a>(
    base: &'a Path,
    command: &'a Commands,
) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
    Box::pin(async move {
        match command {
            Commands::Get(args) => commands::get::run(base, args).await,
            Commands::Search(args) => commands::search::run(base, args).await,
            Commands::Profile(args) => commands::profile::run(base, args),
            Commands::ServiceInfo(args) => commands::service_info::run(base, args),
            Commands::ClearCache => commands::clear_cache::run(base),
            Commands::File(args) => commands::file::run(base, args).await,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_flags_parse() {
        let cli = Cli::try_parse_from([
            "fastgetctl",
            "get",
            "https://www.ctv.ca/shows/the-name",
            "--episode",
            "S01E01-S01E10",
            "--quality",
            "1080",
            "--no-cache",
            "--slowdown",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Get(args) => {
                assert_eq!(args.episode.as_deref(), Some("S01E01-S01E10"));
                assert_eq!(args.quality, Some(1080));
                assert!(args.no_cache);
                assert_eq!(args.slowdown, Some(5));
            }
            _ => panic!("expected get"),
        }
    }

    #[test]
    fn search_requires_keywords() {
        assert!(Cli::try_parse_from(["fastgetctl", "search", "ctv"]).is_err());
        let cli =
            Cli::try_parse_from(["fastgetctl", "search", "ctv,pluto", "dr", "quinn"]).unwrap();
        match cli.command {
            Commands::Search(args) => {
                assert_eq!(args.services, "ctv,pluto");
                assert_eq!(args.keywords, vec!["dr", "quinn"]);
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn subcommand_names_match_the_documented_surface() {
        assert!(Cli::try_parse_from(["fastgetctl", "clear-cache"]).is_ok());
        assert!(Cli::try_parse_from(["fastgetctl", "service-info"]).is_ok());
        assert!(Cli::try_parse_from([
            "fastgetctl",
            "profile",
            "--service",
            "gem",
            "--username",
            "u",
            "--password",
            "p"
        ])
        .is_ok());
    }
}

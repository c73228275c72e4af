use std::fs::File;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use reqwest::Url;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use brainprep::batch::BatchRunner;
use brainprep::config::{AuthKind, Config, ConfigLoader, DownloadRequest, ResolvedConfig};
use brainprep::digest::ExpectedDigests;
use brainprep::domain::{ExistencePolicy, IfNoDigest, OnError, PathDisplay};
use brainprep::error::PrepError;
use brainprep::output::{JsonOutput, OutputMode, StatusSink, TableReporter};

#[derive(Parser)]
#[command(name = "brainprep")]
#[command(about = "Resumable, checksum-verified downloads of neuroimaging datasets")]
#[command(version, author)]
struct Cli {
    /// Print one line per finished file instead of redrawing the table.
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download URLs, or every entry of a manifest")]
    Fetch(FetchArgs),
}

#[derive(Args)]
struct FetchArgs {
    /// URLs to download. Without any, the manifest is read.
    urls: Vec<String>,

    /// Manifest file (default: brainprep.json).
    #[arg(long)]
    config: Option<String>,

    /// Destination file or directory.
    #[arg(long)]
    dst: Option<Utf8PathBuf>,

    #[arg(long, value_enum)]
    ifexists: Option<ExistencePolicy>,

    #[arg(long, value_enum)]
    if_no_digest: Option<IfNoDigest>,

    /// Expected digest as ALGO=HEX; repeatable.
    #[arg(long = "digest", value_name = "ALGO=HEX")]
    digests: Vec<String>,

    /// Expected size in bytes.
    #[arg(long)]
    size: Option<u64>,

    /// Remote modification time (RFC 3339).
    #[arg(long)]
    mtime: Option<String>,

    #[arg(long, value_enum)]
    path: Option<PathDisplay>,

    #[arg(long, value_enum)]
    on_error: Option<OnError>,

    /// Log in to an XNAT server first; defaults to the URL's own server.
    #[arg(long, value_name = "SERVER", num_args = 0..=1, default_missing_value = "")]
    xnat: Option<String>,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long)]
    max_attempts: Option<u32>,

    /// Emit JSON lines on stdout instead of the table.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<PrepError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &PrepError) -> u8 {
    match error {
        PrepError::InvalidUrl { .. }
        | PrepError::UnknownDigest(_)
        | PrepError::InvalidDigest { .. }
        | PrepError::InvalidSetting(_)
        | PrepError::MissingConfig
        | PrepError::ConfigRead(_)
        | PrepError::ConfigParse(_)
        | PrepError::MissingCredentials(_) => 2,
        PrepError::Network(_) | PrepError::HttpStatus { .. } | PrepError::Auth(_) => 3,
        PrepError::LockHeld(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    let cli = Cli::parse();
    let output_mode = if cli.non_interactive || !std::io::stderr().is_terminal() {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    init_logging(cli.log_file.as_ref(), output_mode)?;

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, output_mode),
    }
}

fn init_logging(log_file: Option<&Utf8PathBuf>, output_mode: OutputMode) -> miette::Result<()> {
    // The live table shares stderr with the logs.
    let default = match (log_file, output_mode) {
        (None, OutputMode::Interactive) => "warn",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let (writer, ansi) = match log_file {
        Some(path) => {
            let file = File::create(path.as_std_path()).into_diagnostic()?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer)
        .init();
    Ok(())
}

fn run_fetch(args: FetchArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let resolved = resolve_fetch(&args)?;
    let auth = resolved.authenticator(|key| std::env::var(key).ok())?;
    let downloaders = resolved.downloaders(auth)?;
    debug!(count = downloaders.len(), "starting batch");

    let mut sink: Box<dyn StatusSink> = if args.json {
        Box::new(JsonOutput::stdout())
    } else {
        Box::new(TableReporter::stderr(output_mode))
    };

    let summary = BatchRunner::new(resolved.batch).run(downloaders, sink.as_mut())?;
    if summary.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

/// Manifest settings, or the URLs on the command line, with every flag
/// given on the command line taking precedence.
fn resolve_fetch(args: &FetchArgs) -> Result<ResolvedConfig, PrepError> {
    let mut resolved = if args.urls.is_empty() {
        ConfigLoader::resolve(args.config.as_deref())?
    } else {
        let mut resolved = ConfigLoader::resolve_config(Config::default())?;
        resolved.downloads = args.urls.iter().map(|url| url_request(url)).collect();
        resolved
    };

    let per_file = args.size.is_some() || args.mtime.is_some() || !args.digests.is_empty();
    if per_file {
        let [request] = resolved.downloads.as_mut_slice() else {
            return Err(PrepError::InvalidSetting(
                "--size, --mtime and --digest need exactly one download".to_string(),
            ));
        };
        if let Some(size) = args.size {
            request.size = Some(size);
        }
        if let Some(mtime) = &args.mtime {
            request.mtime = Some(parse_mtime(mtime)?);
        }
        if !args.digests.is_empty() {
            request.digests = parse_digests(&args.digests)?;
        }
    }

    if let Some(policy) = args.ifexists {
        resolved.batch.policy = Some(policy);
    }
    if let Some(on_error) = args.on_error {
        resolved.batch.on_error = on_error;
    }
    if let Some(path) = args.path {
        resolved.batch.path = path;
    }
    if let Some(if_no_digest) = args.if_no_digest {
        resolved.if_no_digest = if_no_digest;
    }
    if let Some(chunk_size) = args.chunk_size {
        if chunk_size == 0 {
            return Err(PrepError::InvalidSetting("chunk_size: 0".to_string()));
        }
        resolved.chunk_size = chunk_size;
    }
    if let Some(max_attempts) = args.max_attempts {
        if max_attempts == 0 {
            return Err(PrepError::InvalidSetting("max_attempts: 0".to_string()));
        }
        resolved.max_attempts = max_attempts;
    }
    if let Some(dst) = &args.dst {
        resolved.dst = Some(dst.clone());
    }
    if let Some(server) = &args.xnat {
        resolved.auth = Some(AuthKind::Xnat);
        resolved.auth_server = match server.as_str() {
            "" => None,
            server => Some(Url::parse(server).map_err(|err| PrepError::InvalidUrl {
                url: server.to_string(),
                message: err.to_string(),
            })?),
        };
    }
    Ok(resolved)
}

fn url_request(url: &str) -> DownloadRequest {
    DownloadRequest {
        url: url.to_string(),
        dst: None,
        size: None,
        mtime: None,
        digests: ExpectedDigests::new(),
    }
}

fn parse_digests(values: &[String]) -> Result<ExpectedDigests, PrepError> {
    let pairs = values
        .iter()
        .map(|value| {
            value.split_once('=').ok_or_else(|| {
                PrepError::InvalidSetting(format!("digest {value}: expected ALGO=HEX"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    ExpectedDigests::from_pairs(pairs)
}

fn parse_mtime(value: &str) -> Result<DateTime<Utc>, PrepError> {
    DateTime::parse_from_rfc3339(value)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| PrepError::InvalidSetting(format!("mtime {value}: {err}")))
}

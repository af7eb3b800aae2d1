use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use capture_prep::engine::{DEFAULT_MAX_MASK, DEFAULT_MIN_MASK, DEFAULT_RATIO};
use capture_prep::{
    AutoKind, Config, Engine, FilterSpec, Mode, Polarity, PrepError, Side, read_comment,
};

fn long_version() -> &'static str {
    let banner = format!(
        "{} (cache format version {})",
        env!("CARGO_PKG_VERSION"),
        capture_prep::cache::CACHE_VERSION
    );
    Box::leak(banner.into_boxed_str())
}

#[derive(Parser, Debug)]
#[command(
    version,
    long_version = long_version(),
    about = "Builds a per-packet interface classification cache for traffic replay"
)]
struct Cli {
    /// Split traffic in auto mode (two passes; learns server networks)
    #[arg(long)]
    auto: bool,

    /// Second-pass policy for auto mode
    #[arg(long = "auto-type", value_enum, requires = "auto")]
    auto_type: Option<AutoTypeArg>,

    /// Split traffic by source-address CIDR membership
    #[arg(long, value_name = "LIST")]
    cidr: Option<String>,

    /// Split traffic by destination port against the service table
    #[arg(long)]
    port: bool,

    /// Split traffic by regex over the dotted-quad source address
    #[arg(long, value_name = "PATTERN")]
    regex: Option<String>,

    /// Input capture file
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Output cache file
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Client/server evidence ratio for auto mode
    #[arg(long, value_name = "R")]
    ratio: Option<f64>,

    /// Shortest aggregated prefix in auto/router mode
    #[arg(long = "min-mask", value_name = "M")]
    min_mask: Option<u8>,

    /// Longest aggregation depth in auto/router mode
    #[arg(long = "max-mask", value_name = "M")]
    max_mask: Option<u8>,

    /// Side for frames that are not classifiable IPv4
    #[arg(long = "non-ip", value_enum, default_value = "client")]
    non_ip: SideArg,

    /// Services file overriding the default well-known port range
    #[arg(long, value_name = "FILE")]
    services: Option<PathBuf>,

    /// Comment to embed in the cache header
    #[arg(long, value_name = "TEXT")]
    comment: Option<String>,

    /// Print the comment embedded in an existing cache file and exit
    #[arg(long = "print-comment", value_name = "FILE")]
    print_comment: Option<PathBuf>,

    /// Classify only the packets matching SPEC (P:, S:, D:, B: or F:)
    #[arg(long, value_name = "SPEC")]
    include: Option<String>,

    /// Classify all packets except those matching SPEC
    #[arg(long, value_name = "SPEC")]
    exclude: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AutoTypeArg {
    Bridge,
    Router,
    Client,
    Server,
}

impl From<AutoTypeArg> for AutoKind {
    fn from(arg: AutoTypeArg) -> AutoKind {
        match arg {
            AutoTypeArg::Bridge => AutoKind::Bridge,
            AutoTypeArg::Router => AutoKind::Router,
            AutoTypeArg::Client => AutoKind::Client,
            AutoTypeArg::Server => AutoKind::Server,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SideArg {
    Client,
    Server,
}

impl From<SideArg> for Side {
    fn from(arg: SideArg) -> Side {
        match arg {
            SideArg::Client => Side::Primary,
            SideArg::Server => Side::Secondary,
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    // Usage errors exit 1 like every other configuration error; --help and
    // --version are not errors.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = err.print();
            return code;
        }
    };
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "aborting");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), PrepError> {
    if let Some(path) = &cli.print_comment {
        let comment = read_comment(path)?;
        println!("Comment:\n{comment}");
        return Ok(());
    }

    let config = build_config(&cli)?;
    let input = cli.input.as_deref().ok_or_else(|| config_err(
        "an input capture must be given with --input",
    ))?;
    let output = cli.output.as_deref().ok_or_else(|| config_err(
        "an output cache must be given with --output",
    ))?;

    let mut engine = Engine::new(config)?;
    let cache = engine.run_file(input)?;
    cache.write_file(output)?;
    info!(packets = cache.len(), output = %output.display(), "done");
    Ok(())
}

fn config_err(message: &str) -> PrepError {
    PrepError::Config {
        message: message.to_string(),
    }
}

fn build_config(cli: &Cli) -> Result<Config, PrepError> {
    let mut modes: Vec<Mode> = Vec::new();
    if cli.auto {
        let kind = cli
            .auto_type
            .ok_or_else(|| config_err("--auto needs --auto-type=bridge|router|client|server"))?;
        modes.push(Mode::Auto(kind.into()));
    }
    if let Some(list) = &cli.cidr {
        modes.push(Mode::Cidr(list.clone()));
    }
    if cli.port {
        modes.push(Mode::Port);
    }
    if let Some(pattern) = &cli.regex {
        modes.push(Mode::Regex(pattern.clone()));
    }
    let mode = match modes.len() {
        0 => return Err(config_err(
            "choose a mode: --auto, --cidr, --port or --regex",
        )),
        1 => modes.remove(0),
        _ => return Err(config_err("modes are mutually exclusive; choose one")),
    };

    let is_auto = matches!(mode, Mode::Auto(_));
    if !is_auto && (cli.min_mask.is_some() || cli.max_mask.is_some()) {
        return Err(config_err("mask bounds only apply to auto mode"));
    }
    if !is_auto && cli.ratio.is_some() {
        return Err(config_err("--ratio only applies to auto mode"));
    }

    let filter = match (&cli.include, &cli.exclude) {
        (Some(_), Some(_)) => {
            return Err(config_err("--include and --exclude are mutually exclusive"));
        }
        (Some(spec), None) => Some((Polarity::Include, FilterSpec::parse(spec)?)),
        (None, Some(spec)) => Some((Polarity::Exclude, FilterSpec::parse(spec)?)),
        (None, None) => None,
    };

    let mut config = Config::new(mode);
    config.ratio = cli.ratio.unwrap_or(DEFAULT_RATIO);
    config.min_mask = cli.min_mask.unwrap_or(DEFAULT_MIN_MASK);
    config.max_mask = cli.max_mask.unwrap_or(DEFAULT_MAX_MASK);
    config.non_ip = cli.non_ip.into();
    config.services_file = cli.services.clone();
    config.comment = cli.comment.clone().unwrap_or_default();
    config.filter = filter;
    Ok(config)
}

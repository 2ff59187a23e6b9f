use std::process::ExitCode;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use opera_audit::accountability::{AccountabilityMapper, MultiplicityPolicy, OutputLinkage};
use opera_audit::cmr::{CmrHttpClient, MetadataSource, SearchQuery};
use opera_audit::composite::{CompositeValidator, ValidatorConfig};
use opera_audit::config::{ConfigLoader, ResolvedConfig};
use opera_audit::domain::{
    BoundingBox, GranuleRecord, Period, ProductType, TemporalRange, Venue, format_cmr_time,
};
use opera_audit::duplicates::DuplicateDetector;
use opera_audit::error::AuditError;
use opera_audit::output::{AuditOutput, OutputFormat, ReportWriter};

const EXIT_FINDINGS: u8 = 2;

#[derive(Parser)]
#[command(name = "opera-audit")]
#[command(about = "Audit OPERA product metadata in CMR for duplicates, gaps and inconsistent composites")]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Find granules sharing a canonical identity")]
    Duplicates(DuplicatesArgs),
    #[command(about = "Find inputs with no derived output")]
    Accountability(AccountabilityArgs),
    #[command(about = "Check composite granules for mixed tracks and time spread")]
    Composite(CompositeArgs),
}

#[derive(Args, Clone)]
struct SearchArgs {
    #[arg(long, value_enum, default_value_t = Venue::Prod)]
    venue: Venue,

    /// RFC 3339 timestamp or YYYY-MM-DD.
    #[arg(long)]
    start: Option<String>,

    /// Defaults to now.
    #[arg(long, requires = "start")]
    end: Option<String>,

    #[arg(long, conflicts_with = "start", default_value_t = 1)]
    days_back: u32,

    /// W,S,E,N
    #[arg(long)]
    bbox: Option<String>,

    #[arg(long)]
    page_size: Option<usize>,

    #[arg(long)]
    max_pages: Option<usize>,

    #[arg(long)]
    throttle_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    #[arg(long, value_enum, default_value_t = Period::Day)]
    period: Period,
}

#[derive(Args)]
struct DuplicatesArgs {
    #[arg(long, value_enum)]
    product: ProductType,

    #[command(flatten)]
    search: SearchArgs,
}

#[derive(Args)]
struct AccountabilityArgs {
    #[arg(long, value_enum, default_value_t = ProductType::Hls)]
    input_product: ProductType,

    #[arg(long, value_enum, default_value_t = ProductType::DswxHls)]
    output_product: ProductType,

    #[arg(long, value_enum, default_value_t = OutputLinkage::Manifest)]
    linkage: OutputLinkage,

    /// Overrides the configured fan-out policy.
    #[arg(long)]
    allow_fan_out: Option<bool>,

    #[command(flatten)]
    search: SearchArgs,
}

#[derive(Args)]
struct CompositeArgs {
    #[arg(long, value_enum, default_value_t = ProductType::DswxS1)]
    product: ProductType,

    #[arg(long, value_enum, default_value_t = ProductType::RtcS1)]
    input_product: ProductType,

    #[arg(long)]
    max_time_span_minutes: Option<f64>,

    #[command(flatten)]
    search: SearchArgs,
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::from(EXIT_FINDINGS),
        Ok(false) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(audit) = report.downcast_ref::<AuditError>() {
                return ExitCode::from(map_exit_code(audit));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &AuditError) -> u8 {
    if error.is_service_error() {
        return 3;
    }
    if error.is_caller_error() {
        return 4;
    }
    match error {
        AuditError::MissingConfig(_)
        | AuditError::ConfigRead(_)
        | AuditError::ConfigParse(_) => 4,
        _ => 1,
    }
}

/// Returns whether any finding was reported.
fn run() -> miette::Result<bool> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let (output, format) = match cli.command {
        Commands::Duplicates(args) => (run_duplicates(&args, &config)?, args.search.format),
        Commands::Accountability(args) => {
            (run_accountability(&args, &config)?, args.search.format)
        }
        Commands::Composite(args) => (run_composite(&args, &config)?, args.search.format),
    };

    let findings = output.findings();
    ReportWriter::print(&output, format).into_diagnostic()?;
    Ok(!findings.is_empty())
}

fn client_for(args: &SearchArgs, config: &ResolvedConfig) -> Result<CmrHttpClient, AuditError> {
    let mut client_config = config.client_config(args.venue);
    if let Some(throttle_ms) = args.throttle_ms {
        client_config.throttle = Duration::from_millis(throttle_ms);
    }
    CmrHttpClient::new(client_config)
}

fn temporal_range(args: &SearchArgs) -> Result<TemporalRange, AuditError> {
    let now = Utc::now();
    match &args.start {
        Some(start) => {
            let end = args.end.clone().unwrap_or_else(|| format_cmr_time(&now));
            format!("{start},{end}").parse()
        }
        None => TemporalRange::last_days(now, args.days_back),
    }
}

fn build_queries(
    args: &SearchArgs,
    config: &ResolvedConfig,
    product: ProductType,
    default_bbox: Option<BoundingBox>,
) -> Result<Vec<SearchQuery>, AuditError> {
    let temporal = temporal_range(args)?;
    let bbox = match &args.bbox {
        Some(value) => Some(value.parse::<BoundingBox>()?),
        None => default_bbox,
    };
    let page_size = args.page_size.unwrap_or(config.cmr.page_size);
    let max_pages = args.max_pages.unwrap_or(config.cmr.max_pages);

    config
        .collections(product, args.venue)?
        .iter()
        .map(|collection| {
            let query =
                SearchQuery::new(collection.clone(), temporal, page_size, max_pages)?;
            Ok(match bbox {
                Some(bbox) => query.with_bounding_box(bbox),
                None => query,
            })
        })
        .collect()
}

fn fetch_all<S: MetadataSource>(
    source: &S,
    queries: Vec<SearchQuery>,
) -> Result<Vec<GranuleRecord>, AuditError> {
    let mut granules = Vec::new();
    for query in queries {
        info!(collection = %query.collection, temporal = %query.temporal, "searching CMR");
        for granule in source.search(query) {
            granules.push(granule?);
        }
    }
    Ok(granules)
}

fn run_duplicates(
    args: &DuplicatesArgs,
    config: &ResolvedConfig,
) -> Result<AuditOutput, AuditError> {
    let client = client_for(&args.search, config)?;
    let queries = build_queries(&args.search, config, args.product, None)?;
    let granules = fetch_all(&client, queries)?;
    let report = DuplicateDetector::new(args.product, args.search.period).detect(&granules);
    Ok(AuditOutput::Duplicates(report))
}

fn run_accountability(
    args: &AccountabilityArgs,
    config: &ResolvedConfig,
) -> Result<AuditOutput, AuditError> {
    let client = client_for(&args.search, config)?;
    let inputs = fetch_all(
        &client,
        build_queries(&args.search, config, args.input_product, None)?,
    )?;
    let outputs = fetch_all(
        &client,
        build_queries(&args.search, config, args.output_product, None)?,
    )?;

    let mut policy = if args.input_product == ProductType::Hls
        && args.output_product == ProductType::DswxHls
        && args.linkage == OutputLinkage::Manifest
    {
        MultiplicityPolicy::dswx_hls(Some(config.accountability.landsat9_cutoff))
    } else {
        MultiplicityPolicy::new(args.input_product, args.linkage)
    };
    policy.allow_fan_out = args
        .allow_fan_out
        .unwrap_or(config.accountability.allow_fan_out);

    let report = AccountabilityMapper::new(policy, args.search.period).map(&inputs, &outputs);
    Ok(AuditOutput::Accountability(report))
}

fn run_composite(
    args: &CompositeArgs,
    config: &ResolvedConfig,
) -> Result<AuditOutput, AuditError> {
    let client = client_for(&args.search, config)?;
    let queries = build_queries(
        &args.search,
        config,
        args.product,
        Some(config.composite.bounding_box),
    )?;
    let validator_config = ValidatorConfig::new(
        args.input_product,
        args.max_time_span_minutes
            .unwrap_or(config.composite.max_time_span_minutes),
    )?;
    let validator = CompositeValidator::new(&client, validator_config);
    let granules = queries.into_iter().flat_map(|query| client.search(query));
    let report = validator.validate(granules)?;
    Ok(AuditOutput::Composite(report))
}

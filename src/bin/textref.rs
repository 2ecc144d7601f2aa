use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use textref_reconciler::app::{App, PopulateOptions};
use textref_reconciler::config::ConfigLoader;
use textref_reconciler::documents::DocumentSource;
use textref_reconciler::domain::IdentifierSpecifier;
use textref_reconciler::error::ReconcileError;
use textref_reconciler::metadata::MetadataReader;
use textref_reconciler::output::{HumanOutput, JsonOutput, OutputMode, ReviewWriter};
use textref_reconciler::store::{LocalStore, StoreLayout};

#[derive(Parser)]
#[command(name = "textref")]
#[command(about = "Reconcile literature identifiers against a canonical text reference store")]
#[command(version, author)]
struct Cli {
    /// Print machine-readable JSON instead of a summary
    #[arg(long, global = true)]
    json: bool,

    /// Store root (defaults to ./.textref when present, else the user data dir)
    #[arg(long, global = true)]
    store: Option<Utf8PathBuf>,

    /// Config file (defaults to ./textref.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Reconcile a metadata feed and link its content")]
    Populate(PopulateArgs),
    #[command(about = "Show text refs matching pmid:/pmcid:/doi:/id: specifier")]
    Lookup(LookupArgs),
    #[command(about = "Count text refs and content rows")]
    Stats,
    #[command(about = "Pick the preferred content row per text ref")]
    Preferred(PreferredArgs),
}

#[derive(Args)]
struct PopulateArgs {
    /// metadata.csv or metadata.csv.gz
    #[arg(long)]
    metadata: PathBuf,

    /// Directory or zip archive of document JSON parses
    #[arg(long)]
    documents: Option<Utf8PathBuf>,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long)]
    dry_run: bool,

    /// Skip abstract and full-text linking
    #[arg(long)]
    no_content: bool,

    /// Review file path (defaults to <store>/reviews/review-<timestamp>.csv)
    #[arg(long)]
    review: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct LookupArgs {
    specifier: String,
}

#[derive(Args)]
struct PreferredArgs {
    specifier: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ReconcileError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ReconcileError) -> u8 {
    match error {
        ReconcileError::NotFound(_)
        | ReconcileError::MissingInput(_)
        | ReconcileError::ConfigRead(_) => 2,
        ReconcileError::StoreQuery(_) | ReconcileError::StoreWrite(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Commands::Populate(args) = &cli.command {
        if let Some(chunk_size) = args.chunk_size {
            if chunk_size == 0 {
                return Err(ReconcileError::InvalidChunkSize.into());
            }
            config.reconcile.chunk_size = chunk_size;
        }
    }

    let layout = StoreLayout::resolve(cli.store.as_deref())?;
    let store = LocalStore::open(layout)?;
    let app = App::new(store, config);

    match cli.command {
        Commands::Populate(args) => run_populate(args, app, output_mode),
        Commands::Lookup(args) => run_lookup(args, app, output_mode),
        Commands::Stats => run_stats(app, output_mode),
        Commands::Preferred(args) => run_preferred(args, app, output_mode),
    }
}

fn run_populate(
    args: PopulateArgs,
    mut app: App<LocalStore>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let entries = MetadataReader::open(&args.metadata)?.read_all()?;
    let mut documents = match &args.documents {
        Some(path) => Some(DocumentSource::open(path)?),
        None => None,
    };
    let options = PopulateOptions {
        dry_run: args.dry_run,
        with_content: !args.no_content,
    };

    let result = match output_mode {
        OutputMode::Json => app.populate(entries, documents.as_mut(), options, &JsonOutput),
        OutputMode::Human => app.populate(entries, documents.as_mut(), options, &HumanOutput),
    }?;

    let review_path = if result.review.is_empty() {
        None
    } else {
        let path = match args.review {
            Some(path) => path,
            None => {
                let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
                app.store().layout().review_path(&stamp)
            }
        };
        ReviewWriter::write(&path, &result.review)?;
        Some(path)
    };

    match output_mode {
        OutputMode::Json => JsonOutput::print_populate(&result).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_populate(&result, review_path.as_deref()),
    }
    Ok(())
}

fn run_lookup(
    args: LookupArgs,
    app: App<LocalStore>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let specifier = args.specifier.parse::<IdentifierSpecifier>()?;
    match output_mode {
        OutputMode::Json => {
            let result = app.lookup(&specifier, &JsonOutput)?;
            JsonOutput::print_lookup(&result).into_diagnostic()?;
        }
        OutputMode::Human => {
            let result = app.lookup(&specifier, &HumanOutput)?;
            HumanOutput::print_lookup(&result);
        }
    }
    Ok(())
}

fn run_stats(app: App<LocalStore>, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => {
            let result = app.stats(&JsonOutput)?;
            JsonOutput::print_stats(&result).into_diagnostic()?;
        }
        OutputMode::Human => {
            let result = app.stats(&HumanOutput)?;
            HumanOutput::print_stats(&result);
        }
    }
    Ok(())
}

fn run_preferred(
    args: PreferredArgs,
    app: App<LocalStore>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let specifier = args
        .specifier
        .as_deref()
        .map(str::parse::<IdentifierSpecifier>)
        .transpose()?;
    match output_mode {
        OutputMode::Json => {
            let result = app.preferred(specifier.as_ref(), &JsonOutput)?;
            JsonOutput::print_preferred(&result).into_diagnostic()?;
        }
        OutputMode::Human => {
            let result = app.preferred(specifier.as_ref(), &HumanOutput)?;
            HumanOutput::print_preferred(&result);
        }
    }
    Ok(())
}

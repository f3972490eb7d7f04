use std::fs;
use std::io::{self, Read};
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use datacatalog::app::Catalog;
use datacatalog::config::{Config, ConfigLoader, ResolvedConfig};
use datacatalog::domain::CatalogId;
use datacatalog::error::CatalogError;
use datacatalog::output::JsonOutput;
use datacatalog::record::RecordKind;
use datacatalog::storage::PosixStorage;
use datacatalog::store::{Document, Filter, JsonDirStore};

type LocalCatalog = Catalog<JsonDirStore, PosixStorage>;

#[derive(Parser)]
#[command(name = "datacatalog")]
#[command(about = "Catalog of uploaded lab files, samples and measurements")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./datacatalog.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Directory holding the catalog collections
    #[arg(long, global = true)]
    database: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Reconcile, show or delete file records")]
    File(FileArgs),
    #[command(about = "Reconcile, associate or delete sample records")]
    Sample(KeyedArgs),
    #[command(about = "Reconcile, associate or delete measurement records")]
    Measurement(KeyedArgs),
    #[command(about = "Index a file or every file under a directory")]
    Dispatch(IndexArgs),
    #[command(about = "List records matching an equality filter")]
    Query(QueryArgs),
}

#[derive(Args)]
struct FileArgs {
    #[command(subcommand)]
    command: FileCommand,
}

#[derive(Subcommand)]
enum FileCommand {
    #[command(about = "Create or refresh the record for one file")]
    Index(IndexArgs),
    #[command(about = "Print the stored record for a file")]
    Show(PathArgs),
    #[command(about = "Delete the record for a file")]
    Delete(PathArgs),
}

#[derive(Args)]
struct IndexArgs {
    uri: String,

    /// Provenance identifier; may be repeated
    #[arg(long = "generated-by")]
    generated_by: Vec<String>,
}

#[derive(Args)]
struct PathArgs {
    path: String,
}

#[derive(Args)]
struct KeyedArgs {
    #[command(subcommand)]
    command: KeyedCommand,
}

#[derive(Subcommand)]
enum KeyedCommand {
    #[command(about = "Create or update a record from a JSON document (`-` reads stdin)")]
    Upsert { input: String },
    #[command(about = "Delete records by natural id")]
    Delete { id: String },
    #[command(about = "Replace the related uuid list of an existing record")]
    Associate {
        uuid: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Args)]
struct QueryArgs {
    kind: RecordKind,

    /// JSON object of dotted-path equality conditions
    filter: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(catalog) = report.downcast_ref::<CatalogError>() {
            return ExitCode::from(map_exit_code(catalog));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CatalogError) -> u8 {
    match error {
        CatalogError::Data(_)
        | CatalogError::Query(_)
        | CatalogError::MissingConfig
        | CatalogError::ConfigRead(_)
        | CatalogError::ConfigParse(_) => 2,
        CatalogError::Database(_) | CatalogError::Storage(_) => 3,
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
    let config = load_config(cli.config.as_deref())?;
    let database = match cli.database.or_else(|| config.database_path.clone()) {
        Some(path) => path,
        None => JsonDirStore::default_root()?,
    };
    let store = JsonDirStore::open(database)?;
    let storage = PosixStorage::new(
        config.storage.system.clone(),
        config.storage.base.clone(),
    );
    let catalog = Catalog::new(store, storage, &config);

    match cli.command {
        Commands::File(args) => run_file(&catalog, args.command),
        Commands::Sample(args) => run_keyed(&catalog, RecordKind::Sample, args.command),
        Commands::Measurement(args) => {
            run_keyed(&catalog, RecordKind::Measurement, args.command)
        }
        Commands::Dispatch(args) => {
            let summary = catalog.dispatch_indexing(&args.uri, &args.generated_by)?;
            JsonOutput::print_index(&summary).into_diagnostic()
        }
        Commands::Query(args) => {
            let filter = match args.filter {
                Some(raw) => {
                    let value: Value = serde_json::from_str(&raw)
                        .map_err(|err| CatalogError::Query(format!("invalid filter: {err}")))?;
                    Filter::from_json(&value)?
                }
                None => Filter::new(),
            };
            let result = catalog.query(args.kind, &filter)?;
            JsonOutput::print_query(&result).into_diagnostic()
        }
    }
}

fn load_config(path: Option<&str>) -> miette::Result<ResolvedConfig> {
    match ConfigLoader::resolve(path) {
        Ok(config) => Ok(config),
        Err(CatalogError::MissingConfig) => Ok(ConfigLoader::resolve_config(Config::default())?),
        Err(err) => Err(err.into()),
    }
}

fn run_file(catalog: &LocalCatalog, command: FileCommand) -> miette::Result<()> {
    match command {
        FileCommand::Index(args) => {
            let record = catalog
                .reconciler()
                .reconcile_file_with_provenance(&args.uri, &args.generated_by)?;
            JsonOutput::print_record(&record).into_diagnostic()
        }
        FileCommand::Show(args) => match catalog.show_file(&args.path)? {
            Some(record) => JsonOutput::print_record(&record).into_diagnostic(),
            None => JsonOutput::print_missing(&args.path).into_diagnostic(),
        },
        FileCommand::Delete(args) => {
            let result = catalog.delete_file(&args.path)?;
            JsonOutput::print_delete(&result).into_diagnostic()
        }
    }
}

fn run_keyed(catalog: &LocalCatalog, kind: RecordKind, command: KeyedCommand) -> miette::Result<()> {
    match command {
        KeyedCommand::Upsert { input } => {
            let document = read_document(&input)?;
            let record = match kind {
                RecordKind::Sample => catalog.reconcile_sample(document)?,
                _ => catalog.reconcile_measurement(document)?,
            };
            JsonOutput::print_record(&record).into_diagnostic()
        }
        KeyedCommand::Delete { id } => {
            let result = match kind {
                RecordKind::Sample => catalog.delete_sample(&id)?,
                _ => catalog.delete_measurement(&id)?,
            };
            JsonOutput::print_delete(&result).into_diagnostic()
        }
        KeyedCommand::Associate { uuid, ids } => {
            let uuid: CatalogId = uuid.parse()?;
            let record = match kind {
                RecordKind::Sample => catalog.associate_measurements(&uuid, ids)?,
                _ => catalog.associate_files(&uuid, ids)?,
            };
            JsonOutput::print_record(&record).into_diagnostic()
        }
    }
}

fn read_document(input: &str) -> miette::Result<Document> {
    let raw = if input == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer).into_diagnostic()?;
        buffer
    } else {
        fs::read_to_string(input).into_diagnostic()?
    };
    match serde_json::from_str::<Value>(&raw).into_diagnostic()? {
        Value::Object(document) => Ok(document),
        _ => Err(CatalogError::Data(format!("{input} does not hold a JSON object")).into()),
    }
}

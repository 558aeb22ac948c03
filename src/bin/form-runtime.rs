use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use form_runtime::master::{FileMasterSource, HttpMasterSource, MasterDataManager, MasterDataSource};
use form_runtime::{Error, FormDefinition, FormSession, RuntimeConfig, Services};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Run declarative form rules", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a schema and report dependency warnings
    Check {
        schema: PathBuf,
    },
    /// Open a session, replay edits and print the resulting snapshot
    Run {
        schema: PathBuf,

        /// JSON array of edits to apply in order
        #[arg(short, long)]
        edits: Option<PathBuf>,

        /// Previously saved answers to open the session with
        #[arg(short, long)]
        answers: Option<PathBuf>,

        /// JSON file of master datasets
        #[arg(long, conflicts_with = "master_url")]
        masters: Option<PathBuf>,

        /// Base URL of a master data service
        #[arg(long)]
        master_url: Option<String>,

        /// Also print submit issues
        #[arg(long)]
        validate: bool,
    },
}

/// One step of an edit script.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Step {
    Edit {
        address: String,
        value: JsonValue,
    },
    RemoveRow {
        #[serde(rename = "removeRow")]
        remove_row: String,
        index: usize,
    },
    AddRow {
        #[serde(rename = "addRow")]
        add_row: String,
    },
}

fn read_json(path: &Path) -> Result<JsonValue, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Internal(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", path.display(), e)))
}

fn load_definition(path: &Path) -> Result<FormDefinition, Error> {
    let definition = FormDefinition::from_file(path)?;
    for warning in definition.warnings() {
        warn!("{}", warning);
    }
    Ok(definition)
}

async fn run(cli: Cli) -> Result<(), Error> {
    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    debug!("config: {:?}", config);

    match cli.command {
        Command::Check { schema } => {
            let definition = load_definition(&schema)?;
            println!(
                "{}: {} field(s), {} warning(s)",
                schema.display(),
                definition.schema().len(),
                definition.warnings().len()
            );
            for warning in definition.warnings() {
                println!("  {}", warning);
            }
        }
        Command::Run {
            schema,
            edits,
            answers,
            masters,
            master_url,
            validate,
        } => {
            let definition = load_definition(&schema)?;
            let source: Option<Arc<dyn MasterDataSource>> = match (masters, master_url) {
                (Some(path), _) => {
                    let source: Arc<dyn MasterDataSource> = Arc::new(FileMasterSource::from_file(path)?);
                    Some(source)
                }
                (None, Some(url)) => {
                    let source: Arc<dyn MasterDataSource> =
                        Arc::new(HttpMasterSource::new(&url, config.master.request_timeout)?);
                    Some(source)
                }
                (None, None) => None,
            };
            let mut services = Services::default();
            if let Some(source) = source {
                services = services.with_masters(Arc::new(MasterDataManager::new(
                    source,
                    config.master.clone(),
                )));
            }

            let initial = match answers {
                Some(path) => read_json(&path)?,
                None => JsonValue::Null,
            };
            let (mut session, report) =
                FormSession::open_with_answers(definition, config, services, initial).await;
            info!("Session {} opened, {} change(s)", session.id(), report.changed.len());

            let steps: Vec<Step> = match edits {
                Some(path) => serde_json::from_value(read_json(&path)?)
                    .map_err(|e| Error::Internal(format!("Invalid edit script: {}", e)))?,
                None => Vec::new(),
            };
            for step in steps {
                debug!("Applying {:?}", step);
                let report = match step {
                    Step::Edit { address, value } => session.apply_edit(&address, value).await?,
                    Step::AddRow { add_row } => session.add_row(&add_row).await?.1,
                    Step::RemoveRow { remove_row, index } => {
                        session.remove_row(&remove_row, index).await?
                    }
                };
                for diagnostic in &report.diagnostics {
                    warn!("{}: {}", diagnostic.address, diagnostic.message);
                }
            }
            let settled = session.settle().await;
            debug!("Settled {} async result(s)", settled.changed.len());

            let snapshot = session.snapshot();
            let mut output = serde_json::to_value(&snapshot)
                .map_err(|e| Error::Internal(format!("Failed to encode snapshot: {}", e)))?;
            if validate {
                let issues = serde_json::to_value(session.validate_for_submit())
                    .map_err(|e| Error::Internal(format!("Failed to encode issues: {}", e)))?;
                if let JsonValue::Object(map) = &mut output {
                    map.insert("issues".to_string(), issues);
                }
            }
            let text = serde_json::to_string_pretty(&output)
                .map_err(|e| Error::Internal(format!("Failed to encode snapshot: {}", e)))?;
            println!("{}", text);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

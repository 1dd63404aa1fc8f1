//! Datastack CLI - inspect and edit a data stack from the command line

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use crossbeam::channel;
use datastack::config::{self, StackConfig};
use datastack::ui::{self, Icons};
use datastack::{DataStorage, Entity, FetchRequest, Model, Predicate, SortKey, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long the CLI waits for a save to report back
const SAVE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "datastack")]
#[command(version)]
#[command(about = "Layered persistence over SQLite - inspect and edit a data stack")]
#[command(long_about = r#"
Datastack keeps application records in an embedded SQLite store described by
a model file. Changes are staged in contexts and cascade up to the store.

Example usage:
  datastack init --name library
  datastack insert Book title=Dune pages=412
  datastack find Book --where "pages > 300" --sort title
  datastack remove Book --where "title == 'Dune'"
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the stack configuration
    #[arg(short, long, global = true, default_value = "datastack.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration and create the store
    Init {
        /// Stack name; names the store and model files
        #[arg(short, long)]
        name: String,

        /// Overwrite an existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show row counts per entity
    Stats,

    /// Print matching records as JSON
    Find {
        /// Entity name
        entity: String,

        /// Filter, e.g. "pages > 300 AND title LIKE 'D%'"
        #[arg(short, long = "where")]
        filter: Option<String>,

        /// Sort key, `field` or `field:desc`; repeatable
        #[arg(short, long)]
        sort: Vec<SortKey>,

        /// Maximum number of records
        #[arg(short, long)]
        limit: Option<usize>,

        /// Print only the first match
        #[arg(long)]
        first: bool,
    },

    /// Insert one record from field=value pairs
    Insert {
        /// Entity name
        entity: String,

        /// Field assignments
        #[arg(required = true)]
        fields: Vec<String>,
    },

    /// Remove every record matching a filter
    Remove {
        /// Entity name
        entity: String,

        /// Filter selecting the records to remove
        #[arg(short, long = "where")]
        filter: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { name, force } => {
            let base = base_dir(&cli.config);
            let stack_config = StackConfig::new(name);
            config::write_config(&cli.config, &stack_config, force)?;

            let model_path = stack_config.model_path(&base);
            if !model_path.exists() {
                let model = Model::new(stack_config.name.clone(), 1);
                std::fs::write(&model_path, model.to_toml_string()?)?;
                ui::status(Icons::CHECK, "Model", &model_path.display().to_string());
            }

            let stack = open_stack(&cli.config, &stack_config)?;
            ui::status(
                Icons::DATABASE,
                "Store",
                &stack_config.database_path(&base).display().to_string(),
            );
            ui::success(&format!(
                "Initialized stack '{}' ({} entities)",
                stack_config.name,
                stack.model().entities.len()
            ));
        }

        Commands::Stats => {
            let stack = open_configured(&cli.config)?;
            let stats = stack.stats()?;

            ui::header(
                Icons::STATS,
                &format!("{} v{} ({})", stats.model, stats.version, stats.path.display()),
            );
            if stats.entities.is_empty() {
                println!("No entities in the model.");
            } else {
                println!("{}", ui::stats_table(&stats));
            }
        }

        Commands::Find { entity, filter, sort, limit, first } => {
            let stack = open_configured(&cli.config)?;
            let mut request = FetchRequest::new(entity);
            if let Some(filter) = filter {
                request = request.filter(Predicate::parse(&filter)?);
            }
            for key in sort {
                request = request.sort_by(key);
            }
            if first {
                request = request.limit(1);
            } else if let Some(limit) = limit {
                request = request.limit(limit);
            }

            let found = stack.fetch(request)?;
            if first {
                println!("{}", serde_json::to_string_pretty(&found.first())?);
            } else {
                println!("{}", serde_json::to_string_pretty(&found)?);
            }
        }

        Commands::Insert { entity, fields } => {
            let stack = open_configured(&cli.config)?;
            let record = parse_record(stack.model(), &entity, &fields)?;
            let id = record.id;

            let saved = wait_for(|done| {
                stack.save_and_wait(move |ctx| ctx.insert(record), done);
            })?;
            if !saved {
                anyhow::bail!("insert into {} failed; see the log for details", entity);
            }
            ui::success(&format!("Inserted {} {}", entity, id));
        }

        Commands::Remove { entity, filter } => {
            let stack = open_configured(&cli.config)?;
            let predicate = Predicate::parse(&filter)?;
            let doomed = stack.fetch(FetchRequest::new(entity.clone()).filter(predicate))?;
            if doomed.is_empty() {
                println!("No matching {} records.", entity);
                return Ok(());
            }

            let count = doomed.len();
            let removed = wait_for(|done| {
                stack.remove(
                    move |ctx| doomed.iter().try_for_each(|record| ctx.delete(record)),
                    done,
                );
            })?;
            if !removed {
                anyhow::bail!("removing from {} failed; see the log for details", entity);
            }
            ui::success(&format!("Removed {} {} record(s)", count, entity));
        }
    }

    Ok(())
}

/// Directory that relative paths in the configuration are resolved against
fn base_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn open_configured(config_path: &Path) -> anyhow::Result<DataStorage> {
    let stack_config = config::load_config(Some(config_path))?.with_context(|| {
        format!(
            "no configuration at {} (run `datastack init --name <name>` first)",
            config_path.display()
        )
    })?;
    open_stack(config_path, &stack_config)
}

fn open_stack(config_path: &Path, stack_config: &StackConfig) -> anyhow::Result<DataStorage> {
    let base = base_dir(config_path);
    let model_path = stack_config.model_path(&base);
    let model = Model::load(&model_path)
        .with_context(|| format!("loading model {}", model_path.display()))?;

    let db_path = stack_config.database_path(&base);
    config::ensure_db_dir(&db_path)?;
    let stack = DataStorage::open_with(&db_path, model, stack_config.worker_threads)?;

    if let Some(loss) = stack.migration_report() {
        ui::warn(&loss.to_string());
    }
    Ok(stack)
}

/// Build a record from `field=value` arguments, typed by the model
fn parse_record(model: &Model, entity: &str, assignments: &[String]) -> anyhow::Result<Entity> {
    let description = model.require_entity(entity)?;
    let mut record = Entity::new(entity);
    for assignment in assignments {
        let (field, raw) = assignment
            .split_once('=')
            .with_context(|| format!("expected field=value, got '{}'", assignment))?;
        let field = description.require_field(field.trim())?;
        let value = Value::parse_as(raw, field.ty)?;
        record.set(field.name.clone(), value);
    }
    Ok(record)
}

/// Run a save-style call and wait for its completion
fn wait_for(start: impl FnOnce(Box<dyn FnOnce(bool) + Send>)) -> anyhow::Result<bool> {
    let (tx, rx) = channel::bounded(1);
    start(Box::new(move |ok| {
        let _ = tx.send(ok);
    }));
    rx.recv_timeout(SAVE_TIMEOUT)
        .context("timed out waiting for the store")
}

#[cfg(test)]
mod tests {
    use super::*;
    use datastack::{EntityDescription, FieldType};

    #[test]
    fn test_parse_record_types_values() {
        let model = Model::new("Library", 1).entity(
            EntityDescription::new("Book")
                .field("title", FieldType::Text)
                .optional_field("pages", FieldType::Integer),
        );
        let args = vec!["title=Dune".to_string(), "pages=412".to_string()];
        let record = parse_record(&model, "Book", &args).unwrap();
        assert_eq!(record.get_str("title"), Some("Dune"));
        assert_eq!(record.get_i64("pages"), Some(412));

        assert!(parse_record(&model, "Book", &["pages=many".to_string()]).is_err());
        assert!(parse_record(&model, "Book", &["isbn=1".to_string()]).is_err());
        assert!(parse_record(&model, "Book", &["title".to_string()]).is_err());
    }

    #[test]
    fn test_base_dir_of_bare_file_is_cwd() {
        assert_eq!(base_dir(Path::new("datastack.toml")), PathBuf::from("."));
        assert_eq!(base_dir(Path::new("conf/datastack.toml")), PathBuf::from("conf"));
    }
}

use anyhow::{Result, bail};
use clap::Parser;
use colldex::config::Config;
use colldex::model::{CodeType, EntityType};
use colldex::sampler::JsonDirSource;
use colldex::{cli, db, indexer, logging};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn default_db_path(repo: &Path) -> PathBuf {
    repo.join(".colldex").join("colldex.sqlite")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    logging::init(args.verbose);

    match args.command {
        cli::Command::Scan {
            repo,
            db,
            no_ignore,
            repository,
            commit,
            concurrency,
            sample_dir,
            sample_ceiling,
            timeout_secs,
        } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&repo));
            let mut settings = indexer::ScanSettings::from_config(Config::get());
            settings.scan_options = indexer::scan::ScanOptions::new(no_ignore);
            settings.repository = repository;
            settings.commit = commit;
            if let Some(concurrency) = concurrency {
                settings.concurrency = concurrency.max(1);
            }
            if let Some(ceiling) = sample_ceiling {
                settings.sample_ceiling = ceiling;
            }
            if let Some(secs) = timeout_secs {
                settings.deadline = Some(Duration::from_secs(secs));
            }
            if let Some(dir) = sample_dir {
                settings = settings.with_sample_source(Arc::new(JsonDirSource::new(dir)));
            }
            let indexer = indexer::Indexer::with_settings(repo, db_path, settings)?;
            let summary = indexer.scan()?;
            print_json(&summary)
        }
        cli::Command::Sample {
            repo,
            db,
            sample_dir,
            collection,
            size,
            sample_ceiling,
            seed,
        } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&repo));
            let mut source = JsonDirSource::new(sample_dir);
            if let Some(seed) = seed {
                source = source.with_seed(seed);
            }
            let mut settings =
                indexer::ScanSettings::from_config(Config::get()).with_sample_source(Arc::new(source));
            if let Some(ceiling) = sample_ceiling {
                settings.sample_ceiling = ceiling;
            }
            let indexer = indexer::Indexer::with_settings(repo, db_path, settings)?;
            let schema = indexer.sample(&collection, size)?;
            print_json(&schema)
        }
        cli::Command::Search {
            repo,
            db,
            query,
            entity,
            limit,
        } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&repo));
            let entity_type = match entity.as_deref() {
                Some(raw) => match EntityType::parse(raw) {
                    Some(entity_type) => Some(entity_type),
                    None => bail!("unknown entity type: {raw}"),
                },
                None => None,
            };
            let db = db::Db::open(&db_path)?;
            let entries = db.search(&query, entity_type, limit)?;
            print_json(&entries)
        }
        cli::Command::Overview { repo, db } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&repo));
            let db = db::Db::open(&db_path)?;
            print_json(&db.overview()?)
        }
        cli::Command::Relationships {
            repo,
            db,
            type_name,
            min_confidence,
        } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&repo));
            let db = db::Db::open(&db_path)?;
            let types = db.types_by_name(&type_name)?;
            if types.is_empty() {
                bail!("no code type named {type_name}");
            }
            let mut out = Vec::new();
            for code_type in types {
                let mut relationships = Vec::new();
                for rel in db.relationships_for_type(&code_type.id)? {
                    if rel.confidence < min_confidence {
                        continue;
                    }
                    let other_id = if rel.source_type_id == code_type.id {
                        &rel.target_type_id
                    } else {
                        &rel.source_type_id
                    };
                    let other = db
                        .get::<CodeType>(other_id)?
                        .map(|t| t.qualified_name());
                    relationships.push(json!({
                        "relationship": rel,
                        "other_type": other,
                    }));
                }
                out.push(json!({
                    "type": code_type.qualified_name(),
                    "id": code_type.id,
                    "relationships": relationships,
                }));
            }
            print_json(&out)
        }
    }
}

use scenelink::cli::Args;
use scenelink::config::{self, SyncSettings};
use scenelink::core::PassReport;
use scenelink::entities::transform::decompose;
use scenelink::entities::{MemoryScene, PropertyBatch, RecordingDestination};
use scenelink::SyncSession;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn init_logging(args: &Args, path_config: &config::PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));

        let file = fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn load_batch(path: &Path) -> Result<PropertyBatch> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read property batch: {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Failed to parse property batch: {}", path.display()))
}

fn print_report(report: &PassReport) {
    println!(
        "pass {}: {} records, {} created, {} erased ({} bones), {} exported properties",
        report.pass,
        report.touched,
        report.created,
        report.erased.records,
        report.erased.bones,
        report.properties.len()
    );
    for path in &report.renamed {
        println!("  renamed: {}", path);
    }
    if let Some(groups) = &report.instances {
        for (path, transforms) in groups {
            println!("  instances: {} x{}", path, transforms.len());
            for world in transforms {
                let (t, r, s) = decompose(*world);
                debug!("    t={:?} r={:?} s={:?}", t, r, s);
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Create path configuration from CLI args and environment
    let path_config = config::PathConfig::from_env_and_cli(args.config_dir.clone());

    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config)?;

    info!("scenelink {} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(|| config::config_file(config::SETTINGS_FILE, &path_config));
    let mut settings = SyncSettings::load_or_default(&settings_path)?;
    if let Some(workers) = args.workers {
        settings.workers = workers;
    }
    info!("Settings: {} ({} workers)", settings_path.display(), settings.worker_count());

    let scene = Arc::new(MemoryScene::from_json(&args.scene)?);
    let destination = Arc::new(RecordingDestination::new());
    let interval = Duration::from_millis(settings.auto_sync_interval_ms);
    let mut session = SyncSession::new(scene, destination.clone(), settings)?;

    let import = args.import.as_deref().map(load_batch).transpose()?;
    let mut exported = PropertyBatch::new();

    for i in 0..args.passes {
        if i > 0 {
            thread::sleep(interval);
        }

        let report = session.sync_pass().context("Sync pass failed")?;
        print_report(&report);
        exported.extend(report.properties);

        if i == 0 {
            if let Some(batch) = &import {
                let imported = session.import_properties(batch);
                println!(
                    "import: {} applied, {} skipped, {} objects recomputed",
                    imported.applied,
                    imported.skipped,
                    imported.recomputed.len()
                );
            }
        }
    }

    if let Some(path) = &args.export {
        let json = serde_json::to_string_pretty(&exported).context("Serialize property batch error")?;
        fs::write(path, json).with_context(|| format!("Failed to write property batch: {}", path.display()))?;
        info!("Exported {} properties to {}", exported.len(), path.display());
    }

    let stats = destination.stats();
    println!(
        "destination: {} live, {} created, {} renamed, {} released",
        stats.live, stats.created, stats.renamed, stats.released
    );

    session.teardown();
    Ok(())
}

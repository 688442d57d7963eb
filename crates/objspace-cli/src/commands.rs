use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use objspace_crypto::{ContentHasher, HashFunction};
use objspace_space::{ContainerSummary, ObjectSpace, SpaceError, VerifyReport};
use objspace_store::{open_file, read_header, ErrorKind, FileHeader, StorageConfig, StreamContainer};
use serde_json::json;
use tracing::debug;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config.as_deref();
    match cli.command {
        Command::Info(args) => cmd_info(&args.file, config, cli.format),
        Command::Verify(args) => cmd_verify(&args.file, config, cli.format),
        Command::Sectors(args) => cmd_sectors(&args, config, cli.format),
    }
}

fn hasher() -> Arc<dyn HashFunction> {
    Arc::new(ContentHasher::MERKLE)
}

/// Read-only configuration for `file`, page size taken from its header.
fn storage_config(file: &Path, config: Option<&Path>) -> anyhow::Result<(StorageConfig, FileHeader)> {
    let base = match config {
        Some(path) => StorageConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => StorageConfig::default(),
    };
    let header = read_header(file).with_context(|| format!("reading header of {}", file.display()))?;
    let config = StorageConfig {
        file_path: file.to_path_buf(),
        page_size: header.page_size as usize,
        read_only: true,
        commit_on_drop: false,
        ..base
    };
    Ok((config, header))
}

/// Load `config` as an object space; `None` if the file holds plain
/// content.
fn load_space(config: &StorageConfig) -> anyhow::Result<Option<ObjectSpace>> {
    match ObjectSpace::load(config, hasher()) {
        Ok(space) => Ok(Some(space)),
        Err(err @ SpaceError::Store(_)) if err.kind() == ErrorKind::Format => {
            debug!(error = %err, "not an object space");
            Ok(None)
        }
        Err(err) => Err(err).context("opening object space"),
    }
}

fn cmd_info(file: &Path, config: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let (config, header) = storage_config(file, config)?;
    let containers = match load_space(&config)? {
        Some(space) => Some(space.summary()?),
        None => None,
    };
    match format {
        OutputFormat::Json => {
            let value = json!({
                "file": file.display().to_string(),
                "version": header.version,
                "page_size": header.page_size,
                "digest_size": header.digest_size,
                "content_length": header.content_length,
                "commits": header.commit_count,
                "root": header.root.to_hex(),
                "containers": containers.as_deref().map(|list| {
                    list.iter().map(summary_json).collect::<Vec<_>>()
                }),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            println!("{} {}", "File:".bold(), file.display());
            println!("  Format version: {}", header.version);
            println!("  Page size: {} bytes", header.page_size);
            println!("  Digest size: {} bytes", header.digest_size);
            println!("  Content: {} bytes", header.content_length);
            println!("  Commits: {}", header.commit_count);
            println!("  Root: {}", header.root.to_hex().cyan());
            match containers {
                Some(list) => {
                    println!("{}", "Containers:".bold());
                    for c in list {
                        let layout = match c.fixed_size {
                            Some(size) => format!("fixed {size} B"),
                            None => "variable".to_string(),
                        };
                        let root = c.root.map(|r| r.short_hex()).unwrap_or_else(|| "-".into());
                        println!(
                            "  {:<20} {:>8} objects  {:>8} slots  {:<12} root {}",
                            c.name.yellow(),
                            c.objects,
                            c.slots,
                            layout,
                            root.cyan()
                        );
                    }
                }
                None => println!("  (not an object space)"),
            }
        }
    }
    Ok(())
}

fn summary_json(c: &ContainerSummary) -> serde_json::Value {
    json!({
        "name": c.name,
        "objects": c.objects,
        "slots": c.slots,
        "fixed_size": c.fixed_size,
        "root": c.root.as_ref().map(|r| r.to_hex()),
    })
}

fn cmd_verify(file: &Path, config: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let (config, _) = storage_config(file, config)?;
    let report = match load_space(&config)? {
        Some(mut space) => space.verify()?,
        None => {
            let mut content = open_file(&config, hasher())
                .with_context(|| format!("opening {}", file.display()))?;
            VerifyReport {
                file_root: content.root(),
                file_ok: content.verify()?,
                containers: Vec::new(),
            }
        }
    };
    match format {
        OutputFormat::Json => {
            let value = json!({
                "file": file.display().to_string(),
                "ok": report.is_ok(),
                "root": report.file_root.to_hex(),
                "root_ok": report.file_ok,
                "containers": report.containers.iter().map(|c| json!({
                    "name": c.name,
                    "objects": c.objects,
                    "root": c.root.as_ref().map(|r| r.to_hex()),
                    "ok": c.ok,
                })).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            println!("  File root: {} {}", report.file_root.short_hex().cyan(), mark(report.file_ok));
            for c in &report.containers {
                println!("  {:<20} {:>8} objects {}", c.name.yellow(), c.objects, mark(c.ok));
            }
        }
    }
    if !report.is_ok() {
        bail!("{} failed verification", file.display());
    }
    if format == OutputFormat::Text {
        println!("{} Integrity verified", "✓".green().bold());
    }
    Ok(())
}

fn mark(ok: bool) -> colored::ColoredString {
    if ok {
        "ok".green()
    } else {
        "MISMATCH".red().bold()
    }
}

fn cmd_sectors(args: &SectorArgs, config: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let (config, _) = storage_config(&args.file, config)?;
    let cluster_size = args.cluster_size.unwrap_or(config.cluster_size);
    let content = open_file(&config, hasher())
        .with_context(|| format!("opening {}", args.file.display()))?;
    let container = StreamContainer::open(content, cluster_size, config.container_policy)
        .context("reading sector store")?;
    let stats = container.stats();
    match format {
        OutputFormat::Json => {
            let value = json!({
                "sector_size": stats.sector_size,
                "sectors": stats.sectors,
                "free_sectors": stats.free_sectors,
                "streams": stats.streams.iter().enumerate().map(|(id, (length, capacity))| json!({
                    "id": id,
                    "length": length,
                    "capacity": capacity,
                })).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            println!("{} {}", "Sectors:".bold(), args.file.display());
            println!("  Sector size: {} bytes", stats.sector_size);
            println!("  Sectors: {} ({} free)", stats.sectors, stats.free_sectors.to_string().green());
            println!("  {:>6} {:>12} {:>10}", "stream", "length", "sectors");
            for (id, (length, capacity)) in stats.streams.iter().enumerate() {
                println!("  {id:>6} {length:>12} {capacity:>10}");
            }
        }
    }
    Ok(())
}

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use strata_op::{Definition, Platform};
use strata_solver::{
  DryRunWorker, FsCache, LoadOverrides, Solver, SolverConfig, VertexStatus, load, render,
};

/// Strata - a content-addressed build graph
#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.strata)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Validate a definition and print its graph
  Inspect {
    /// Path to the definition JSON, or `-` for stdin
    definition: PathBuf,
  },

  /// Solve a definition with the dry-run worker
  Solve {
    /// Path to the definition JSON, or `-` for stdin
    definition: PathBuf,

    /// Maximum number of vertices executing at once
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Salt mixed into every cache key
    #[arg(long)]
    cache_salt: Option<String>,

    /// Ignore cached results
    #[arg(long)]
    no_cache: bool,

    /// Platform for ops that don't name one, e.g. linux/arm64
    #[arg(long)]
    platform: Option<Platform>,
  },

  /// Replace a source identifier and print the rewritten definition
  Pin {
    /// Path to the definition JSON, or `-` for stdin
    definition: PathBuf,

    /// OLD=NEW source identifier replacement, may be repeated
    #[arg(long = "source", value_parser = parse_replacement, required = true)]
    sources: Vec<(String, String)>,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  match cli.command {
    Some(Commands::Inspect { definition }) => inspect(&definition)?,
    Some(Commands::Solve {
      definition,
      max_concurrency,
      cache_salt,
      no_cache,
      platform,
    }) => {
      let mut config = SolverConfig::default();
      if let Some(max) = max_concurrency {
        config.max_concurrency = max;
      }
      config.cache_salt = cache_salt;

      let mut overrides = LoadOverrides::new().ignore_cache(no_cache);
      overrides.default_platform = platform;

      let data_dir = data_dir(cli.data_dir)?;
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(async { solve(&definition, &data_dir, config, overrides).await })?;
    }
    Some(Commands::Pin {
      definition,
      sources,
    }) => pin(&definition, &sources)?,
    None => {
      println!("strata - use --help to see available commands");
    }
  }

  Ok(())
}

/// Only `solve` touches the data directory, so other commands work without a
/// home directory.
fn data_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
  match explicit {
    Some(dir) => Ok(dir),
    None => Ok(
      dirs::home_dir()
        .context("could not determine home directory")?
        .join(".strata"),
    ),
  }
}

fn inspect(path: &Path) -> Result<()> {
  let definition = read_definition(path)?;
  let heads = load(&definition, &LoadOverrides::default())
    .with_context(|| format!("failed to load definition: {}", path.display()))?;

  eprintln!(
    "Loaded definition with {} ops and {} heads",
    definition.len(),
    heads.len()
  );
  print!("{}", render(&heads));

  let caps = definition.required_caps();
  if !caps.is_empty() {
    println!();
    println!("Required capabilities:");
    for cap in caps {
      println!("  {}", cap);
    }
  }
  Ok(())
}

async fn solve(
  path: &Path,
  data_dir: &Path,
  config: SolverConfig,
  overrides: LoadOverrides,
) -> Result<()> {
  let definition = read_definition(path)?;

  let cache = FsCache::new(data_dir.join("cache"));
  let solver = Solver::new(config, Arc::new(DryRunWorker), Arc::new(cache));

  let cancel = CancellationToken::new();
  let on_interrupt = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupt received, cancelling solve");
      on_interrupt.cancel();
    }
  });

  let report = solver
    .solve_definition(&definition, &overrides, cancel)
    .await
    .with_context(|| format!("failed to load definition: {}", path.display()))?;

  let heads: Vec<serde_json::Value> = report
    .heads
    .iter()
    .map(|head| match head {
      Ok(handle) => serde_json::json!({ "result": handle }),
      Err(e) => serde_json::json!({
        "error": e.describe(),
        "origin": e.origin(),
      }),
    })
    .collect();
  let vertices: serde_json::Map<String, serde_json::Value> = report
    .vertices
    .iter()
    .map(|(digest, status)| -> Result<_, serde_json::Error> {
      Ok((digest.to_string(), serde_json::to_value(status)?))
    })
    .collect::<Result<_, _>>()?;

  let cached = report
    .vertices
    .values()
    .filter(|s| matches!(s, VertexStatus::Completed { cached: true, .. }))
    .count();
  eprintln!(
    "Solve {}: {} vertices, {} cached",
    report.solve_id,
    report.vertices.len(),
    cached
  );

  println!(
    "{}",
    serde_json::to_string_pretty(&serde_json::json!({
      "solve_id": report.solve_id,
      "heads": heads,
      "vertices": vertices,
    }))?
  );

  if let Some(e) = report.first_error() {
    bail!("solve failed: {}", e.describe());
  }
  Ok(())
}

fn pin(path: &Path, sources: &[(String, String)]) -> Result<()> {
  let mut definition = read_definition(path)?;
  for (from, to) in sources {
    let table = definition
      .pin_source(from, to)
      .with_context(|| format!("failed to pin source '{}'", from))?;
    eprintln!("Pinned {} -> {} ({} ops rewritten)", from, to, table.len());
  }
  println!("{}", definition.to_json_pretty()?);
  Ok(())
}

fn read_definition(path: &Path) -> Result<Definition> {
  let bytes = if path == Path::new("-") {
    let mut input = Vec::new();
    io::stdin()
      .read_to_end(&mut input)
      .context("failed to read definition from stdin")?;
    input
  } else {
    std::fs::read(path)
      .with_context(|| format!("failed to read definition file: {}", path.display()))?
  };
  Definition::from_json(&bytes)
    .with_context(|| format!("failed to parse definition: {}", path.display()))
}

fn parse_replacement(value: &str) -> Result<(String, String), String> {
  match value.split_once('=') {
    Some((from, to)) if !from.is_empty() && !to.is_empty() => {
      Ok((from.to_string(), to.to_string()))
    }
    _ => Err(format!("expected OLD=NEW, got '{}'", value)),
  }
}

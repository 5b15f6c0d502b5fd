//! ST-070: CLI subcommands: init, validate, graph, plan, deploy, destroy.

use crate::core::context::RunContext;
use crate::core::eventlog::EventLog;
use crate::core::executor::{self, RunConfig};
use crate::core::graph::{EdgeKind, StackGraph};
use crate::core::{parser, planner, types};
use crate::lookups::{LookupRegistry, Resolver};
use crate::provider::LocalProvider;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new strata project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate strata.yaml without contacting the provider
    Validate {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,
    },

    /// Show the stack dependency graph in execution order
    Graph {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,

        /// Show destroy order instead
        #[arg(long)]
        destroy: bool,
    },

    /// Show execution plan (diff declared stacks vs remote state)
    Plan {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Plan a destroy instead of a deploy
        #[arg(long)]
        destroy: bool,
    },

    /// Create or update every enabled stack in dependency order
    Deploy {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Maximum stacks in flight (overrides settings.concurrency)
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Delete every enabled stack in reverse dependency order
    Destroy {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Maximum stacks in flight (overrides settings.concurrency)
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

/// Dispatch a CLI command. Returns the process exit code.
pub async fn dispatch(cmd: Commands) -> Result<i32, String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path).map(|_| 0),
        Commands::Validate { file } => cmd_validate(&file).map(|_| 0),
        Commands::Graph { file, destroy } => cmd_graph(&file, destroy).await.map(|_| 0),
        Commands::Plan {
            file,
            state_dir,
            destroy,
        } => cmd_plan(&file, &state_dir, destroy).await.map(|_| 0),
        Commands::Deploy {
            file,
            state_dir,
            concurrency,
        } => cmd_run(&file, &state_dir, types::RunAction::Deploy, concurrency).await,
        Commands::Destroy {
            file,
            state_dir,
            concurrency,
        } => cmd_run(&file, &state_dir, types::RunAction::Destroy, concurrency).await,
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("strata.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;
    let templates = path.join("templates");
    std::fs::create_dir_all(&templates)
        .map_err(|e| format!("cannot create templates dir: {}", e))?;

    let config = r#"namespace: my-project
environment: dev
region: us-east-1

variables:
  VpcCidr: 10.0.0.0/16

settings:
  concurrency: 4

pre_deploy: []
post_deploy: []

stacks:
  - name: network
    template_path: templates/network.yaml
    variables:
      Cidr: "${var VpcCidr}"
"#;
    let template = r#"# Rendered by strata; `outputs` become stack outputs.
cidr: "{{ var.Cidr }}"
outputs:
  NetworkName: "{{ stack.fqn }}"
"#;
    std::fs::write(&config_path, config)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;
    let template_path = templates.join("network.yaml");
    std::fs::write(&template_path, template)
        .map_err(|e| format!("cannot write {}: {}", template_path.display(), e))?;

    println!("Initialized strata project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}", template_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        let enabled = config.stacks.iter().filter(|s| s.enabled).count();
        println!(
            "OK: {} ({} stacks, {} enabled)",
            if config.namespace.is_empty() { "-" } else { &config.namespace },
            config.stacks.len(),
            enabled
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

async fn cmd_graph(file: &Path, destroy: bool) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let ctx = RunContext::from_config(&config);
    let mut lookups = LookupRegistry::with_builtins();
    lookups
        .load_aliases(&config.lookups, &config.search_path)
        .map_err(|e| e.to_string())?;
    let resolver = Resolver::new(Arc::new(lookups), config.settings.max_lookup_depth);
    let graph = StackGraph::build(&config.stacks, &resolver, &ctx)
        .await
        .map_err(|e| e.to_string())?;
    let graph = if destroy { graph.reversed() } else { graph };
    let order = graph.topological_order().map_err(|e| e.to_string())?;

    println!(
        "{} order ({} stacks):",
        if destroy { "Destroy" } else { "Deploy" },
        order.len()
    );
    for (i, id) in order.iter().enumerate() {
        let node = graph.node(*id);
        let after: Vec<String> = graph
            .dependencies(*id)
            .map(|dep| match graph.edge_kind(dep, *id) {
                Some(EdgeKind::Discovered) => format!("{} (output)", graph.node(dep).name),
                _ => graph.node(dep).name.clone(),
            })
            .collect();
        if after.is_empty() {
            println!("  {:>2}. {}", i + 1, node.name);
        } else {
            println!("  {:>2}. {} <- {}", i + 1, node.name, after.join(", "));
        }
    }
    for name in graph.disabled() {
        println!("      {} (disabled)", name);
    }
    Ok(())
}

async fn cmd_plan(file: &Path, state_dir: &Path, destroy: bool) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let action = if destroy {
        types::RunAction::Destroy
    } else {
        types::RunAction::Deploy
    };
    let provider = Arc::new(LocalProvider::new(state_dir));
    let cfg = RunConfig::new(&config, action, provider).map_err(|e| e.to_string())?;
    let plan = planner::plan(&cfg).await.map_err(|e| e.to_string())?;
    println!("{}", plan);
    Ok(())
}

async fn cmd_run(
    file: &Path,
    state_dir: &Path,
    action: types::RunAction,
    concurrency: Option<usize>,
) -> Result<i32, String> {
    let mut config = parse_and_validate(file)?;
    if let Some(n) = concurrency {
        config.settings.concurrency = n.max(1);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let provider = Arc::new(LocalProvider::new(state_dir));
    let cfg = RunConfig::new(&config, action, provider)
        .map_err(|e| e.to_string())?
        .with_events(EventLog::new(state_dir))
        .with_cancel(cancel);
    let report = executor::run(&cfg).await.map_err(|e| e.to_string())?;

    println!("{}", report);
    Ok(report.exit_code())
}

/// Parse and validate a strata config file, returning errors if invalid.
fn parse_and_validate(file: &Path) -> Result<types::StrataConfig, String> {
    let config = parser::parse_config_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

//! CLI binary for running and validating FlowX pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flowx_dag::{Library, Node, Pipeline, LIBRARY_FILE};
use flowx_llm::{FnRequester, OpenAiClient};
use flowx_pipeline::{FlowEngine, Severity};
use flowx_tools::HttpFetcher;
use flowx_types::{FlowContext, FlowError};

#[derive(Parser)]
#[command(name = "flowx", version, about = "Declarative YAML pipelines for LLM workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow definition
    Run {
        /// Path to the flow .yaml file
        flow: PathBuf,

        /// Text bound to ${inputs.input_text}
        #[arg(short, long)]
        prompt: Option<String>,

        /// Context namespaces as a JSON object, e.g. '{"user":{"name":"Ada"}}'
        #[arg(short, long)]
        context: Option<String>,

        /// Library file (default: flow.lib.json next to the flow)
        #[arg(short, long)]
        lib: Option<PathBuf>,

        /// Walk the path without calling any model or fetching documents
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the flow path a run would take
    Path {
        /// Path to the flow .yaml file
        flow: PathBuf,

        /// Context namespaces as a JSON object
        #[arg(short, long)]
        context: Option<String>,
    },

    /// Collect every file the flow refers to into the library file
    BuildLib {
        /// Path to the flow .yaml file
        flow: PathBuf,

        /// Directory the library keys are relative to (default: the flow's directory)
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Output library file (default: flow.lib.json next to the flow)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Lint a flow definition
    Validate {
        /// Path to the flow .yaml file
        flow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            flow,
            prompt,
            context,
            lib,
            dry_run,
        } => {
            cmd_run(&flow, prompt, context.as_deref(), lib.as_deref(), dry_run).await?;
        }
        Commands::Path { flow, context } => {
            cmd_path(&flow, context.as_deref()).await?;
        }
        Commands::BuildLib { flow, root, output } => {
            cmd_build_lib(&flow, root.as_deref(), output.as_deref())?;
        }
        Commands::Validate { flow } => {
            cmd_validate(&flow)?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_flow(path: &Path) -> anyhow::Result<Pipeline> {
    let source = std::fs::read_to_string(path)?;
    Ok(flowx_dag::parse(&source)?)
}

fn flow_dir(flow: &Path) -> PathBuf {
    match flow.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn library_path(flow: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => flow_dir(flow).join(LIBRARY_FILE),
    }
}

/// A missing library file means nothing has been built yet; nodes that
/// need a library entry will report it when they run.
fn load_library(path: &Path) -> anyhow::Result<Library> {
    if !path.is_file() {
        tracing::warn!(path = %path.display(), "no library file, run build-lib first");
        return Ok(Library::new());
    }
    Ok(Library::load(path)?)
}

fn parse_context(raw: Option<&str>) -> anyhow::Result<FlowContext> {
    let Some(raw) = raw else {
        return Ok(FlowContext::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Object(namespaces) => Ok(FlowContext::with_namespaces(namespaces)),
        other => anyhow::bail!("--context must be a JSON object, got {other}"),
    }
}

fn print_node(node: &Node) -> flowx_types::Result<()> {
    println!("  -> {} ({})", node.name, node.kind().as_str());
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(
    path: &Path,
    prompt: Option<String>,
    context: Option<&str>,
    lib: Option<&Path>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let mut pipeline = load_flow(path)?;
    flowx_pipeline::validate_or_raise(&pipeline)?;
    if let Some(prompt) = prompt {
        pipeline.set_input_text(prompt);
    }
    let context = parse_context(context)?;
    let library = load_library(&library_path(path, lib))?;

    println!("Running flow: {}", path.display());
    if dry_run {
        println!("(dry run mode -- no LLM calls)");
        let offline = FnRequester::new(|node: &Node, _: &str| {
            Err(FlowError::config(format!(
                "{} tried to call a model during a dry run",
                node.name
            )))
        });
        let engine = FlowEngine::new(Arc::new(offline)).with_library(library);
        let flow_path = engine
            .preview_path(&pipeline, &context, Some(&print_node))
            .await?;
        println!("\nFlow path: {}", flow_path.join(" -> "));
        return Ok(());
    }

    let client = Arc::new(OpenAiClient::from_env()?);
    tracing::info!(model = %client.model(), "using model");
    let engine = FlowEngine::new(client.clone())
        .with_embedder(client)
        .with_fetcher(Arc::new(HttpFetcher::new()))
        .with_library(library);
    let report = engine
        .execute(&mut pipeline, &context, Some(&print_node))
        .await?;

    println!("\nFlow completed (run {})", report.run_id);
    println!("Flow path: {}", report.flow_path.join(" -> "));
    match &report.result {
        serde_json::Value::String(text) => println!("\n{text}"),
        value => println!("\n{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

async fn cmd_path(path: &Path, context: Option<&str>) -> anyhow::Result<()> {
    let pipeline = load_flow(path)?;
    let context = parse_context(context)?;
    let offline = FnRequester::new(|node: &Node, _: &str| {
        Err(FlowError::config(format!("{} cannot run while planning", node.name)))
    });
    let engine = FlowEngine::new(Arc::new(offline));
    let flow_path = engine.plan(&pipeline, &context).await?;
    for name in &flow_path {
        println!("{name}");
    }
    Ok(())
}

fn cmd_build_lib(path: &Path, root: Option<&Path>, output: Option<&Path>) -> anyhow::Result<()> {
    let pipeline = load_flow(path)?;
    let root = root.map(Path::to_path_buf).unwrap_or_else(|| flow_dir(path));
    let output = library_path(path, output);

    let mut library = if output.is_file() {
        Library::load(&output)?
    } else {
        Library::new()
    };
    let added = flowx_dag::build_library(&pipeline, &root, &mut library)?;
    library.save(&output)?;

    println!(
        "Library written: {} ({} entries, {} new)",
        output.display(),
        library.len(),
        added
    );
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_flow(path)?;
    let diagnostics = flowx_pipeline::validate(&pipeline);

    if diagnostics.is_empty() {
        println!("Flow is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        match &diag.node {
            Some(node) => println!("[{}] {} ({}): {}", severity, diag.rule, node, diag.message),
            None => println!("[{}] {}: {}", severity, diag.rule, diag.message),
        }
        if let Some(fix) = &diag.fix {
            println!("        fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

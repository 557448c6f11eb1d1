use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use mosaic::agent::{ExecutionContext, Runtime};
use mosaic::config::env::{load_env, EnvMap};
use mosaic::config::Config;
use mosaic::core::Task;
use mosaic::llm::Message;
use mosaic::orchestration::{RunOptions, Scheduler};
use mosaic::tools::{ResolveContext, ToolRegistry};
use mosaic::workflow::RunId;
use mosaic::{mlog, Result, Workflow};

/// Mosaic - workflow orchestration for LLM and code agents
#[derive(Parser, Debug)]
#[command(name = "mosaic")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MOSAIC_DEBUG=1  Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.mosaic/mosaic.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a workflow directory or a single agent document
    Run {
        /// Workflow directory, agent directory or agent.toml path
        #[arg(short, long)]
        config: PathBuf,

        /// Initial user query
        #[arg(short, long)]
        query: Option<String>,

        /// Allow host-registered code steps and callbacks
        #[arg(long)]
        trust_remote_code: bool,

        /// Reuse outputs of unchanged steps from the previous run
        #[arg(long)]
        load_cache: bool,

        /// Directory for artifacts, history and the run summary
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Extra placeholder values, KEY=VALUE
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
    },

    /// Load a workflow and print its steps in execution order
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List the tools each LLM step would be offered
    Tools {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

fn main() {
    let cli = Cli::parse();
    mosaic::log::init_with_debug(cli.debug);

    let result = match cli.command {
        Command::Run {
            config,
            query,
            trust_remote_code,
            load_cache,
            output_dir,
            env,
        } => run(
            &config,
            query,
            trust_remote_code,
            load_cache,
            output_dir,
            env.into_iter().collect(),
        ),
        Command::Validate { config } => validate(&config),
        Command::Tools { config } => list_tools(&config),
    };

    if let Err(e) = result {
        mlog!("Exiting with error: {}", e);
        eprintln!("Error: {}", e.cause_chain());
        std::process::exit(1);
    }
}

/// Directory `.env` and relative agent documents are read from.
fn config_dir(path: &Path) -> &Path {
    if path.is_file() {
        path.parent().unwrap_or(Path::new("."))
    } else {
        path
    }
}

fn load_workflow(path: &Path, settings: &Config, extra: &EnvMap) -> Result<Workflow> {
    let env = load_env(Some(config_dir(path)), extra)?;
    Ok(Workflow::load(path, &env)?.map_configs(|agent| settings.apply_to(agent)))
}

fn run(
    config: &Path,
    query: Option<String>,
    trust: bool,
    load_cache: bool,
    output_dir: Option<PathBuf>,
    extra: EnvMap,
) -> Result<()> {
    let settings = Config::load()?;
    let trust = trust || settings.trust_remote_code;
    let workflow = load_workflow(config, &settings, &extra)?;
    let output_dir = output_dir.unwrap_or_else(|| settings.effective_output_dir());
    std::fs::create_dir_all(&output_dir)?;
    mosaic::log::attach_run_log(&output_dir);

    let runtime = Runtime::builder().trust_remote_code(trust).build();
    let mut scheduler = Scheduler::new(
        workflow,
        runtime,
        RunOptions {
            load_cache,
            events: None,
        },
    )?;

    let run_id = RunId::new();
    let mut initial = ExecutionContext::new(run_id, &output_dir);
    if let Some(query) = query {
        initial.messages.push(Message::user(query));
    }
    mlog!(
        "Run {} config={} output={} trust={} load_cache={}",
        run_id.short(),
        config.display(),
        output_dir.display(),
        trust,
        load_cache
    );

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                mlog!("Interrupt received, cancelling run");
                on_signal.cancel();
            }
        });
        scheduler.run(initial, &cancel).await
    })?;

    eprintln!(
        "Run {} {} ({} steps) -> {}",
        report.run_id().short(),
        report.status(),
        report.state.steps.len(),
        output_dir.display()
    );
    if let Some(answer) = report.final_answer() {
        println!("{}", answer);
    }
    Ok(())
}

fn validate(config: &Path) -> Result<()> {
    let settings = Config::load()?;
    let workflow = load_workflow(config, &settings, &EnvMap::new())?;
    for name in workflow.order() {
        let Some(step) = workflow.step(name) else {
            continue;
        };
        let next = workflow.graph().successors(name);
        println!(
            "{} [{}{}] -> {}",
            name,
            step.kind,
            if step.critical { "" } else { ", non-critical" },
            if next.is_empty() {
                "(end)".to_string()
            } else {
                next.join(", ")
            }
        );
    }
    Ok(())
}

fn list_tools(config: &Path) -> Result<()> {
    let settings = Config::load()?;
    let workflow = load_workflow(config, &settings, &EnvMap::new())?;
    let runtime: Arc<Runtime> = Runtime::builder()
        .trust_remote_code(settings.trust_remote_code)
        .build();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        for step in workflow.steps() {
            if step.kind != mosaic::agent::AgentKind::Llm {
                continue;
            }
            let registry = ToolRegistry::resolve(ResolveContext {
                runtime: runtime.clone(),
                task: Task::new(&step.tag, "", ""),
                config: step.config.clone(),
                output_dir: settings.effective_output_dir(),
                run_id: RunId::new(),
            })
            .await?;
            println!("{}:", step.name);
            for name in registry.names() {
                println!("  {}", name);
            }
            registry.cleanup().await;
        }
        Ok::<(), mosaic::Error>(())
    })
}

//! armis-mcp-client - command line entry point.
//!
//! Runs prompt templates against the Armis MCP endpoint and a local Ollama
//! model, interactively or one-shot, or serves the HTTP API.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use armis_mcp_client::{
    agent::{Analyst, Persona, RunContext, RunFailure, RunOutcome},
    api::{self, AppState},
    catalog::DirCatalog,
    config::Config,
    history::{HistoryStore, RunStatus},
    llm::OllamaClient,
    template::{self, check_bindings, Bindings, PromptDefinition},
    tools::McpConnector,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MAC_PROMPT_ID: &str = "mac-risk-summarizer";

#[derive(Parser, Debug)]
#[command(
    name = "armis-mcp-client",
    version,
    about = "Query the Armis security platform over MCP and analyze results with a local Ollama model"
)]
struct Cli {
    /// Ollama model to use instead of OLLAMA_MODEL
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available prompts
    List,

    /// Print a prompt's template
    Show { id: String },

    /// Render a prompt without running it
    Preview {
        id: String,
        /// Variable binding, repeatable
        #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },

    /// Run a prompt
    Run {
        id: String,
        /// Variable binding, repeatable
        #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },

    /// Summarize the risk of a device by MAC address
    Mac { address: String },

    /// Ask a free-form question; the model decides what to query
    Ask {
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },

    /// Menu-driven mode (the default)
    Interactive,

    /// Save the template a prompt-builder run generated as a custom prompt
    SaveGenerated {
        /// History id of the finished run
        run_id: String,
        /// Prompt name instead of the generated one
        #[arg(long)]
        name: Option<String>,
        /// Prompt id instead of one derived from the name
        #[arg(long)]
        id: Option<String>,
    },

    /// Show or clear run history
    History {
        /// Show one run in full
        id: Option<String>,

        /// Delete all history entries
        #[arg(long, conflicts_with = "id")]
        clear: bool,
    },

    /// Serve the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))
}

struct App {
    config: Config,
    catalog: DirCatalog,
    history: HistoryStore,
    analyst: Arc<Analyst>,
    model: String,
}

enum Job {
    Prompt(PromptDefinition, Bindings),
    Question(String),
}

impl App {
    fn new(config: Config, model: Option<String>) -> anyhow::Result<Self> {
        let persona = Persona::load(&config.context_dir).with_context(|| {
            format!("Failed to read persona files in {}", config.context_dir.display())
        })?;
        let analyst = Analyst::new(
            Arc::new(OllamaClient::new(&config.ollama_host)),
            Arc::new(McpConnector::from_config(&config)),
            persona,
            config.loop_policy(),
        );
        Ok(Self {
            catalog: DirCatalog::new(&config.context_dir),
            history: HistoryStore::new(&config.history_dir),
            model: model.unwrap_or_else(|| config.default_model.clone()),
            analyst: Arc::new(analyst),
            config,
        })
    }

    fn prompt_job(&self, id: &str, bindings: Bindings) -> anyhow::Result<Job> {
        let definition = self.catalog.load(id)?;
        check_bindings(&definition, &bindings)?;
        Ok(Job::Prompt(definition, bindings))
    }

    /// Run a job, recording it in history. Ctrl-C cancels it.
    async fn execute(&self, job: Job) -> anyhow::Result<()> {
        let (label, prompt_id) = match &job {
            Job::Prompt(def, _) => (def.name().to_string(), Some(def.id().to_string())),
            Job::Question(q) => (q.clone(), None),
        };
        let run_id = self.history.save_run(&label, prompt_id.as_deref())?;
        info!(run = %run_id, model = %self.model, "Starting: {}", label);

        let ctx = RunContext::new(self.model.clone());
        let cancel = ctx.cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling after the current step...");
                cancel.cancel();
            }
        });

        let outcome = match &job {
            Job::Prompt(def, bindings) => self.analyst.run_definition(def, bindings, &ctx).await,
            Job::Question(q) => self.analyst.run_freeform(q, &ctx).await,
        };
        interrupt.abort();

        let RunOutcome { result, rounds, log } = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.history
                    .update_run(&run_id, RunStatus::Failed, Some(format!("Error: {}", e)), None)?;
                return Err(e.into());
            }
        };
        match result {
            Ok(report) => {
                self.history
                    .update_run(&run_id, RunStatus::Completed, Some(report.clone()), Some(log))?;
                println!("\n{}\n{}\n", "=".repeat(60), report.trim_end());
                info!(run = %run_id, rounds, "Analysis complete");
                Ok(())
            }
            Err(failure) => {
                let status = match failure {
                    RunFailure::Cancelled => RunStatus::Cancelled,
                    _ => RunStatus::Failed,
                };
                self.history
                    .update_run(&run_id, status, Some(format!("Error: {}", failure)), Some(log))?;
                Err(anyhow::anyhow!("Run {} did not complete: {}", run_id, failure))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Initialize logging; reports go to stdout, logs to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "armis_mcp_client=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={}, mcp={}",
        config.default_model, config.mcp_url
    );
    let app = App::new(config, cli.model)?;

    match cli.command.unwrap_or(Commands::Interactive) {
        Commands::List => {
            for entry in app.catalog.list_definitions()? {
                println!("{:<28} {:<32} {}", entry.id, entry.name, entry.description);
            }
        }
        Commands::Show { id } => {
            println!("{}", app.catalog.load_definition(&id)?);
        }
        Commands::Preview { id, vars } => {
            let definition = app.catalog.load(&id)?;
            let bindings: Bindings = vars.into_iter().collect();
            println!("{}", template::preview(&definition, &bindings));
            if let Err(e) = check_bindings(&definition, &bindings) {
                eprintln!("\nNote: {}", e);
            }
        }
        Commands::Run { id, vars } => {
            let job = app.prompt_job(&id, vars.into_iter().collect())?;
            app.execute(job).await?;
        }
        Commands::Mac { address } => {
            let bindings = Bindings::from([("mac_address".to_string(), address)]);
            let job = app.prompt_job(MAC_PROMPT_ID, bindings)?;
            app.execute(job).await?;
        }
        Commands::Ask { question } => {
            app.execute(Job::Question(question.join(" "))).await?;
        }
        Commands::Interactive => interactive(&app).await?,
        Commands::SaveGenerated { run_id, name, id } => {
            let record = app.history.get_run(&run_id)?;
            let output = match (record.status, record.result) {
                (RunStatus::Completed, Some(output)) => output,
                _ => anyhow::bail!("Run {} has no completed result", run_id),
            };
            let entry = app
                .catalog
                .save_generated(&output, name.as_deref(), id.as_deref())?;
            println!("Saved custom prompt '{}' ({})", entry.name, entry.id);
        }
        Commands::History { id, clear } => history(&app, id, clear)?,
        Commands::Serve { host, port } => {
            let mut config = app.config.clone();
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let state = AppState::new(config, app.analyst.clone());
            api::serve(Arc::new(state)).await?;
        }
    }

    Ok(())
}

fn history(app: &App, id: Option<String>, clear: bool) -> anyhow::Result<()> {
    if clear {
        let count = app.history.clear()?;
        println!("Deleted {} history entr{}", count, if count == 1 { "y" } else { "ies" });
        return Ok(());
    }
    if let Some(id) = id {
        let record = app.history.get_run(&id)?;
        println!("{} [{:?}] {}", record.id, record.status, record.label);
        println!("started:  {}", record.started_at);
        if let Some(finished) = record.finished_at {
            println!("finished: {}", finished);
        }
        for entry in &record.log {
            println!("  {} {:?}: {}", entry.timestamp, entry.entry_type, entry.content);
        }
        if let Some(result) = record.result {
            println!("\n{}", result);
        }
        return Ok(());
    }
    let runs = app.history.list_runs()?;
    if runs.is_empty() {
        println!("No runs recorded.");
    }
    for run in runs {
        println!(
            "{}  {:<10} {}",
            run.id,
            format!("{:?}", run.status).to_lowercase(),
            run.label
        );
    }
    Ok(())
}

/// Read one trimmed line. EOF and Ctrl-C both return `None`.
async fn read_line(lines: &mut Lines<BufReader<Stdin>>, prompt: &str) -> anyhow::Result<Option<String>> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    next_line_or_interrupt(lines, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn next_line_or_interrupt<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    interrupt: impl Future<Output = ()>,
) -> anyhow::Result<Option<String>> {
    tokio::select! {
        line = lines.next_line() => Ok(line?.map(|l| l.trim().to_string())),
        _ = interrupt => {
            println!();
            Ok(None)
        }
    }
}

async fn interactive(app: &App) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Armis MCP Client (model: {})", app.model);

    let mut show_menu = true;
    loop {
        let entries = app.catalog.list_definitions()?;
        if show_menu {
            println!("\nAvailable options:");
            println!("{}", "-".repeat(40));
            println!("  0. Ask a question [Experimental]");
            for (i, entry) in entries.iter().enumerate() {
                println!("  {}. {}: {}", i + 1, entry.name, entry.description);
            }
            println!("{}", "-".repeat(40));
            show_menu = false;
        }

        let Some(choice) = read_line(&mut lines, "\nSelect an option (l = list, q or Ctrl-C = quit): ").await? else {
            break;
        };
        let job = match choice.to_lowercase().as_str() {
            "" => continue,
            "q" | "quit" | "exit" => break,
            "l" | "list" => {
                show_menu = true;
                continue;
            }
            "0" => match read_line(&mut lines, "Question: ").await? {
                Some(q) if !q.is_empty() => Job::Question(q),
                Some(_) => continue,
                None => break,
            },
            other => {
                let Some(entry) = other
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| entries.get(i))
                else {
                    println!("Invalid option '{}'", other);
                    continue;
                };
                let definition = match app.catalog.load(&entry.id) {
                    Ok(def) => def,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                let mut bindings = Bindings::new();
                for var in definition.variables() {
                    let label = if var.description.is_empty() { &var.name } else { &var.description };
                    match read_line(&mut lines, &format!("{}: ", label)).await? {
                        Some(value) => {
                            bindings.insert(var.name.clone(), value);
                        }
                        None => return Ok(()),
                    }
                }
                if let Err(e) = check_bindings(&definition, &bindings) {
                    println!("{}", e);
                    continue;
                }
                Job::Prompt(definition, bindings)
            }
        };

        if let Err(e) = app.execute(job).await {
            println!("Error: {:#}", e);
        }
    }
    Ok(())
}

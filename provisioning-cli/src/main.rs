use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use provisioning::api::{ApplyStack, DestroyStack, PlanStack};
use provisioning::identity::{IdentityResolver, StaticIdentity};
use provisioning::persistence::StateRepository;
use provisioning::runtime::SimulatedProvider;
use provisioning::{
    compile_stack, handle_apply, handle_destroy, handle_plan, load_from_path, Config,
    DestroyOptions, Executor, StackDocument,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "provisioning", about = "Plan, apply and destroy a cluster stack")]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "provisioning.toml")]
    config: PathBuf,

    /// Log at debug level regardless of RUST_LOG.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the resource graph in execution order without calling the provider.
    Plan {
        #[arg(long, default_value = "provisioning/metadata/stack.yaml")]
        stack: PathBuf,
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Create or converge every resource in the stack.
    Apply {
        #[arg(long, default_value = "provisioning/metadata/stack.yaml")]
        stack: PathBuf,
    },
    /// Tear the stack down in reverse dependency order.
    Destroy {
        #[arg(long, default_value = "provisioning/metadata/stack.yaml")]
        stack: PathBuf,
        /// Confirm the teardown.
        #[arg(long)]
        yes: bool,
        /// Allow failed deletes to be retried.
        #[arg(long)]
        retry_deletes: bool,
    },
    /// Print the outputs recorded by the last apply.
    Outputs {
        #[arg(long, default_value = "provisioning/metadata/stack.yaml")]
        stack: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

struct Session {
    executor: Executor,
    provider: Arc<SimulatedProvider>,
    repo: StateRepository,
}

async fn open_session(config: &Config, doc: &StackDocument) -> Result<Session> {
    let compiled = compile_stack(doc)?;
    let repo = StateRepository::new(&config.state.dir, compiled.label.id());
    let provider = match repo.load_cloud().await? {
        Some(snapshot) => SimulatedProvider::from_snapshot(snapshot),
        None => SimulatedProvider::new(),
    }
    .with_settle_polls(config.simulation.settle_polls)
    .with_region(&doc.region);
    let provider = Arc::new(provider);

    let identity: Arc<dyn IdentityResolver> = match &config.identity.caller_arn {
        Some(arn) => Arc::new(StaticIdentity::new(Some(arn.clone()))),
        None => provider.clone(),
    };
    let executor = Executor::new(provider.clone(), identity, config.execution.clone());

    let token = executor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight resources settle");
            token.cancel();
        }
    });

    Ok(Session {
        executor,
        provider,
        repo,
    })
}

fn load_stack(path: &Path) -> Result<StackDocument> {
    load_from_path(path).with_context(|| format!("loading {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = Config::load(&cli.config)?;

    match &cli.command {
        Commands::Plan { stack, json } => {
            let doc = load_stack(stack)?;
            let plan = handle_plan(&PlanStack { stack: doc })?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print!("{}", plan.render());
            }
        }
        Commands::Apply { stack } => {
            let doc = load_stack(stack)?;
            let session = open_session(&config, &doc).await?;
            let result = handle_apply(&ApplyStack { stack: doc }, &session.executor, &session.repo).await;
            session.repo.save_cloud(&session.provider.snapshot().await).await?;
            let result = result?;
            print!("{}", result.report.render());
            if !result.report.succeeded() {
                bail!("apply did not complete; see {}", session.repo.dir().display());
            }
            println!("{}", serde_json::to_string_pretty(&result.outputs)?);
        }
        Commands::Destroy {
            stack,
            yes,
            retry_deletes,
        } => {
            let doc = load_stack(stack)?;
            if !yes {
                bail!("refusing to destroy {} without --yes", doc.label.name);
            }
            let session = open_session(&config, &doc).await?;
            let cmd = DestroyStack {
                stack: doc,
                options: DestroyOptions {
                    retry_confirmed: *retry_deletes,
                },
            };
            let report = handle_destroy(&cmd, &session.executor, &session.repo).await;
            session.repo.save_cloud(&session.provider.snapshot().await).await?;
            let report = report?;
            print!("{}", report.render());
            if !report.succeeded() {
                bail!("destroy did not complete");
            }
        }
        Commands::Outputs { stack } => {
            let doc = load_stack(stack)?;
            let compiled = compile_stack(&doc)?;
            let repo = StateRepository::new(&config.state.dir, compiled.label.id());
            match repo.load_outputs().await? {
                Some(outputs) => println!("{}", serde_json::to_string_pretty(&outputs)?),
                None => info!(stack = %compiled.label.id(), "no outputs recorded"),
            }
        }
    }
    Ok(())
}

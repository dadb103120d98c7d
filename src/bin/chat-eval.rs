use std::{error::Error, path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, ValueEnum};
use dualeval::{
    eval::report::{write_artifacts, ArtifactPaths},
    providers::openai::OpenAI,
    AgentUnderTest, Embedder, EvalConfig, EvalError, EvalRunner, HashingEmbedder, JudgeScorer,
    LLMProvider, ProviderEmbedder, ReplayAgent, ScenarioCatalog, ScenarioId, SupportAgent,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AgentKind {
    /// Support bot backed by the OpenAI-compatible provider.
    Provider,
    /// Canned replies stored in the scenario catalog.
    Replay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmbedderKind {
    /// Offline hashed bag-of-words embedding.
    Hashing,
    /// Embeddings endpoint of the OpenAI-compatible provider.
    Provider,
}

#[derive(Parser)]
#[command(name = "chat-eval")]
#[command(about = "Score a two-phase support chatbot with semantic similarity and an LLM judge")]
struct Args {
    /// Scenario catalog (YAML)
    #[arg(short, long)]
    scenarios: PathBuf,

    /// Evaluation config (YAML); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = AgentKind::Provider)]
    agent: AgentKind,

    #[arg(long, default_value = "gpt-4o-mini")]
    agent_model: String,

    #[arg(long, default_value = "gpt-4o")]
    judge_model: String,

    #[arg(long, value_enum, default_value_t = EmbedderKind::Hashing)]
    embedder: EmbedderKind,

    #[arg(long, default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Directory the report files are written to
    #[arg(short, long, default_value = "reports")]
    out: PathBuf,

    /// Only run these scenario ids (repeatable)
    #[arg(short, long = "filter")]
    filter: Vec<ScenarioId>,

    /// Ask the agent to rewrite gathering replies that commit to a remedy
    #[arg(long)]
    gathering_guard: bool,
}

enum Outcome {
    Written(ArtifactPaths),
    NothingToRun,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,dualeval=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current turn");
            interrupt.cancel();
        }
    });

    match run(args, cancel).await {
        Ok(Outcome::Written(paths)) => {
            println!("Report: {}", paths.markdown.display());
            println!("Data:   {}", paths.json.display());
            ExitCode::SUCCESS
        }
        Ok(Outcome::NothingToRun) => ExitCode::from(2),
        Err(err) => {
            error!(error = %err, "evaluation failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, cancel: CancellationToken) -> Result<Outcome, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => EvalConfig::load(path)?,
        None => EvalConfig::default(),
    };
    if args.gathering_guard {
        config.gathering_guard = true;
    }

    let catalog = ScenarioCatalog::load(&args.scenarios)?;
    let scenarios = catalog.select(&args.filter);
    if scenarios.is_empty() {
        warn!(filter = ?args.filter, "no scenario matched the filter");
        eprintln!("no scenario matched the filter");
        return Ok(Outcome::NothingToRun);
    }

    let provider: Arc<dyn LLMProvider> = Arc::new(OpenAI::from_env()?);

    let embedder: Arc<dyn Embedder> = match args.embedder {
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::default()),
        EmbedderKind::Provider => Arc::new(ProviderEmbedder::new(provider.clone(), args.embedding_model)),
    };

    let agent: Box<dyn AgentUnderTest> = match args.agent {
        AgentKind::Provider => Box::new(SupportAgent::new(provider.clone(), args.agent_model)),
        AgentKind::Replay => {
            let replay = ReplayAgent::from_scenarios(&scenarios);
            if replay.is_empty() {
                return Err(EvalError::AgentUnavailable(
                    "the selected scenarios carry no replay replies".to_string(),
                )
                .into());
            }
            Box::new(replay)
        }
    };

    let judge = JudgeScorer::new(provider, args.judge_model)?;
    let runner = EvalRunner::from_config(config, embedder, judge)?.with_cancellation(cancel.clone());

    info!(
        scenarios = scenarios.len(),
        agent = agent.name(),
        out = %args.out.display(),
        "running evaluation"
    );
    let report = runner.run(&scenarios, agent.as_ref()).await?;

    for scenario in &report.scenarios {
        let failed = scenario.failed_turns().count();
        match &scenario.means {
            Some(means) => println!(
                "{:<8} rubric {:>5.1}%  judge {:>4.1}/10  failed turns {}",
                scenario.scenario.as_str(),
                means.rubric.aggregate * 100.0,
                means.judge.overall_score,
                failed
            ),
            None => println!("{:<8} no scored turns  failed turns {}", scenario.scenario.as_str(), failed),
        }
    }
    if cancel.is_cancelled() {
        println!("Run cancelled; {} turns skipped.", report.skipped_turns);
    }

    let paths = write_artifacts(&args.out, &report)?;
    Ok(Outcome::Written(paths))
}

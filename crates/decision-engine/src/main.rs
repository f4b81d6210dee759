use clap::{Args, Parser, Subcommand};
use decision_engine::actions::TracingPublisher;
use decision_engine::config::EngineConfig;
use decision_engine::parser::{self, Format, RuleSet};
use decision_engine::{telemetry, DecisionEngine, EngineError, RequestContext, Vocabulary};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "decisionctl",
    about = "Evaluate, score and validate API security rules from the command line",
    version
)]
struct Cli {
    /// Engine configuration file (YAML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the verdict vocabulary
    #[arg(long, global = true, value_parser = parse_vocabulary)]
    vocabulary: Option<Vocabulary>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a decision for a request context and dispatch its actions
    Evaluate(EvaluateArgs),
    /// Compute a risk assessment for a request context
    Score(ScoreArgs),
    /// Dry-run a single rule against a request context
    Test(TestArgs),
    /// Validate a rule file without evaluating anything
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    /// Rule file: rule list, sectioned file or export bundle
    #[arg(long)]
    rules: PathBuf,
    /// Request context (JSON or YAML)
    #[arg(long)]
    context: PathBuf,
}

#[derive(Args, Debug)]
struct ScoreArgs {
    /// File holding scoring rules and profiles
    #[arg(long)]
    bundle: PathBuf,
    #[arg(long)]
    context: PathBuf,
}

#[derive(Args, Debug)]
struct TestArgs {
    #[arg(long)]
    rules: PathBuf,
    /// Id of the rule to dry-run
    #[arg(long)]
    rule: String,
    #[arg(long)]
    context: PathBuf,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[arg(long)]
    rules: PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run_cli().await {
        eprintln!("decisionctl: {err}");
        std::process::exit(1);
    }
}

async fn run_cli() -> Result<(), EngineError> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(vocabulary) = cli.vocabulary {
        config.vocabulary = vocabulary;
    }
    telemetry::init(&config.telemetry)?;

    match cli.command {
        Command::Evaluate(args) => {
            let engine = engine_from(read_rule_set(&args.rules)?, config).await?;
            let ctx = read_context(&args.context)?;
            let (decision, report) = engine.evaluate_and_dispatch(&ctx).await;
            print_json(&serde_json::json!({ "decision": decision, "dispatch": report }))?;
        }
        Command::Score(args) => {
            let engine = engine_from(read_rule_set(&args.bundle)?, config).await?;
            let ctx = read_context(&args.context)?;
            print_json(&engine.assess(&ctx))?;
        }
        Command::Test(args) => {
            let engine = engine_from(read_rule_set(&args.rules)?, config).await?;
            let ctx = read_context(&args.context)?;
            print_json(&engine.test_rule(&args.rule, &ctx).await?)?;
        }
        Command::Validate(args) => {
            let set = read_rule_set(&args.rules)?;
            set.validate()?;
            println!(
                "ok: {} rules, {} scoring rules, {} profiles",
                set.rules.len(),
                set.scoring_rules.len(),
                set.profiles.len()
            );
        }
    }
    Ok(())
}

async fn engine_from(set: RuleSet, config: EngineConfig) -> Result<DecisionEngine, EngineError> {
    DecisionEngine::builder()
        .with_config(config)
        .with_entities(set.rules, set.scoring_rules, set.profiles)
        .with_publisher(Arc::new(TracingPublisher))
        .build()
        .await
}

fn read_rule_set(path: &Path) -> Result<RuleSet, EngineError> {
    let content = std::fs::read_to_string(path)?;
    let format = path
        .to_str()
        .and_then(Format::from_extension)
        .unwrap_or_else(|| Format::detect(&content));
    parser::parse_rule_set_with_format(&content, format)
}

fn read_context(path: &Path) -> Result<RequestContext, EngineError> {
    let content = std::fs::read_to_string(path)?;
    match Format::detect(&content) {
        Format::Json => Ok(serde_json::from_str(&content)?),
        Format::Yaml => Ok(serde_yaml::from_str(&content)?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), EngineError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_vocabulary(raw: &str) -> Result<Vocabulary, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "access" => Ok(Vocabulary::Access),
        "compliance" => Ok(Vocabulary::Compliance),
        "classification" => Ok(Vocabulary::Classification),
        other => Err(format!(
            "'{other}' is not one of access, compliance, classification"
        )),
    }
}

//! `xpo` - drive experiment pipelines from the command line
//!
//! Pipelines are described by a TOML file holding executor settings, the
//! stage graph and static fixture agents. Without `--db` everything runs
//! against an in-memory store.

use anyhow::{anyhow, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use xpo_core::prelude::*;
use xpo_store::{MemoryStore, RequestId, RunForest, RunId, Stores};
use xpo_store_sqlite::SqliteStore;

fn pipeline_arg() -> Arg {
    Arg::new("pipeline")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Pipeline TOML file")
}

fn db_arg() -> Arg {
    Arg::new("db")
        .long("db")
        .value_parser(value_parser!(PathBuf))
        .help("SQLite database; in-memory when omitted")
}

fn request_arg() -> Arg {
    Arg::new("request").required(true).help("Request id")
}

fn cli() -> Command {
    Command::new("xpo")
        .version(xpo_core::VERSION)
        .about("Experiment pipeline orchestrator")
        .subcommand_required(true)
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs and results as JSON"),
        )
        .subcommand(
            Command::new("validate")
                .about("Check a pipeline file and print its stage chain")
                .arg(pipeline_arg()),
        )
        .subcommand(
            Command::new("simulate")
                .about("Create a request and run it with the file's fixture agents")
                .arg(pipeline_arg())
                .arg(db_arg())
                .arg(Arg::new("subject").long("subject").default_value("demo-product"))
                .arg(Arg::new("objective").long("objective").default_value("improve pricing"))
                .arg(Arg::new("usecase").long("usecase").default_value("pricing")),
        )
        .subcommand(
            Command::new("runs")
                .about("Print the run forest of a request")
                .arg(pipeline_arg())
                .arg(db_arg().required(true))
                .arg(request_arg()),
        )
        .subcommand(
            Command::new("resume")
                .about("Advance open lineages of a request")
                .arg(pipeline_arg())
                .arg(db_arg().required(true))
                .arg(request_arg())
                .arg(
                    Arg::new("retry")
                        .long("retry")
                        .action(ArgAction::SetTrue)
                        .help("Also retry failed lineages"),
                ),
        )
        .subcommand(
            Command::new("ready")
                .about("List completed requests awaiting deployment")
                .arg(pipeline_arg())
                .arg(db_arg().required(true))
                .arg(Arg::new("request").long("request").help("Only this request")),
        )
        .subcommand(
            Command::new("deploy")
                .about("Mark an approved terminal run as deployed")
                .arg(pipeline_arg())
                .arg(db_arg().required(true))
                .arg(request_arg())
                .arg(Arg::new("run").required(true).help("Terminal run id")),
        )
        .subcommand(
            Command::new("feedback")
                .about("Run the feedback stage on deployed runs")
                .arg(pipeline_arg())
                .arg(db_arg().required(true))
                .arg(request_arg()),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(args: &ArgMatches) -> Result<PipelineFile> {
    let path = args
        .get_one::<PathBuf>("pipeline")
        .ok_or_else(|| anyhow!("missing pipeline file"))?;
    PipelineFile::load(path).with_context(|| format!("loading {}", path.display()))
}

fn open_stores(args: &ArgMatches) -> Result<Stores> {
    match args.get_one::<PathBuf>("db") {
        Some(path) => {
            let store = SqliteStore::open(path).with_context(|| format!("opening {}", path.display()))?;
            Ok(Stores::shared(Arc::new(store)))
        }
        None => Ok(Stores::shared(Arc::new(MemoryStore::new()))),
    }
}

fn service(args: &ArgMatches) -> Result<ExperimentService> {
    let file = load(args)?;
    let graph = Arc::new(file.graph.build().context("invalid stage graph")?);
    let agents = registry_from_fixtures(&file.agents)?;
    let executor = PipelineExecutor::new(graph, agents, open_stores(args)?, file.executor)?;
    Ok(ExperimentService::new(executor))
}

fn request_id(args: &ArgMatches, name: &str) -> Result<Option<RequestId>> {
    args.get_one::<String>(name)
        .map(|raw| raw.parse().map_err(|e| anyhow!("invalid request id {raw}: {e}")))
        .transpose()
}

fn required_request(args: &ArgMatches) -> Result<RequestId> {
    request_id(args, "request")?.ok_or_else(|| anyhow!("missing request id"))
}

fn print_forest(service: &ExperimentService, forest: &RunForest, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(forest)?);
        return Ok(());
    }
    let summary = forest.summary(service.executor().graph());
    println!(
        "request {}: {} runs, {} lineages ({} finished, {} failed, {:.0}%)",
        forest.request_id(),
        summary.runs,
        summary.lineages,
        summary.finished,
        summary.failed,
        summary.progress_percent
    );
    for (i, lineage) in forest.lineages().iter().enumerate() {
        let status = lineage.leaf().map_or("empty", |leaf| leaf.status.as_str());
        println!("  lineage {}: [{status}] {}", i + 1, lineage.stages().join(" -> "));
    }
    Ok(())
}

fn validate(args: &ArgMatches) -> Result<()> {
    let file = load(args)?;
    let graph = file.graph.build().context("invalid stage graph")?;
    registry_from_fixtures(&file.agents)?
        .ensure_covers(&graph)
        .context("fixture agents do not cover the graph")?;

    let chain: Vec<&str> = graph.chain().iter().map(|s| s.as_str()).collect();
    println!("stages: {}", chain.join(" -> "));
    for stage in graph.on_demand_stages() {
        println!("on demand: {stage}");
    }
    Ok(())
}

async fn simulate(args: &ArgMatches, json: bool) -> Result<()> {
    let service = service(args)?;
    let field = |name: &str| args.get_one::<String>(name).cloned().unwrap_or_default();
    let id = service
        .create_request(&field("subject"), &field("objective"), &field("usecase"))
        .await?;
    let forest = service.wait(id).await?;
    let request = service.get_request(id).await?;
    tracing::info!(request = %id, phase = %request.phase, "simulation finished");
    print_forest(&service, &forest, json)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let json = matches.get_flag("json");
    init_tracing(json);

    match matches.subcommand() {
        Some(("validate", args)) => validate(args),
        Some(("simulate", args)) => simulate(args, json).await,
        Some(("runs", args)) => {
            let service = service(args)?;
            let forest = service.get_runs(required_request(args)?).await?;
            print_forest(&service, &forest, json)
        }
        Some(("resume", args)) => {
            let service = service(args)?;
            let id = required_request(args)?;
            let forest = if args.get_flag("retry") {
                service.retry_failed(id).await?
            } else {
                service.resume(id).await?
            };
            print_forest(&service, &forest, json)
        }
        Some(("ready", args)) => {
            let service = service(args)?;
            for request in service.completed_and_approved(request_id(args, "request")?).await? {
                let forest = service.get_runs(request.id).await?;
                let runs: Vec<String> = service.deployable(&forest).iter().map(|r| r.id.to_string()).collect();
                println!(
                    "{} #{} {} ({}): {}",
                    request.id,
                    request.sequence,
                    request.subject_id,
                    request.objective,
                    runs.join(", ")
                );
            }
            Ok(())
        }
        Some(("deploy", args)) => {
            let service = service(args)?;
            let raw = args
                .get_one::<String>("run")
                .ok_or_else(|| anyhow!("missing run id"))?;
            let run: RunId = raw.parse().map_err(|e| anyhow!("invalid run id {raw}: {e}"))?;
            let run = service.mark_deployed(required_request(args)?, run).await?;
            let at = run.flags.deployed_at.map_or_else(String::new, |at| at.to_rfc3339());
            println!("deployed {} at {at}", run.id);
            Ok(())
        }
        Some(("feedback", args)) => {
            let service = service(args)?;
            let forest = service.collect_feedback(required_request(args)?).await?;
            print_forest(&service, &forest, json)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn parses_resume_with_retry() {
        let matches = cli()
            .try_get_matches_from(["xpo", "resume", "p.toml", "--db", "x.db", "01ARZ3NDEKTSV4RRFFQ69G5FAV", "--retry"])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "resume");
        assert!(args.get_flag("retry"));
        assert!(required_request(args).is_ok());
    }
}

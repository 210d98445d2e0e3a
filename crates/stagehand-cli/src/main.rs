use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use stagehand_runner::external::{GcloudCli, HelmCli, KubectlCli, ReqwestProbe, TerraformCli};
use stagehand_runner::pipeline::STAGES;
use stagehand_runner::{
    read_journal, HarnessConfig, HarnessError, Pipeline, PipelineFailure, PipelineReport,
    SkipFlags, StageRunner, StageStore, Tools,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "stagehand.yaml";
const DEFAULT_RUN_NAME: &str = "gke_basic";

#[derive(Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Staged, resumable cluster deploy-and-validate harness"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        working_dir: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_RUN_NAME)]
        run_name: String,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        working_dir: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_RUN_NAME)]
        run_name: String,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    Clean {
        #[arg(long)]
        working_dir: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_RUN_NAME)]
        run_name: String,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&error_payload(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            working_dir,
            run_name,
            json,
        } => {
            let config = load_config(config.as_deref())?;
            let run_dir = resolve_run_dir(working_dir, &run_name);
            let runner = StageRunner::new(SkipFlags::from_env());
            tracing::info!(run_dir = %run_dir.display(), "starting pipeline");
            let pipeline = Pipeline::new(config.clone(), &run_dir, runner, real_tools(&config)?);
            match pipeline.run() {
                Ok(report) => {
                    if json {
                        return Ok(Some(json!({
                            "ok": true,
                            "command": "run",
                            "run_dir": run_dir.display().to_string(),
                            "stages": report_to_json(&report)
                        })));
                    }
                    println!("run_dir: {}", run_dir.display());
                    print_report(&report);
                    println!("result: passed");
                }
                Err(failure) => {
                    if !json {
                        println!("run_dir: {}", run_dir.display());
                        print_report(&failure.report);
                        if let Some(cleanup) = &failure.cleanup {
                            eprintln!("cleanup_error: {}", cleanup);
                        }
                    }
                    return Err(failure.into());
                }
            }
        }
        Commands::Describe {
            config,
            working_dir,
            run_name,
            json,
        } => {
            let config = load_config(config.as_deref())?;
            let run_dir = resolve_run_dir(working_dir, &run_name);
            let skip = SkipFlags::from_env();
            let store = StageStore::new(&run_dir);
            let keys = store.keys()?;
            let journal = read_journal(&store)?;
            if json {
                let stages: Vec<Value> = STAGES
                    .iter()
                    .map(|name| json!({"name": name, "skip": skip.is_skipped(name)}))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "run_dir": run_dir.display().to_string(),
                    "config": serde_json::to_value(&config)?,
                    "stages": stages,
                    "keys": keys,
                    "journal": serde_json::to_value(&journal)?
                })));
            }
            println!("run_dir: {}", run_dir.display());
            println!("template_dir: {}", config.template_dir.display());
            println!("module_path: {}", config.module_path);
            println!("project: {}", config.project.as_deref().unwrap_or("(unset)"));
            match &config.region {
                Some(region) => println!("region: {}", region),
                None => println!("region: one of {}", config.region_candidates.join(", ")),
            }
            println!("chart_path: {}", config.chart_path);
            for name in STAGES {
                let mode = if skip.is_skipped(name) { "skip" } else { "run" };
                println!("stage: {} ({})", name, mode);
            }
            if keys.is_empty() {
                println!("keys: none");
            } else {
                println!("keys: {}", keys.join(", "));
            }
            for entry in &journal {
                match &entry.error {
                    Some(err) => println!(
                        "journal: {} {} {} ({})",
                        entry.finished_at,
                        entry.name,
                        entry.status.as_str(),
                        err
                    ),
                    None => println!(
                        "journal: {} {} {}",
                        entry.finished_at,
                        entry.name,
                        entry.status.as_str()
                    ),
                }
            }
        }
        Commands::Init { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, HarnessConfig::default().to_yaml()?)?;
            println!("wrote: {}", path.display());
        }
        Commands::Clean {
            working_dir,
            run_name,
        } => {
            let run_dir = resolve_run_dir(working_dir, &run_name);
            if run_dir.is_dir() {
                std::fs::remove_dir_all(&run_dir)?;
                println!("removed: {}", run_dir.display());
            } else {
                println!("nothing to clean: {}", run_dir.display());
            }
        }
    }
    Ok(None)
}

/// An explicit `--config` must exist; otherwise `stagehand.yaml` is used when
/// present and built-in defaults when not. Environment fills what is unset.
fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    let mut config = match path {
        Some(p) => HarnessConfig::load(p)?,
        None if Path::new(DEFAULT_CONFIG).is_file() => HarnessConfig::load(Path::new(DEFAULT_CONFIG))?,
        None => HarnessConfig::default(),
    };
    config.apply_env(std::env::vars());
    Ok(config)
}

fn resolve_run_dir(working_dir: Option<PathBuf>, run_name: &str) -> PathBuf {
    working_dir.unwrap_or_else(|| PathBuf::from("stages").join(run_name))
}

fn real_tools(config: &HarnessConfig) -> Result<Tools> {
    Ok(Tools {
        provisioner: Box::new(TerraformCli::new(&config.tools.terraform)),
        credentials: Box::new(GcloudCli::new(&config.tools.gcloud)),
        installer: Box::new(HelmCli::new(&config.tools.helm)),
        cluster: Box::new(KubectlCli::new(&config.tools.kubectl)),
        http: Box::new(ReqwestProbe::new(Duration::from_secs(config.http_timeout_secs))?),
    })
}

fn print_report(report: &PipelineReport) {
    for (name, status) in &report.stages {
        println!("stage: {} {}", name, status.as_str());
    }
}

fn report_to_json(report: &PipelineReport) -> Value {
    Value::Array(
        report
            .stages
            .iter()
            .map(|(name, status)| json!({"name": name, "status": status.as_str()}))
            .collect(),
    )
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_payload(err: &anyhow::Error) -> Value {
    if let Some(failure) = err.downcast_ref::<PipelineFailure>() {
        return json_error(
            failure.error.code(),
            failure.error.to_string(),
            json!({
                "cleanup_error": failure.cleanup.as_ref().map(|e| e.to_string()),
                "stages": report_to_json(&failure.report)
            }),
        );
    }
    if let Some(harness) = err.downcast_ref::<HarnessError>() {
        return json_error(harness.code(), harness.to_string(), json!({}));
    }
    json_error("command_failed", err.to_string(), json!({}))
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        _ => false,
    }
}

use bidi_storage::config::BidiConfig;
use bidi_storage::simulator::{
    run_append_dst_batch, run_read_dst_batch, summarize_batch, AppendDstConfig, DstOutcome,
    ReadDstConfig, SimulatedServerConfig,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Calm,
    Moderate,
    Chaos,
}

impl Mode {
    fn parse(s: &str) -> Option<Mode> {
        match s {
            "calm" => Some(Mode::Calm),
            "moderate" => Some(Mode::Moderate),
            "chaos" => Some(Mode::Chaos),
            _ => None,
        }
    }

    fn server(self) -> SimulatedServerConfig {
        match self {
            Mode::Calm => SimulatedServerConfig::no_faults(),
            Mode::Moderate => SimulatedServerConfig::default(),
            Mode::Chaos => SimulatedServerConfig::high_chaos(),
        }
    }
}

struct Args {
    workload: String,
    mode: Mode,
    seed: u64,
    seeds: usize,
    ops: usize,
    config: Option<String>,
    json: bool,
}

fn usage() -> String {
    "usage: bidi-sim [read|append|all] [--mode calm|moderate|chaos] [--seed N] \
     [--seeds N] [--ops N] [--config FILE] [--json]"
        .to_string()
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        workload: "all".to_string(),
        mode: Mode::Moderate,
        seed: 0,
        seeds: 20,
        ops: 200,
        config: None,
        json: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().ok_or_else(|| format!("{} needs a value", name));
        match arg.as_str() {
            "read" | "append" | "all" => args.workload = arg.clone(),
            "--mode" => {
                let v = value("--mode")?;
                args.mode = Mode::parse(&v).ok_or_else(|| format!("unknown mode {}", v))?;
            }
            "--seed" => args.seed = value("--seed")?.parse().map_err(|e| format!("--seed: {}", e))?,
            "--seeds" => args.seeds = value("--seeds")?.parse().map_err(|e| format!("--seeds: {}", e))?,
            "--ops" => args.ops = value("--ops")?.parse().map_err(|e| format!("--ops: {}", e))?,
            "--config" => args.config = Some(value("--config")?),
            "--json" => args.json = true,
            "-h" | "--help" => return Err(usage()),
            other => return Err(format!("unexpected argument {}\n{}", other, usage())),
        }
    }
    Ok(args)
}

#[derive(Serialize)]
struct BatchReport {
    workload: &'static str,
    seeds: usize,
    passed: usize,
    failed_seeds: Vec<u64>,
    operations: u64,
    stream_drops: u64,
    redirects: u64,
}

impl BatchReport {
    fn from_results<R: DstOutcome>(workload: &'static str, results: &[R]) -> Self {
        BatchReport {
            workload,
            seeds: results.len(),
            passed: results.iter().filter(|r| r.is_success()).count(),
            failed_seeds: results.iter().filter(|r| !r.is_success()).map(|r| r.seed()).collect(),
            operations: results.iter().map(|r| r.operations()).sum(),
            stream_drops: results.iter().map(|r| r.stats().stream_drops).sum(),
            redirects: results.iter().map(|r| r.stats().redirects).sum(),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };
    let base = match &args.config {
        Some(path) => BidiConfig::load(path)?,
        None => BidiConfig::test(),
    };
    let config = base.from_env()?;
    info!(?args.mode, seed = args.seed, seeds = args.seeds, ops = args.ops, "starting simulation");

    let mut reports = Vec::new();
    if args.workload != "append" {
        let results = run_read_dst_batch(args.seed, args.seeds, args.ops, |seed| ReadDstConfig {
            seed,
            server: args.mode.server(),
            retry: config.retry.clone(),
            session: config.read.clone(),
            ..Default::default()
        });
        for r in results.iter().filter(|r| !r.is_success()) {
            warn!(summary = %r.summary(), violations = ?r.invariant_violations, "read run failed");
        }
        if !args.json {
            println!("read:   {}", summarize_batch(&results));
        }
        reports.push(BatchReport::from_results("read", &results));
    }
    if args.workload != "read" {
        let results = run_append_dst_batch(args.seed, args.seeds, args.ops, |seed| AppendDstConfig {
            seed,
            server: args.mode.server().recoverable_only(),
            append: config.append.clone(),
            retry: config.retry.clone(),
            ..Default::default()
        });
        for r in results.iter().filter(|r| !r.is_success()) {
            warn!(summary = %r.summary(), violations = ?r.invariant_violations, "append run failed");
        }
        if !args.json {
            println!("append: {}", summarize_batch(&results));
        }
        reports.push(BatchReport::from_results("append", &results));
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    if reports.iter().any(|r| r.passed != r.seeds) {
        std::process::exit(1);
    }
    Ok(())
}

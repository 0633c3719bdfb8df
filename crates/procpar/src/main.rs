use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procpar::{ArgMap, DispatchConfig, Dispatcher, Operation, Registry, handle_if_worker};

const USAGE: &str = "Usage: procpar-demo --op <name> (--items a,b,c | --count N) [--concurrency N]

Operations:
  uppercase   upper-case each item
  describe    report the worker that handled each item
  fail        always fails, with a cause
  vanish      exits without writing a result
  leak        writes unframed output, then exits
  token       zero-argument; returns a fresh uuid per slot";

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error("refusing to process '{item}'")]
    Refused {
        item: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Description {
    item: String,
    pid: u32,
    started_at: Option<DateTime<Utc>>,
    /// Arguments the worker was launched with, minus its payload.
    forwarded: Vec<String>,
}

fn uppercase(item: String) -> Result<String, DemoError> {
    Ok(item.to_uppercase())
}

fn describe(item: String) -> Result<Description, DemoError> {
    let mut args = ArgMap::from_env();
    args.remove(procpar::bridge::cmdline::ARGS_KEY);

    Ok(Description {
        item,
        pid: std::process::id(),
        started_at: Some(Utc::now()),
        forwarded: args.to_tokens(),
    })
}

fn fail(item: String) -> Result<String, DemoError> {
    Err(DemoError::Refused {
        item,
        source: io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
    })
}

fn vanish(_item: String) -> Result<String, DemoError> {
    std::process::exit(0)
}

fn leak(item: String) -> Result<String, DemoError> {
    println!("leaking {item}");
    std::process::exit(0)
}

fn token() -> Result<String, DemoError> {
    Ok(uuid::Uuid::new_v4().to_string())
}

struct DemoOps {
    registry: Arc<Registry>,
    uppercase: Operation<String, String>,
    describe: Operation<String, Description>,
    fail: Operation<String, String>,
    vanish: Operation<String, String>,
    leak: Operation<String, String>,
    token: Operation<(), String>,
}

fn demo_ops() -> anyhow::Result<DemoOps> {
    let mut registry = Registry::new();
    let uppercase = registry.register("demo", "uppercase", uppercase)?;
    let describe = registry.register("demo", "describe", describe)?;
    let fail = registry.register("demo", "fail", fail)?;
    let vanish = registry.register("demo", "vanish", vanish)?;
    let leak = registry.register("demo", "leak", leak)?;
    let token = registry.register0("demo", "token", token)?;

    Ok(DemoOps {
        registry: Arc::new(registry),
        uppercase,
        describe,
        fail,
        vanish,
        leak,
        token,
    })
}

fn main() -> ExitCode {
    procpar::init_tracing();

    let ops = match demo_ops() {
        Ok(ops) => ops,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    handle_if_worker(&ops.registry);

    let args = ArgMap::from_env();
    if args.contains("help") || args.contains("h") {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    match run(&ops, &args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(ops: &DemoOps, args: &ArgMap) -> anyhow::Result<()> {
    let op = args.get("op").context("missing --op")?;

    let mut config = DispatchConfig::new();
    if let Some(limit) = args.get("concurrency") {
        let limit: usize = limit
            .parse()
            .with_context(|| format!("invalid --concurrency '{limit}'"))?;
        config = config.with_concurrency(limit);
    }
    let dispatcher = Dispatcher::with_config(Arc::clone(&ops.registry), config);

    let items = items(args)?;
    tracing::debug!(op, items = items.len(), "Running demo");

    let rendered = match op {
        "uppercase" => render(&dispatcher.for_each_blocking(items, &ops.uppercase)?)?,
        "describe" => render(&dispatcher.for_each_blocking(items, &ops.describe)?)?,
        "fail" => render(&dispatcher.for_each_blocking(items, &ops.fail)?)?,
        "vanish" => render(&dispatcher.for_each_blocking(items, &ops.vanish)?)?,
        "leak" => render(&dispatcher.for_each_blocking(items, &ops.leak)?)?,
        "token" => {
            let slots = vec![(); items.len()];
            render(&dispatcher.for_each_blocking(slots, &ops.token)?)?
        }
        other => bail!("unknown operation '{other}'\n\n{USAGE}"),
    };

    println!("{rendered}");
    Ok(())
}

/// `--items a,b,c` verbatim, or `--count N` generated ids.
fn items(args: &ArgMap) -> anyhow::Result<Vec<String>> {
    if let Some(items) = args.get("items") {
        return Ok(items
            .split(',')
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect());
    }

    let Some(count) = args.get("count") else {
        bail!("provide --items or --count\n\n{USAGE}");
    };
    let count: usize = count
        .parse()
        .with_context(|| format!("invalid --count '{count}'"))?;
    Ok((0..count)
        .map(|_| uuid::Uuid::new_v4().to_string())
        .collect())
}

fn render<T: Serialize>(results: &[T]) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(results)?)
}

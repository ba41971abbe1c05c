use clap::Parser;
use env_logger::DEFAULT_FILTER_ENV;
use log::LevelFilter;
use slotd::control::{SlotConfig, SlotManager};
use slotd::records::{AttrRecord, AttrValue};
use slotd::seams::{AdvertSink, Evaluator, ExitStatus, JobExecutor, Value};
use slotd::ExecutorHandle;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "slotd-agent", about = "Machine-side slot/claim agent")]
struct Opts {
    /// Path to the slot configuration (JSON).
    #[arg(long, env = "SLOTD_CONFIG")]
    config: PathBuf,

    /// Seconds between advertisement refreshes.
    #[arg(long, default_value = "60")]
    advertise_interval: u64,

    #[arg(long)]
    debug: bool,
}

fn setup_logging(verbose: bool) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    let has_debug = std::env::var(DEFAULT_FILTER_ENV)
        .map(|v| v.contains("debug"))
        .unwrap_or(false);
    if verbose || has_debug {
        builder.format_timestamp_millis();
    }
    builder.parse_default_env();
    builder.init();
}

/// Resolves literals and plain attribute references; anything more
/// elaborate belongs to a real policy-language evaluator plugged into
/// the same trait.
struct LiteralEvaluator;

impl Evaluator for LiteralEvaluator {
    fn evaluate(
        &self,
        expr: &str,
        primary: &AttrRecord,
        target: Option<&AttrRecord>,
    ) -> slotd::Result<Value> {
        let expr = expr.trim();
        match expr {
            "true" | "(true)" => return Ok(Value::Boolean(true)),
            "false" | "(false)" => return Ok(Value::Boolean(false)),
            _ => {}
        }
        if let Ok(v) = expr.parse::<i64>() {
            return Ok(Value::Integer(v));
        }
        if let Ok(v) = expr.parse::<f64>() {
            return Ok(Value::Real(v));
        }
        let lookup = primary.get(expr).or_else(|| target.and_then(|t| t.get(expr)));
        Ok(match lookup {
            Some(AttrValue::Bool(b)) => Value::Boolean(*b),
            Some(AttrValue::Int(v)) => Value::Integer(*v),
            Some(AttrValue::Real(v)) => Value::Real(*v),
            Some(AttrValue::Str(s)) => Value::Str(s.clone()),
            Some(AttrValue::Expr(_)) | None => Value::Undefined,
        })
    }
}

/// Publishes slot records to the log as JSON lines.
struct LogAdvertSink;

impl AdvertSink for LogAdvertSink {
    fn publish(&mut self, record: &AttrRecord) -> slotd::Result<()> {
        log::info!("advert: {}", serde_json::to_string(record)?);
        Ok(())
    }

    fn invalidate(&mut self, name: &str) -> slotd::Result<()> {
        log::info!("advert invalidated: {name}");
        Ok(())
    }
}

/// Executor that only tracks handles; a stop request queues the
/// corresponding exit event for the main loop to deliver.
struct DryRunExecutor {
    next: u64,
    exits: Rc<RefCell<VecDeque<(ExecutorHandle, ExitStatus)>>>,
}

impl JobExecutor for DryRunExecutor {
    fn spawn(&mut self, _job: &AttrRecord, slot_record: &AttrRecord) -> slotd::Result<ExecutorHandle> {
        self.next += 1;
        let handle = ExecutorHandle::new(self.next);
        log::info!(
            "dry-run: job started as executor {handle} on {:?}",
            slot_record.get("Name")
        );
        Ok(handle)
    }

    fn stop(&mut self, handle: ExecutorHandle, graceful: bool) {
        log::info!("dry-run: stopping executor {handle} (graceful: {graceful})");
        self.exits
            .borrow_mut()
            .push_back((handle, ExitStatus::Exited(0)));
    }

    fn suspend(&mut self, handle: ExecutorHandle) {
        log::info!("dry-run: suspending executor {handle}");
    }

    fn resume(&mut self, handle: ExecutorHandle) {
        log::info!("dry-run: resuming executor {handle}");
    }

    fn kill_all(&mut self) {
        log::info!("dry-run: killing all executors");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    setup_logging(opts.debug);

    let text = std::fs::read_to_string(&opts.config)?;
    let config = SlotConfig::from_json(&text)?;
    let exits = Rc::new(RefCell::new(VecDeque::new()));
    let mut manager = SlotManager::new(
        config,
        Box::new(LiteralEvaluator),
        Box::new(LogAdvertSink),
        Box::new(DryRunExecutor {
            next: 0,
            exits: exits.clone(),
        }),
    )?;

    let advertise_interval = Duration::from_secs(opts.advertise_interval);
    let mut next_advertise = Instant::now();

    loop {
        let now = Instant::now();
        // Drain into a local first: delivering an exit may queue new
        // exits through the executor.
        let pending: Vec<_> = exits.borrow_mut().drain(..).collect();
        for (handle, status) in pending {
            manager.executor_exited(handle, status, now);
        }
        if now >= next_advertise {
            manager.evaluate_and_advertise(now);
            next_advertise = now + advertise_interval;
        }
        manager.tick(now);

        let wakeup = manager
            .next_deadline()
            .map_or(next_advertise, |d| d.min(next_advertise));
        let sleep = wakeup.saturating_duration_since(Instant::now());
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupt received, shutting down");
                manager.shutdown();
                break;
            }
        }
    }
    Ok(())
}

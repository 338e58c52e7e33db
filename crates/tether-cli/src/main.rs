use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tether_core::{
    BindOptions, Event, EventRegistry, Scheduler, SchedulerConfig, Target, handler,
};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Demo host: pumps `update` the way a window loop would, and fires a few UI events.
#[derive(Parser, Debug)]
#[command(name = "tether", version)]
struct Args {
    /// Number of `update` ticks to pump.
    #[arg(long, default_value_t = 30)]
    ticks: u32,

    /// Milliseconds between ticks.
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// Duration for the demo delay tasks (`5`, `5s`, `500ms`).
    #[arg(long, default_value = "100ms")]
    delay: String,

    /// Scheduler config as a JSON file.
    #[arg(long)]
    scheduler_config: Option<PathBuf>,

    /// Log filter, used when RUST_LOG is not set.
    #[arg(long, env = "TETHER_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // (A) Scheduler を用意
    let config = match &args.scheduler_config {
        Some(path) => SchedulerConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => SchedulerConfig::default(),
    };
    let scheduler = Scheduler::start(config)?;

    // (B) registry を 2 つ（window と button の代わり）
    let window = EventRegistry::builder(&scheduler).owner_id("window").build();
    let button = EventRegistry::builder(&scheduler).owner_id("button").build();

    // (C) bind: inline chain / deferred / delay
    button.bind(
        "click",
        Target::chain([
            handler(|event| {
                info!(event_id = ?event.id(), "click: first handler");
                Ok(())
            }),
            handler(|_| {
                info!("click: second handler");
                Ok(())
            }),
        ]),
    )?;
    window.bind_with(
        "resize",
        Target::single(|event| {
            info!(width = %event["width"], height = %event["height"], "resize handled on worker");
            Ok(())
        }),
        BindOptions::deferred(),
    )?;
    let inline_delay = button.bind(
        &format!("delay[{}]", args.delay),
        Target::single(|event| {
            info!(event_type = event.event_type(), "inline delay fired");
            Ok(())
        }),
    )?;
    window.bind_with(
        &format!("delay[{}]", args.delay),
        Target::single(|_| Err("deferred delay failing on purpose".into())),
        BindOptions::deferred(),
    )?;
    info!(task_id = %inline_delay.id(), target_time = ?inline_delay.target_time(), "delay bound");

    // (D) window loop の代わりに update を pump する
    let mut ticker = interval(Duration::from_millis(args.tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    for tick in 0..args.ticks {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted");
                break;
            }
        }

        for registry in [&window, &button] {
            registry.trigger("update");
        }
        match tick {
            1 => {
                button.trigger("click");
            }
            2 => {
                window.trigger(Event::new("resize").with("width", 800).with("height", 600));
            }
            _ => {}
        }
    }

    // (E) deferred Task を待ってから止める
    let drained = tokio::task::spawn_blocking({
        let scheduler = scheduler.clone();
        move || scheduler.wait_idle(Duration::from_secs(2))
    })
    .await?;
    scheduler.shutdown();

    let leftover = window.tasks(&format!("delay[{}]", args.delay)).len()
        + button.tasks(&format!("delay[{}]", args.delay)).len();
    info!(
        drained,
        leftover_delay_tasks = leftover,
        latest = ?tether_core::latest_event().map(|e| e.event_type().to_string()),
        "done"
    );
    Ok(())
}

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use futures::StreamExt;
use rand::RngExt;
use tracing::Level;

use prerender::bundle::Bundle;
use prerender::consts::DEFAULT_RENDER_DEADLINE;
use prerender::engine::mock::{Behavior, ScriptedFactory};
use prerender::{EnginePool, Params, PooledRenderer, Render, RenderConfig, RenderError};

#[derive(Parser)]
#[command(
    name = "prerender",
    version,
    about = "Server-side rendering on a pool of script engines."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a pool of simulated engines and report how it behaved
    Bench {
        /// Total renders to run
        #[arg(short, long, default_value_t = 200)]
        requests: usize,

        /// Renders in flight at once
        #[arg(short, long, default_value_t = 16)]
        concurrency: usize,

        /// Simulated render time in milliseconds
        #[arg(short, long, default_value_t = 20)]
        latency_ms: u64,

        /// Fraction of renders whose engine never calls back
        #[arg(long, default_value_t = 0.02)]
        hang_rate: f64,

        /// Fraction of renders whose entry point throws
        #[arg(long, default_value_t = 0.0)]
        throw_rate: f64,

        /// Per-render deadline in milliseconds
        #[arg(short, long, default_value_t = DEFAULT_RENDER_DEADLINE.as_millis() as u64)]
        deadline_ms: u64,
    },
    /// Load a bundle and print its name, size and digest
    Bundle {
        /// Path to the bundle file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Bench {
            requests,
            concurrency,
            latency_ms,
            hang_rate,
            throw_rate,
            deadline_ms,
        } => {
            if !(0.0..=1.0).contains(&hang_rate) || !(0.0..=1.0).contains(&throw_rate) {
                anyhow::bail!("--hang-rate and --throw-rate must be between 0 and 1");
            }
            let config = RenderConfig {
                deadline: Duration::from_millis(deadline_ms),
            };
            bench(requests, concurrency.max(1), latency_ms, hang_rate, throw_rate, config).await
        }
        Command::Bundle { path } => {
            let bundle = Bundle::load(&path).await?;
            println!("name:   {}", bundle.name());
            println!("bytes:  {}", bundle.len());
            println!("sha256: {}", bundle.digest());
            Ok(())
        }
    }
}

#[derive(Default)]
struct Tally {
    ok: usize,
    timed_out: usize,
    failed: usize,
}

async fn bench(
    requests: usize,
    concurrency: usize,
    latency_ms: u64,
    hang_rate: f64,
    throw_rate: f64,
    config: RenderConfig,
) -> anyhow::Result<()> {
    let factory = ScriptedFactory::new(move |params: &Params| {
        let mut rng = rand::rng();
        if rng.random_bool(hang_rate) {
            return Behavior::Hang;
        }
        if rng.random_bool(throw_rate) {
            return Behavior::Throw("simulated failure".to_string());
        }
        let payload = serde_json::json!({
            "app": format!("<div>{}</div>", params.url),
            "title": format!("<title>{}</title>", params.url),
        });
        let jitter = rng.random_range(0..=latency_ms / 2);
        Behavior::reply_after(Duration::from_millis(latency_ms + jitter), payload.to_string())
    });
    let probe = factory.probe();
    let pool = EnginePool::new(factory);
    let renderer = PooledRenderer::new(pool.clone(), config);

    println!(
        "Rendering {} pages, {} at a time (deadline {:?})...",
        requests, concurrency, renderer.config().deadline
    );
    let started = Instant::now();

    let results: Vec<_> = futures::stream::iter(0..requests)
        .map(|i| renderer.render(Params::new(format!("/page/{i}"), format!("bench-{i}"))))
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut tally = Tally::default();
    for result in &results {
        match result {
            Ok(_) => tally.ok += 1,
            Err(RenderError::TimedOut(_)) => tally.timed_out += 1,
            Err(_) => tally.failed += 1,
        }
    }
    let elapsed = started.elapsed();
    let stats = pool.shutdown().await?;

    println!("\n=> done in {:.2?}", elapsed);
    println!("  rendered:   {}", tally.ok);
    println!("  timed out:  {}", tally.timed_out);
    println!("  failed:     {}", tally.failed);
    println!(
        "  engines:    {} created, {} discarded, {} idle",
        stats.created, stats.discarded, stats.idle
    );
    println!("  overlaps:   {}", probe.overlaps());
    Ok(())
}

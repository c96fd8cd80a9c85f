//! Demo CLI exercising a [`Policy`] over [`InMemoryBackend`].
//!
//! Not part of the library's public contract — a vehicle for poking at
//! coalescing and stale-while-revalidate behavior from a terminal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cache_policy::{GenerateFuture, GenerateOutcome, InMemoryBackend, Policy, RuleOptions};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "policy-demo")]
#[command(about = "Exercises the cache-policy engine against an in-memory backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs `concurrency` concurrent gets for the same key against a slow
    /// generator, demonstrating single-flight coalescing.
    Coalesce {
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
        #[arg(long, default_value_t = 200)]
        generator_delay_ms: u64,
    },
    /// Primes an entry then lets it go stale, demonstrating
    /// stale-while-revalidate serving.
    StaleWhileRevalidate {
        #[arg(long, default_value_t = 300)]
        stale_in_ms: u64,
        #[arg(long, default_value_t = 100)]
        stale_timeout_ms: u64,
        #[arg(long, default_value_t = 250)]
        generator_delay_ms: u64,
    },
}

fn slow_counter_generator(delay: Duration) -> Arc<dyn Fn(cache_policy::Key) -> GenerateFuture<String> + Send + Sync> {
    let calls = Arc::new(AtomicU64::new(0));
    Arc::new(move |_key| {
        let calls = Arc::clone(&calls);
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            GenerateOutcome::ok(format!("generation-{n}"), None)
        })
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Coalesce { concurrency, generator_delay_ms } => {
            let backend = Arc::new(InMemoryBackend::<String>::new());
            let generate_func = slow_counter_generator(Duration::from_millis(generator_delay_ms));

            let mut options: RuleOptions<String> = RuleOptions::default();
            options.expires_in = Some(Duration::from_secs(60));
            options.generate_func = Some(generate_func);
            options.generate_timeout =
                Some(cache_policy::GenerateTimeout::Millis(Duration::from_secs(5)));

            let policy: Policy<String> = Policy::new(options, Some(backend), "demo")?;

            let mut handles = Vec::with_capacity(concurrency);
            for i in 0..concurrency {
                let policy = policy.clone();
                handles.push(tokio::spawn(async move {
                    let outcome = policy.get("shared-key".into()).await;
                    println!("caller {i}: value={:?} error={:?}", outcome.value, outcome.error);
                }));
            }
            for handle in handles {
                handle.await?;
            }

            let stats = policy.stats();
            println!(
                "gets={} generates={} hits={} (expected: generates=1 regardless of concurrency)",
                stats.gets, stats.generates, stats.hits
            );
        }

        Commands::StaleWhileRevalidate { stale_in_ms, stale_timeout_ms, generator_delay_ms } => {
            let backend = Arc::new(InMemoryBackend::<String>::new());
            let generate_func = slow_counter_generator(Duration::from_millis(generator_delay_ms));

            let mut options: RuleOptions<String> = RuleOptions::default();
            options.expires_in = Some(Duration::from_secs(60));
            options.stale_in = Some(cache_policy::StaleIn::Millis(Duration::from_millis(stale_in_ms)));
            options.stale_timeout = Some(Duration::from_millis(stale_timeout_ms));
            options.generate_func = Some(generate_func);
            options.generate_timeout =
                Some(cache_policy::GenerateTimeout::Millis(Duration::from_secs(5)));

            let policy: Policy<String> = Policy::new(options, Some(backend), "demo")?;

            let first = policy.get("shared-key".into()).await;
            println!("prime: value={:?}", first.value);

            tokio::time::sleep(Duration::from_millis(stale_in_ms + 10)).await;

            let started = std::time::Instant::now();
            let stale = policy.get("shared-key".into()).await;
            println!(
                "after staleIn elapsed: value={:?} waited={:?} (expect ~staleTimeout)",
                stale.value,
                started.elapsed()
            );

            println!("stats: {:?}", policy.stats());
        }
    }

    Ok(())
}

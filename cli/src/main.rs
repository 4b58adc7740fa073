use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Instant,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use ganglion::{
    config::{NetworkConfig, PoolConfig},
    dispatch::net::{master::NetworkDispatcher, worker::WorkerServer, DEFAULT_WORKER_PORT},
    Dispatcher, PoolDispatcher, TracingSink,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod walk;

use walk::{Walk, WalkCodec, WalkParams, WalkResolver};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve random-walk tasks to masters
    Worker {
        /// Address to listen on
        #[arg(
            long,
            env = "GANGLION_LISTEN",
            default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_WORKER_PORT))
        )]
        listen: SocketAddr,
    },
    /// Estimate the probability that a random walk reaches a goal
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Worker to dispatch to; repeat for more. Runs locally when none is given
    #[arg(long = "worker", env = "GANGLION_WORKERS", value_delimiter = ',')]
    workers: Vec<SocketAddr>,

    /// Number of walks
    #[arg(long, default_value_t = 10_000)]
    tasks: usize,

    /// Maximum steps per walk
    #[arg(long, default_value_t = 1_000)]
    steps: u32,

    /// Position the walk has to reach
    #[arg(long, default_value_t = 30)]
    goal: i64,

    /// Seed of the first walk; walk `i` uses `seed + i`
    #[arg(long)]
    seed: Option<u64>,

    /// Size of the local pool
    #[arg(long, env = "GANGLION_THREADS")]
    threads: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Worker { listen } => serve(listen).await,
        Command::Run(args) => run(args).await,
    }
}

async fn serve(listen: SocketAddr) -> anyhow::Result<()> {
    let server = WorkerServer::bind(listen, Arc::new(WalkResolver))
        .await
        .with_context(|| format!("could not listen on {listen}"))?;
    tokio::select! {
        _ = server.serve() => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let params = WalkParams {
        steps: args.steps,
        goal: args.goal,
    };
    let seed = args.seed.unwrap_or_else(rand::random);
    let started = Instant::now();

    let (reached, displacement) = if args.workers.is_empty() {
        let config = match args.threads {
            Some(workers) => PoolConfig::builder().workers(workers).build(),
            None => PoolConfig::default(),
        };
        info!(workers = config.workers, "running on the local pool");
        let dispatcher: PoolDispatcher<Walk> =
            PoolDispatcher::with_events(config, Arc::new(TracingSink))?;
        estimate(&dispatcher, params, seed, args.tasks).await
    } else {
        let dispatcher: NetworkDispatcher<Walk> = NetworkDispatcher::with_events(
            NetworkConfig::default(),
            params.upload()?,
            Arc::new(WalkCodec),
            Arc::new(TracingSink),
        )?;
        for addr in &args.workers {
            dispatcher
                .add_worker(*addr)
                .await
                .with_context(|| format!("could not register worker {addr}"))?;
        }
        let result = estimate(&dispatcher, params, seed, args.tasks).await;
        for worker in dispatcher.workers() {
            println!(
                "{}  {:?}  window {}  rtt {:?}",
                worker.addr, worker.state, worker.expected_tasks, worker.estimated_rtt
            );
        }
        dispatcher.close().await;
        result
    };

    let tasks = args.tasks.max(1) as f64;
    println!(
        "P(reach {} within {} steps) ~ {:.4}  ({} of {} walks, mean end {:.2}, {:?})",
        args.goal,
        args.steps,
        reached as f64 / tasks,
        reached,
        args.tasks,
        displacement as f64 / tasks,
        started.elapsed()
    );
    Ok(())
}

/// Runs `tasks` walks and returns how many reached the goal together with
/// the sum of their end positions.
async fn estimate<D>(dispatcher: &D, params: WalkParams, seed: u64, tasks: usize) -> (u64, i64)
where
    D: Dispatcher<Walk>,
{
    let displacement = Arc::new(AtomicI64::new(0));
    let session = {
        let displacement = displacement.clone();
        dispatcher.new_session(tasks, move |trajectory| {
            displacement.fetch_add(trajectory.value, Ordering::Relaxed);
        })
    };
    for i in 0..tasks as u64 {
        dispatcher.submit(
            &session,
            Walk {
                params,
                seed: seed.wrapping_add(i),
            },
        );
    }
    dispatcher.await_completion(&session).await;
    (session.reached(), displacement.load(Ordering::Relaxed))
}

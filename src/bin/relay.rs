//! relay CLI: dispatch work, run consumers, or try the round trip in memory.

use clap::{Parser, Subcommand};
use relay_rs::broker::memory::InMemoryBroker;
use relay_rs::broker::pgmq::PgmqBroker;
use relay_rs::broker::{Broker, ConfirmListener, Subscriptions};
use relay_rs::config::Config;
use relay_rs::confirm::ConfirmationTracker;
use relay_rs::db::Db;
use relay_rs::dedup::{DEFAULT_SWEEP_EVERY, DEFAULT_TTL, Deduplicator};
use relay_rs::dispatch::Dispatcher;
use relay_rs::model::{ReplyAddress, WorkRequest};
use relay_rs::notify::LogNotifier;
use relay_rs::reply::{ReplyCorrelator, ReplyListener};
use relay_rs::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use relay_rs::topology::Topology;
use relay_rs::worker::Worker;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "relay", about = "Correlated request/reply work dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct JobArgs {
    /// Job identifier
    #[arg(long, default_value = "JOB-EMAIL-1")]
    job_id: String,
    /// Job payload
    #[arg(long, default_value = "Hello with email!")]
    payload: String,
    /// Notification recipient (defaults to NOTIFICATION_TO)
    #[arg(long)]
    notify: Option<String>,
}

impl JobArgs {
    fn into_request(self) -> WorkRequest {
        WorkRequest {
            job_id: self.job_id,
            payload: self.payload,
            notify_target: self.notify,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Dispatch one job and wait for the broker's verdict
    Dispatch {
        #[command(flatten)]
        job: JobArgs,
        /// Seconds to wait for the publish confirm
        #[arg(long, default_value_t = 10)]
        confirm_timeout: u64,
        /// Also wait this many seconds for the worker's reply, received on a
        /// private queue that is removed afterwards
        #[arg(long)]
        wait_reply: Option<u64>,
    },
    /// Run the worker, and log replies sent to the shared reply queue, until Ctrl-C
    Serve {
        /// Concurrent consumers per queue
        #[arg(long, default_value_t = 4)]
        consumers: usize,
    },
    /// Run one job through an in-memory broker end to end
    Demo {
        #[command(flatten)]
        job: JobArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Dispatch {
            job,
            confirm_timeout,
            wait_reply,
        } => cmd_dispatch(job.into_request(), confirm_timeout, wait_reply).await,
        Command::Serve { consumers } => cmd_serve(consumers).await,
        Command::Demo { job } => cmd_demo(job.into_request()).await,
    }
}

struct Pgmq {
    telemetry: TelemetryGuard,
    config: Config,
    topology: Topology,
    tracker: Arc<ConfirmationTracker>,
    broker: Arc<PgmqBroker>,
}

async fn connect(service_name: &str) -> anyhow::Result<Pgmq> {
    let config = Config::from_env()?;
    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: service_name.to_string(),
        log_level: config.log_level.clone(),
    })?;

    let topology = config.topology()?;
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let tracker = Arc::new(ConfirmationTracker::new());
    let listener: Arc<dyn ConfirmListener> = tracker.clone();
    let broker = Arc::new(PgmqBroker::new(
        Arc::new(db),
        topology.clone(),
        listener,
        config.pgmq.clone(),
    ));
    broker.declare().await?;

    Ok(Pgmq {
        telemetry: guard,
        config,
        topology,
        tracker,
        broker,
    })
}

async fn cmd_dispatch(
    request: WorkRequest,
    confirm_timeout: u64,
    wait_reply: Option<u64>,
) -> anyhow::Result<()> {
    let env = connect("relay-dispatch").await?;
    let dispatcher = Dispatcher::new(env.broker.clone(), env.topology.clone(), env.tracker.clone());
    let confirm_timeout = Duration::from_secs(confirm_timeout);

    let Some(reply_secs) = wait_reply else {
        let dispatched = dispatcher.dispatch(request).await?;
        println!("Published with corrId={}", dispatched.token);
        let outcome = dispatched.confirmation.wait_timeout(confirm_timeout).await;
        env.telemetry.force_flush();
        println!("Broker accepted corrId={}", outcome?.correlation_token);
        return Ok(());
    };

    let reply_queue = env.topology.private_reply_queue();
    env.broker.declare_queue(&reply_queue).await?;
    let dispatcher = dispatcher.with_reply_address(ReplyAddress::direct(&reply_queue));

    let correlator = Arc::new(ReplyCorrelator::new());
    let subs = Subscriptions::new(env.broker.clone()).on(
        reply_queue.clone(),
        Arc::new(ReplyListener::new(env.broker.clone(), correlator.clone())),
    );
    let stop = subs.shutdown_handle();
    let consumers = tokio::spawn(subs.run());

    let reply = async {
        let pending = dispatcher.request(request, &correlator).await?;
        println!("Published with corrId={}", pending.token);
        pending.confirmation.wait_timeout(confirm_timeout).await?;
        let reply = pending
            .reply
            .wait_timeout(Duration::from_secs(reply_secs))
            .await?;
        anyhow::Ok((pending.token, reply))
    }
    .await;

    stop.shutdown();
    consumers.await??;
    env.broker.delete_queue(&reply_queue).await?;
    env.telemetry.force_flush();

    let (token, reply) = reply?;
    println!(
        "Reply corrId={} jobId={} status={} details={}",
        token, reply.job_id, reply.status, reply.details
    );
    Ok(())
}

async fn cmd_serve(consumers: usize) -> anyhow::Result<()> {
    let env = connect("relay").await?;

    let dedup = Arc::new(Deduplicator::new(
        env.config.dedup_ttl,
        env.config.dedup_sweep_every,
    ));
    let notifier = Arc::new(LogNotifier::new(
        &env.config.notification_from,
        &env.config.notification_to,
    ));
    let worker = Worker::new(env.broker.clone(), dedup, notifier);
    let replies = ReplyListener::new(env.broker.clone(), Arc::new(ReplyCorrelator::new()));

    let subs = Subscriptions::new(env.broker.clone())
        .on(env.topology.work_queue.clone(), Arc::new(worker))
        .on(env.topology.reply_queue.clone(), Arc::new(replies))
        .consumers_per_queue(consumers);

    let stop = subs.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stop.shutdown();
    });

    let result = subs.run().await;
    env.telemetry.force_flush();
    result?;
    Ok(())
}

async fn cmd_demo(request: WorkRequest) -> anyhow::Result<()> {
    let telemetry = init_telemetry(TelemetryConfig {
        endpoint: None,
        service_name: "relay-demo".to_string(),
        log_level: "info".to_string(),
    })?;

    let topology = Topology::default();
    let tracker = Arc::new(ConfirmationTracker::new());
    let listener: Arc<dyn ConfirmListener> = tracker.clone();
    let broker = Arc::new(InMemoryBroker::new(topology.clone(), listener));

    let correlator = Arc::new(ReplyCorrelator::new());
    let worker = Worker::new(
        broker.clone(),
        Arc::new(Deduplicator::new(DEFAULT_TTL, DEFAULT_SWEEP_EVERY)),
        Arc::new(LogNotifier::new("relay@localhost", "ops@localhost")),
    );
    let subs = Subscriptions::new(broker.clone())
        .on(topology.work_queue.clone(), Arc::new(worker))
        .on(
            topology.reply_queue.clone(),
            Arc::new(ReplyListener::new(broker.clone(), correlator.clone())),
        );
    let stop = subs.shutdown_handle();
    let consumers = tokio::spawn(subs.run());

    let dispatcher = Dispatcher::new(broker, topology, tracker);
    let pending = dispatcher.request(request, &correlator).await?;
    println!("Published with corrId={}", pending.token);

    let outcome = pending.confirmation.wait().await?;
    println!("Broker accepted corrId={}", outcome.correlation_token);
    let reply = pending.reply.wait_timeout(Duration::from_secs(5)).await?;
    println!(
        "Reply corrId={} jobId={} status={} details={}",
        pending.token, reply.job_id, reply.status, reply.details
    );

    stop.shutdown();
    consumers.await??;
    telemetry.force_flush();
    Ok(())
}

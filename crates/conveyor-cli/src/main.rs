//! conveyor - flow スケジューラのデモ用 CLI
//!
//! インメモリストアの上に `StoreFlowEngine` と `Worker` を組み立てて動かします。
//!
//! - `conveyor demo`: デモ flow を起動し、疑似クライアントが応答し続ける中でワーカーを回す
//! - `conveyor wake`: 止まった flow を作って復旧ツールで起こす
//! - `conveyor config`: 有効な設定を表示する

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conveyor_core::app::{WorkerBuilder, WorkerConfig, WorkerCounts, wake_stuck_flow};
use conveyor_core::domain::{
    ClientId, Message, Priority, QueueName, SessionId, Status, TaskIdGenerator,
};
use conveyor_core::impls::{FlowCall, FlowLogic, FlowRegistry, MemoryDataStore, StoreFlowEngine};
use conveyor_core::ports::{Clock, FlowError, SystemClock};
use conveyor_core::queue::QueueManager;
use conveyor_core::state::StateSchema;
use conveyor_core::typed::{TypeRegistry, Value};

const DEMO_CLIENT: &str = "C.0000000000000001";

#[derive(Debug, Parser)]
#[command(name = "conveyor", version, about = "Notification-driven flow scheduler")]
struct Cli {
    /// Worker configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a demo flow against a simulated client until it finishes.
    Demo {
        /// Number of client calls the flow makes.
        #[arg(long, default_value_t = 5)]
        calls: u64,

        /// Flow priority (0-7).
        #[arg(long, default_value_t = 1)]
        priority: u8,

        /// JSON arguments handed to the flow.
        #[arg(long)]
        args: Option<String>,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Stall a demo flow by losing its client tasks, then wake it.
    Wake {
        /// Session to wake; defaults to the stalled demo flow.
        session: Option<String>,
    },
    /// Print the effective worker configuration.
    Config,
}

/// Calls the client `calls` times and adds up the answers.
struct Tally;

#[async_trait]
impl FlowLogic for Tally {
    fn name(&self) -> &str {
        "Tally"
    }

    fn schema(&self) -> StateSchema {
        StateSchema::from_fields(&["answers", "args"])
    }

    async fn start(&self, call: &mut FlowCall<'_>) -> Result<(), FlowError> {
        let args = call.args().clone();
        let calls = args
            .to_json()
            .get("calls")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1);
        call.state_mut().set("args", args)?;
        call.state_mut().set("answers", Value::UInt(0))?;
        for i in 0..calls {
            call.call_client("Count", Value::UInt(i), "Answer")?;
        }
        Ok(())
    }

    async fn run_state(
        &self,
        state: &str,
        call: &mut FlowCall<'_>,
        responses: &[Message],
    ) -> Result<(), FlowError> {
        if state != "Answer" {
            return Err(FlowError::UnknownState(state.to_string()));
        }
        let answered = responses.iter().filter(|m| !m.is_status()).count() as u64;
        let total = match call.state().get("answers") {
            Some(Value::UInt(n)) => *n,
            _ => 0,
        };
        call.state_mut().set("answers", Value::UInt(total + answered))?;
        Ok(())
    }

    async fn end(&self, call: &mut FlowCall<'_>) -> Result<(), FlowError> {
        info!(session_id = %call.session_id(), answers = ?call.state().get("answers"), "tally finished");
        Ok(())
    }
}

/// In-memory store, queue manager and flow engine wired together.
struct Demo {
    manager: QueueManager,
    engine: Arc<StoreFlowEngine>,
    client: ClientId,
}

impl Demo {
    fn new(config: &WorkerConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(MemoryDataStore::new(Arc::clone(&clock)));
        let ids = Arc::new(TaskIdGenerator::new(Arc::clone(&clock)));
        let manager = QueueManager::new(store, clock, ids, config.notification_shards);

        let mut flows = FlowRegistry::new();
        flows.register(Tally)?;
        let engine = Arc::new(StoreFlowEngine::new(
            &manager,
            flows,
            Arc::new(TypeRegistry::with_builtins()),
            config.stuck_flows_timeout(),
        ));
        Ok(Self {
            manager,
            engine,
            client: ClientId::new(DEMO_CLIENT)?,
        })
    }

    async fn start_tally(&self, priority: Priority, args: Value) -> Result<SessionId> {
        let session = self
            .engine
            .start_flow("Tally", Some(self.client.clone()), QueueName::worker(), priority, args)
            .await?;
        Ok(session)
    }
}

/// 疑似クライアント: 自分宛てのタスクを取り出して応答を返し続ける
async fn client_loop(mut manager: QueueManager, client: ClientId, shutdown: CancellationToken) {
    loop {
        let tasks = match manager
            .query_and_own(&client, Duration::from_secs(60), 10)
            .await
        {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(error = %err, "client failed to fetch tasks");
                Vec::new()
            }
        };

        for task in &tasks {
            let answer = task.response(1, Value::from(format!("{} #{}", task.name, task.request_id)));
            let responses = match task.status(2, &Status::ok()) {
                Ok(status) => vec![answer, status],
                Err(err) => {
                    warn!(error = %err, "client failed to build a status");
                    continue;
                }
            };
            if let Err(err) = manager.receive_responses(&responses) {
                warn!(error = %err, "client failed to queue responses");
                continue;
            }
            if let Some(task_id) = task.task_id {
                manager.dequeue_client_request(&client, task_id);
            }
        }
        if let Err(err) = manager.flush().await {
            warn!(error = %err, "client failed to flush responses");
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
}

#[derive(Serialize)]
struct DemoReport {
    session_id: String,
    flow_state: String,
    answers: serde_json::Value,
    stats: WorkerCounts,
}

async fn run_demo(
    config: WorkerConfig,
    calls: u64,
    priority: u8,
    args: Option<String>,
    timeout: Duration,
) -> Result<()> {
    let demo = Demo::new(&config)?;

    // (A) ワーカーを組み立てる
    let worker = WorkerBuilder::new(demo.manager.copy(), demo.engine.clone())
        .config(config)
        .build()?;
    let worker = Arc::new(worker);

    // (B) flow を起動（CLI の JSON 引数に呼び出し回数を足す）
    let mut json: serde_json::Value = match args {
        Some(raw) => serde_json::from_str(&raw).context("--args is not valid JSON")?,
        None => serde_json::json!({}),
    };
    if let Some(map) = json.as_object_mut() {
        map.entry("calls").or_insert(serde_json::json!(calls));
    }
    let priority = Priority::new(priority)?;
    let session = demo.start_tally(priority, Value::from_json(json)).await?;
    info!(session_id = %session, "demo flow started");

    // (C) ワーカーと疑似クライアントを動かす
    let shutdown = CancellationToken::new();
    let runner = {
        let worker = Arc::clone(&worker);
        let token = shutdown.child_token();
        tokio::spawn(async move { worker.run(token).await })
    };
    let client = tokio::spawn(client_loop(
        demo.manager.copy(),
        demo.client.clone(),
        shutdown.child_token(),
    ));

    // (D) flow が終わるまでポーリングで待つ
    let deadline = tokio::time::Instant::now() + timeout;
    let outcome = loop {
        let inspection = demo.engine.inspect(&session).await?;
        if !inspection.context.is_running() {
            break Ok(inspection);
        }
        if tokio::time::Instant::now() >= deadline {
            break Err(anyhow::anyhow!("flow {session} did not finish within {timeout:?}"));
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Err(anyhow::anyhow!("interrupted")),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    };

    // (E) 止めてから結果を出す
    shutdown.cancel();
    runner.await.context("worker task panicked")?;
    client.await.context("client task panicked")?;

    let inspection = outcome?;
    let report = DemoReport {
        session_id: session.to_string(),
        flow_state: format!("{:?}", inspection.context.state),
        answers: inspection
            .state
            .get("answers")
            .map(Value::to_json)
            .unwrap_or(serde_json::Value::Null),
        stats: worker.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_wake(config: WorkerConfig, session: Option<String>) -> Result<()> {
    let demo = Demo::new(&config)?;
    let stalled = demo
        .start_tally(Priority::MEDIUM, Value::from_json(serde_json::json!({"calls": 3})))
        .await?;

    // クライアントがタスクを受け取ったまま落ちた状況を作る
    let mut manager = demo.manager.copy();
    let lost = manager
        .query_and_own(&demo.client, Duration::from_secs(60), 100)
        .await?;
    for task in &lost {
        if let Some(task_id) = task.task_id {
            manager.dequeue_client_request(&demo.client, task_id);
        }
    }
    manager.flush().await?;
    info!(session_id = %stalled, lost = lost.len(), "stalled demo flow");

    let target: SessionId = match session {
        Some(raw) => raw.parse()?,
        None => stalled,
    };
    let woken = wake_stuck_flow(&mut manager, &target).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "session_id": target.to_string(),
            "reinjected": woken,
        }))?
    );
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    let Some(path) = path else {
        return Ok(WorkerConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: WorkerConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    if config.queues.is_empty() {
        bail!("config file {} lists no queues", path.display());
    }
    Ok(config)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Demo {
            calls,
            priority,
            args,
            timeout_secs,
        } => run_demo(config, calls, priority, args, Duration::from_secs(timeout_secs)).await,
        Command::Wake { session } => run_wake(config, session).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

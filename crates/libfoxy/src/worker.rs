//! Per-token workers.
//!
//! A worker owns two tasks. The intake task admits work (acknowledging each
//! item before queueing it) and decides when the worker retires. The
//! execution task runs queued items one by one while holding the token's
//! lock, then routes each result to the primary channel or straight to the
//! caller waiting on it. A failing item is answered with `InternalError` and
//! the worker carries on with the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use foxy_protocol::{CLIENT_OK, Command, CommandKind, ErrorCode, ResponseLine};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::csp::TokenService;
use crate::upstream::{UpstreamError, UpstreamProvider, UpstreamSession};
use crate::storage::TokenState;
use crate::work::{Ack, Origin, ResultKind, Routing, WorkItem, WorkKind, WorkResult};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Retire a worker once it has been up this long.
    pub max_uptime: Duration,
    /// Retire a worker once it has executed more items than this.
    pub max_runs: u64,
    /// Receive timeout of both worker loops.
    pub reaction_time: Duration,
    pub intake_capacity: usize,
    /// How long a synchronous caller waits for its result.
    pub service_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_uptime: Duration::from_secs(600),
            max_runs: 800,
            reaction_time: Duration::from_secs(5),
            intake_capacity: 64,
            service_timeout: Duration::from_secs(200),
        }
    }
}

struct WorkerState {
    started: Instant,
    runs: AtomicU64,
    max_uptime: Duration,
    max_runs: u64,
}

impl WorkerState {
    fn time_is_up(&self) -> bool {
        self.started.elapsed() > self.max_uptime || self.runs.load(Ordering::Relaxed) > self.max_runs
    }
}

/// Handle the dispatcher keeps for a running worker.
pub struct WorkerRecord {
    pub id: u64,
    /// Token served, `None` for the administrative worker.
    pub token: Option<String>,
    pub(crate) intake: mpsc::Sender<WorkItem>,
    pub(crate) acks: Mutex<mpsc::Receiver<Ack>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl WorkerRecord {
    /// Retired workers stop accepting work.
    pub fn is_retired(&self) -> bool {
        self.intake.is_closed()
    }

    pub(crate) fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

/// Everything a new worker needs besides its identity.
pub(crate) struct WorkerContext {
    pub service: Arc<dyn TokenService>,
    pub provider: Arc<dyn UpstreamProvider>,
    pub results: mpsc::Sender<WorkResult>,
    pub config: PoolConfig,
}

pub(crate) fn spawn_worker(
    id: u64,
    token: Option<String>,
    lock: Option<Arc<Mutex<()>>>,
    ctx: &WorkerContext,
) -> Arc<WorkerRecord> {
    let capacity = ctx.config.intake_capacity.max(1);
    let (intake_tx, intake_rx) = mpsc::channel(capacity);
    let (internal_tx, internal_rx) = mpsc::channel(capacity);
    let (ack_tx, ack_rx) = mpsc::channel(capacity);

    let state = Arc::new(WorkerState {
        started: Instant::now(),
        runs: AtomicU64::new(0),
        max_uptime: ctx.config.max_uptime,
        max_runs: ctx.config.max_runs,
    });

    let intake = tokio::spawn(intake_loop(
        id,
        intake_rx,
        internal_tx,
        ack_tx,
        Arc::clone(&state),
        ctx.config.reaction_time,
    ));
    let execution = Execution::new(
        id,
        token.clone(),
        Arc::clone(&ctx.service),
        Arc::clone(&ctx.provider),
    );
    let execution = tokio::spawn(execution_loop(
        execution,
        internal_rx,
        lock,
        state,
        ctx.results.clone(),
        ctx.config.reaction_time,
    ));

    info!(worker = id, token = token.as_deref().unwrap_or("<admin>"), "worker started");
    Arc::new(WorkerRecord {
        id,
        token,
        intake: intake_tx,
        acks: Mutex::new(ack_rx),
        tasks: StdMutex::new(vec![intake, execution]),
    })
}

async fn intake_loop(
    id: u64,
    mut intake: mpsc::Receiver<WorkItem>,
    internal: mpsc::Sender<WorkItem>,
    acks: mpsc::Sender<Ack>,
    state: Arc<WorkerState>,
    reaction_time: Duration,
) {
    loop {
        match timeout(reaction_time, intake.recv()).await {
            Err(_) => {}
            Ok(None) => break,
            Ok(Some(item)) if item.kind == WorkKind::Kill => {
                intake.close();
                while let Ok(queued) = intake.try_recv() {
                    if queued.kind != WorkKind::Kill {
                        admit(id, queued, &internal, &acks).await;
                    }
                }
                // Queued behind everything admitted above.
                if internal.send(item).await.is_err() {
                    warn!(worker = id, "execution stopped before kill");
                }
                debug!(worker = id, "intake stopped");
                return;
            }
            Ok(Some(item)) => admit(id, item, &internal, &acks).await,
        }

        if state.time_is_up() {
            info!(
                worker = id,
                runs = state.runs.load(Ordering::Relaxed),
                uptime_secs = state.started.elapsed().as_secs(),
                "worker retiring"
            );
            intake.close();
            while let Some(queued) = intake.recv().await {
                if queued.kind != WorkKind::Kill {
                    admit(id, queued, &internal, &acks).await;
                }
            }
            break;
        }
    }
    debug!(worker = id, "intake stopped");
}

async fn admit(
    id: u64,
    item: WorkItem,
    internal: &mpsc::Sender<WorkItem>,
    acks: &mpsc::Sender<Ack>,
) {
    let ack = Ack {
        worker_id: id,
        ticket: item.ticket,
    };
    if acks.send(ack).await.is_err() {
        warn!(worker = id, ticket = item.ticket, "acknowledgement not delivered");
    }
    if internal.send(item).await.is_err() {
        error!(worker = id, ticket = ack.ticket, "execution stopped, admitted work lost");
    }
}

async fn execution_loop(
    mut execution: Execution,
    mut internal: mpsc::Receiver<WorkItem>,
    lock: Option<Arc<Mutex<()>>>,
    state: Arc<WorkerState>,
    primary: mpsc::Sender<WorkResult>,
    reaction_time: Duration,
) {
    let id = execution.id;
    loop {
        let mut item = match timeout(reaction_time, internal.recv()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(item)) => item,
        };
        state.runs.fetch_add(1, Ordering::Relaxed);
        if item.kind == WorkKind::Kill {
            break;
        }

        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let ticket = item.ticket;
        let routing = item.routing;
        let origin = std::mem::replace(&mut item.origin, Origin::Service);
        let reply = item.reply.take();
        let failed = failed_lines(&item);

        // A panicking call must only cost the current item.
        let spare = execution.spare();
        let task = tokio::spawn(async move {
            let outcome = execution.run(&item).await;
            (execution, outcome)
        });
        let outcome = match task.await {
            Ok((returned, outcome)) => {
                execution = returned;
                outcome
            }
            Err(err) => {
                error!(worker = id, ticket, "work item failed: {err}");
                execution = spare;
                Outcome {
                    kind: ResultKind::Generic,
                    lines: failed,
                    token_state: None,
                }
            }
        };

        let result = WorkResult {
            worker_id: id,
            ticket,
            kind: outcome.kind,
            lines: outcome.lines,
            origin,
            token_state: outcome.token_state,
        };
        match (routing, reply) {
            (Routing::Primary, _) => {
                if primary.send(result).await.is_err() {
                    error!(worker = id, ticket, "primary channel closed, result dropped");
                }
            }
            (Routing::Alternate, Some(reply)) => {
                if reply.send(result).is_err() {
                    debug!(worker = id, ticket, "caller gave up, result dropped");
                }
            }
            (Routing::Alternate, None) => {
                warn!(worker = id, ticket, "alternate result without a waiting caller, dropped");
            }
        }
    }
    execution.close().await;
    debug!(worker = id, "execution stopped");
}

/// `InternalError` for every command of an item that could not finish.
fn failed_lines(item: &WorkItem) -> Vec<ResponseLine> {
    item.commands
        .iter()
        .map(|command| ResponseLine::new(command.id.clone(), ErrorCode::InternalError))
        .collect()
}

struct Outcome {
    kind: ResultKind,
    lines: Vec<ResponseLine>,
    token_state: Option<TokenState>,
}

struct Execution {
    id: u64,
    token: Option<String>,
    service: Arc<dyn TokenService>,
    provider: Arc<dyn UpstreamProvider>,
    session: Option<Box<dyn UpstreamSession>>,
}

impl Execution {
    fn new(
        id: u64,
        token: Option<String>,
        service: Arc<dyn TokenService>,
        provider: Arc<dyn UpstreamProvider>,
    ) -> Self {
        Self {
            id,
            token,
            service,
            provider,
            session: None,
        }
    }

    /// Same worker identity without a session, used when a run is lost.
    fn spare(&self) -> Self {
        Self::new(
            self.id,
            self.token.clone(),
            Arc::clone(&self.service),
            Arc::clone(&self.provider),
        )
    }

    async fn session(&mut self) -> Result<&dyn UpstreamSession, UpstreamError> {
        if self.session.is_none() {
            self.session = Some(self.provider.connect().await?);
        }
        match &self.session {
            Some(session) => Ok(session.as_ref()),
            None => Err(UpstreamError::Unreachable("no session".into())),
        }
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.provider.close(session).await;
        }
    }

    async fn run(&mut self, item: &WorkItem) -> Outcome {
        let (kind, lines) = match &item.kind {
            WorkKind::SelectTerminal { name, max_readers } => {
                let lines = self
                    .service
                    .prioritize(name, *max_readers)
                    .into_iter()
                    .enumerate()
                    .map(|(n, entry)| ResponseLine::new((n + 1).to_string(), entry))
                    .collect();
                (ResultKind::Priority, lines)
            }
            _ => {
                let mut lines = Vec::with_capacity(item.commands.len());
                for command in &item.commands {
                    let line = self.command(item, command).await;
                    lines.push(ResponseLine::new(command.id.clone(), line));
                }
                let signs = item
                    .commands
                    .iter()
                    .any(|command| command.kind() == CommandKind::Sign);
                let kind = if signs {
                    ResultKind::PinInfo
                } else {
                    ResultKind::Generic
                };
                (kind, lines)
            }
        };

        let token_state = match (kind, &self.token) {
            (ResultKind::PinInfo, Some(token)) => self
                .service
                .inventory()
                .token_for_reader(token)
                .map(|record| record.state()),
            _ => None,
        };
        Outcome {
            kind,
            lines,
            token_state,
        }
    }

    async fn command(&mut self, item: &WorkItem, command: &Command) -> String {
        let kind = command.kind();
        debug!(worker = self.id, id = %command.id, command = %command.name, "executing");
        let data = command.data.as_deref();
        match kind {
            CommandKind::Alias => return self.service.aliases().join("|"),
            CommandKind::Enum => {
                return self.service.enumerate(&item.reader, data).join("|");
            }
            CommandKind::List => {
                let listed = self
                    .service
                    .list(&item.reader, data, command.object.as_deref());
                return listed.join("|");
            }
            CommandKind::Client => return CLIENT_OK.to_string(),
            CommandKind::Unknown => return ErrorCode::Unsupported.into(),
            CommandKind::Chain => return self.service.chain(&item.reader),
            CommandKind::Apdu | CommandKind::Sign | CommandKind::Reset => {}
        }

        let Some(token) = self.token.clone() else {
            return ErrorCode::ReaderNotFound.into();
        };
        if matches!(kind, CommandKind::Apdu | CommandKind::Sign) && data.is_none_or(str::is_empty) {
            return ErrorCode::WrongData.into();
        }
        let id = self.id;
        let service = Arc::clone(&self.service);
        let session = match self.session().await {
            Ok(session) => session,
            Err(err) => {
                error!(worker = id, token = %token, "no upstream session: {err}");
                return ErrorCode::InternalError.into();
            }
        };
        match kind {
            CommandKind::Apdu => service.apdu(session, &token, data.unwrap_or_default()).await,
            CommandKind::Sign => {
                service
                    .sign(
                        session,
                        &item.reader,
                        data.unwrap_or_default(),
                        item.password.as_deref(),
                    )
                    .await
            }
            _ => service.reset(session, &token).await,
        }
    }
}

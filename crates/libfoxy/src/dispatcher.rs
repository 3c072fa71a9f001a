//! Routes work items to per-token workers.
//!
//! Each token gets one worker at a time. Workers retire after their uptime or
//! run budget is spent, and the next submission for that token starts a
//! replacement. The token lock outlives workers, so a retiring worker still
//! finishing admitted work never overlaps with its replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use foxy_protocol::{CommandKind, decode_reader};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::csp::TokenService;
use crate::error::FoxyError;
use crate::upstream::UpstreamProvider;
use crate::work::{Routing, WorkItem, WorkKind, WorkResult};
use crate::worker::{PoolConfig, WorkerContext, WorkerRecord, spawn_worker};

/// Key of the administrative worker.
const ADMIN: &str = "";

/// A submission the pool did not take. The item is returned when it still
/// exists so the caller can answer its client.
#[derive(Debug)]
pub struct Rejected {
    pub error: FoxyError,
    pub item: Option<WorkItem>,
}

/// A submission a worker acknowledged.
#[derive(Debug, Clone, Copy)]
pub struct Accepted {
    pub worker_id: u64,
    pub ticket: u64,
}

pub struct Dispatcher {
    ctx: WorkerContext,
    workers: Mutex<HashMap<String, Arc<WorkerRecord>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_worker: AtomicU64,
    next_ticket: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher and the receiver of its primary result channel.
    pub fn new(
        service: Arc<dyn TokenService>,
        provider: Arc<dyn UpstreamProvider>,
        config: PoolConfig,
    ) -> (Arc<Self>, mpsc::Receiver<WorkResult>) {
        let (results, results_rx) = mpsc::channel(config.intake_capacity.max(1));
        let dispatcher = Self {
            ctx: WorkerContext {
                service,
                provider,
                results,
                config,
            },
            workers: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            next_worker: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
        };
        (Arc::new(dispatcher), results_rx)
    }

    pub fn service(&self) -> &Arc<dyn TokenService> {
        &self.ctx.service
    }

    /// Hand `item` to the worker of its token. Returns once the worker has
    /// acknowledged it. Its result arrives on the primary channel, so
    /// alternate items must go through [`Dispatcher::submit_and_wait`].
    pub async fn submit(&self, item: WorkItem) -> Result<Accepted, Rejected> {
        if item.routing == Routing::Alternate {
            return Err(Rejected {
                error: FoxyError::NoWaiter,
                item: Some(item),
            });
        }
        self.submit_routed(item).await
    }

    async fn submit_routed(&self, mut item: WorkItem) -> Result<Accepted, Rejected> {
        let key = match self.resolve(&item) {
            Ok(key) => key,
            Err(error) => {
                return Err(Rejected {
                    error,
                    item: Some(item),
                });
            }
        };
        loop {
            let worker = self.worker_for(&key).await;
            match self.send_to(&worker, &key, item).await {
                Ok(accepted) => return Ok(accepted),
                Err(Rejected {
                    item: Some(back),
                    error: FoxyError::WorkerLost(_),
                }) if worker.is_retired() => item = back,
                Err(rejected) => return Err(rejected),
            }
        }
    }

    /// Submit `item` for the alternate channel and wait for its result.
    ///
    /// The result is handed over on a channel of its own, so a caller that
    /// gives up never holds back the worker.
    pub async fn submit_and_wait(&self, mut item: WorkItem) -> Result<WorkResult, Rejected> {
        let (reply, result) = oneshot::channel();
        item.routing = Routing::Alternate;
        item.reply = Some(reply);
        let reader = item.reader.clone();
        let accepted = match self.submit_routed(item).await {
            Ok(accepted) => accepted,
            Err(mut rejected) => {
                if let Some(item) = rejected.item.as_mut() {
                    item.reply = None;
                }
                return Err(rejected);
            }
        };

        match timeout(self.ctx.config.service_timeout, result).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => {
                error!(worker = accepted.worker_id, ticket = accepted.ticket, "worker dropped the result");
                Err(Rejected {
                    error: FoxyError::WorkerLost(reader),
                    item: None,
                })
            }
            Err(_) => {
                error!(worker = accepted.worker_id, ticket = accepted.ticket, "no result in time");
                Err(Rejected {
                    error: FoxyError::Timeout(reader),
                    item: None,
                })
            }
        }
    }

    /// Send to one specific worker. A retired worker hands the item back as
    /// `WorkerLost` and is dropped from the table.
    async fn send_to(
        &self,
        worker: &Arc<WorkerRecord>,
        key: &str,
        mut item: WorkItem,
    ) -> Result<Accepted, Rejected> {
        item.token = (key != ADMIN).then(|| key.to_string());
        if item.ticket == 0 {
            item.ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        }
        let ticket = item.ticket;

        let mut acks = worker.acks.lock().await;
        if let Err(mpsc::error::SendError(back)) = worker.intake.send(item).await {
            drop(acks);
            debug!(worker = worker.id, key, "worker retired, replacing");
            self.forget(key, worker).await;
            return Err(Rejected {
                error: FoxyError::WorkerLost(key.to_string()),
                item: Some(back),
            });
        }
        // Acks of submitters cancelled after sending are still queued.
        loop {
            match acks.recv().await {
                Some(ack) if ack.ticket == ticket => {
                    debug!(worker = ack.worker_id, ticket, key, "work acknowledged");
                    return Ok(Accepted {
                        worker_id: ack.worker_id,
                        ticket,
                    });
                }
                Some(ack) => {
                    debug!(
                        worker = ack.worker_id,
                        stale = ack.ticket,
                        key,
                        "discarding stale acknowledgement"
                    );
                }
                None => {
                    error!(worker = worker.id, ticket, key, "worker stopped without acknowledging");
                    return Err(Rejected {
                        error: FoxyError::WorkerLost(key.to_string()),
                        item: None,
                    });
                }
            }
        }
    }

    /// Token key for `item`, or the administrative key.
    fn resolve(&self, item: &WorkItem) -> Result<String, FoxyError> {
        if matches!(item.kind, WorkKind::SelectTerminal { .. })
            || item.reader.is_empty()
            || item.commands.iter().all(|command| !command.kind().needs_token())
        {
            return Ok(ADMIN.to_string());
        }

        let inventory = self.ctx.service.inventory();
        let reader = decode_reader(&item.reader);
        if inventory.contains_reader(&reader) {
            return Ok(reader);
        }
        if let Some(reader) = inventory.reader_for_name(&item.reader) {
            return Ok(reader.to_string());
        }

        let by_name = item
            .commands
            .first()
            .is_some_and(|command| matches!(command.kind(), CommandKind::Chain | CommandKind::Sign));
        if by_name {
            let tokens = self.ctx.service.find_tokens(&item.reader);
            return match tokens.as_slice() {
                [token] => Ok(token.reader.clone()),
                [] => Err(FoxyError::ReaderNotFound(item.reader.clone())),
                _ => Err(FoxyError::VagueName(item.reader.clone())),
            };
        }
        Err(FoxyError::ReaderNotFound(item.reader.clone()))
    }

    async fn worker_for(&self, key: &str) -> Arc<WorkerRecord> {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get(key) {
            if !worker.is_retired() {
                return Arc::clone(worker);
            }
        }

        let lock = if key == ADMIN {
            None
        } else {
            let mut locks = self.locks.lock().await;
            Some(Arc::clone(locks.entry(key.to_string()).or_default()))
        };
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let token = (key != ADMIN).then(|| key.to_string());
        let worker = spawn_worker(id, token, lock, &self.ctx);
        workers.insert(key.to_string(), Arc::clone(&worker));
        worker
    }

    async fn forget(&self, key: &str, worker: &Arc<WorkerRecord>) {
        let mut workers = self.workers.lock().await;
        if workers.get(key).is_some_and(|current| Arc::ptr_eq(current, worker)) {
            workers.remove(key);
        }
    }

    /// Id of the live worker serving `token`, if any.
    pub async fn worker_id(&self, token: &str) -> Option<u64> {
        let workers = self.workers.lock().await;
        workers
            .get(token)
            .filter(|worker| !worker.is_retired())
            .map(|worker| worker.id)
    }

    /// Stop every worker after it finishes its admitted work.
    pub async fn shutdown(&self) {
        let workers: Vec<_> = self.workers.lock().await.drain().map(|(_, w)| w).collect();
        info!(workers = workers.len(), "stopping workers");
        for worker in &workers {
            let _acks = worker.acks.lock().await;
            if worker.intake.send(WorkItem::kill()).await.is_err() {
                debug!(worker = worker.id, "worker already retired");
            }
        }
        for worker in workers {
            for task in worker.take_tasks() {
                if let Err(err) = task.await {
                    error!(worker = worker.id, "worker task failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use foxy_protocol::{Command, ResponseLine};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    use crate::csp::{CspConfig, IcaService};
    use crate::mock::{MockCard, MockUpstream};
    use crate::storage::{Inventory, ReaderRecord, TokenRecord};
    use crate::upstream::UpstreamSession;
    use crate::work::{Origin, ResultKind};
    use std::sync::atomic::AtomicBool;

    const ATR: &str = "3BFF1300FF8131FE45";

    fn config() -> PoolConfig {
        PoolConfig {
            reaction_time: Duration::from_millis(20),
            service_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        }
    }

    fn inventory() -> Inventory {
        let mut inventory = Inventory::default();
        for (reader, name) in [
            ("T1", "commonName: Jan Novak"),
            ("T2", "commonName: Eva Novak"),
            ("T3", "commonName: Petr Svoboda"),
        ] {
            inventory.insert_reader(reader.into(), ReaderRecord::default());
            inventory.insert_token(TokenRecord::new(name.into(), None, reader.into()));
        }
        inventory
    }

    fn upstream() -> MockUpstream {
        let upstream = MockUpstream::new();
        for reader in ["T1", "T2", "T3"] {
            upstream.add_card(reader, MockCard::new(ATR));
        }
        upstream
    }

    fn ica(inventory: Inventory) -> Arc<IcaService> {
        let service = IcaService::new(CspConfig::default());
        service.install(inventory);
        Arc::new(service)
    }

    fn reset(reader: &str, id: &str) -> WorkItem {
        WorkItem::process(
            reader,
            None,
            vec![Command::new(id, "RESET")],
            Origin::Service,
            Routing::Primary,
        )
    }

    /// Records the interval each reset runs in.
    struct Recording {
        inner: IcaService,
        spans: std::sync::Mutex<Vec<(String, Instant, Instant)>>,
    }

    #[async_trait::async_trait]
    impl TokenService for Recording {
        fn inventory(&self) -> Arc<Inventory> {
            self.inner.inventory()
        }

        async fn init(&self, provider: Arc<dyn UpstreamProvider>) -> Result<(), FoxyError> {
            self.inner.init(provider).await
        }

        async fn apdu(&self, session: &dyn UpstreamSession, token: &str, command: &str) -> String {
            self.inner.apdu(session, token, command).await
        }

        async fn sign(
            &self,
            session: &dyn UpstreamSession,
            alias: &str,
            digest: &str,
            password: Option<&str>,
        ) -> String {
            self.inner.sign(session, alias, digest, password).await
        }

        async fn reset(&self, session: &dyn UpstreamSession, token: &str) -> String {
            let start = Instant::now();
            let atr = self.inner.reset(session, token).await;
            self.spans
                .lock()
                .expect("spans")
                .push((token.to_string(), start, Instant::now()));
            atr
        }
    }

    /// Panics on its first reset.
    struct Flaky {
        inner: IcaService,
        tripped: AtomicBool,
    }

    #[async_trait::async_trait]
    impl TokenService for Flaky {
        fn inventory(&self) -> Arc<Inventory> {
            self.inner.inventory()
        }

        async fn init(&self, provider: Arc<dyn UpstreamProvider>) -> Result<(), FoxyError> {
            self.inner.init(provider).await
        }

        async fn apdu(&self, session: &dyn UpstreamSession, token: &str, command: &str) -> String {
            self.inner.apdu(session, token, command).await
        }

        async fn sign(
            &self,
            session: &dyn UpstreamSession,
            alias: &str,
            digest: &str,
            password: Option<&str>,
        ) -> String {
            self.inner.sign(session, alias, digest, password).await
        }

        async fn reset(&self, session: &dyn UpstreamSession, token: &str) -> String {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("card service failed");
            }
            self.inner.reset(session, token).await
        }
    }

    #[tokio::test]
    async fn results_for_one_token_arrive_in_submission_order() {
        let upstream = upstream();
        let (dispatcher, mut results) =
            Dispatcher::new(ica(inventory()), Arc::new(upstream), config());

        for n in 0..10 {
            dispatcher
                .submit(reset("T1", &n.to_string()))
                .await
                .expect("accepted");
        }
        for n in 0..10 {
            let result = results.recv().await.expect("result");
            assert_eq!(result.lines, vec![ResponseLine::new(n.to_string(), ATR)]);
            assert_eq!(result.kind, ResultKind::Generic);
        }
    }

    #[tokio::test]
    async fn one_batch_at_a_time_per_token() {
        let upstream = upstream();
        upstream.set_delay(Duration::from_millis(15));
        let service = Arc::new(Recording {
            inner: IcaService::new(CspConfig::default()),
            spans: std::sync::Mutex::new(Vec::new()),
        });
        service.inner.install(inventory());
        let (dispatcher, mut results) = Dispatcher::new(
            Arc::clone(&service) as Arc<dyn TokenService>,
            Arc::new(upstream),
            config(),
        );

        let mut submitters = Vec::new();
        for n in 0..6 {
            let dispatcher = Arc::clone(&dispatcher);
            let reader = if n % 2 == 0 { "T1" } else { "T2" };
            submitters.push(tokio::spawn(async move {
                dispatcher.submit(reset(reader, &n.to_string())).await.is_ok()
            }));
        }
        for submitter in submitters {
            assert!(submitter.await.expect("join"));
        }
        for _ in 0..6 {
            results.recv().await.expect("result");
        }

        let spans = service.spans.lock().expect("spans").clone();
        assert_eq!(spans.len(), 6);
        for token in ["T1", "T2"] {
            let mut own: Vec<_> = spans.iter().filter(|(t, _, _)| t == token).collect();
            own.sort_by_key(|(_, start, _)| *start);
            for pair in own.windows(2) {
                assert!(pair[0].2 <= pair[1].1, "overlapping batches on {token}");
            }
        }
    }

    #[tokio::test]
    async fn retired_worker_is_replaced() {
        let upstream = upstream();
        let config = PoolConfig {
            max_runs: 3,
            ..config()
        };
        let (dispatcher, mut results) = Dispatcher::new(ica(inventory()), Arc::new(upstream), config);

        let first = dispatcher.submit(reset("T1", "1")).await.expect("accepted");
        for n in 2..=4 {
            dispatcher
                .submit(reset("T1", &n.to_string()))
                .await
                .expect("accepted");
        }
        for _ in 0..4 {
            results.recv().await.expect("result");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dispatcher.worker_id("T1").await, None);

        let next = dispatcher.submit(reset("T1", "5")).await.expect("accepted");
        assert_ne!(first.worker_id, next.worker_id);
        let result = results.recv().await.expect("result");
        assert_eq!(result.lines, vec![ResponseLine::new("5", ATR)]);
    }

    #[tokio::test]
    async fn terminal_selection_goes_to_requested_channel() {
        let upstream = upstream();
        let (dispatcher, mut results) =
            Dispatcher::new(ica(inventory()), Arc::new(upstream.clone()), config());

        let item = WorkItem::select_terminal("", 0, Origin::Service, Routing::Primary);
        dispatcher.submit(item).await.expect("accepted");
        let listed = results.recv().await.expect("primary result");
        assert_eq!(listed.kind, ResultKind::Priority);
        assert_eq!(listed.lines[0].id, "1");

        let item = WorkItem::select_terminal("USB T3", 3, Origin::Service, Routing::Primary);
        let selected = dispatcher.submit_and_wait(item).await.expect("alternate result");
        assert_eq!(selected.kind, ResultKind::Priority);
        assert_eq!(selected.lines, vec![ResponseLine::new("1", "Foxy USB T3 (---)")]);
        assert!(results.try_recv().is_err());
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn unresolved_names_are_rejected() {
        let (dispatcher, _results) =
            Dispatcher::new(ica(inventory()), Arc::new(upstream()), config());

        let sign = |reader: &str| {
            WorkItem::process(
                reader,
                None,
                vec![Command::new("1", "SIGN").with_data("a".repeat(40))],
                Origin::Service,
                Routing::Primary,
            )
        };
        let rejected = dispatcher.submit(sign("Novak")).await.expect_err("vague");
        assert!(matches!(rejected.error, FoxyError::VagueName(_)));
        assert!(rejected.item.is_some());

        let rejected = dispatcher.submit(sign("Dvorak")).await.expect_err("unknown");
        assert!(matches!(rejected.error, FoxyError::ReaderNotFound(_)));

        let rejected = dispatcher.submit(reset("Svoboda", "1")).await.expect_err("reset by name");
        assert!(matches!(rejected.error, FoxyError::ReaderNotFound(_)));

        let accepted = dispatcher.submit(sign("Svoboda")).await;
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn tcp_origin_travels_with_the_result() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            let mut reply = String::new();
            stream.read_to_string(&mut reply).await.expect("read");
            reply
        });

        let (dispatcher, mut results) =
            Dispatcher::new(ica(inventory()), Arc::new(upstream()), config());
        let (stream, _) = listener.accept().await.expect("accept");
        let item = WorkItem::process(
            "T1",
            None,
            vec![Command::new("1", "RESET")],
            Origin::Tcp(stream),
            Routing::Primary,
        );
        dispatcher.submit(item).await.expect("accepted");
        let result = results.recv().await.expect("result");
        crate::codec::deliver(result).await;

        assert_eq!(client.await.expect("client"), format!(">1:{ATR}#\n"));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_finishes_admitted_work() {
        let upstream = upstream();
        upstream.set_delay(Duration::from_millis(10));
        let (dispatcher, mut results) =
            Dispatcher::new(ica(inventory()), Arc::new(upstream), config());
        for n in 0..3 {
            dispatcher
                .submit(reset("T2", &n.to_string()))
                .await
                .expect("accepted");
        }
        dispatcher.shutdown().await;
        for _ in 0..3 {
            assert!(results.recv().await.is_some());
        }
        assert_eq!(dispatcher.worker_id("T2").await, None);
    }

    #[tokio::test]
    async fn failed_call_costs_only_its_own_item() {
        let service = Arc::new(Flaky {
            inner: IcaService::new(CspConfig::default()),
            tripped: AtomicBool::new(false),
        });
        service.inner.install(inventory());
        let (dispatcher, mut results) = Dispatcher::new(service, Arc::new(upstream()), config());

        let first = dispatcher.submit(reset("T1", "1")).await.expect("accepted");
        let failed = results.recv().await.expect("result");
        assert_eq!(failed.lines, vec![ResponseLine::new("1", "InternalError")]);

        let second = dispatcher.submit(reset("T1", "2")).await.expect("accepted");
        assert_eq!(first.worker_id, second.worker_id);
        let result = timeout(Duration::from_secs(2), results.recv())
            .await
            .expect("worker still running")
            .expect("result");
        assert_eq!(result.lines, vec![ResponseLine::new("2", ATR)]);
    }

    #[tokio::test]
    async fn abandoned_waiters_do_not_hold_the_token() {
        let upstream = upstream();
        upstream.set_delay(Duration::from_millis(5));
        let config = PoolConfig {
            intake_capacity: 2,
            ..config()
        };
        let (dispatcher, mut results) = Dispatcher::new(ica(inventory()), Arc::new(upstream), config);
        let waiting = |id: String| {
            WorkItem::process(
                "T1",
                None,
                vec![Command::new(id, "RESET")],
                Origin::Service,
                Routing::Alternate,
            )
        };

        for n in 0..8 {
            let _ = timeout(
                Duration::from_millis(1),
                dispatcher.submit_and_wait(waiting(n.to_string())),
            )
            .await;
        }
        let rejected = dispatcher
            .submit(waiting("x".into()))
            .await
            .expect_err("nobody waits for it");
        assert!(matches!(rejected.error, FoxyError::NoWaiter));

        dispatcher.submit(reset("T1", "last")).await.expect("accepted");
        let result = timeout(Duration::from_secs(2), results.recv())
            .await
            .expect("token not blocked")
            .expect("result");
        assert_eq!(result.lines, vec![ResponseLine::new("last", ATR)]);

        let answered = dispatcher
            .submit_and_wait(waiting("sync".into()))
            .await
            .expect("waiting caller answered");
        assert_eq!(answered.lines, vec![ResponseLine::new("sync", ATR)]);
    }
}

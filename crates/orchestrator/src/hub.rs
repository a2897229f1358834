//! Session routing
//!
//! The [`Orchestrator`] creates a worker the first time a session id is seen. Each session
//! gets its own robot link from the [`LinkConnector`], a [`SessionManager`] that connects and
//! supervises it, and a [`SessionWorker`]. Sessions share nothing mutable except the context
//! store, which isolates sessions from each other. A session whose context is swept as idle
//! is torn down: its worker stops, its link is released and the connector forgets it.

use crate::worker::{OrchestratorEvent, SessionServices, SessionWorker, WorkerSettings};
use crate::{BrainConfig, MetricsHub, OrchestratorError};
use dialogue::{Context, ContextStore, Resolver, RuleTable};
use intent_events::Utterance;
use parking_lot::Mutex;
use robot_link::{ConnectionError, LinkConnector, SessionConfig, SessionManager};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const INBOX_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 1024;

/// How a session ended. `Err` means the robot link was lost for good.
#[derive(Debug)]
pub struct SessionExit {
    pub session_id: String,
    pub result: Result<(), OrchestratorError>,
}

struct SessionHandle {
    inbox: mpsc::Sender<Arc<Utterance>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Orchestrator {
    connector: Arc<dyn LinkConnector>,
    services: SessionServices,
    session_config: SessionConfig,
    metrics: MetricsHub,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    /// Torn-down sessions still releasing their links
    retiring: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    exits_tx: mpsc::UnboundedSender<SessionExit>,
    exits_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionExit>>>,
}

impl Orchestrator {
    pub fn new(
        config: &BrainConfig,
        rules: Arc<RuleTable>,
        connector: Arc<dyn LinkConnector>,
    ) -> Result<Self, OrchestratorError> {
        let metrics = MetricsHub::new().map_err(OrchestratorError::Metrics)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let services = SessionServices {
            store: Arc::new(ContextStore::new(config.context_store_config())),
            resolver: Arc::new(Resolver::new(rules, config.resolver_config())),
            events,
            metrics: metrics.brain.clone(),
            settings: WorkerSettings {
                queue_bound: config.queue_bound,
                offline_policy: config.offline_policy,
                greeting: config.greeting.clone(),
                step_timeout_margin: config.step_timeout_margin(),
            },
        };
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Ok(Self {
            connector,
            services,
            session_config: config.session_config(),
            metrics,
            sessions: Mutex::new(HashMap::new()),
            retiring: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            exits_tx,
            exits_rx: Mutex::new(Some(exits_rx)),
        })
    }

    /// Hand an utterance to its session's worker, starting the session if needed.
    pub async fn submit(&self, session_id: &str, utterance: Utterance) -> Result<(), OrchestratorError> {
        let utterance = Arc::new(utterance);
        for _ in 0..2 {
            if self.shutdown.is_cancelled() {
                return Err(OrchestratorError::ShutDown);
            }
            let inbox = self.inbox(session_id)?;
            match inbox.send(utterance.clone()).await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    // the worker has ended; start the session again
                    debug!(session_id, "session worker gone, restarting session");
                    self.sessions.lock().remove(session_id);
                }
            }
        }
        Err(OrchestratorError::ShutDown)
    }

    fn inbox(&self, session_id: &str) -> Result<mpsc::Sender<Arc<Utterance>>, OrchestratorError> {
        let mut sessions = self.sessions.lock();
        if let Some(handle) = sessions.get(session_id) {
            if !handle.inbox.is_closed() {
                return Ok(handle.inbox.clone());
            }
        }
        let handle = self.spawn_session(session_id)?;
        let inbox = handle.inbox.clone();
        sessions.insert(session_id.to_string(), handle);
        Ok(inbox)
    }

    fn spawn_session(&self, session_id: &str) -> Result<SessionHandle, OrchestratorError> {
        let link = self
            .connector
            .open(session_id)
            .map_err(|source| OrchestratorError::Link {
                session_id: session_id.to_string(),
                source,
            })?;
        let manager = SessionManager::new(link.clone(), self.session_config);
        let (inbox, rx) = mpsc::channel(INBOX_CAPACITY);
        let worker = SessionWorker::new(session_id, self.services.clone(), link, manager.subscribe(), rx);

        info!(session_id, endpoint = manager.link().endpoint(), "starting session");
        self.metrics.brain.sessions_active.inc();
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(run_session(
            session_id.to_string(),
            manager,
            worker,
            cancel.clone(),
            self.connector.clone(),
            self.exits_tx.clone(),
            self.metrics.clone(),
        ));
        Ok(SessionHandle { inbox, cancel, task })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.services.events.subscribe()
    }

    /// Session exits, for whoever needs to react to a lost robot. Can be taken once.
    pub fn take_exits(&self) -> Option<mpsc::UnboundedReceiver<SessionExit>> {
        self.exits_rx.lock().take()
    }

    /// Evict idle conversation contexts and tear down their sessions. Returns how many
    /// contexts were removed.
    pub fn sweep_idle(&self) -> usize {
        let evicted = self.services.store.sweep();
        if evicted.is_empty() {
            return 0;
        }

        let mut retiring = self.retiring.lock();
        retiring.retain(|task| !task.is_finished());
        let mut sessions = self.sessions.lock();
        for session_id in &evicted {
            if let Some(handle) = sessions.remove(session_id) {
                debug!(%session_id, "stopping idle session");
                handle.cancel.cancel();
                retiring.push(handle.task);
            }
        }
        info!(evicted = evicted.len(), sessions = sessions.len(), "idle sessions evicted");
        evicted.len()
    }

    /// Snapshot of a session's conversation context.
    pub fn context(&self, session_id: &str) -> Context {
        self.services.store.get(session_id)
    }

    pub fn store(&self) -> Arc<ContextStore> {
        self.services.store.clone()
    }

    pub fn metrics(&self) -> &MetricsHub {
        &self.metrics
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Stop every session: cancel running plans, release links and wait for the workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut tasks: Vec<JoinHandle<()>> = self.retiring.lock().drain(..).collect();
        tasks.extend(self.sessions.lock().drain().map(|(_, handle)| handle.task));
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "session task ended abnormally");
            }
        }
        info!("orchestrator stopped");
    }
}

async fn run_session(
    session_id: String,
    mut manager: SessionManager,
    worker: SessionWorker,
    cancel: CancellationToken,
    connector: Arc<dyn LinkConnector>,
    exits: mpsc::UnboundedSender<SessionExit>,
    metrics: MetricsHub,
) {
    let worker_task = tokio::spawn(worker.run(cancel.clone()));

    let connected = tokio::select! {
        result = manager.connect() => result,
        _ = cancel.cancelled() => Ok(()),
    };
    let result: Result<(), ConnectionError> = match connected {
        Ok(()) => manager.supervise(cancel.clone()).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        error!(%session_id, error = %e, "robot link lost, ending session");
    }

    cancel.cancel();
    if let Err(e) = worker_task.await {
        error!(%session_id, error = %e, "session worker ended abnormally");
    }
    if result.is_ok() {
        connector.close(&session_id);
    }
    metrics.brain.sessions_active.dec();

    let _ = exits.send(SessionExit {
        result: result.map_err(|source| OrchestratorError::Connection {
            session_id: session_id.clone(),
            source,
        }),
        session_id,
    });
}

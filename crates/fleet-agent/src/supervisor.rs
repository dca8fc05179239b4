//! Start, stop and reset of the connection loop.

use std::{path::Path, sync::Arc};

use fleet_agent_core::{AgentContext, ConfigError, OperationError, RequestStore};
use fleet_agent_executor::{ExecuteError, RequestExecutor};
use fleet_agent_transport::{
    ConnectionEngine, Connector, EngineExit, EngineState, HttpRegistrar, PendingReplies,
    RegistrationError, Registrar, WsConnector,
    identity::{MACHINE_ID_FILE, resolve_device_id},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{dataplane::Dataplane, host::HostFactory};

/// Supervisor error.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to start dataplane: {0}")]
    DataplaneStart(#[source] OperationError),
    #[error("Failed to stop dataplane: {0}")]
    DataplaneStop(#[source] OperationError),
    #[error("Failed to restore stored configuration: {0}")]
    Restore(#[source] ExecuteError),
    #[error("No device id: set device_id or provide {MACHINE_ID_FILE}")]
    NoDeviceId,
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Builds the manager-facing seams for the current configuration.
pub trait LinkFactory: Send + Sync {
    /// Registrar for `device_id`.
    ///
    /// # Errors
    /// Returns error if the registrar cannot be built.
    fn registrar(
        &self,
        context: &AgentContext,
        device_id: &str,
    ) -> Result<Arc<dyn Registrar>, RegistrationError>;

    fn connector(&self, context: &AgentContext) -> Arc<dyn Connector>;
}

/// HTTPS registration and WebSocket sessions.
pub struct ManagerLinks;

impl LinkFactory for ManagerLinks {
    fn registrar(
        &self,
        context: &AgentContext,
        device_id: &str,
    ) -> Result<Arc<dyn Registrar>, RegistrationError> {
        let registrar = HttpRegistrar::new(
            &context.config.management_url,
            context.version.as_str(),
            device_id,
        )?;
        Ok(Arc::new(registrar))
    }

    fn connector(&self, context: &AgentContext) -> Arc<dyn Connector> {
        Arc::new(WsConnector::new(context.config.not_approved_status))
    }
}

/// Snapshot reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    /// Whether the connection loop runs.
    pub active: bool,
    pub state: EngineState,
    pub dataplane_running: bool,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<EngineExit>,
    state: watch::Receiver<EngineState>,
}

impl Running {
    fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

struct Inner {
    context: AgentContext,
    /// Dataplane control built from `context`.
    dataplane: Arc<dyn Dataplane>,
    running: Option<Running>,
}

/// Owns the connection loop and the dataplane lifecycle.
pub struct AgentSupervisor {
    inner: Mutex<Inner>,
    store: Arc<dyn RequestStore>,
    host: Arc<dyn HostFactory>,
    links: Arc<dyn LinkFactory>,
    pending: PendingReplies,
}

impl AgentSupervisor {
    #[must_use]
    pub fn new(
        context: AgentContext,
        store: Arc<dyn RequestStore>,
        host: Arc<dyn HostFactory>,
        links: Arc<dyn LinkFactory>,
    ) -> Self {
        let dataplane = host.dataplane(&context);
        Self {
            inner: Mutex::new(Inner {
                context,
                dataplane,
                running: None,
            }),
            store,
            host,
            links,
            pending: PendingReplies::default(),
        }
    }

    /// Start the connection loop. Does nothing if it already runs.
    ///
    /// The configuration is reloaded and the executor, dataplane control and
    /// checker are built anew from it. With `start_dataplane`, a stopped
    /// dataplane is started and the stored configuration applied to it.
    ///
    /// # Errors
    /// Returns error if the configuration cannot be reloaded, no device id
    /// is available, the dataplane fails to start or the stored
    /// configuration cannot be re-applied.
    pub async fn start(&self, start_dataplane: bool, check_system: bool) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        if inner.running.as_ref().is_some_and(Running::is_active) {
            tracing::debug!("Already started, ignoring");
            return Ok(());
        }
        // A loop that gave up on registration is reaped here.
        inner.running = None;

        inner.context = inner.context.reload()?;
        let context = inner.context.clone();
        let dataplane = self.host.dataplane(&context);
        inner.dataplane = Arc::clone(&dataplane);
        let executor = Arc::new(self.host.executor(&context, Arc::clone(&self.store)));

        let dataplane_running = dataplane.is_running().await;
        if check_system && !dataplane_running {
            if let Err(e) = self.host.checker(&context).check().await {
                tracing::error!(error = %e, "System checker failed, fix the problems and run 'fleet-agent start'");
            }
        }

        let device_id = resolve_device_id(
            context.config.device_id.as_deref(),
            Path::new(MACHINE_ID_FILE),
        )
        .await
        .ok_or(SupervisorError::NoDeviceId)?;
        let registrar = self.links.registrar(&context, &device_id)?;
        let connector = self.links.connector(&context);

        if start_dataplane {
            if dataplane_running {
                tracing::debug!("Dataplane already running");
            } else {
                start_dataplane_with_config(dataplane.as_ref(), &executor).await?;
            }
        }

        let engine = ConnectionEngine::new(context, device_id, executor, registrar, connector)
            .with_pending(self.pending.clone());
        let state = engine.subscribe();
        let cancel = engine.cancel_token();
        let task = tokio::spawn(engine.run());
        inner.running = Some(Running {
            cancel,
            task,
            state,
        });

        tracing::info!("Agent started");
        Ok(())
    }

    /// Stop the connection loop and wait for it to exit.
    ///
    /// # Errors
    /// Returns error if the dataplane fails to stop. The loop is stopped
    /// regardless.
    pub async fn stop(&self, stop_dataplane: bool) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        let running = inner.running.take();
        if let Some(running) = &running {
            running.cancel.cancel();
            tracing::debug!("Disconnect from manager initiated");
        }
        let dataplane = Arc::clone(&inner.dataplane);

        // No more requests can arrive, so the dataplane may go right away.
        let result = if stop_dataplane {
            dataplane
                .stop()
                .await
                .map_err(SupervisorError::DataplaneStop)
        } else {
            if dataplane.is_running().await {
                tracing::info!("Dataplane still running, use 'fleet-agent stop' to stop it");
            }
            Ok(())
        };

        if let Some(running) = running {
            match running.task.await {
                Ok(exit) => tracing::debug!(?exit, "Connection loop joined"),
                Err(e) => tracing::error!(error = %e, "Connection loop panicked"),
            }
        }
        if !self.pending.is_empty() {
            tracing::info!(count = self.pending.len(), "Replies kept for the next session");
        }

        tracing::info!("Agent stopped");
        result
    }

    /// Restart the loop with the dataplane stopped.
    ///
    /// # Errors
    /// Returns error if stopping or starting fails.
    pub async fn reset(&self) -> Result<(), SupervisorError> {
        self.stop(true).await?;
        self.start(false, true).await
    }

    pub async fn status(&self) -> AgentStatus {
        let (active, state, dataplane) = {
            let inner = self.inner.lock().await;
            let (active, state) = inner
                .running
                .as_ref()
                .map_or((false, EngineState::Stopped), |r| {
                    (r.is_active(), *r.state.borrow())
                });
            (active, state, Arc::clone(&inner.dataplane))
        };
        AgentStatus {
            active,
            state,
            dataplane_running: dataplane.is_running().await,
        }
    }

    /// Context as of the last start.
    pub async fn context(&self) -> AgentContext {
        self.inner.lock().await.context.clone()
    }
}

/// Start the dataplane and apply the stored configuration in replay order.
///
/// A stored `start-router` starts the dataplane itself once the interfaces
/// are handed over, so the dataplane is only started here without one.
async fn start_dataplane_with_config(
    dataplane: &dyn Dataplane,
    executor: &RequestExecutor,
) -> Result<(), SupervisorError> {
    let configured = executor
        .has_router_config()
        .await
        .map_err(|e| SupervisorError::Restore(e.into()))?;
    if !configured {
        dataplane
            .start()
            .await
            .map_err(SupervisorError::DataplaneStart)?;
        tracing::debug!("Dataplane started");
    }
    let restored = executor.restore().await.map_err(SupervisorError::Restore)?;
    tracing::info!(requests = restored, "Dataplane started with stored configuration");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        path::PathBuf,
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use fleet_agent_core::{Action, AgentConfig, OperationRunner, Request};
    use fleet_agent_executor::{SysfsResolver, TranslatorRegistry};
    use fleet_agent_store::MemoryStore;
    use fleet_agent_transport::Channel;
    use fleet_agent_transport::channel::ConnectionError;
    use serde_json::{Value, json};

    use super::*;
    use crate::system::SystemChecker;

    /// What the host did, in order.
    type Journal = Arc<StdMutex<Vec<String>>>;

    #[derive(Default)]
    pub(crate) struct FakeDataplane {
        pub running: AtomicBool,
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
        pub fail_start: bool,
        pub journal: Journal,
    }

    #[async_trait]
    impl Dataplane for FakeDataplane {
        async fn start(&self) -> Result<(), OperationError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(OperationError::InvalidCommand("no hugepages".into()));
            }
            self.journal.lock().unwrap().push("dataplane started".into());
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), OperationError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingChecker {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl SystemChecker for CountingChecker {
        async fn check(&self) -> Result<(), OperationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Registrar rejecting every attempt.
    struct Rejecting;

    #[async_trait]
    impl Registrar for Rejecting {
        async fn register(&self, _token: &str) -> Result<String, RegistrationError> {
            Err(RegistrationError::RejectedByManager("device limit reached".into()))
        }
    }

    /// Connector that never completes.
    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, _: &str, _: &str) -> Result<Box<dyn Channel>, ConnectionError> {
            std::future::pending().await
        }
    }

    pub(crate) struct FakeLinks;

    impl LinkFactory for FakeLinks {
        fn registrar(
            &self,
            _context: &AgentContext,
            _device_id: &str,
        ) -> Result<Arc<dyn Registrar>, RegistrationError> {
            Ok(Arc::new(Rejecting))
        }

        fn connector(&self, _context: &AgentContext) -> Arc<dyn Connector> {
            Arc::new(Unreachable)
        }
    }

    /// Records shell lines and helper descriptions into the journal.
    struct JournalRunner(Journal);

    #[async_trait]
    impl OperationRunner for JournalRunner {
        async fn run(&self, action: &Action) -> Result<(), OperationError> {
            let entry = if action.name == Action::EXEC {
                action.args.join(" ")
            } else {
                action.description.clone()
            };
            self.0.lock().unwrap().push(entry);
            Ok(())
        }
    }

    pub(crate) struct FakeHost {
        pub dataplane: Arc<FakeDataplane>,
        pub checker: Arc<CountingChecker>,
        /// Dataplane start command of every configuration the host was asked for.
        pub start_commands: StdMutex<Vec<String>>,
    }

    impl HostFactory for FakeHost {
        fn executor(&self, context: &AgentContext, store: Arc<dyn RequestStore>) -> RequestExecutor {
            RequestExecutor::new(
                TranslatorRegistry::with_defaults(
                    Arc::new(SysfsResolver::new(context.config.state_dir.clone())),
                    context.config.dataplane.clone(),
                ),
                store,
                Arc::new(JournalRunner(Arc::clone(&self.dataplane.journal))),
            )
        }

        fn dataplane(&self, context: &AgentContext) -> Arc<dyn Dataplane> {
            self.start_commands
                .lock()
                .unwrap()
                .push(context.config.dataplane.start_command.clone());
            self.dataplane.clone()
        }

        fn checker(&self, _context: &AgentContext) -> Arc<dyn SystemChecker> {
            self.checker.clone()
        }
    }

    pub(crate) struct Fixture {
        pub dir: tempfile::TempDir,
        pub dataplane: Arc<FakeDataplane>,
        pub checker: Arc<CountingChecker>,
        pub host: Arc<FakeHost>,
        pub store: Arc<dyn RequestStore>,
        pub supervisor: Arc<AgentSupervisor>,
    }

    impl Fixture {
        fn journal(&self) -> Vec<String> {
            self.dataplane.journal.lock().unwrap().clone()
        }
    }

    fn test_config(dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            device_id: Some("dev-test".into()),
            state_dir: dir.join("state"),
            token_file: dir.join("token.txt"),
            ..AgentConfig::default()
        }
    }

    fn assemble(dir: tempfile::TempDir, context: AgentContext, dataplane: FakeDataplane) -> Fixture {
        let dataplane = Arc::new(dataplane);
        let checker = Arc::new(CountingChecker::default());
        let host = Arc::new(FakeHost {
            dataplane: dataplane.clone(),
            checker: checker.clone(),
            start_commands: StdMutex::default(),
        });
        let store: Arc<dyn RequestStore> = Arc::new(MemoryStore::new());
        let supervisor = Arc::new(AgentSupervisor::new(
            context,
            store.clone(),
            host.clone(),
            Arc::new(FakeLinks),
        ));
        Fixture {
            dir,
            dataplane,
            checker,
            host,
            store,
            supervisor,
        }
    }

    pub(crate) fn fixture(dataplane: FakeDataplane) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let context = AgentContext::new(test_config(dir.path()));
        assemble(dir, context, dataplane)
    }

    /// Fixture whose context is loaded from a file with `start_command`.
    fn fixture_from_file(start_command: &str) -> (Fixture, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        write_config(&path, dir.path(), start_command);
        let context = AgentContext::load(&path).unwrap();
        (assemble(dir, context, FakeDataplane::default()), path)
    }

    fn write_config(path: &std::path::Path, dir: &std::path::Path, start_command: &str) {
        let config = format!(
            "device_id = \"dev-test\"\nstate_dir = \"{}\"\ntoken_file = \"{}\"\n\n[dataplane]\nstart_command = \"{start_command}\"\n",
            dir.join("state").display(),
            dir.join("token.txt").display(),
        );
        std::fs::write(path, config).unwrap();
    }

    fn route() -> Request {
        Request::new("add-route", json!({"addr": "8.8.8.8/32", "via": "10.0.0.1"}))
    }

    async fn store_route_and_router(store: &dyn RequestStore) {
        store
            .put("add-route:8.8.8.8/32:10.0.0.1", &route(), &[])
            .await
            .unwrap();
        store
            .put("start-router", &Request::new("start-router", Value::Null), &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let f = fixture(FakeDataplane::default());

        f.supervisor.start(false, true).await.unwrap();
        f.supervisor.start(false, true).await.unwrap();

        let status = f.supervisor.status().await;
        assert!(status.active);
        assert!(!status.dataplane_running);
        assert_eq!(f.checker.calls.load(Ordering::SeqCst), 1);

        f.supervisor.stop(false).await.unwrap();
        let status = f.supervisor.status().await;
        assert!(!status.active);
        assert_eq!(status.state, EngineState::Stopped);
        assert_eq!(f.dataplane.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dataplane_start_failure_keeps_inactive() {
        let f = fixture(FakeDataplane {
            fail_start: true,
            ..FakeDataplane::default()
        });

        let err = f.supervisor.start(true, false).await.unwrap_err();
        assert!(matches!(err, SupervisorError::DataplaneStart(_)));
        assert!(!f.supervisor.status().await.active);
    }

    #[tokio::test]
    async fn test_checker_skipped_while_dataplane_runs() {
        let f = fixture(FakeDataplane::default());
        f.dataplane.running.store(true, Ordering::SeqCst);

        f.supervisor.start(false, true).await.unwrap();
        assert_eq!(f.checker.calls.load(Ordering::SeqCst), 0);
        f.supervisor.stop(false).await.unwrap();
        assert!(f.dataplane.is_running().await);
    }

    #[tokio::test]
    async fn test_reset_stops_dataplane_and_restarts_loop() {
        let f = fixture(FakeDataplane::default());
        f.supervisor.start(true, false).await.unwrap();
        assert!(f.dataplane.is_running().await);

        f.supervisor.reset().await.unwrap();

        let status = f.supervisor.status().await;
        assert!(status.active);
        assert!(!status.dataplane_running);
        assert_eq!(f.dataplane.starts.load(Ordering::SeqCst), 1);
        assert_eq!(f.dataplane.stops.load(Ordering::SeqCst), 1);
        assert_eq!(f.checker.calls.load(Ordering::SeqCst), 1);

        f.supervisor.stop(false).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_loop_can_be_restarted() {
        let f = fixture(FakeDataplane::default());
        std::fs::write(f.dir.path().join("token.txt"), "tok\n").unwrap();

        f.supervisor.start(false, false).await.unwrap();
        while f.supervisor.status().await.active {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(f.supervisor.status().await.state, EngineState::Stopped);

        f.supervisor.start(false, false).await.unwrap();
        assert!(f.supervisor.status().await.active);
        f.supervisor.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_dataplane_start_restores_stored_configuration() {
        let f = fixture(FakeDataplane::default());
        f.store
            .put("add-route:8.8.8.8/32:10.0.0.1", &route(), &[])
            .await
            .unwrap();

        f.supervisor.start(true, false).await.unwrap();

        assert_eq!(f.journal(), ["dataplane started", "add route 8.8.8.8/32 via 10.0.0.1"]);
        let stored = f.store.get("add-route:8.8.8.8/32:10.0.0.1").await.unwrap().unwrap();
        assert_eq!(stored.operations.len(), 1);
        f.supervisor.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_stored_router_starts_dataplane_in_replay_order() {
        let f = fixture(FakeDataplane::default());
        store_route_and_router(f.store.as_ref()).await;

        f.supervisor.start(true, false).await.unwrap();

        let journal = f.journal();
        assert_eq!(f.dataplane.starts.load(Ordering::SeqCst), 0);
        let started = journal.iter().position(|e| e == "systemctl start vpp").unwrap();
        let route = journal
            .iter()
            .position(|e| e == "add route 8.8.8.8/32 via 10.0.0.1")
            .unwrap();
        assert!(started < route);
        f.supervisor.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_running_dataplane_not_restored_again() {
        let f = fixture(FakeDataplane::default());
        f.dataplane.running.store(true, Ordering::SeqCst);
        store_route_and_router(f.store.as_ref()).await;

        f.supervisor.start(true, false).await.unwrap();

        assert!(f.journal().is_empty());
        f.supervisor.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_reloaded_configuration_reaches_host_parts() {
        let (f, path) = fixture_from_file("start-dataplane-a");
        store_route_and_router(f.store.as_ref()).await;

        f.supervisor.start(true, false).await.unwrap();
        f.supervisor.stop(false).await.unwrap();

        write_config(&path, f.dir.path(), "start-dataplane-b");
        f.supervisor.start(true, false).await.unwrap();

        let commands = f.host.start_commands.lock().unwrap().clone();
        assert_eq!(commands.last().map(String::as_str), Some("start-dataplane-b"));
        assert!(commands.iter().any(|c| c == "start-dataplane-a"));

        let journal = f.journal();
        let first = journal.iter().position(|e| e == "start-dataplane-a").unwrap();
        let second = journal.iter().position(|e| e == "start-dataplane-b").unwrap();
        assert!(first < second);
        assert_eq!(f.supervisor.context().await.config.dataplane.start_command, "start-dataplane-b");

        f.supervisor.stop(false).await.unwrap();
    }
}

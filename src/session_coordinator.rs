use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerEvents};
use crate::config::Settings;
use crate::credential_session::{Credential, CredentialSession};
use crate::directory::DirectoryClient;
use crate::error::SessionError;
use crate::identity_provider::IdentityProvider;
use crate::streaming_client::{MessageRouter, StreamingClient, UpkeepOutcome};
use crate::telemetry_aggregator::TelemetryAggregator;

const COMMAND_CAPACITY: usize = 32;

/// Work handed from the scheduler and delivery contexts to the session worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    RefreshCredentials,
    Upkeep,
    /// Broker dropped a connection with `reason_code` at `reported_at`
    Reconnect {
        reason_code: u8,
        reported_at: Instant,
    },
}

/// Runs one credential session and its broker stream.
///
/// A single worker task performs every provider, directory and broker call;
/// timer tasks only enqueue [`WorkerCommand`]s for it.
pub struct SessionCoordinator {
    aggregator: Arc<TelemetryAggregator>,
    credentials: Arc<CredentialSession>,
    broker: Arc<dyn Broker>,
    commands: Sender<WorkerCommand>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    timers: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl SessionCoordinator {
    /// Authenticates, discovers devices and opens the subscribed stream, then
    /// starts the refresh and upkeep timers.
    ///
    /// Setup failures are returned here; the worker is not retried.
    pub async fn start<F>(
        settings: &Settings,
        provider: Arc<dyn IdentityProvider>,
        directory: DirectoryClient,
        broker_factory: F,
    ) -> Result<Self, SessionError>
    where
        F: FnOnce(Arc<dyn BrokerEvents>) -> Arc<dyn Broker>,
    {
        info!("Starting session coordinator");
        let aggregator = Arc::new(TelemetryAggregator::new());
        let credentials = Arc::new(CredentialSession::new(
            provider,
            settings.login_details(),
            settings.registration_policy,
        ));

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let router: Arc<dyn BrokerEvents> =
            Arc::new(MessageRouter::new(aggregator.clone(), commands.clone()));
        let broker = broker_factory(router);

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = SessionWorker {
            credentials: credentials.clone(),
            directory,
            aggregator: aggregator.clone(),
            stream: StreamingClient::new(
                broker.clone(),
                settings.broker_refresh_cycles,
                settings.realtime_timeout_secs,
            ),
            commands: command_rx,
            cancel: cancel.clone(),
        };
        let worker = tokio::spawn(worker.run(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                cancel.cancel();
                let _ = worker.await;
                return Err(e);
            }
            Err(_) => {
                // Worker vanished before reporting; surface why
                let reason = match worker.await {
                    Err(e) if e.is_panic() => "panicked during setup",
                    _ => "exited during setup",
                };
                return Err(SessionError::WorkerStopped(reason));
            }
        }

        let timers = vec![
            // First refresh is one full period after the initial flow
            spawn_timer(
                time::interval_at(
                    Instant::now() + settings.credential_refresh,
                    settings.credential_refresh,
                ),
                WorkerCommand::RefreshCredentials,
                commands.clone(),
                cancel.clone(),
            ),
            spawn_timer(
                time::interval(settings.upkeep_interval),
                WorkerCommand::Upkeep,
                commands.clone(),
                cancel.clone(),
            ),
        ];
        info!("Session coordinator running");

        Ok(Self {
            aggregator,
            credentials,
            broker,
            commands,
            cancel,
            worker,
            timers,
            shutdown_timeout: settings.shutdown_timeout,
        })
    }

    pub fn aggregator(&self) -> Arc<TelemetryAggregator> {
        self.aggregator.clone()
    }

    /// Observer registration; each notification means `get_values()` changed
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.aggregator.subscribe()
    }

    pub fn credential(&self) -> Option<Arc<Credential>> {
        self.credentials.current()
    }

    /// Queues a command for the worker outside the regular schedule
    pub async fn request(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    /// Stops the timers and the worker, waiting at most the configured
    /// shutdown timeout for the worker to close the broker connection and
    /// at most as long again for a best-effort disconnect after that.
    pub async fn shutdown(self) {
        info!("Shutting down session coordinator");
        self.cancel.cancel();
        for timer in &self.timers {
            timer.abort();
        }

        let mut worker = self.worker;
        match time::timeout(self.shutdown_timeout, &mut worker).await {
            Ok(Ok(())) => debug!("session worker stopped"),
            Ok(Err(e)) => error!(error = %e, "session worker ended abnormally"),
            Err(_) => {
                warn!(
                    timeout = ?self.shutdown_timeout,
                    "session worker did not stop in time, aborting"
                );
                worker.abort();
                match time::timeout(self.shutdown_timeout, self.broker.disconnect()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "best-effort broker disconnect failed"),
                    Err(_) => warn!(
                        timeout = ?self.shutdown_timeout,
                        "broker disconnect did not finish, abandoning it"
                    ),
                }
            }
        }
    }
}

fn spawn_timer(
    mut ticker: time::Interval,
    command: WorkerCommand,
    commands: Sender<WorkerCommand>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if commands.send(command).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

struct SessionWorker {
    credentials: Arc<CredentialSession>,
    directory: DirectoryClient,
    aggregator: Arc<TelemetryAggregator>,
    stream: StreamingClient,
    commands: Receiver<WorkerCommand>,
    cancel: CancellationToken,
}

impl SessionWorker {
    async fn run(mut self, ready: oneshot::Sender<Result<(), SessionError>>) {
        match self.setup().await {
            Ok(()) => {
                let _ = ready.send(Ok(()));
                self.serve().await;
            }
            Err(e) => {
                error!(error = %e, "session setup failed, worker terminating");
                let _ = ready.send(Err(e));
            }
        }

        if let Err(e) = self.stream.shutdown().await {
            warn!(error = %e, "broker disconnect failed during shutdown");
        }
        info!("Session worker stopped");
    }

    async fn setup(&mut self) -> Result<(), SessionError> {
        let credential = self.credentials.authenticate().await?;
        let discovery = self.directory.discover(&credential.id_token).await?;
        info!(
            house_id = %discovery.house_id,
            devices = discovery.devices.len(),
            "discovered devices"
        );

        self.aggregator
            .replace_devices(discovery.house_id, discovery.devices.clone());
        self.aggregator.set_user_id(credential.user_id.clone());

        self.stream.connect(credential.broker_keys()).await?;
        self.stream.subscribe(&discovery.devices).await?;
        Ok(())
    }

    async fn serve(&mut self) {
        loop {
            let command = tokio::select! {
                _ = self.cancel.cancelled() => return,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => return,
                },
            };
            self.handle(command).await;
        }
    }

    /// Command failures are logged and left to the next scheduled tick
    async fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::RefreshCredentials => match self.credentials.authenticate().await {
                Ok(credential) => {
                    self.aggregator.set_user_id(credential.user_id.clone());
                    self.stream.update_credentials(credential.broker_keys());
                }
                Err(e) => warn!(error = %e, "credential refresh failed, keeping previous credential"),
            },
            WorkerCommand::Upkeep => match self.stream.upkeep().await {
                Ok(UpkeepOutcome::KeptAlive) => debug!("upkeep cycle complete"),
                Ok(outcome) => info!(?outcome, "upkeep cycle reconnected broker session"),
                Err(e) => warn!(error = %e, "upkeep recovery failed"),
            },
            WorkerCommand::Reconnect {
                reason_code,
                reported_at,
            } => {
                if let Err(e) = self.stream.handle_disconnect(reason_code, reported_at).await {
                    warn!(error = %e, reason_code, "reconnect failed, upkeep will retry");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::REASON_CONNECTION_LOST;
    use crate::credential_session::tests::ScriptedProvider;
    use crate::streaming_client::tests::RecordingBroker;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    fn settings(directory_url: &str, upkeep_secs: u64) -> Settings {
        settings_with(
            directory_url,
            &[("UPKEEP_INTERVAL_SECS", upkeep_secs.to_string())],
        )
    }

    fn settings_with(directory_url: &str, overrides: &[(&'static str, String)]) -> Settings {
        let vars: HashMap<&str, String> = [
            ("EDP_USERNAME", "alice@example.com"),
            ("EDP_PASSWORD", "pw"),
            ("COGNITO_CLIENT_ID", "client"),
            ("COGNITO_CLIENT_SECRET", "secret"),
            ("COGNITO_USER_POOL_ID", "eu-west-1_pool"),
            ("COGNITO_IDENTITY_POOL_ID", "eu-west-1:pool"),
            ("IOT_HOST", "broker.invalid"),
            ("DIRECTORY_URL", directory_url),
        ]
        .into_iter()
        .map(|(key, value)| (key, value.to_string()))
        .chain(overrides.iter().cloned())
        .collect();
        Settings::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    async fn directory_server() -> mockito::ServerGuard {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/equipment/houses")
            .with_body(r#"{"houses": [{"houseId": "house-1"}]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/equipment/houses/house-1/device")
            .with_body(r#"[{"deviceId": "r1", "deviceLocalId": "aa11", "type": "meter"}]"#)
            .create_async()
            .await;
        server
            .mock("GET", "/equipment/houses/house-1/modules")
            .with_body(r#"{"Modules": [{"deviceId": "r1", "groups": ["PRODUCTION_METER"]}]}"#)
            .create_async()
            .await;
        server
    }

    #[tokio::test]
    async fn test_start_runs_setup_and_upkeep() {
        let server = directory_server().await;
        let broker = Arc::new(RecordingBroker::default());
        let factory_broker = broker.clone();

        let coordinator = SessionCoordinator::start(
            &settings(&server.url(), 3600),
            Arc::new(ScriptedProvider::default()),
            DirectoryClient::new(server.url()),
            move |_| factory_broker as Arc<dyn Broker>,
        )
        .await
        .unwrap();

        let credential = coordinator.credential().unwrap();
        assert_eq!(credential.access_token, "access-2");
        let snapshot = coordinator.aggregator().get_values();
        assert_eq!(snapshot.house_id.as_deref(), Some("house-1"));
        assert_eq!(snapshot.user_id.as_deref(), Some("stable-user"));
        assert_eq!(snapshot.available_device_ids, vec!["aa11".to_string()]);
        assert_eq!(broker.subscribed.lock().len(), 4);

        // Upkeep ticks immediately once running
        time::timeout(Duration::from_secs(2), async {
            while broker.published.lock().is_empty() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(broker.published.lock()[0].0, "meter/aa11/toDev/realtime");

        coordinator.shutdown().await;
        assert!(!broker.connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_setup_failure_is_returned() {
        let server = directory_server().await;
        let provider = Arc::new(ScriptedProvider::default());
        provider.fail_sign_in.store(true, Ordering::SeqCst);

        let result = SessionCoordinator::start(
            &settings(&server.url(), 3600),
            provider,
            DirectoryClient::new(server.url()),
            |_| Arc::new(RecordingBroker::default()) as Arc<dyn Broker>,
        )
        .await;

        assert!(matches!(result, Err(SessionError::Auth(_))));
    }

    #[tokio::test]
    async fn test_refresh_and_reconnect_commands() {
        let server = directory_server().await;
        let broker = Arc::new(RecordingBroker::default());
        let factory_broker = broker.clone();
        let events: Arc<parking_lot::Mutex<Option<Arc<dyn BrokerEvents>>>> = Default::default();
        let captured = events.clone();

        let coordinator = SessionCoordinator::start(
            &settings(&server.url(), 3600),
            Arc::new(ScriptedProvider::default()),
            DirectoryClient::new(server.url()),
            move |router| {
                *captured.lock() = Some(router);
                factory_broker as Arc<dyn Broker>
            },
        )
        .await
        .unwrap();

        assert!(coordinator.request(WorkerCommand::RefreshCredentials).await);
        time::timeout(Duration::from_secs(2), async {
            while coordinator.credential().map(|c| c.access_token.clone())
                != Some("access-4".to_string())
            {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        broker.connected.store(false, Ordering::SeqCst);
        let router = events.lock().clone().unwrap();
        router.on_disconnect(REASON_CONNECTION_LOST);
        time::timeout(Duration::from_secs(2), async {
            while broker.connects.load(Ordering::SeqCst) < 2 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            broker.last_keys.lock().clone().map(|keys| keys.access_key),
            Some("AKIA-id-4".to_string())
        );

        coordinator.shutdown().await;
    }

    fn sign_in_attempts(provider: &ScriptedProvider) -> usize {
        provider
            .calls
            .lock()
            .iter()
            .filter(|call| call.starts_with("auth:"))
            .count()
    }

    async fn wait_for_token(coordinator: &SessionCoordinator, token: &str) {
        time::timeout(Duration::from_secs(5), async {
            while coordinator.credential().map(|c| c.access_token.clone()).as_deref() != Some(token) {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("credential {token} never swapped in"));
    }

    #[tokio::test]
    async fn test_refresh_timer_swaps_credential_and_survives_failed_tick() {
        let server = directory_server().await;
        let provider = Arc::new(ScriptedProvider::default());
        let broker = Arc::new(RecordingBroker::default());
        let factory_broker = broker.clone();

        let coordinator = SessionCoordinator::start(
            &settings_with(
                &server.url(),
                &[
                    ("UPKEEP_INTERVAL_SECS", "3600".to_string()),
                    ("CREDENTIAL_REFRESH_SECS", "1".to_string()),
                ],
            ),
            provider.clone(),
            DirectoryClient::new(server.url()),
            move |_| factory_broker as Arc<dyn Broker>,
        )
        .await
        .unwrap();
        assert_eq!(sign_in_attempts(&provider), 2);

        // First tick is a full period away and fails
        provider.fail_sign_in.store(true, Ordering::SeqCst);
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sign_in_attempts(&provider), 2);

        time::timeout(Duration::from_secs(5), async {
            while sign_in_attempts(&provider) < 3 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            coordinator.credential().map(|c| c.access_token.clone()),
            Some("access-2".to_string())
        );

        // Next tick retries and swaps the credential in
        provider.fail_sign_in.store(false, Ordering::SeqCst);
        wait_for_token(&coordinator, "access-4").await;
        wait_for_token(&coordinator, "access-6").await;
        assert_eq!(
            broker.last_keys.lock().clone().map(|keys| keys.access_key),
            Some("AKIA-id-2".to_string())
        );

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_when_broker_hangs() {
        let server = directory_server().await;
        let broker = Arc::new(RecordingBroker::default());
        let factory_broker = broker.clone();

        let coordinator = SessionCoordinator::start(
            &settings_with(
                &server.url(),
                &[("SHUTDOWN_TIMEOUT_SECS", "1".to_string())],
            ),
            Arc::new(ScriptedProvider::default()),
            DirectoryClient::new(server.url()),
            move |_| factory_broker as Arc<dyn Broker>,
        )
        .await
        .unwrap();

        broker.hang_disconnect.store(true, Ordering::SeqCst);
        let stopped = time::timeout(Duration::from_secs(4), coordinator.shutdown()).await;
        assert!(stopped.is_ok(), "shutdown blocked on a hanging broker");
        assert_eq!(broker.disconnects.load(Ordering::SeqCst), 0);
    }
}

//! Shared application state for the Axum API server.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_common::error::AppError;
use courier_notifier::channel::{ConsumerPolicy, MessageChannel};
use courier_notifier::gateway::{PushGateway, SessionRegistry};
use courier_notifier::ledger::FailedMessageLedger;
use courier_notifier::producer::NotificationProducer;
use courier_notifier::store::NotificationStore;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub producer: NotificationProducer,
    pub gateway: PushGateway,
    pub store: Arc<dyn NotificationStore>,
    pub ledger: Arc<dyn FailedMessageLedger>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn NotificationStore>,
        ledger: Arc<dyn FailedMessageLedger>,
    ) -> Self {
        let producer = NotificationProducer::new(channel);
        let gateway = PushGateway::new(
            store.clone(),
            Arc::new(SessionRegistry::new()),
            producer.clone(),
        );
        Self {
            config,
            producer,
            gateway,
            store,
            ledger,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        self.gateway.sessions()
    }

    /// Run the push gateway consumers in the background.
    ///
    /// In-app sends are only useful while the gateway consumes them, so a
    /// gateway failure cancels `shutdown` and takes the server down with it.
    pub fn spawn_gateway(
        &self,
        channel: Arc<dyn MessageChannel>,
        policy: ConsumerPolicy,
        shutdown: CancellationToken,
    ) -> JoinHandle<Result<(), AppError>> {
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            let result = gateway
                .run(channel.as_ref(), policy, shutdown.clone())
                .await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Push gateway exited with error, shutting down");
                shutdown.cancel();
            }
            result
        })
    }
}

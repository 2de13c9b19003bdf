use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::admin::AdminService;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::notifier::{ChangeNotifier, WebhookNotifier};
use crate::router;
use crate::store::{DefaultStore, SqliteFlagStore};

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let secret = match config.validate().and_then(|_| config.webhook_secret()) {
        Ok(secret) => secret.to_owned(),
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return;
        }
    };

    let store = match SqliteFlagStore::from_config(&config).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to open flag store at {}: {}", config.database_url, e);
            return;
        }
    };
    if let Err(e) = store.seed().await {
        tracing::error!("Failed to seed initial flags: {}", e);
        return;
    }

    let notifier: Arc<dyn ChangeNotifier> = match WebhookNotifier::new(
        &config.webhook_url,
        &secret,
        config.webhook_timeout(),
    ) {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            tracing::error!("Failed to create webhook notifier: {}", e);
            return;
        }
    };

    let (dispatcher, worker) =
        Dispatcher::spawn(notifier.clone(), config.notification_queue_size);

    let store: Arc<dyn DefaultStore> = Arc::new(store);
    let admin = AdminService::new(store.clone(), dispatcher, config.admin_actor());
    let app = router::router(store, admin, notifier, &config);

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("listening on unknown address: {}", e),
    }
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("server error: {}", e);
    }

    // The router owned the last dispatcher handle, so the worker drains and exits
    if let Err(e) = worker.await {
        tracing::error!("notification worker failed: {}", e);
    }
}

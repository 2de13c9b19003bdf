use std::future::ready;
use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method, StatusCode},
    routing::{get, patch, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    admin::AdminService,
    api::endpoint,
    config::{AllowedOrigins, Config},
    metrics_utils::{setup_metrics_recorder, track_metrics},
    notifier::ChangeNotifier,
    store::DefaultStore,
};

#[derive(Clone)]
pub struct State {
    pub store: Arc<dyn DefaultStore>,
    pub admin: AdminService,
    pub notifier: Arc<dyn ChangeNotifier>,
}

fn cors_layer(origins: &AllowedOrigins) -> CorsLayer {
    let allow_origin = match origins {
        AllowedOrigins::Any => AllowOrigin::any(),
        AllowedOrigins::List(origins) => AllowOrigin::list(origins.iter().filter_map(|origin| {
            HeaderValue::from_str(origin)
                .map_err(|_| tracing::warn!("ignoring invalid allowed origin {}", origin))
                .ok()
        })),
    };

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(allow_origin)
}

pub fn router(
    store: Arc<dyn DefaultStore>,
    admin: AdminService,
    notifier: Arc<dyn ChangeNotifier>,
    config: &Config,
) -> Router {
    let state = State {
        store: store.clone(),
        admin,
        notifier,
    };

    // liveness/readiness checks
    let status_router = Router::new()
        .route("/", get(endpoint::index))
        .route("/_readiness", get(move || readiness(store.clone())))
        .route("/_liveness", get(|| ready("ok")));

    let flags_router = Router::new()
        .route("/api/flags", get(endpoint::list_flags))
        .route("/api/flags/defaults", post(endpoint::update_defaults))
        .route(
            "/api/flags/defaults/:flag_name",
            patch(endpoint::update_default),
        )
        .route(
            "/api/notify-flag-change",
            post(endpoint::notify_flag_change),
        )
        .layer(ConcurrencyLimitLayer::new(config.max_concurrency));

    let router = Router::new()
        .merge(status_router)
        .merge(flags_router)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.allowed_origins))
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // The recorder is process global, tests leave it off
    if *config.enable_metrics {
        match setup_metrics_recorder() {
            Ok(recorder_handle) => {
                router.route("/metrics", get(move || ready(recorder_handle.render())))
            }
            Err(e) => {
                tracing::error!("failed to install metrics recorder: {}", e);
                router
            }
        }
    } else {
        router
    }
}

pub async fn readiness(
    store: Arc<dyn DefaultStore>,
) -> Result<&'static str, (StatusCode, String)> {
    store.ping().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("flag store unavailable: {e}"),
        )
    })?;
    Ok("ready")
}

use axum::{
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::artifacts::{ArtifactBundle, ArtifactError};
use crate::calendar::{Clock, SystemClock};
use crate::config::ServiceConfig;
use crate::predictor::{FuturePrices, PredictError, PresentPrice, Predictor};
use crate::types::{ErrorBody, HealthStatus, PredictParams, ReloadStatus};

pub type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, msg: impl ToString) -> ApiError {
    (status, Json(ErrorBody { error: msg.to_string() }))
}

impl From<PredictError> for (StatusCode, Json<ErrorBody>) {
    fn from(e: PredictError) -> Self {
        let status = if e.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        api_error(status, e)
    }
}

/// Load the configured artifacts and wire them into a predictor.
pub fn build_predictor(cfg: &ServiceConfig, clock: Arc<dyn Clock>) -> Result<Predictor, ArtifactError> {
    let bundle = ArtifactBundle::load(&cfg.artifacts)?;
    Ok(Predictor::new(bundle)
        .with_clock(clock)
        .with_age_policy(cfg.flat_age)
        .with_feature_logging(cfg.log_features))
}

// ---------- Server state ----------

#[derive(Clone)]
pub struct AppState {
    // swapped wholesale on reload; readers clone the inner Arc and let go
    predictor: Arc<RwLock<Arc<Predictor>>>,
    config: Arc<ServiceConfig>,
    clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(predictor: Predictor, config: ServiceConfig) -> Self {
        Self {
            predictor: Arc::new(RwLock::new(Arc::new(predictor))),
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock handed to predictors built by [`AppState::reload`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn predictor(&self) -> Arc<Predictor> {
        self.predictor.read().clone()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Rebuild the predictor from disk and publish it. The current predictor
    /// stays in place if loading fails.
    pub fn reload(&self) -> Result<Arc<Predictor>, ArtifactError> {
        let fresh = Arc::new(build_predictor(&self.config, self.clock.clone())?);
        *self.predictor.write() = fresh.clone();
        tracing::info!("artifacts reloaded");
        Ok(fresh)
    }
}

// ---------- Handlers ----------

pub async fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "Backend is running!".to_string(),
    })
}

pub async fn predict(
    State(state): State<AppState>,
    Query(params): Query<PredictParams>,
) -> Result<Json<PresentPrice>, ApiError> {
    let query = params
        .into_query(&state.config().defaults)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    Ok(Json(state.predictor().predict_present(&query)?))
}

pub async fn predict_test(State(state): State<AppState>) -> Result<Json<PresentPrice>, ApiError> {
    Ok(Json(state.predictor().predict_present_sample()?))
}

pub async fn future_predict(
    State(state): State<AppState>,
    Query(params): Query<PredictParams>,
) -> Result<Json<FuturePrices>, ApiError> {
    let query = params
        .into_query(&state.config().defaults)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    Ok(Json(state.predictor().predict_future(&query)?))
}

pub async fn future_predict_test(State(state): State<AppState>) -> Result<Json<FuturePrices>, ApiError> {
    Ok(Json(state.predictor().predict_future_sample()?))
}

pub async fn reload(State(state): State<AppState>) -> Result<Json<ReloadStatus>, ApiError> {
    let fresh = tokio::task::spawn_blocking(move || state.reload())
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .map_err(|e| {
            tracing::error!("artifact reload failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        })?;
    let bundle = fresh.artifacts();
    Ok(Json(ReloadStatus {
        reloaded: true,
        present_model: bundle.present().regressor().describe(),
        future_model: bundle.future().regressor().describe(),
    }))
}

/// CORS for the browser frontend. An empty origin list allows any origin;
/// origins that are not valid header values are skipped.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| {
                HeaderValue::from_str(o)
                    .inspect_err(|_| tracing::warn!("ignoring invalid CORS origin {o:?}"))
                    .ok()
            })
            .collect();
        AllowOrigin::list(parsed)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config().cors_origins);
    Router::new()
        .route("/api/health", get(health))
        .route("/api/model/predict", get(predict))
        .route("/api/model/predict/test", get(predict_test))
        .route("/api/model/future/predict", get(future_predict))
        .route("/api/model/future/predict/test", get(future_predict_test))
        .route("/api/model/reload", post(reload))
        .layer(cors)
        .with_state(state)
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use tokio::time::Instant;
use shared::types::{
    ControllerSettings, LinkStatus, NetSettings, OutputId, OutputSettings, SensorId,
    SessionStatus, TempProfile,
};
use crate::bus::{Bus, Event};
use crate::link::table::NetworkView;
use crate::status::{Stamped, StatusView};
use crate::store_manager::StoreHandle;

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    pub bus: Bus,
    pub status: StatusView,
    pub sensor_count: usize,
    pub output_count: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/link", get(get_link))
        .route("/v1/session", get(get_session))
        .route("/v1/networks", get(get_networks))
        .route("/v1/scan/start", post(start_scan))
        .route("/v1/scan/stop", post(stop_scan))
        .route("/v1/network", put(put_network))
        .route("/v1/controllers/:id", put(put_controller))
        .route("/v1/outputs/:id", put(put_output))
        .route("/v1/profiles/:index", get(get_profile))
        .with_state(state)
}

async fn get_link(State(state): State<AppState>) -> Json<Stamped<LinkStatus>> {
    Json(state.status.link.borrow().clone())
}

async fn get_session(State(state): State<AppState>) -> Json<Stamped<SessionStatus>> {
    Json(state.status.session.borrow().clone())
}

async fn get_networks(State(state): State<AppState>) -> Json<Vec<NetworkView>> {
    let now = Instant::now();
    Json(
        state
            .status
            .networks
            .borrow()
            .iter()
            .map(|record| record.view(now))
            .collect(),
    )
}

async fn start_scan(State(state): State<AppState>) -> StatusCode {
    state.bus.publish(Event::ScanStart);
    StatusCode::ACCEPTED
}

async fn stop_scan(State(state): State<AppState>) -> StatusCode {
    state.bus.publish(Event::ScanStop);
    StatusCode::ACCEPTED
}

async fn put_network(
    State(state): State<AppState>,
    Json(settings): Json<NetSettings>,
) -> StatusCode {
    if let Err(e) = state.store.set_net_settings(settings).await {
        tracing::error!("Failed to store network settings: {:#}", e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    state.bus.publish(Event::NetworkSettingsChanged);
    StatusCode::NO_CONTENT
}

async fn put_controller(
    State(state): State<AppState>,
    Path(sensor_id): Path<SensorId>,
    Json(settings): Json<ControllerSettings>,
) -> StatusCode {
    if sensor_id as usize >= state.sensor_count {
        return StatusCode::NOT_FOUND;
    }
    if settings.sensor_id != sensor_id {
        return StatusCode::BAD_REQUEST;
    }

    if let Err(e) = state.store.set_controller_settings(settings).await {
        tracing::error!("Failed to store controller {} settings: {:#}", sensor_id, e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    state.bus.publish(Event::ControllerSettingsChanged(sensor_id));
    StatusCode::NO_CONTENT
}

async fn put_output(
    State(state): State<AppState>,
    Path(output_id): Path<OutputId>,
    Json(settings): Json<OutputSettings>,
) -> StatusCode {
    if output_id as usize >= state.output_count {
        return StatusCode::NOT_FOUND;
    }
    if settings.output_id != output_id {
        return StatusCode::BAD_REQUEST;
    }

    if let Err(e) = state.store.set_output_settings(settings).await {
        tracing::error!("Failed to store output {} settings: {:#}", output_id, e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    state.bus.publish(Event::OutputSettingsChanged(output_id));
    StatusCode::NO_CONTENT
}

async fn get_profile(
    State(state): State<AppState>,
    Path(index): Path<u32>,
) -> Result<Json<TempProfile>, StatusCode> {
    state
        .store
        .temp_profile(index)
        .await
        .map_err(|e| {
            tracing::error!("Failed to read profile {}: {:#}", index, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

//! Status HTTP API
//!
//! Read-only endpoints for operators and probes:
//! - `GET /health` - process liveness
//! - `GET /health/ready` - 200 once the node completed a reconciliation
//! - `GET /admin/status` - current ownership and peer view

use crate::common::{format_partitions, Result};
use crate::coordinator::ownership::OwnershipView;
use crate::coordinator::server::Service;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct StatusState {
    pub service_name: String,
    pub member_id: String,
    pub address: String,
    pub num_partitions: u32,
    pub started_at: DateTime<Utc>,
    pub ownership: OwnershipView,
}

pub fn create_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/health/ready", axum::routing::get(health_ready))
        .route("/admin/status", axum::routing::get(admin_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Ready once the node has reconciled at least once in its current session
async fn health_ready(State(state): State<StatusState>) -> impl IntoResponse {
    let snapshot = state.ownership.snapshot();
    let ready = snapshot.ticks > 0;
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        axum::Json(json!({
            "ready": ready,
            "peers": snapshot.peers.len(),
        })),
    )
}

async fn admin_status(State(state): State<StatusState>) -> impl IntoResponse {
    let snapshot = state.ownership.snapshot();
    axum::Json(json!({
        "service": state.service_name,
        "member_id": state.member_id,
        "address": state.address,
        "num_partitions": state.num_partitions,
        "owned": snapshot.owned,
        "owned_ranges": format_partitions(&snapshot.owned),
        "peers": snapshot.peers,
        "ticks": snapshot.ticks,
        "updated_at": snapshot.updated_at,
        "started_at": state.started_at,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Serves the status API for the lifetime of a node session.
pub struct StatusServer {
    bind_addr: SocketAddr,
    state: StatusState,
}

impl StatusServer {
    pub fn new(bind_addr: SocketAddr, state: StatusState) -> Self {
        Self { bind_addr, state }
    }
}

#[async_trait]
impl Service for StatusServer {
    fn name(&self) -> &str {
        "status-http"
    }

    async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        tracing::info!("  Status API: {}", self.bind_addr);
        axum::serve(listener, create_router(self.state.clone()))
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ownership::{OwnershipSnapshot, OwnershipTable};
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::BTreeSet;
    use tower::ServiceExt;

    fn state(table: &OwnershipTable) -> StatusState {
        StatusState {
            service_name: "orders".into(),
            member_id: "node-1".into(),
            address: "10.0.0.1:8177".into(),
            num_partitions: 4,
            started_at: Utc::now(),
            ownership: table.view(),
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let table = OwnershipTable::new();
        let (status, body) = get(create_router(state(&table)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_ready_after_first_tick() {
        let table = OwnershipTable::new();
        let router = create_router(state(&table));

        let (status, _) = get(router.clone(), "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        table.publish(OwnershipSnapshot {
            ticks: 1,
            ..Default::default()
        });
        let (status, body) = get(router, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_admin_status_reports_ownership() {
        let table = OwnershipTable::new();
        table.publish(OwnershipSnapshot {
            owned: BTreeSet::from([0, 1, 3]),
            peers: vec!["10.0.0.1:8177".into(), "10.0.0.2:8177".into()],
            ticks: 7,
            updated_at: Some(Utc::now()),
        });

        let (status, body) = get(create_router(state(&table)), "/admin/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "orders");
        assert_eq!(body["owned"], json!([0, 1, 3]));
        assert_eq!(body["owned_ranges"], "0-1,3");
        assert_eq!(body["peers"].as_array().unwrap().len(), 2);
        assert_eq!(body["ticks"], 7);
    }
}

//! HTTP surface: banner, state snapshot and client updates.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderName, Method};
use axum::routing::get;
use axum::{Json, Router};
use pendulum_core::{PendulumAgent, PendulumSnapshot, PendulumUpdate};
use pendulum_env::{MessageBus, NeighborSource, PendulumContext};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

type SharedAgent<Ctx, Bus, Nbr> = Arc<PendulumAgent<Ctx, Bus, Nbr>>;

/// Builds the instance router.
pub fn router<Ctx, Bus, Nbr>(agent: SharedAgent<Ctx, Bus, Nbr>) -> Router
where
    Ctx: PendulumContext,
    Bus: MessageBus,
    Nbr: NeighborSource,
{
    Router::new()
        .route("/", get(banner::<Ctx, Bus, Nbr>))
        .route(
            "/pendulum",
            get(get_pendulum::<Ctx, Bus, Nbr>).put(put_pendulum::<Ctx, Bus, Nbr>),
        )
        .layer(cors_layer())
        .with_state(agent)
}

/// Browser front ends are served from elsewhere; accept any origin.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ORIGIN,
            HeaderName::from_static("x-requested-with"),
            header::CONTENT_TYPE,
            header::ACCEPT,
        ])
}

async fn banner<Ctx, Bus, Nbr>(State(agent): State<SharedAgent<Ctx, Bus, Nbr>>) -> String
where
    Ctx: PendulumContext,
    Bus: MessageBus,
    Nbr: NeighborSource,
{
    format!("Pendulum Instance {} Server ...", agent.instance_id())
}

async fn get_pendulum<Ctx, Bus, Nbr>(
    State(agent): State<SharedAgent<Ctx, Bus, Nbr>>,
) -> Json<PendulumSnapshot>
where
    Ctx: PendulumContext,
    Bus: MessageBus,
    Nbr: NeighborSource,
{
    Json(agent.snapshot().await)
}

/// Never rejects: a body that doesn't parse is treated as an empty update.
async fn put_pendulum<Ctx, Bus, Nbr>(
    State(agent): State<SharedAgent<Ctx, Bus, Nbr>>,
    body: Bytes,
) -> Json<PendulumSnapshot>
where
    Ctx: PendulumContext,
    Bus: MessageBus,
    Nbr: NeighborSource,
{
    let update = PendulumUpdate::from_slice_lenient(&body);
    debug!(instance = %agent.instance_id(), ?update, "PUT /pendulum");
    Json(agent.apply_update(update).await)
}

//! Meetbook - Self-hosted Meeting Booking Engine

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tower_http::cors::{self, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use meetbook::config::Config;
use meetbook::error::Error;
use meetbook::models::MeetingType;
use meetbook::state::AppState;
use meetbook::{availability, bookings, bus, holds, ratelimit, realtime, sweeper, webhooks, workers};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let event_bus = bus::EventBus::connect(&config.nats_url).await?;
    event_bus.ensure_streams().await?;

    let state = AppState::new(db, event_bus, config.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = workers::spawn(&state, &shutdown_rx);
    handles.push(tokio::spawn(sweeper::run(state.clone(), shutdown_rx.clone())));

    let public = Router::new()
        .route("/book/:slug", get(get_meeting_type))
        .route("/book/:slug/slots", get(availability::get_slots))
        .route("/book/:slug/hold", post(holds::create_hold_handler))
        .route(
            "/book/:slug/hold/:hold_id",
            get(holds::get_hold_handler).delete(holds::release_hold_handler),
        )
        .route("/book/:slug/confirm", post(bookings::confirm_handler))
        .route(
            "/book/:slug/bookings/:booking_id",
            axum::routing::delete(bookings::cancel_handler),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ratelimit::public_rate_limit,
        ));

    let app = Router::new()
        .route(
            "/health",
            get(|| async { Json(serde_json::json!({"status": "healthy", "service": "meetbook"})) }),
        )
        .merge(public)
        .route("/realtime/slots/:meeting_type_id", get(realtime::slot_stream))
        .route("/webhooks/signwell", post(webhooks::signwell_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🚀 Meetbook listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(true);
    })
    .await?;

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(cors::Any)
        .allow_headers(cors::Any)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeetingTypeView {
    id: Uuid,
    slug: String,
    name: String,
    description: Option<String>,
    duration_minutes: i32,
    location: Option<String>,
    requires_nda: bool,
}

/// Public metadata for a booking page.
async fn get_meeting_type(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> meetbook::Result<Json<MeetingTypeView>> {
    let mt = MeetingType::active_by_slug(&state.db, &slug)
        .await?
        .ok_or(Error::NotFound("meeting type"))?;
    Ok(Json(MeetingTypeView {
        id: mt.id,
        slug: mt.slug,
        name: mt.name,
        description: mt.description,
        duration_minutes: mt.duration_minutes,
        location: mt.location,
        requires_nda: mt.requires_nda,
    }))
}

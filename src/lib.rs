//! Meetbook - Self-hosted Meeting Booking Engine
//!
//! The core of a booking platform: slot availability over recurring weekly
//! rules, short-lived exclusive holds, NDA-gated confirmation, a durable
//! event bus with retry and dead-lettering, real-time slot updates over SSE,
//! and idempotent e-signature webhook ingress.
//!
//! ## Components
//! - [`availability`] - candidate slots from rules, blackouts, buffers, occupancy
//! - [`holds`] - exclusive slot reservations with a 15 minute TTL
//! - [`bookings`] - hold conversion under idempotency and NDA gating
//! - [`bus`] - JetStream publish/subscribe with dedup, backoff and DLQ
//! - [`realtime`] - SSE fan-out of slot and booking events per meeting type
//! - [`webhooks`] - idempotent e-signature provider ingress

pub mod availability;
pub mod bookings;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod holds;
pub mod models;
pub mod ratelimit;
pub mod realtime;
pub mod signwell;
pub mod state;
pub mod sweeper;
pub mod webhooks;
pub mod workers;

pub use error::{Error, Result};

//! Process-wide dependency container, built once at startup and passed to
//! every handler and worker. No module-level singletons.

use std::sync::Arc;

use chrono_tz::Tz;
use sqlx::PgPool;

use crate::availability::parse_zone;
use crate::bus::EventBus;
use crate::config::Config;
use crate::error::Result;
use crate::models::{MeetingType, User};
use crate::ratelimit::RateLimiter;
use crate::signwell::SignwellClient;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub bus: EventBus,
    pub config: Arc<Config>,
    pub signwell: Option<SignwellClient>,
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(db: PgPool, bus: EventBus, config: Arc<Config>) -> Self {
        let signwell = config.signwell.as_ref().map(SignwellClient::new);
        AppState {
            db,
            bus,
            config,
            signwell,
            limiter: RateLimiter::new(),
        }
    }

    /// Resolves the host's IANA zone from a meeting type's owner.
    pub async fn host_zone(&self, meeting_type: &MeetingType) -> Result<Tz> {
        let owner = User::by_id(&self.db, meeting_type.owner_id)
            .await?
            .ok_or(crate::error::Error::NotFound("host"))?;
        parse_zone(&owner.timezone)
    }
}

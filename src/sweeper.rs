//! Hold expiration sweeper.
//!
//! Every sweep transitions lapsed active holds to `expired` with a
//! compare-and-set, so any number of processes can run it concurrently, and
//! announces `slot.released {reason: expired}` only for the rows this sweep
//! actually transitioned.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::Result;
use crate::events::{Envelope, Event, ReleaseReason, SlotReleased};
use crate::models::SlotHold;
use crate::state::AppState;

pub const SWEEP_PERIOD: Duration = Duration::from_secs(30);

pub async fn run(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SWEEP_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match sweep(&state).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(expired = n, "swept lapsed holds"),
                    Err(e) => tracing::error!(error = %e, "hold sweep failed"),
                }
            }
        }
    }
    tracing::info!("sweeper stopped");
}

pub async fn sweep(state: &AppState) -> Result<usize> {
    let expired = sqlx::query_as::<_, SlotHold>(
        "UPDATE slot_holds SET status = 'expired'
         WHERE status = 'active' AND expires_at < NOW()
         RETURNING *",
    )
    .fetch_all(&state.db)
    .await?;

    for hold in &expired {
        // Emitted only for rows this sweep transitioned; a row already
        // expired by another process never double-emits.
        state
            .bus
            .publish_logged(&Envelope::new(Event::SlotReleased(SlotReleased {
                hold_id: hold.id,
                meeting_type_id: hold.meeting_type_id,
                slot_start: hold.slot_start,
                slot_end: hold.slot_end,
                reason: ReleaseReason::Expired,
            })))
            .await;
    }

    Ok(expired.len())
}

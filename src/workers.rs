//! Background bus consumers: the post-confirmation notifier and the email
//! dispatcher. Both are plain durable consumers on the bus adapter; failures
//! ride the adapter's retry/DLQ policy and never propagate outward.

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{
    run_consumer, ConsumerSpec, ACK_WAIT_EXTERNAL, STREAM_BOOKINGS, STREAM_NOTIFICATIONS,
};
use crate::error::Result;
use crate::events::{
    EmailKind, EmailNotification, Envelope, Event, SUBJECT_BOOKING_CANCELED,
    SUBJECT_BOOKING_CONFIRMED, SUBJECT_EMAIL_REQUESTED,
};
use crate::state::AppState;

pub fn spawn(state: &AppState, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_consumer(
            state.clone(),
            shutdown.clone(),
            ConsumerSpec::durable(
                STREAM_BOOKINGS,
                "booking-notifier",
                &[SUBJECT_BOOKING_CONFIRMED, SUBJECT_BOOKING_CANCELED],
            ),
            notifier,
        ),
        spawn_consumer(
            state.clone(),
            shutdown.clone(),
            ConsumerSpec::durable(
                STREAM_NOTIFICATIONS,
                "email-dispatcher",
                &[SUBJECT_EMAIL_REQUESTED],
            )
            .with_ack_wait(ACK_WAIT_EXTERNAL),
            dispatcher,
        ),
    ]
}

fn spawn_consumer<F>(
    state: AppState,
    shutdown: watch::Receiver<bool>,
    spec: ConsumerSpec,
    handler: fn(AppState, Envelope) -> F,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let name = spec.name;
    tokio::spawn(async move {
        let bus = state.bus.clone();
        let st = state.clone();
        if let Err(e) =
            run_consumer(bus, spec, shutdown, move |env| handler(st.clone(), env)).await
        {
            tracing::error!(consumer = name, error = %e, "consumer terminated");
        }
    })
}

/// Turns booking lifecycle events into email work items.
async fn notifier(state: AppState, envelope: Envelope) -> Result<()> {
    let (booking, kind) = match &envelope.event {
        Event::BookingConfirmed(b) => (b, EmailKind::BookingConfirmation),
        Event::BookingCanceled(b) => (b, EmailKind::BookingCanceled),
        _ => return Ok(()),
    };
    state
        .bus
        .publish(&Envelope::new(Event::EmailRequested(EmailNotification {
            booking_id: booking.booking_id,
            recipient: booking.guest_email.clone(),
            kind,
        })))
        .await?;
    Ok(())
}

/// Delivers a requested email. Mail transport is an external collaborator;
/// without credentials this degrades to a logged no-op, but the work item is
/// still consumed and the sent event recorded.
async fn dispatcher(state: AppState, envelope: Envelope) -> Result<()> {
    let Event::EmailRequested(req) = &envelope.event else {
        return Ok(());
    };
    tracing::info!(
        booking_id = %req.booking_id,
        recipient = %req.recipient,
        kind = ?req.kind,
        "email dispatch (no mail transport configured, skipping delivery)"
    );
    state
        .bus
        .publish(&Envelope::new(Event::EmailSent(req.clone())))
        .await?;
    Ok(())
}

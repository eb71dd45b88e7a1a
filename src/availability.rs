//! Availability engine.
//!
//! Computes the candidate slot grid for a meeting type over a date window:
//! weekly rules unioned, blackout dates subtracted, buffers applied against
//! existing occupancy (active holds plus confirmed bookings). All
//! comparisons happen on absolute time; the guest's zone is used only to
//! render the response. Days are iterated by adding calendar days in the
//! host's zone, never 24h of absolute time, so DST boundaries behave.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::{Error, Result};
use crate::models::{AvailabilityRule, BlackoutDate, MeetingType};
use crate::state::AppState;

/// Earliest a slot may start relative to now. Strictly greater-than: a slot
/// starting exactly at now + lead is not bookable.
pub const MIN_LEAD_HOURS: i64 = 2;

/// Upper bound on a single listing request, in days.
const MAX_WINDOW_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub available: bool,
}

pub struct AvailabilityInputs<'a> {
    pub host_zone: Tz,
    pub duration_minutes: i64,
    pub buffer_before_minutes: i64,
    pub buffer_after_minutes: i64,
    /// Inclusive wall-clock date window in the host's zone.
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub rules: &'a [AvailabilityRule],
    pub blackouts: &'a [BlackoutDate],
    /// `[start, end)` intervals of active holds and confirmed bookings.
    pub occupancy: &'a [(DateTime<Utc>, DateTime<Utc>)],
    pub now: DateTime<Utc>,
}

/// Resolution bias for wall times that are ambiguous (DST fall-back) or
/// nonexistent (DST spring-forward).
#[derive(Clone, Copy)]
enum Bias {
    Earliest,
    Latest,
}

/// Maps a host-zone wall time to an instant. Ambiguous times resolve by
/// bias; times inside a DST gap shift forward past the transition.
fn wall_to_instant(tz: Tz, date: NaiveDate, time: NaiveTime, bias: Bias) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&date.and_time(time)) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(a, b) => Some(
            match bias {
                Bias::Earliest => a,
                Bias::Latest => b,
            }
            .with_timezone(&Utc),
        ),
        LocalResult::None => {
            let shifted = date.and_time(time) + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
                LocalResult::Ambiguous(a, _) => Some(a.with_timezone(&Utc)),
                LocalResult::None => None,
            }
        }
    }
}

pub fn compute_slots(inp: &AvailabilityInputs) -> Vec<Slot> {
    let duration = Duration::minutes(inp.duration_minutes);
    let buffer_before = Duration::minutes(inp.buffer_before_minutes);
    let buffer_after = Duration::minutes(inp.buffer_after_minutes);
    let earliest_start = inp.now + Duration::hours(MIN_LEAD_HOURS);

    let mut candidates: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();
    let mut day = inp.start_date;
    while day <= inp.end_date {
        let weekday = day.weekday().num_days_from_sunday() as i32;
        for rule in inp.rules.iter().filter(|r| {
            r.active
                && r.day_of_week == weekday
                && r.effective_from <= day
                && r.effective_until.map_or(true, |until| day < until)
        }) {
            candidates_for_rule(inp.host_zone, day, rule, duration, &mut candidates);
        }
        let Some(next) = day.succ_opt() else { break };
        day = next;
    }

    candidates.sort();
    candidates.dedup();

    candidates
        .into_iter()
        .map(|(start, end)| {
            let local_date = start.with_timezone(&inp.host_zone).date_naive();
            let available = start > earliest_start
                && !hits_blackout(inp.host_zone, local_date, inp.blackouts, start, end)
                && !hits_occupancy(
                    start - buffer_before,
                    end + buffer_after,
                    inp.occupancy,
                );
            Slot { start, end, available }
        })
        .collect()
}

/// Emits candidate slots for one rule on one day: fixed-duration stepping on
/// the absolute timeline, kept only while the wall-clock representation of
/// both endpoints stays inside the rule's window.
fn candidates_for_rule(
    tz: Tz,
    day: NaiveDate,
    rule: &AvailabilityRule,
    duration: Duration,
    out: &mut Vec<(DateTime<Utc>, DateTime<Utc>)>,
) {
    let Some(window_start) = wall_to_instant(tz, day, rule.start_time, Bias::Earliest) else {
        return;
    };
    let Some(window_end) = wall_to_instant(tz, day, rule.end_time, Bias::Latest) else {
        return;
    };

    let mut start = window_start;
    let mut guard = 0;
    while start + duration <= window_end {
        guard += 1;
        if guard > 2000 {
            tracing::warn!(rule_id = %rule.id, %day, "candidate generation guard tripped");
            break;
        }
        let end = start + duration;
        let start_wall = start.with_timezone(&tz);
        let end_wall = end.with_timezone(&tz);
        if start_wall.date_naive() == day
            && start_wall.time() >= rule.start_time
            && end_wall.date_naive() == day
            && end_wall.time() <= rule.end_time
        {
            out.push((start, end));
        }
        start = end;
    }
}

fn blackout_applies(blackout: &BlackoutDate, date: NaiveDate) -> bool {
    if blackout.recurring_yearly {
        blackout.date.month() == date.month() && blackout.date.day() == date.day()
    } else {
        blackout.date == date
    }
}

fn hits_blackout(
    tz: Tz,
    date: NaiveDate,
    blackouts: &[BlackoutDate],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> bool {
    blackouts.iter().any(|b| {
        if !blackout_applies(b, date) {
            return false;
        }
        match (b.start_time, b.end_time) {
            (Some(bs), Some(be)) => {
                if bs >= be {
                    // Malformed partial blackout.
                    return false;
                }
                let Some(bs) = wall_to_instant(tz, date, bs, Bias::Earliest) else {
                    return false;
                };
                let Some(be) = wall_to_instant(tz, date, be, Bias::Latest) else {
                    return false;
                };
                start < be && bs < end
            }
            // No times: the whole day is blacked out.
            _ => true,
        }
    })
}

fn hits_occupancy(
    buffered_start: DateTime<Utc>,
    buffered_end: DateTime<Utc>,
    occupancy: &[(DateTime<Utc>, DateTime<Utc>)],
) -> bool {
    occupancy
        .iter()
        .any(|(busy_start, busy_end)| buffered_start < *busy_end && *busy_start < buffered_end)
}

// --- Loading ---

pub async fn load_rules(
    db: &PgPool,
    meeting_type: &MeetingType,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<Vec<AvailabilityRule>> {
    let rules = sqlx::query_as::<_, AvailabilityRule>(
        "SELECT * FROM availability_rules
         WHERE owner_id = $1 AND active = TRUE
           AND (meeting_type_id IS NULL OR meeting_type_id = $2)
           AND effective_from <= $3
           AND (effective_until IS NULL OR effective_until > $4)",
    )
    .bind(meeting_type.owner_id)
    .bind(meeting_type.id)
    .bind(end_date)
    .bind(start_date)
    .fetch_all(db)
    .await?;
    Ok(rules)
}

pub async fn load_blackouts(
    db: &PgPool,
    meeting_type: &MeetingType,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<Vec<BlackoutDate>> {
    // Recurring entries are fetched unconditionally; month+day matching
    // happens per-day during computation.
    let blackouts = sqlx::query_as::<_, BlackoutDate>(
        "SELECT * FROM blackout_dates
         WHERE owner_id = $1
           AND (recurring_yearly = TRUE OR (date >= $2 AND date <= $3))",
    )
    .bind(meeting_type.owner_id)
    .bind(start_date)
    .bind(end_date)
    .fetch_all(db)
    .await?;
    Ok(blackouts)
}

pub async fn load_occupancy(
    db: &PgPool,
    meeting_type: &MeetingType,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
    let rows: Vec<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
        "SELECT slot_start, slot_end FROM slot_holds
          WHERE meeting_type_id = $1 AND status = 'active'
            AND slot_start < $3 AND slot_end > $2
         UNION ALL
         SELECT slot_start, slot_end FROM bookings
          WHERE meeting_type_id = $1 AND status = 'confirmed'
            AND slot_start < $3 AND slot_end > $2",
    )
    .bind(meeting_type.id)
    .bind(window_start)
    .bind(window_end)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

pub fn parse_zone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| Error::Validation(format!("unknown timezone: {name}")))
}

// --- HTTP ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotsQuery {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub timezone: String,
}

#[derive(Debug, Serialize)]
pub struct SlotView {
    pub start: String,
    pub end: String,
    pub available: bool,
}

#[derive(Debug, Serialize)]
pub struct SlotsResponse {
    pub slots: Vec<SlotView>,
}

pub async fn get_slots(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<SlotsQuery>,
) -> Result<Json<SlotsResponse>> {
    if query.end_date < query.start_date {
        return Err(Error::Validation("endDate precedes startDate".into()));
    }
    if (query.end_date - query.start_date).num_days() > MAX_WINDOW_DAYS {
        return Err(Error::Validation(format!(
            "window exceeds {MAX_WINDOW_DAYS} days"
        )));
    }
    let guest_zone = parse_zone(&query.timezone)?;

    let meeting_type = MeetingType::active_by_slug(&state.db, &slug)
        .await?
        .ok_or(Error::NotFound("meeting type"))?;
    let host_zone = state.host_zone(&meeting_type).await?;

    let rules = load_rules(&state.db, &meeting_type, query.start_date, query.end_date).await?;
    let blackouts =
        load_blackouts(&state.db, &meeting_type, query.start_date, query.end_date).await?;

    // Expand the occupancy window by the buffers so edge-adjacent rows are
    // visible to the buffered-interval test.
    let pad = Duration::minutes(
        (meeting_type.buffer_before_minutes + meeting_type.buffer_after_minutes) as i64,
    );
    let window_start = wall_to_instant(
        host_zone,
        query.start_date,
        NaiveTime::MIN,
        Bias::Earliest,
    )
    .ok_or_else(|| Error::Validation("unresolvable window start".into()))?
        - pad;
    let window_end = query
        .end_date
        .succ_opt()
        .and_then(|d| wall_to_instant(host_zone, d, NaiveTime::MIN, Bias::Latest))
        .ok_or_else(|| Error::Validation("unresolvable window end".into()))?
        + pad;
    let occupancy = load_occupancy(&state.db, &meeting_type, window_start, window_end).await?;

    let slots = compute_slots(&AvailabilityInputs {
        host_zone,
        duration_minutes: meeting_type.duration_minutes as i64,
        buffer_before_minutes: meeting_type.buffer_before_minutes as i64,
        buffer_after_minutes: meeting_type.buffer_after_minutes as i64,
        start_date: query.start_date,
        end_date: query.end_date,
        rules: &rules,
        blackouts: &blackouts,
        occupancy: &occupancy,
        now: Utc::now(),
    });

    Ok(Json(SlotsResponse {
        slots: slots
            .into_iter()
            .map(|s| SlotView {
                start: s.start.with_timezone(&guest_zone).to_rfc3339(),
                end: s.end.with_timezone(&guest_zone).to_rfc3339(),
                available: s.available,
            })
            .collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;
    use uuid::Uuid;

    fn rule(day_of_week: i32, start: (u32, u32), end: (u32, u32)) -> AvailabilityRule {
        AvailabilityRule {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            meeting_type_id: None,
            day_of_week,
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            effective_from: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            effective_until: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    fn blackout(date: (i32, u32, u32)) -> BlackoutDate {
        BlackoutDate {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            start_time: None,
            end_time: None,
            reason: None,
            recurring_yearly: false,
            created_at: Utc::now(),
        }
    }

    fn inputs<'a>(
        rules: &'a [AvailabilityRule],
        blackouts: &'a [BlackoutDate],
        occupancy: &'a [(DateTime<Utc>, DateTime<Utc>)],
        day: NaiveDate,
    ) -> AvailabilityInputs<'a> {
        AvailabilityInputs {
            host_zone: New_York,
            duration_minutes: 30,
            buffer_before_minutes: 0,
            buffer_after_minutes: 0,
            start_date: day,
            end_date: day,
            rules,
            blackouts,
            occupancy,
            now: Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn tuesday_morning_rule_yields_two_utc_slots() {
        // 09:00-10:00 America/New_York on Tue 2025-04-08 is 13:00-14:00Z (EDT).
        let rules = [rule(2, (9, 0), (10, 0))];
        let day = NaiveDate::from_ymd_opt(2025, 4, 8).unwrap();
        let slots = compute_slots(&inputs(&rules, &[], &[], day));
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].start, Utc.with_ymd_and_hms(2025, 4, 8, 13, 0, 0).unwrap());
        assert_eq!(slots[1].start, Utc.with_ymd_and_hms(2025, 4, 8, 13, 30, 0).unwrap());
        assert!(slots.iter().all(|s| s.available));
    }

    #[test]
    fn lead_time_boundary_is_strict() {
        let rules = [rule(2, (9, 0), (10, 0))];
        let day = NaiveDate::from_ymd_opt(2025, 4, 8).unwrap();
        let mut inp = inputs(&rules, &[], &[], day);
        // First slot starts 13:00Z; now + 2h == 13:00Z exactly.
        inp.now = Utc.with_ymd_and_hms(2025, 4, 8, 11, 0, 0).unwrap();
        let slots = compute_slots(&inp);
        assert!(!slots[0].available, "start == now + lead must not be available");
        assert!(slots[1].available);
    }

    #[test]
    fn occupied_slot_is_marked_unavailable() {
        let rules = [rule(2, (9, 0), (10, 0))];
        let day = NaiveDate::from_ymd_opt(2025, 4, 8).unwrap();
        let occupancy = [(
            Utc.with_ymd_and_hms(2025, 4, 8, 13, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 4, 8, 13, 30, 0).unwrap(),
        )];
        let slots = compute_slots(&inputs(&rules, &[], &occupancy, day));
        assert!(!slots[0].available);
        assert!(slots[1].available);
    }

    #[test]
    fn buffered_interval_touching_occupancy_is_still_available() {
        // Half-open intervals: buffered end == busy start is not a hit.
        let rules = [rule(2, (9, 0), (10, 0))];
        let day = NaiveDate::from_ymd_opt(2025, 4, 8).unwrap();
        let occupancy = [(
            Utc.with_ymd_and_hms(2025, 4, 8, 13, 45, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 4, 8, 14, 0, 0).unwrap(),
        )];
        let mut inp = inputs(&rules, &[], &occupancy, day);
        inp.buffer_after_minutes = 15;
        let slots = compute_slots(&inp);
        // 13:00-13:30 buffered to 13:45 touches the busy interval: available.
        assert!(slots[0].available);
        // 13:30-14:00 buffered to 14:15 overlaps it: unavailable.
        assert!(!slots[1].available);
    }

    #[test]
    fn full_day_blackout_blocks_every_slot() {
        let rules = [rule(2, (9, 0), (10, 0))];
        let day = NaiveDate::from_ymd_opt(2025, 4, 8).unwrap();
        let blackouts = [blackout((2025, 4, 8))];
        let slots = compute_slots(&inputs(&rules, &blackouts, &[], day));
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(|s| !s.available));
    }

    #[test]
    fn partial_blackout_blocks_only_the_interval() {
        let rules = [rule(2, (9, 0), (10, 0))];
        let day = NaiveDate::from_ymd_opt(2025, 4, 8).unwrap();
        let mut b = blackout((2025, 4, 8));
        b.start_time = NaiveTime::from_hms_opt(9, 0, 0);
        b.end_time = NaiveTime::from_hms_opt(9, 30, 0);
        let slots = compute_slots(&inputs(&rules, &[b], &[], day));
        assert!(!slots[0].available);
        assert!(slots[1].available);
    }

    #[test]
    fn malformed_partial_blackout_is_ignored() {
        let rules = [rule(2, (9, 0), (10, 0))];
        let day = NaiveDate::from_ymd_opt(2025, 4, 8).unwrap();
        let mut b = blackout((2025, 4, 8));
        b.start_time = NaiveTime::from_hms_opt(12, 0, 0);
        b.end_time = NaiveTime::from_hms_opt(9, 0, 0);
        let slots = compute_slots(&inputs(&rules, &[b], &[], day));
        assert!(slots.iter().all(|s| s.available));
    }

    #[test]
    fn recurring_yearly_blackout_matches_month_and_day() {
        let rules = [rule(2, (9, 0), (10, 0))];
        let day = NaiveDate::from_ymd_opt(2025, 4, 8).unwrap();
        let mut b = blackout((2019, 4, 8));
        b.recurring_yearly = true;
        let slots = compute_slots(&inputs(&rules, &[b], &[], day));
        assert!(slots.iter().all(|s| !s.available));
    }

    #[test]
    fn spring_forward_gap_produces_no_candidates() {
        // US DST 2025: clocks jump 02:00 -> 03:00 on Sun 2025-03-09.
        let rules = [rule(0, (2, 0), (3, 0))];
        let day = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        let mut inp = inputs(&rules, &[], &[], day);
        inp.now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let slots = compute_slots(&inp);
        assert!(slots.is_empty(), "the missing hour has no wall-clock slots");
    }

    #[test]
    fn fall_back_hour_yields_two_instants_per_wall_label() {
        // US DST 2025: clocks repeat 01:00-02:00 on Sun 2025-11-02.
        let rules = [rule(0, (1, 0), (2, 0))];
        let day = NaiveDate::from_ymd_opt(2025, 11, 2).unwrap();
        let mut inp = inputs(&rules, &[], &[], day);
        inp.now = Utc.with_ymd_and_hms(2025, 10, 1, 0, 0, 0).unwrap();
        let slots = compute_slots(&inp);
        // 01:00 and 01:30 EDT, then 01:00 and 01:30 EST: four absolute slots.
        assert_eq!(slots.len(), 4);
        let starts: Vec<_> = slots.iter().map(|s| s.start).collect();
        assert_eq!(starts[0], Utc.with_ymd_and_hms(2025, 11, 2, 5, 0, 0).unwrap());
        assert_eq!(starts[1], Utc.with_ymd_and_hms(2025, 11, 2, 5, 30, 0).unwrap());
        assert_eq!(starts[2], Utc.with_ymd_and_hms(2025, 11, 2, 6, 0, 0).unwrap());
        assert_eq!(starts[3], Utc.with_ymd_and_hms(2025, 11, 2, 6, 30, 0).unwrap());
    }

    #[test]
    fn rules_outside_their_effective_window_do_not_fire() {
        let mut r = rule(2, (9, 0), (10, 0));
        r.effective_until = Some(NaiveDate::from_ymd_opt(2025, 4, 8).unwrap());
        let day = NaiveDate::from_ymd_opt(2025, 4, 8).unwrap();
        // effective_until is exclusive: the rule died before this Tuesday.
        let rules = [r];
        let slots = compute_slots(&inputs(&rules, &[], &[], day));
        assert!(slots.is_empty());
    }

    #[test]
    fn overlapping_rules_union_without_duplicates() {
        let rules = [rule(2, (9, 0), (10, 0)), rule(2, (9, 0), (11, 0))];
        let day = NaiveDate::from_ymd_opt(2025, 4, 8).unwrap();
        let slots = compute_slots(&inputs(&rules, &[], &[], day));
        // 09:00..11:00 every 30 min, no duplicated 09:00/09:30 candidates.
        assert_eq!(slots.len(), 4);
    }
}

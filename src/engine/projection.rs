//! Per-room, per-day calendar rows derived from reservations.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_PROJECTION_DAYS;
use crate::model::*;

use super::{Engine, EngineError, RoomGuards};

/// Status of `date` for a stay covering `span`: the check-out day is its own
/// state, nights inside the stay are reserved, anything else is free.
pub fn determine_status(date: NaiveDate, span: &Span) -> DailyStatus {
    if date == span.end {
        DailyStatus::CheckoutDay
    } else if span.start <= date && date < span.end {
        DailyStatus::Reserved
    } else {
        DailyStatus::Free
    }
}

/// Rows for one room from check-in through check-out, both inclusive.
pub fn project_rows(room_id: Ulid, span: &Span, reservation_id: Ulid, guest_id: Option<Ulid>) -> Vec<RoomDailyStatus> {
    span.start
        .iter_days()
        .take_while(|date| *date <= span.end)
        .map(|date| RoomDailyStatus {
            room_id,
            date,
            status: determine_status(date, span),
            reservation_id: Some(reservation_id),
            guest_id,
        })
        .collect()
}

/// Projection rows for every room a reservation occupies.
pub(super) fn reservation_rows(reservation: &Reservation, allocations: &[ReservationRoom]) -> Vec<RoomDailyStatus> {
    if allocations.is_empty() {
        let Some(room_id) = reservation.room_id else {
            return Vec::new();
        };
        let guest = reservation.guest_ids.first().copied().unwrap_or(reservation.customer_id);
        return project_rows(room_id, &reservation.span(), reservation.id, Some(guest));
    }
    allocations
        .iter()
        .flat_map(|row| {
            let guest = row
                .guest_ids
                .first()
                .or(reservation.guest_ids.first())
                .copied()
                .unwrap_or(reservation.customer_id);
            project_rows(row.room_id, &row.span(), reservation.id, Some(guest))
        })
        .collect()
}

/// Whether `candidate` may replace `existing` at the same `(room, date)`.
///
/// A departing guest's check-out day never hides the next guest's arrival.
fn takes_precedence(candidate: &RoomDailyStatus, existing: Option<&RoomDailyStatus>) -> bool {
    match existing {
        Some(current)
            if candidate.status == DailyStatus::CheckoutDay
                && current.status == DailyStatus::Reserved
                && current.reservation_id != candidate.reservation_id =>
        {
            false
        }
        _ => true,
    }
}

/// Drop candidate rows that would overwrite a stronger row already stored.
/// Also resolves collisions between candidates of different reservations.
pub(super) fn merge_rows(guards: &RoomGuards, candidates: Vec<RoomDailyStatus>) -> Vec<RoomDailyStatus> {
    let mut merged: BTreeMap<(Ulid, NaiveDate), RoomDailyStatus> = BTreeMap::new();
    for row in candidates {
        let key = (row.room_id, row.date);
        let stored = guards.get(&row.room_id).and_then(|rs| rs.daily.get(&row.date));
        let existing = merged.get(&key).or(stored);
        if takes_precedence(&row, existing) {
            merged.insert(key, row);
        }
    }
    merged.into_values().collect()
}

fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next.pred_opt()?))
}

impl Engine {
    /// Project a reservation's rows into the calendar. Idempotent: running it
    /// again writes the same rows. Returns the number of rows written.
    pub async fn generate_for_reservation(&self, reservation_id: Ulid) -> Result<usize, EngineError> {
        let reservation = self
            .get_reservation(reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        if reservation.is_cancelled() {
            return Err(EngineError::Locked(reservation.code));
        }

        let mut room_ids = self.allocated_rooms(reservation_id);
        room_ids.extend(reservation.room_id);
        let mut guards = self.lock_rooms(room_ids).await?;

        let allocations: Vec<ReservationRoom> = guards
            .values()
            .filter_map(|rs| rs.allocation_for(reservation_id).cloned())
            .collect();
        let rows = merge_rows(&guards, reservation_rows(&reservation, &allocations));
        let written = rows.len();
        if written == 0 {
            return Ok(0);
        }
        self.commit(&mut guards, vec![Event::DailyStatusUpserted { rows }])
            .await?;
        tracing::debug!(code = %reservation.code, rows = written, "calendar rows projected");
        Ok(written)
    }

    /// Rebuild one month of the calendar from every live reservation that
    /// touches it.
    ///
    /// The clear and the rewrite go out as a single unit of work under every
    /// room lock, so readers see either the old month or the new one, never
    /// an empty calendar.
    pub async fn regenerate_for_month(&self, year: i32, month: u32) -> Result<usize, EngineError> {
        let (from, to) = month_bounds(year, month)
            .ok_or_else(|| EngineError::invalid("month", format!("{year}-{month:02} is not a calendar month.")))?;
        let started = std::time::Instant::now();

        let mut guards = self.lock_all_rooms().await?;

        let mut allocations: BTreeMap<Ulid, Vec<ReservationRoom>> = BTreeMap::new();
        for rs in guards.values() {
            for row in &rs.allocations {
                allocations.entry(row.reservation_id).or_default().push(row.clone());
            }
        }
        let touching: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| !r.is_cancelled() && r.check_in_date <= to && r.check_out_date >= from)
            .map(|r| r.value().clone())
            .collect();

        let mut candidates = Vec::new();
        for reservation in &touching {
            let rows = allocations.get(&reservation.id).map(Vec::as_slice).unwrap_or(&[]);
            candidates.extend(
                reservation_rows(reservation, rows)
                    .into_iter()
                    .filter(|row| row.date >= from && row.date <= to && guards.contains_key(&row.room_id)),
            );
        }
        // Reserved rows first so a check-out day never displaces them.
        candidates.sort_by_key(|row| row.status != DailyStatus::Reserved);

        let mut rows: BTreeMap<(Ulid, NaiveDate), RoomDailyStatus> = BTreeMap::new();
        for row in candidates {
            let key = (row.room_id, row.date);
            if takes_precedence(&row, rows.get(&key)) {
                rows.insert(key, row);
            }
        }
        let rows: Vec<RoomDailyStatus> = rows.into_values().collect();
        let written = rows.len();

        let events = vec![
            Event::DailyStatusCleared {
                room_ids: guards.keys().copied().collect(),
                from,
                to,
            },
            Event::DailyStatusUpserted { rows },
        ];
        self.commit(&mut guards, events).await?;

        metrics::histogram!(crate::observability::CALENDAR_REBUILD_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        tracing::info!(month = %format!("{year}-{month:02}"), rows = written, "calendar month rebuilt");
        Ok(written)
    }

    /// Stored calendar rows of a room for `[from, to]`, in date order.
    pub async fn daily_statuses(
        &self,
        room_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RoomDailyStatus>, EngineError> {
        if to < from {
            return Err(EngineError::invalid("to", "End date must not be before start date."));
        }
        if (to - from).num_days() > MAX_PROJECTION_DAYS {
            return Err(EngineError::LimitExceeded("calendar range too long"));
        }
        let rs = self.get_room_state(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.daily.range(from..=to).map(|(_, row)| row.clone()).collect())
    }

    /// Calendar of every active room for a month, keyed by room number.
    pub async fn month_calendar(
        &self,
        year: i32,
        month: u32,
    ) -> Result<BTreeMap<String, Vec<RoomDailyStatus>>, EngineError> {
        let (from, to) = month_bounds(year, month)
            .ok_or_else(|| EngineError::invalid("month", format!("{year}-{month:02} is not a calendar month.")))?;
        let mut calendar = BTreeMap::new();
        for room in self.active_rooms().await {
            let rows = self.daily_statuses(room.id, from, to).await?;
            calendar.insert(room.room_number, rows);
        }
        Ok(calendar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn status_by_position_in_stay() {
        let span = Span::new(d(2024, 1, 10), d(2024, 1, 12));
        assert_eq!(determine_status(d(2024, 1, 9), &span), DailyStatus::Free);
        assert_eq!(determine_status(d(2024, 1, 10), &span), DailyStatus::Reserved);
        assert_eq!(determine_status(d(2024, 1, 11), &span), DailyStatus::Reserved);
        assert_eq!(determine_status(d(2024, 1, 12), &span), DailyStatus::CheckoutDay);
        assert_eq!(determine_status(d(2024, 1, 13), &span), DailyStatus::Free);
    }

    #[test]
    fn rows_include_checkout_day() {
        let span = Span::new(d(2024, 1, 30), d(2024, 2, 2));
        let rows = project_rows(Ulid::new(), &span, Ulid::new(), None);
        let statuses: Vec<_> = rows.iter().map(|r| (r.date, r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (d(2024, 1, 30), DailyStatus::Reserved),
                (d(2024, 1, 31), DailyStatus::Reserved),
                (d(2024, 2, 1), DailyStatus::Reserved),
                (d(2024, 2, 2), DailyStatus::CheckoutDay),
            ]
        );
    }

    #[test]
    fn checkout_day_never_hides_arrival() {
        let room = Ulid::new();
        let arriving = RoomDailyStatus {
            room_id: room,
            date: d(2024, 1, 12),
            status: DailyStatus::Reserved,
            reservation_id: Some(Ulid::new()),
            guest_id: None,
        };
        let departing = RoomDailyStatus {
            status: DailyStatus::CheckoutDay,
            reservation_id: Some(Ulid::new()),
            ..arriving.clone()
        };
        assert!(!takes_precedence(&departing, Some(&arriving)));
        assert!(takes_precedence(&arriving, Some(&departing)));
        assert!(takes_precedence(&departing, None));

        let merged = merge_rows(&RoomGuards::new(), vec![arriving.clone(), departing]);
        assert_eq!(merged, vec![arriving]);
    }

    #[test]
    fn month_bounds_handle_december_and_leap_years() {
        assert_eq!(month_bounds(2024, 2), Some((d(2024, 2, 1), d(2024, 2, 29))));
        assert_eq!(month_bounds(2024, 12), Some((d(2024, 12, 1), d(2024, 12, 31))));
        assert_eq!(month_bounds(2024, 13), None);
    }
}

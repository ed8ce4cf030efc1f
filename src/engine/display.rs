//! What a room looks like on the front-desk board for a given day.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use ulid::Ulid;

use crate::cleaning::CleaningStatus;
use crate::model::{Room, RoomState, Span, Stay};
use crate::time::{end_of_day, start_of_day};

use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DisplayStatus {
    #[serde(rename = "LIBRE")]
    Free,
    #[serde(rename = "OCUPADA")]
    Occupied,
    #[serde(rename = "PENDIENTE_CHECKOUT")]
    PendingCheckout,
    #[serde(rename = "SUCIA")]
    Dirty,
    #[serde(rename = "RESERVADA")]
    Reserved,
    #[serde(rename = "MANTENIMIENTO")]
    Maintenance,
}

impl DisplayStatus {
    pub fn code(&self) -> &'static str {
        match self {
            DisplayStatus::Free => "LIBRE",
            DisplayStatus::Occupied => "OCUPADA",
            DisplayStatus::PendingCheckout => "PENDIENTE_CHECKOUT",
            DisplayStatus::Dirty => "SUCIA",
            DisplayStatus::Reserved => "RESERVADA",
            DisplayStatus::Maintenance => "MANTENIMIENTO",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomDisplay {
    pub room_id: Ulid,
    pub room_number: String,
    pub date: NaiveDate,
    pub status: DisplayStatus,
    /// Present once the cleaning rule was reached.
    pub cleaning: Option<CleaningStatus>,
    /// The cleaning lookup failed and a placeholder was used.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    UnderMaintenance,
    GuestInHouse,
    CheckoutPending,
    NeedsCleaning,
    BookedAhead,
}

/// First matching signal decides the status; no match means free.
const DISPLAY_RULES: [(Signal, DisplayStatus); 5] = [
    (Signal::UnderMaintenance, DisplayStatus::Maintenance),
    (Signal::GuestInHouse, DisplayStatus::Occupied),
    (Signal::CheckoutPending, DisplayStatus::PendingCheckout),
    (Signal::NeedsCleaning, DisplayStatus::Dirty),
    (Signal::BookedAhead, DisplayStatus::Reserved),
];

/// Whether an open stay with planned check-out `planned` still covers `date`.
///
/// For today and earlier the guest counts through the check-out day itself.
/// For a future date the guest must still be there at the end of that day.
pub fn planned_checkout_covers(planned: NaiveDate, date: NaiveDate, today: NaiveDate) -> bool {
    let planned_at = start_of_day(planned);
    if date > today {
        planned_at >= end_of_day(date)
    } else {
        planned_at >= start_of_day(date)
    }
}

/// Whether `stay` intersects `date`. An open stay without a planned
/// check-out is only assumed to last through today.
pub fn stay_covers(stay: &Stay, planned_checkout: Option<NaiveDate>, date: NaiveDate, today: NaiveDate) -> bool {
    if stay.check_in_at > end_of_day(date) {
        return false;
    }
    match (stay.check_out_at, planned_checkout) {
        (Some(out), _) => out >= start_of_day(date),
        (None, Some(planned)) => planned_checkout_covers(planned, date, today),
        (None, None) => date <= today,
    }
}

fn within_day(at: NaiveDateTime, date: NaiveDate) -> bool {
    start_of_day(date) <= at && at <= end_of_day(date)
}

impl Engine {
    fn planned_checkout(&self, rs: &RoomState, stay: &Stay) -> Option<NaiveDate> {
        let reservation_id = stay.reservation_id?;
        rs.allocation_for(reservation_id)
            .map(|row| row.check_out_date)
            .or_else(|| self.reservations.get(&reservation_id).map(|r| r.check_out_date))
    }

    fn stay_on(&self, rs: &RoomState, date: NaiveDate, today: NaiveDate) -> Option<Stay> {
        rs.stays
            .iter()
            .filter(|stay| stay_covers(stay, self.planned_checkout(rs, stay), date, today))
            .max_by_key(|stay| stay.check_in_at)
            .cloned()
    }

    /// The stay intersecting `date` (default today), most recent check-in first.
    pub async fn stay_for_date(&self, room_id: Ulid, date: Option<NaiveDate>) -> Option<Stay> {
        let today = self.clock.today();
        let rs = self.get_room_state(&room_id)?;
        let guard = rs.read().await;
        self.stay_on(&guard, date.unwrap_or(today), today)
    }

    pub fn is_historic_date(&self, date: NaiveDate) -> bool {
        date < self.clock.today()
    }

    pub fn can_modify_on(&self, date: NaiveDate) -> bool {
        !self.is_historic_date(date)
    }

    /// Whether yesterday's guest checked out during `date`.
    pub async fn has_pending_checkout_on(&self, room_id: Ulid, date: NaiveDate) -> bool {
        let today = self.clock.today();
        let Some(rs) = self.get_room_state(&room_id) else {
            return false;
        };
        let guard = rs.read().await;
        self.pending_checkout(&guard, date, today)
    }

    fn pending_checkout(&self, rs: &RoomState, date: NaiveDate, today: NaiveDate) -> bool {
        let Some(yesterday) = date.pred_opt() else {
            return false;
        };
        self.stay_on(rs, yesterday, today)
            .and_then(|stay| stay.check_out_at)
            .is_some_and(|out| within_day(out, date))
    }

    fn guest_in_house(&self, rs: &RoomState, date: NaiveDate, today: NaiveDate) -> bool {
        self.stay_on(rs, date, today)
            .is_some_and(|stay| stay.check_out_at.is_none_or(|out| out > end_of_day(date)))
    }

    fn booked_ahead(&self, rs: &RoomState, date: NaiveDate, today: NaiveDate) -> bool {
        if date < today {
            return false;
        }
        match self.bookings_on(rs, &Span::day(date), None) {
            Ok(hits) => !hits.is_empty(),
            Err(e) => {
                tracing::warn!(room = %rs.room.room_number, error = %e, "booking lookup failed, showing room as reserved");
                true
            }
        }
    }

    async fn cleaning_for(&self, room: &Room, date: NaiveDate) -> (CleaningStatus, bool) {
        match self.cleaning.cleaning_status(room, date).await {
            Ok(status) => (status, false),
            Err(e) => {
                tracing::warn!(room = %room.room_number, error = %e, "cleaning status lookup failed");
                metrics::counter!(crate::observability::CLEANING_LOOKUP_FAILURES_TOTAL).increment(1);
                (CleaningStatus::unknown(), true)
            }
        }
    }

    /// Board status of a room on `date` (default today).
    ///
    /// Rules are checked in order: maintenance, guest in house, pending
    /// check-out, needs cleaning, booked, and finally free. A failed cleaning
    /// lookup does not stop the evaluation; the room is shown as not dirty
    /// and the result is marked degraded.
    pub async fn display_status_on(&self, room_id: Ulid, date: Option<NaiveDate>) -> Result<RoomDisplay, EngineError> {
        let today = self.clock.today();
        let date = date.unwrap_or(today);
        let rs = self.get_room_state(&room_id).ok_or(EngineError::NotFound(room_id))?;
        // Snapshot so the cleaning provider is never awaited under the room lock.
        let snapshot = rs.read().await.clone();

        let mut cleaning = None;
        let mut degraded = false;
        let mut status = DisplayStatus::Free;
        for (signal, candidate) in DISPLAY_RULES {
            let holds = match signal {
                Signal::UnderMaintenance => snapshot.room.maintenance,
                Signal::GuestInHouse => self.guest_in_house(&snapshot, date, today),
                Signal::CheckoutPending => self.pending_checkout(&snapshot, date, today),
                Signal::NeedsCleaning => {
                    let (found, failed) = self.cleaning_for(&snapshot.room, date).await;
                    degraded = failed;
                    let dirty = !failed && found.needs_cleaning();
                    cleaning = Some(found);
                    dirty
                }
                Signal::BookedAhead => self.booked_ahead(&snapshot, date, today),
            };
            if holds {
                status = candidate;
                break;
            }
        }

        Ok(RoomDisplay {
            room_id,
            room_number: snapshot.room.room_number,
            date,
            status,
            cleaning,
            degraded,
        })
    }

    /// Board for every active room, ordered by room number.
    pub async fn display_board(&self, date: Option<NaiveDate>) -> Vec<RoomDisplay> {
        let mut board = Vec::new();
        for room in self.active_rooms().await {
            match self.display_status_on(room.id, date).await {
                Ok(display) => board.push(display),
                Err(e) => tracing::warn!(room = %room.room_number, error = %e, "room dropped from board"),
            }
        }
        board
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn at(date: NaiveDate, hour: u32) -> NaiveDateTime {
        date.and_hms_opt(hour, 0, 0).unwrap()
    }

    fn stay(check_in_at: NaiveDateTime, check_out_at: Option<NaiveDateTime>) -> Stay {
        Stay {
            id: Ulid::new(),
            room_id: Ulid::new(),
            reservation_id: Some(Ulid::new()),
            check_in_at,
            check_out_at,
        }
    }

    #[test]
    fn planned_checkout_counts_through_departure_day_until_tomorrow() {
        let today = d(2024, 1, 10);
        // Past and present: the departure day itself still counts
        assert!(planned_checkout_covers(d(2024, 1, 10), today, today));
        assert!(planned_checkout_covers(d(2024, 1, 9), d(2024, 1, 9), today));
        assert!(!planned_checkout_covers(d(2024, 1, 9), today, today));
        // Future: the guest must still be in at the end of the day
        assert!(!planned_checkout_covers(d(2024, 1, 12), d(2024, 1, 12), today));
        assert!(planned_checkout_covers(d(2024, 1, 13), d(2024, 1, 12), today));
    }

    #[test]
    fn closed_stay_covers_until_checkout_moment() {
        let today = d(2024, 1, 10);
        let s = stay(at(d(2024, 1, 8), 15), Some(at(d(2024, 1, 10), 11)));
        assert!(!stay_covers(&s, None, d(2024, 1, 7), today));
        assert!(stay_covers(&s, None, d(2024, 1, 8), today));
        assert!(stay_covers(&s, None, d(2024, 1, 10), today));
        assert!(!stay_covers(&s, None, d(2024, 1, 11), today));
    }

    #[test]
    fn open_stay_without_plan_only_lasts_through_today() {
        let today = d(2024, 1, 10);
        let s = stay(at(d(2024, 1, 9), 15), None);
        assert!(stay_covers(&s, None, today, today));
        assert!(!stay_covers(&s, None, d(2024, 1, 11), today));
        assert!(stay_covers(&s, Some(d(2024, 1, 12)), d(2024, 1, 11), today));
    }

    #[test]
    fn rule_order_is_fixed() {
        let order: Vec<DisplayStatus> = DISPLAY_RULES.iter().map(|(_, s)| *s).collect();
        assert_eq!(
            order,
            vec![
                DisplayStatus::Maintenance,
                DisplayStatus::Occupied,
                DisplayStatus::PendingCheckout,
                DisplayStatus::Dirty,
                DisplayStatus::Reserved,
            ]
        );
    }

    #[test]
    fn status_serializes_to_board_codes() {
        for status in [
            DisplayStatus::Free,
            DisplayStatus::Occupied,
            DisplayStatus::PendingCheckout,
            DisplayStatus::Dirty,
            DisplayStatus::Reserved,
            DisplayStatus::Maintenance,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.code()));
        }
    }
}

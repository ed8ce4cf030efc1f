use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::guests::build_room_guest_map;
use crate::model::*;
use crate::pricing::total_for_stay;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_room(&self, id: Ulid) -> Option<Room> {
        let rs = self.get_room_state(&id)?;
        let guard = rs.read().await;
        Some(guard.room.clone())
    }

    /// Rooms for the given ids; unknown ids are skipped.
    pub async fn rooms_by_ids(&self, ids: &[Ulid]) -> HashMap<Ulid, Room> {
        let mut rooms = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(room) = self.get_room(*id).await {
                rooms.insert(*id, room);
            }
        }
        rooms
    }

    /// Bookable rooms ordered by room number.
    pub async fn active_rooms(&self) -> Vec<Room> {
        let states: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(states.len());
        for rs in states {
            let guard = rs.read().await;
            if guard.room.is_bookable() {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by(|a, b| natural_cmp(&a.room_number, &b.room_number));
        rooms
    }

    pub async fn room_by_number(&self, number: &str) -> Option<Room> {
        let number = number.trim();
        let states: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in states {
            let guard = rs.read().await;
            if guard.room.room_number == number && guard.room.deleted_at.is_none() {
                return Some(guard.room.clone());
            }
        }
        None
    }

    pub fn get_customer(&self, id: Ulid) -> Option<Customer> {
        self.customers.get(&id).map(|c| c.value().clone())
    }

    pub fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        self.reservations.get(&id).map(|r| r.value().clone())
    }

    pub fn reservation_by_code(&self, code: &str) -> Option<Reservation> {
        self.reservations
            .iter()
            .find(|r| r.code == code)
            .map(|r| r.value().clone())
    }

    /// Live reservations overlapping `[from, to)`, by check-in date.
    pub fn reservations_in_range(&self, from: NaiveDate, to: NaiveDate) -> Vec<Reservation> {
        let query = Span { start: from, end: to };
        let mut found: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| !r.is_cancelled() && r.span().overlaps(&query))
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.check_in_date.cmp(&b.check_in_date).then_with(|| a.code.cmp(&b.code)));
        found
    }

    /// Rooms holding junction rows for the reservation, in allocation order.
    pub(crate) fn allocated_rooms(&self, reservation_id: Ulid) -> Vec<Ulid> {
        self.allocation_index
            .get(&reservation_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }

    /// Junction rows of a reservation, in allocation order.
    pub async fn reservation_rooms(&self, reservation_id: Ulid) -> Vec<ReservationRoom> {
        let mut rows = Vec::new();
        for room_id in self.allocated_rooms(reservation_id) {
            let Some(rs) = self.get_room_state(&room_id) else {
                continue;
            };
            let guard = rs.read().await;
            if let Some(row) = guard.allocation_for(reservation_id) {
                rows.push(row.clone());
            }
        }
        rows
    }

    pub fn payments_for(&self, reservation_id: Ulid) -> Vec<Payment> {
        self.payments
            .get(&reservation_id)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    /// Sum of recorded payments, reversals included.
    pub fn net_paid(&self, reservation_id: Ulid) -> Money {
        self.payments
            .get(&reservation_id)
            .map(|p| p.iter().map(|payment| payment.amount).sum())
            .unwrap_or(Money::ZERO)
    }

    pub fn payment_methods(&self) -> Vec<PaymentMethodRecord> {
        let mut methods: Vec<_> = self.payment_methods.iter().map(|m| m.value().clone()).collect();
        methods.sort_by(|a, b| a.code.cmp(&b.code));
        methods
    }

    /// Per-night ledger entries of a reservation across its rooms.
    pub async fn stay_nights_for(&self, reservation_id: Ulid) -> Vec<StayNight> {
        let mut room_ids = self.allocated_rooms(reservation_id);
        if let Some(room_id) = self.get_reservation(reservation_id).and_then(|r| r.room_id) {
            room_ids.push(room_id);
        }
        room_ids.sort();
        room_ids.dedup();

        let mut nights = Vec::new();
        for room_id in room_ids {
            let Some(rs) = self.get_room_state(&room_id) else {
                continue;
            };
            let guard = rs.read().await;
            nights.extend(guard.nights.iter().filter(|n| n.reservation_id == reservation_id).cloned());
        }
        nights.sort_by_key(|n| (n.date, n.room_id));
        nights
    }

    /// Price quote for a room selection over `[check_in, check_out)`.
    pub async fn calculate_total(
        &self,
        selected: &[Ulid],
        room_guests: &HashMap<Ulid, u32>,
        check_in: NaiveDate,
        check_out: NaiveDate,
    ) -> Money {
        let rooms = self.rooms_by_ids(selected).await;
        total_for_stay(&rooms, selected, room_guests, check_in, check_out)
    }

    /// Who sleeps in which room for a reservation.
    pub async fn room_guest_map(&self, reservation_id: Ulid) -> Result<BTreeMap<Ulid, Vec<GuestInfo>>, EngineError> {
        let reservation = self
            .get_reservation(reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let rows = self.reservation_rooms(reservation_id).await;

        let mut wanted: Vec<Ulid> = rows.iter().flat_map(|r| r.guest_ids.iter().copied()).collect();
        wanted.extend(reservation.guest_ids.iter().copied());
        wanted.push(reservation.customer_id);
        let customers: HashMap<Ulid, Customer> = wanted
            .into_iter()
            .filter_map(|id| self.get_customer(id).map(|c| (id, c)))
            .collect();

        Ok(build_room_guest_map(&reservation, &rows, &customers))
    }
}

/// Order room numbers so "2" sorts before "10", falling back to plain text.
fn natural_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::natural_cmp;

    #[test]
    fn room_numbers_sort_numerically() {
        let mut numbers = vec!["10", "2", "B1", "101", "A2"];
        numbers.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(numbers, vec!["2", "10", "101", "A2", "B1"]);
    }
}

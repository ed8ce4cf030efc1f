//! How many people a reservation is for, and who sits in which room.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ulid::Ulid;

use crate::model::{Customer, GuestComposition, GuestInfo, Reservation, ReservationRoom};

/// Guest-count fields as submitted with a reservation.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestCountInput<'a> {
    pub adults: Option<i64>,
    pub children: Option<i64>,
    pub guests_count: Option<i64>,
    pub room_guests: Option<&'a HashMap<Ulid, Vec<Ulid>>>,
}

/// Explicit adults/children win when they add up to at least one person.
/// Otherwise count distinct assigned guests, then `guests_count`, and finally
/// settle on a single adult.
pub fn resolve_guest_composition(input: &GuestCountInput<'_>) -> GuestComposition {
    if input.adults.is_some() || input.children.is_some() {
        let adults = clamp_count(input.adults);
        let children = clamp_count(input.children);
        if adults.saturating_add(children) > 0 {
            return GuestComposition::new(adults, children);
        }
    }

    let distinct = input
        .room_guests
        .map(|map| map.values().flatten().collect::<BTreeSet<_>>().len() as u32)
        .unwrap_or(0);
    if distinct > 0 {
        return GuestComposition::new(distinct, 0);
    }

    let counted = clamp_count(input.guests_count);
    if counted > 0 {
        return GuestComposition::new(counted, 0);
    }

    GuestComposition::new(1, 0)
}

fn clamp_count(v: Option<i64>) -> u32 {
    v.unwrap_or(0).clamp(0, u32::MAX as i64) as u32
}

/// Per-room guest lists for a reservation.
///
/// With several rooms each room lists its own guests. With one room the
/// room's guests are used, then the reservation-level guests, and as a last
/// resort the booking customer, so an occupied room never shows as unassigned.
pub fn build_room_guest_map(
    reservation: &Reservation,
    rows: &[ReservationRoom],
    customers: &HashMap<Ulid, Customer>,
) -> BTreeMap<Ulid, Vec<GuestInfo>> {
    let lookup = |ids: &[Ulid]| -> Vec<GuestInfo> {
        let mut seen = BTreeSet::new();
        ids.iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| customers.get(id).map(GuestInfo::from))
            .collect()
    };

    let mut map = BTreeMap::new();
    if rows.len() > 1 {
        for row in rows {
            map.insert(row.room_id, lookup(row.guest_ids.as_slice()));
        }
        return map;
    }

    let (room_id, room_guests) = match rows.first() {
        Some(row) => (Some(row.room_id), lookup(row.guest_ids.as_slice())),
        None => (reservation.room_id, Vec::new()),
    };
    let Some(room_id) = room_id else {
        return map;
    };

    let mut guests = room_guests;
    if guests.is_empty() {
        guests = lookup(reservation.guest_ids.as_slice());
    }
    if guests.is_empty()
        && let Some(customer) = customers.get(&reservation.customer_id)
    {
        guests.push(GuestInfo::from(customer));
    }
    map.insert(room_id, guests);
    map
}

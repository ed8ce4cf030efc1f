//! Nightly room pricing from occupancy tiers.

use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{Money, Room};
use crate::time::days_between;

/// Single-occupancy nightly price: tier 1, then the legacy per-person
/// column, then the legacy flat price.
pub fn base_price(room: &Room) -> Money {
    room.occupancy_prices
        .get(&1)
        .copied()
        .or(room.price_1_person)
        .or(room.price)
        .unwrap_or(Money::ZERO)
}

/// Nightly price for `guests` people in `room`, capped at the room capacity.
pub fn price_for_room(room: &Room, guests: u32) -> Money {
    if guests == 0 {
        return Money::ZERO;
    }
    let capacity = if room.max_capacity > 0 {
        room.max_capacity
    } else {
        guests
    };
    let actual = guests.min(capacity);
    let extra = actual.saturating_sub(1);
    base_price(room) + room.additional_person_price * Money::from(extra)
}

/// Sum of `price_for_room * nights` over the selected rooms.
///
/// Rooms with no assigned guests and ids missing from `rooms` contribute
/// nothing. Returns zero for an empty or inverted date range.
pub fn total_for_stay(
    rooms: &HashMap<Ulid, Room>,
    selected: &[Ulid],
    room_guests: &HashMap<Ulid, u32>,
    check_in: NaiveDate,
    check_out: NaiveDate,
) -> Money {
    let nights = days_between(check_in, check_out);
    if nights <= 0 {
        return Money::ZERO;
    }
    let nights = Money::from(nights);
    selected
        .iter()
        .filter_map(|id| {
            let guests = room_guests.get(id).copied().unwrap_or(0);
            if guests == 0 {
                return None;
            }
            rooms.get(id).map(|room| price_for_room(room, guests) * nights)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn room(single: i64, additional: i64, capacity: u32) -> Room {
        Room::new("101", capacity).with_prices(Decimal::from(single), Decimal::from(additional))
    }

    #[test]
    fn price_adds_extra_guests() {
        let r = room(50_000, 15_000, 3);
        assert_eq!(price_for_room(&r, 1), Decimal::from(50_000));
        assert_eq!(price_for_room(&r, 2), Decimal::from(65_000));
    }

    #[test]
    fn price_capped_at_capacity() {
        let r = room(50_000, 15_000, 3);
        assert_eq!(price_for_room(&r, 5), Decimal::from(80_000));
    }

    #[test]
    fn zero_guests_is_free() {
        let r = room(50_000, 15_000, 3);
        assert_eq!(price_for_room(&r, 0), Decimal::ZERO);
    }

    #[test]
    fn zero_capacity_uses_guest_count() {
        let r = room(30_000, 5_000, 0);
        assert_eq!(price_for_room(&r, 4), Decimal::from(45_000));
    }

    #[test]
    fn base_price_fallback_chain() {
        let mut r = Room::new("102", 2);
        assert_eq!(base_price(&r), Decimal::ZERO);
        r.price = Some(Decimal::from(20_000));
        assert_eq!(base_price(&r), Decimal::from(20_000));
        r.price_1_person = Some(Decimal::from(25_000));
        assert_eq!(base_price(&r), Decimal::from(25_000));
        r.occupancy_prices.insert(1, Decimal::from(30_000));
        assert_eq!(base_price(&r), Decimal::from(30_000));
    }

    #[test]
    fn stay_total_across_rooms() {
        let a = room(40_000, 0, 2);
        let b = room(50_000, 10_000, 3);
        let rooms = HashMap::from([(a.id, a.clone()), (b.id, b.clone())]);
        let guests = HashMap::from([(a.id, 1), (b.id, 2)]);
        let total = total_for_stay(&rooms, &[a.id, b.id], &guests, d(2024, 5, 1), d(2024, 5, 3));
        assert_eq!(total, Decimal::from(200_000));
    }

    #[test]
    fn stay_total_skips_empty_rooms_and_bad_ranges() {
        let a = room(40_000, 0, 2);
        let b = room(50_000, 10_000, 3);
        let rooms = HashMap::from([(a.id, a.clone()), (b.id, b.clone())]);
        let guests = HashMap::from([(a.id, 1)]);
        let selected = [a.id, b.id];
        assert_eq!(
            total_for_stay(&rooms, &selected, &guests, d(2024, 5, 1), d(2024, 5, 2)),
            Decimal::from(40_000)
        );
        assert_eq!(
            total_for_stay(&rooms, &selected, &guests, d(2024, 5, 2), d(2024, 5, 2)),
            Decimal::ZERO
        );
        assert_eq!(
            total_for_stay(&rooms, &selected, &guests, d(2024, 5, 3), d(2024, 5, 1)),
            Decimal::ZERO
        );
    }
}

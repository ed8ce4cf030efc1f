//! Splitting a reservation total across its rooms.

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::RoundingStrategy;
use ulid::Ulid;

use crate::model::{Money, Reservation, ReservationRoom};
use crate::time::days_between;

/// Round to cents, halves away from zero.
pub fn round_money(value: Money) -> Money {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Split `total` into `parts` subtotals that sum to exactly `total`.
///
/// Every part but the last is `round(total / parts)`; the last takes the
/// remainder, absorbing the rounding drift.
pub fn split_evenly(total: Money, parts: usize) -> Vec<Money> {
    if parts == 0 {
        return Vec::new();
    }
    let base = round_money(total / Money::from(parts as u64));
    let mut out = vec![base; parts - 1];
    let assigned = base * Money::from((parts - 1) as u64);
    out.push(total - assigned);
    out
}

/// Billable nights for a date range; a same-day or inverted range bills one.
pub fn stay_nights(check_in: NaiveDate, check_out: NaiveDate) -> u32 {
    days_between(check_in, check_out).clamp(1, u32::MAX as i64) as u32
}

pub fn price_per_night(subtotal: Money, nights: u32) -> Money {
    round_money(subtotal / Money::from(nights.max(1)))
}

/// Fresh junction rows for `room_ids`, in selection order.
pub(super) fn allocate_rooms(
    reservation: &Reservation,
    room_ids: &[Ulid],
    room_guests: &HashMap<Ulid, Vec<Ulid>>,
) -> Vec<ReservationRoom> {
    let nights = stay_nights(reservation.check_in_date, reservation.check_out_date);
    room_ids
        .iter()
        .zip(split_evenly(reservation.total_amount, room_ids.len()))
        .map(|(room_id, subtotal)| ReservationRoom {
            id: Ulid::new(),
            reservation_id: reservation.id,
            room_id: *room_id,
            check_in_date: reservation.check_in_date,
            check_out_date: reservation.check_out_date,
            check_in_time: reservation.check_in_time.clone(),
            nights,
            price_per_night: price_per_night(subtotal, nights),
            subtotal,
            guest_ids: room_guests.get(room_id).cloned().unwrap_or_default(),
        })
        .collect()
}

/// Re-split the reservation total over the rows it already has, in the
/// order given.
///
/// Rows keep their room, dates and guests. A row's positive night count is
/// kept; otherwise it is recomputed from the row's own dates, then from the
/// reservation's.
pub(super) fn rebalance_rows(existing: &[ReservationRoom], reservation: &Reservation) -> Vec<ReservationRoom> {
    let mut rows = existing.to_vec();
    let subtotals = split_evenly(reservation.total_amount, rows.len());
    for (row, subtotal) in rows.iter_mut().zip(subtotals) {
        if row.nights == 0 {
            let own = days_between(row.check_in_date, row.check_out_date);
            row.nights = if own > 0 {
                own as u32
            } else {
                stay_nights(reservation.check_in_date, reservation.check_out_date)
            };
        }
        row.subtotal = subtotal;
        row.price_per_night = price_per_night(subtotal, row.nights);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GuestComposition, PaymentStatus};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn reservation(total: &str, check_in: NaiveDate, check_out: NaiveDate) -> Reservation {
        Reservation {
            id: Ulid::new(),
            code: "RES-2024-0001".into(),
            customer_id: Ulid::new(),
            room_id: None,
            check_in_date: check_in,
            check_out_date: check_out,
            check_in_time: "14:00".into(),
            total_amount: dec(total),
            deposit_amount: Decimal::ZERO,
            balance_due: dec(total),
            payment_status: PaymentStatus::Pending,
            guests: GuestComposition::new(1, 0),
            guest_ids: Vec::new(),
            notes: None,
            attachment: None,
            created_at: d(2024, 1, 1).and_hms_opt(8, 0, 0).unwrap(),
            deleted_at: None,
        }
    }

    #[test]
    fn three_way_split_puts_remainder_last() {
        let parts = split_evenly(dec("100000"), 3);
        assert_eq!(parts, vec![dec("33333.33"), dec("33333.33"), dec("33333.34")]);
    }

    #[test]
    fn split_always_sums_to_total() {
        for total in ["0.01", "1", "99.99", "100000", "123456.78", "7"] {
            for parts in 1..=12 {
                let split = split_evenly(dec(total), parts);
                assert_eq!(split.len(), parts);
                assert_eq!(split.iter().copied().sum::<Decimal>(), dec(total), "{total} / {parts}");
            }
        }
        assert!(split_evenly(dec("10"), 0).is_empty());
    }

    #[test]
    fn nights_never_below_one() {
        assert_eq!(stay_nights(d(2024, 1, 10), d(2024, 1, 15)), 5);
        assert_eq!(stay_nights(d(2024, 1, 10), d(2024, 1, 10)), 1);
        assert_eq!(stay_nights(d(2024, 1, 10), d(2024, 1, 8)), 1);
    }

    #[test]
    fn nightly_price_is_rounded() {
        assert_eq!(price_per_night(dec("33333.34"), 3), dec("11111.11"));
        assert_eq!(price_per_night(dec("100"), 0), dec("100"));
        assert_eq!(round_money(dec("0.005")), dec("0.01"));
        assert_eq!(round_money(dec("-0.005")), dec("-0.01"));
    }

    #[test]
    fn allocate_follows_selection_order() {
        let res = reservation("100000", d(2024, 1, 10), d(2024, 1, 12));
        let (a, b, c) = (Ulid::new(), Ulid::new(), Ulid::new());
        let guest = Ulid::new();
        let rows = allocate_rooms(&res, &[a, b, c], &HashMap::from([(b, vec![guest])]));
        assert_eq!(rows.iter().map(|r| r.room_id).collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(rows[2].subtotal, dec("33333.34"));
        assert_eq!(rows[0].nights, 2);
        assert_eq!(rows[0].price_per_night, dec("16666.67"));
        assert_eq!(rows[1].guest_ids, vec![guest]);
        assert!(rows[0].guest_ids.is_empty());
    }

    #[test]
    fn rebalance_keeps_rooms_and_positive_nights() {
        let old = reservation("200", d(2024, 1, 10), d(2024, 1, 12));
        let mut rows = allocate_rooms(&old, &[Ulid::new(), Ulid::new()], &HashMap::new());
        rows[1].nights = 0;
        rows[0].nights = 5;

        let new = reservation("301", d(2024, 1, 10), d(2024, 1, 13));
        let rebalanced = rebalance_rows(&rows, &new);
        assert_eq!(rebalanced[0].room_id, rows[0].room_id);
        assert_eq!(rebalanced[0].subtotal, dec("150.50"));
        assert_eq!(rebalanced[1].subtotal, dec("150.50"));
        assert_eq!(rebalanced[0].nights, 5);
        assert_eq!(rebalanced[0].price_per_night, dec("30.10"));
        // Row dates are unchanged, so the recomputed count comes from them
        assert_eq!(rebalanced[1].nights, 2);
    }
}

use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::{Attachment, Money, Room};

use super::FieldErrors;

/// Reservation fields as submitted for create and update.
#[derive(Debug, Clone, Default)]
pub struct ReservationInput {
    pub customer_id: Option<Ulid>,
    /// Selected rooms in display order; the last one absorbs rounding.
    pub room_ids: Vec<Ulid>,
    pub check_in_date: Option<NaiveDate>,
    pub check_out_date: Option<NaiveDate>,
    /// Free-form time, normalized on save.
    pub check_in_time: Option<String>,
    pub total_amount: Money,
    pub deposit: Money,
    pub payment_method: Option<String>,
    pub adults: Option<i64>,
    pub children: Option<i64>,
    pub guests_count: Option<i64>,
    /// Room id → guests (customer ids) staying in it.
    pub room_guests: HashMap<Ulid, Vec<Ulid>>,
    pub guest_ids: Vec<Ulid>,
    pub notes: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_by: Option<String>,
}

impl ReservationInput {
    /// Selected rooms without repeats, first occurrence wins.
    pub fn distinct_rooms(&self) -> Vec<Ulid> {
        let mut seen = std::collections::HashSet::new();
        self.room_ids.iter().copied().filter(|id| seen.insert(*id)).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PaymentInput {
    pub amount: Money,
    pub method: Option<String>,
    pub bank_name: Option<String>,
    pub reference: Option<String>,
    pub note: Option<String>,
    pub created_by: Option<String>,
}

/// Facts about the surrounding state that validation needs.
pub(super) struct ValidationContext<'a> {
    pub today: NaiveDate,
    /// Reject a check-in date before today.
    pub reject_past_check_in: bool,
    /// An empty room selection is a field error rather than a separate outcome.
    pub require_rooms: bool,
    pub customer_exists: bool,
    pub rooms: &'a HashMap<Ulid, Room>,
}

/// Check every field and report all problems at once.
pub(super) fn validate_reservation(input: &ReservationInput, ctx: &ValidationContext<'_>) -> FieldErrors {
    let mut errors = FieldErrors::new();

    match input.customer_id {
        None => errors.add("customer_id", "A customer is required."),
        Some(_) if !ctx.customer_exists => errors.add("customer_id", "The selected customer does not exist."),
        Some(_) => {}
    }

    let rooms = input.distinct_rooms();
    if rooms.is_empty() && ctx.require_rooms {
        errors.add("room_ids", "Select at least one room.");
    }
    if rooms.len() > MAX_ROOMS_PER_RESERVATION {
        errors.add(
            "room_ids",
            format!("A reservation can hold at most {MAX_ROOMS_PER_RESERVATION} rooms."),
        );
    }
    for id in &rooms {
        match ctx.rooms.get(id) {
            Some(room) if room.is_bookable() => {
                let guests = input.room_guests.get(id).map(Vec::len).unwrap_or(0);
                if guests > room.max_capacity as usize {
                    errors.add(
                        "room_guests",
                        format!("Room {} holds at most {} guests.", room.room_number, room.max_capacity),
                    );
                }
            }
            Some(room) => errors.add("room_ids", format!("Room {} is not available for booking.", room.room_number)),
            None => errors.add("room_ids", format!("Room {id} does not exist.")),
        }
    }

    match (input.check_in_date, input.check_out_date) {
        (None, None) => {
            errors.add("check_in_date", "Check-in date is required.");
            errors.add("check_out_date", "Check-out date is required.");
        }
        (None, Some(_)) => errors.add("check_in_date", "Check-in date is required."),
        (Some(_), None) => errors.add("check_out_date", "Check-out date is required."),
        (Some(check_in), Some(check_out)) => {
            if check_out <= check_in {
                errors.add("check_out_date", "Check-out must be after check-in.");
            } else if (check_out - check_in).num_days() > MAX_STAY_NIGHTS {
                errors.add("check_out_date", format!("A stay cannot exceed {MAX_STAY_NIGHTS} nights."));
            }
        }
    }
    if ctx.reject_past_check_in
        && let Some(check_in) = input.check_in_date
        && check_in < ctx.today
    {
        errors.add("check_in_date", "Check-in cannot be in the past.");
    }

    if input.total_amount <= Money::ZERO {
        errors.add("total_amount", "Total must be greater than zero.");
    }
    if input.deposit < Money::ZERO {
        errors.add("deposit", "Deposit cannot be negative.");
    } else if input.deposit > input.total_amount {
        errors.add("deposit", "Deposit cannot exceed the total.");
    }

    if input.adults.is_some_and(|n| n < 0) {
        errors.add("adults", "Adults cannot be negative.");
    }
    if input.children.is_some_and(|n| n < 0) {
        errors.add("children", "Children cannot be negative.");
    }
    let party = input.adults.unwrap_or(0).max(0).saturating_add(input.children.unwrap_or(0).max(0));
    if party > MAX_GUESTS_PER_RESERVATION || input.guests_count.is_some_and(|n| n > MAX_GUESTS_PER_RESERVATION) {
        errors.add(
            "guests",
            format!("A reservation cannot exceed {MAX_GUESTS_PER_RESERVATION} guests."),
        );
    }
    if input.notes.as_ref().is_some_and(|n| n.chars().count() > MAX_NOTES_LEN) {
        errors.add("notes", format!("Notes cannot exceed {MAX_NOTES_LEN} characters."));
    }

    errors
}

pub(super) fn validate_payment(input: &PaymentInput) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if input.amount <= Money::ZERO {
        errors.add("amount", "Amount must be greater than zero.");
    }
    if input.note.as_ref().is_some_and(|n| n.chars().count() > MAX_NOTES_LEN) {
        errors.add("note", format!("Notes cannot exceed {MAX_NOTES_LEN} characters."));
    }
    errors
}

pub(super) fn validate_room(room: &Room, number_taken: bool) -> FieldErrors {
    let mut errors = FieldErrors::new();
    let number = room.room_number.trim();
    if number.is_empty() {
        errors.add("room_number", "Room number is required.");
    } else if number.len() > MAX_ROOM_NUMBER_LEN {
        errors.add(
            "room_number",
            format!("Room number cannot exceed {MAX_ROOM_NUMBER_LEN} characters."),
        );
    } else if number_taken {
        errors.add("room_number", format!("Room {number} already exists."));
    }
    if room.max_capacity == 0 {
        errors.add("max_capacity", "Capacity must be at least one guest.");
    }
    if room.additional_person_price < Money::ZERO || room.occupancy_prices.values().any(|p| *p < Money::ZERO) {
        errors.add("prices", "Prices cannot be negative.");
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn valid_input(room: &Room) -> ReservationInput {
        ReservationInput {
            customer_id: Some(Ulid::new()),
            room_ids: vec![room.id],
            check_in_date: Some(d(2024, 1, 10)),
            check_out_date: Some(d(2024, 1, 12)),
            total_amount: Decimal::from(100_000),
            deposit: Decimal::from(20_000),
            ..Default::default()
        }
    }

    fn ctx(rooms: &HashMap<Ulid, Room>) -> ValidationContext<'_> {
        ValidationContext {
            today: d(2024, 1, 10),
            reject_past_check_in: true,
            require_rooms: true,
            customer_exists: true,
            rooms,
        }
    }

    #[test]
    fn valid_input_passes() {
        let room = Room::new("101", 2);
        let rooms = HashMap::from([(room.id, room.clone())]);
        assert!(validate_reservation(&valid_input(&room), &ctx(&rooms)).is_empty());
    }

    #[test]
    fn every_problem_is_reported() {
        let room = Room::new("101", 2);
        let rooms = HashMap::from([(room.id, room.clone())]);
        let input = ReservationInput {
            customer_id: None,
            room_ids: vec![],
            check_in_date: Some(d(2024, 1, 9)),
            check_out_date: Some(d(2024, 1, 9)),
            total_amount: Decimal::ZERO,
            deposit: Decimal::from(-1),
            adults: Some(-2),
            ..Default::default()
        };
        let errors = validate_reservation(&input, &ctx(&rooms));
        for field in [
            "customer_id",
            "room_ids",
            "check_in_date",
            "check_out_date",
            "total_amount",
            "deposit",
            "adults",
        ] {
            assert!(errors.contains(field), "missing {field}: {errors}");
        }
    }

    #[test]
    fn oversized_party_rejected() {
        let room = Room::new("101", 2);
        let rooms = HashMap::from([(room.id, room.clone())]);
        let mut input = valid_input(&room);
        input.adults = Some(3_000_000_000);
        input.children = Some(2_000_000_000);
        let errors = validate_reservation(&input, &ctx(&rooms));
        assert!(errors.contains("guests"), "{errors}");

        input.adults = Some(MAX_GUESTS_PER_RESERVATION);
        input.children = Some(0);
        assert!(!validate_reservation(&input, &ctx(&rooms)).contains("guests"));

        input.adults = None;
        input.guests_count = Some(MAX_GUESTS_PER_RESERVATION + 1);
        assert!(validate_reservation(&input, &ctx(&rooms)).contains("guests"));
    }

    #[test]
    fn deposit_above_total_rejected() {
        let room = Room::new("101", 2);
        let rooms = HashMap::from([(room.id, room.clone())]);
        let mut input = valid_input(&room);
        input.deposit = Decimal::from(100_001);
        let errors = validate_reservation(&input, &ctx(&rooms));
        assert_eq!(errors.fields().collect::<Vec<_>>(), vec!["deposit"]);
    }

    #[test]
    fn inactive_unknown_and_overfull_rooms() {
        let mut closed = Room::new("102", 2);
        closed.active = false;
        let small = Room::new("103", 1);
        let rooms = HashMap::from([(closed.id, closed.clone()), (small.id, small.clone())]);
        let mut input = valid_input(&small);
        input.room_ids = vec![closed.id, small.id, Ulid::new()];
        input.room_guests = HashMap::from([(small.id, vec![Ulid::new(), Ulid::new()])]);
        let errors = validate_reservation(&input, &ctx(&rooms));
        assert_eq!(errors.get("room_ids").len(), 2);
        assert_eq!(errors.get("room_guests"), ["Room 103 holds at most 1 guests."]);
    }

    #[test]
    fn past_check_in_allowed_when_not_enforced() {
        let room = Room::new("101", 2);
        let rooms = HashMap::from([(room.id, room.clone())]);
        let mut input = valid_input(&room);
        input.check_in_date = Some(d(2024, 1, 1));
        let mut context = ctx(&rooms);
        assert!(validate_reservation(&input, &context).contains("check_in_date"));
        context.reject_past_check_in = false;
        assert!(validate_reservation(&input, &context).is_empty());
    }

    #[test]
    fn room_rules() {
        assert!(validate_room(&Room::new("201", 2), false).is_empty());
        let errors = validate_room(&Room::new(" ", 0), false);
        assert!(errors.contains("room_number") && errors.contains("max_capacity"));
        assert!(validate_room(&Room::new("201", 2), true).contains("room_number"));
    }
}

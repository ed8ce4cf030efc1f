use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::time::intervals_overlap;

pub type Money = Decimal;

/// Half-open day interval `[start, end)`. The end date is the check-out day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Span {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Single-day window `[date, date + 1)`.
    pub fn day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date.succ_opt().unwrap_or(date),
        }
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        intervals_overlap(self.start, self.end, other.start, other.end)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

// ── Rooms & people ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub room_number: String,
    /// Max guests; always >= 1 for rooms accepted by the engine.
    pub max_capacity: u32,
    pub active: bool,
    pub maintenance: bool,
    /// Occupancy tier (persons) → nightly price.
    pub occupancy_prices: BTreeMap<u32, Money>,
    /// Pre-tier single-occupancy price.
    pub price_1_person: Option<Money>,
    /// Oldest flat nightly price column.
    pub price: Option<Money>,
    pub additional_person_price: Money,
    pub deleted_at: Option<NaiveDateTime>,
}

impl Room {
    pub fn new(room_number: impl Into<String>, max_capacity: u32) -> Self {
        Self {
            id: Ulid::new(),
            room_number: room_number.into(),
            max_capacity,
            active: true,
            maintenance: false,
            occupancy_prices: BTreeMap::new(),
            price_1_person: None,
            price: None,
            additional_person_price: Money::ZERO,
            deleted_at: None,
        }
    }

    pub fn with_prices(mut self, single: Money, additional: Money) -> Self {
        self.occupancy_prices.insert(1, single);
        self.additional_person_price = additional;
        self
    }

    pub fn is_bookable(&self) -> bool {
        self.active && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub name: String,
    pub identification: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Customer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            name: name.into(),
            identification: None,
            phone: None,
            email: None,
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Partial,
    Paid,
}

impl PaymentStatus {
    /// Status implied by a balance and the amount already paid.
    pub fn derive(balance_due: Money, deposit: Money) -> Self {
        if balance_due <= Money::ZERO {
            PaymentStatus::Paid
        } else if deposit > Money::ZERO {
            PaymentStatus::Partial
        } else {
            PaymentStatus::Pending
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Partial => "partial",
            PaymentStatus::Paid => "paid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestComposition {
    pub adults: u32,
    pub children: u32,
    pub total: u32,
}

impl GuestComposition {
    pub fn new(adults: u32, children: u32) -> Self {
        Self {
            adults,
            children,
            total: adults.saturating_add(children),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    /// `RES-{year}-{seq:04}`
    pub code: String,
    pub customer_id: Ulid,
    /// Room column from the single-room era. New reservations leave it empty
    /// and book through [`ReservationRoom`] rows instead.
    pub room_id: Option<Ulid>,
    pub check_in_date: NaiveDate,
    pub check_out_date: NaiveDate,
    pub check_in_time: String,
    pub total_amount: Money,
    pub deposit_amount: Money,
    pub balance_due: Money,
    pub payment_status: PaymentStatus,
    pub guests: GuestComposition,
    /// Reservation-level guest list (customer ids).
    pub guest_ids: Vec<Ulid>,
    pub notes: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span {
            start: self.check_in_date,
            end: self.check_out_date,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Recompute the derived payment fields from the net amount paid.
    pub fn apply_paid_total(&mut self, net_paid: Money) {
        self.deposit_amount = net_paid.max(Money::ZERO);
        self.balance_due = (self.total_amount - self.deposit_amount).max(Money::ZERO);
        self.payment_status = PaymentStatus::derive(self.balance_due, self.deposit_amount);
    }
}

/// Junction row: one room allocated to a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRoom {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub room_id: Ulid,
    pub check_in_date: NaiveDate,
    pub check_out_date: NaiveDate,
    pub check_in_time: String,
    pub nights: u32,
    pub price_per_night: Money,
    pub subtotal: Money,
    /// Guests assigned to this room (customer ids).
    pub guest_ids: Vec<Ulid>,
}

impl ReservationRoom {
    pub fn span(&self) -> Span {
        Span {
            start: self.check_in_date,
            end: self.check_out_date,
        }
    }
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Efectivo,
    Transferencia,
}

impl PaymentMethod {
    /// Map free-form input onto a known method. Unrecognized input is cash.
    pub fn normalize(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return PaymentMethod::Efectivo;
        };
        match raw.trim().to_lowercase().as_str() {
            "transferencia" | "transfer" | "transferencia bancaria" | "bank_transfer" => {
                PaymentMethod::Transferencia
            }
            _ => PaymentMethod::Efectivo,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PaymentMethod::Efectivo => "efectivo",
            PaymentMethod::Transferencia => "transferencia",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PaymentMethod::Efectivo => "Efectivo",
            PaymentMethod::Transferencia => "Transferencia",
        }
    }
}

/// Row of the payment-methods lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodRecord {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub reservation_id: Ulid,
    /// Negative amounts reverse an earlier payment.
    pub amount: Money,
    pub method: PaymentMethod,
    pub bank_name: Option<String>,
    pub reference: Option<String>,
    pub note: Option<String>,
    pub reverses: Option<Ulid>,
    pub paid_at: NaiveDateTime,
    pub created_by: Option<String>,
}

// ── Occupancy ────────────────────────────────────────────────────

/// Realized occupancy. `check_out_at == None` means the guest is still in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stay {
    pub id: Ulid,
    pub room_id: Ulid,
    pub reservation_id: Option<Ulid>,
    pub check_in_at: NaiveDateTime,
    pub check_out_at: Option<NaiveDateTime>,
}

/// Per-night charge written when a guest checks in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayNight {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub room_id: Ulid,
    pub stay_id: Option<Ulid>,
    pub date: NaiveDate,
    pub price: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyStatus {
    Free,
    Reserved,
    CheckoutDay,
}

impl DailyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DailyStatus::Free => "free",
            DailyStatus::Reserved => "reserved",
            DailyStatus::CheckoutDay => "checkout_day",
        }
    }
}

/// Calendar projection row, keyed by `(room_id, date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDailyStatus {
    pub room_id: Ulid,
    pub date: NaiveDate,
    pub status: DailyStatus,
    pub reservation_id: Option<Ulid>,
    pub guest_id: Option<Ulid>,
}

/// Per-room state guarded by one lock: the room row plus everything that is
/// booked, realized or projected on it.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Junction rows on this room, sorted by `check_in_date`.
    pub allocations: Vec<ReservationRoom>,
    pub stays: Vec<Stay>,
    pub nights: Vec<StayNight>,
    pub daily: BTreeMap<NaiveDate, RoomDailyStatus>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            allocations: Vec::new(),
            stays: Vec::new(),
            nights: Vec::new(),
            daily: BTreeMap::new(),
        }
    }

    /// Insert a junction row keeping the list sorted by check-in date.
    pub fn insert_allocation(&mut self, row: ReservationRoom) {
        let pos = self
            .allocations
            .partition_point(|a| a.check_in_date <= row.check_in_date);
        self.allocations.insert(pos, row);
    }

    pub fn remove_allocations_for(&mut self, reservation_id: Ulid) -> usize {
        let before = self.allocations.len();
        self.allocations.retain(|a| a.reservation_id != reservation_id);
        before - self.allocations.len()
    }

    /// Junction rows whose span overlaps `query`.
    /// Rows starting at or after `query.end` are skipped by binary search.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ReservationRoom> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.check_in_date < query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.check_out_date > query.start)
    }

    pub fn allocation_for(&self, reservation_id: Ulid) -> Option<&ReservationRoom> {
        self.allocations
            .iter()
            .find(|a| a.reservation_id == reservation_id)
    }

    pub fn open_stay(&self) -> Option<&Stay> {
        self.stays.iter().find(|s| s.check_out_at.is_none())
    }
}

/// WAL record vocabulary. One committed unit of work is a `Vec<Event>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomSaved {
        room: Room,
    },
    CustomerSaved {
        customer: Customer,
    },
    PaymentMethodAdded {
        method: PaymentMethodRecord,
    },
    /// Insert or replace the reservation row. Payment fields are re-derived
    /// from the payment list when applied.
    ReservationSaved {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: Ulid,
        at: NaiveDateTime,
    },
    /// Drop every junction row of the reservation, then insert `rows`.
    RoomsAllocated {
        reservation_id: Ulid,
        released_rooms: Vec<Ulid>,
        rows: Vec<ReservationRoom>,
    },
    PaymentRecorded {
        payment: Payment,
    },
    StayOpened {
        stay: Stay,
        nights: Vec<StayNight>,
    },
    StayClosed {
        stay_id: Ulid,
        room_id: Ulid,
        at: NaiveDateTime,
    },
    NightsPurged {
        reservation_id: Ulid,
        room_ids: Vec<Ulid>,
    },
    DailyStatusUpserted {
        rows: Vec<RoomDailyStatus>,
    },
    /// Remove projection rows pointing at a reservation.
    DailyStatusReleased {
        reservation_id: Ulid,
        room_ids: Vec<Ulid>,
    },
    /// Remove all projection rows of `room_ids` in `[from, to]`.
    DailyStatusCleared {
        room_ids: Vec<Ulid>,
        from: NaiveDate,
        to: NaiveDate,
    },
}

impl Event {
    /// Rooms whose state (or whose subscribers) this event touches.
    pub fn room_ids(&self) -> Vec<Ulid> {
        match self {
            Event::RoomSaved { room } => vec![room.id],
            Event::ReservationSaved { reservation } => reservation.room_id.into_iter().collect(),
            Event::RoomsAllocated {
                released_rooms,
                rows,
                ..
            } => {
                let mut ids: Vec<Ulid> = released_rooms.clone();
                ids.extend(rows.iter().map(|r| r.room_id));
                ids.sort();
                ids.dedup();
                ids
            }
            Event::StayOpened { stay, .. } => vec![stay.room_id],
            Event::StayClosed { room_id, .. } => vec![*room_id],
            Event::NightsPurged { room_ids, .. }
            | Event::DailyStatusReleased { room_ids, .. }
            | Event::DailyStatusCleared { room_ids, .. } => room_ids.clone(),
            Event::DailyStatusUpserted { rows } => {
                let mut ids: Vec<Ulid> = rows.iter().map(|r| r.room_id).collect();
                ids.sort();
                ids.dedup();
                ids
            }
            Event::CustomerSaved { .. }
            | Event::PaymentMethodAdded { .. }
            | Event::ReservationCancelled { .. }
            | Event::PaymentRecorded { .. } => Vec::new(),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Guest as shown on a room card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestInfo {
    pub id: Ulid,
    pub name: String,
    pub identification: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl From<&Customer> for GuestInfo {
    fn from(c: &Customer) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            identification: c.identification.clone(),
            phone: c.phone.clone(),
            email: c.email.clone(),
        }
    }
}

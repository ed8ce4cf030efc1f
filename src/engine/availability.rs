//! Room availability across every place a booking can live.

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Reservation, RoomState, Span};

use super::{Engine, EngineError, RoomConflict};

/// What a booking source may look at.
pub struct BookingContext<'a> {
    pub room: &'a RoomState,
    pub reservations: &'a DashMap<Ulid, Reservation>,
}

/// A live (non-cancelled) booking found by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Booking {
    pub reservation_id: Ulid,
    pub span: Span,
}

/// One place bookings are recorded. The checker asks every source in order
/// and treats the room as taken if any of them reports an overlap.
pub trait BookingSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Live bookings on `ctx.room` overlapping `query` under the half-open rule.
    fn overlapping(&self, ctx: &BookingContext<'_>, query: &Span) -> Result<Vec<Booking>, EngineError>;
}

/// Reservations from the single-room era, which carry the room themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyRoomSource;

impl BookingSource for LegacyRoomSource {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn overlapping(&self, ctx: &BookingContext<'_>, query: &Span) -> Result<Vec<Booking>, EngineError> {
        let room_id = ctx.room.room.id;
        Ok(ctx
            .reservations
            .iter()
            .filter(|r| r.room_id == Some(room_id) && !r.is_cancelled() && r.span().overlaps(query))
            .map(|r| Booking {
                reservation_id: r.id,
                span: r.span(),
            })
            .collect())
    }
}

/// Junction rows allocating the room to a reservation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReservationRoomSource;

impl BookingSource for ReservationRoomSource {
    fn name(&self) -> &'static str {
        "reservation_rooms"
    }

    fn overlapping(&self, ctx: &BookingContext<'_>, query: &Span) -> Result<Vec<Booking>, EngineError> {
        let mut hits = Vec::new();
        for row in ctx.room.overlapping(query) {
            let reservation = ctx.reservations.get(&row.reservation_id).ok_or_else(|| {
                EngineError::Inconsistent(format!(
                    "room {} holds a row for missing reservation {}",
                    ctx.room.room.room_number, row.reservation_id
                ))
            })?;
            if reservation.is_cancelled() {
                continue;
            }
            hits.push(Booking {
                reservation_id: row.reservation_id,
                span: row.span(),
            });
        }
        Ok(hits)
    }
}

impl Engine {
    /// Every live booking on the room overlapping `query`, from all sources,
    /// minus `exclude`.
    pub(crate) fn bookings_on(
        &self,
        room: &RoomState,
        query: &Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        let ctx = BookingContext {
            room,
            reservations: &self.reservations,
        };
        let mut all = Vec::new();
        for source in &self.sources {
            let hits = source.overlapping(&ctx, query)?;
            all.extend(hits.into_iter().filter(|b| Some(b.reservation_id) != exclude));
        }
        Ok(all)
    }

    /// The earliest booking colliding with `query`, if any.
    pub(crate) fn find_conflict(
        &self,
        room: &RoomState,
        query: &Span,
        exclude: Option<Ulid>,
    ) -> Result<Option<RoomConflict>, EngineError> {
        let first = self
            .bookings_on(room, query, exclude)?
            .into_iter()
            .min_by_key(|b| b.span.start);
        Ok(first.map(|b| RoomConflict {
            room_id: room.room.id,
            room_number: room.room.room_number.clone(),
            date: b.span.start.max(query.start),
            reservation_id: b.reservation_id,
        }))
    }

    /// Whether the room is free for `[check_in, check_out)`.
    ///
    /// Read-only. Fails closed: an unknown room, an empty range or a booking
    /// source error all report the room as unavailable.
    pub async fn is_room_available(
        &self,
        room_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        exclude_reservation: Option<Ulid>,
    ) -> bool {
        if check_in >= check_out {
            metrics::counter!(crate::observability::AVAILABILITY_CHECKS_TOTAL, "result" => "error").increment(1);
            return false;
        }
        self.is_free(room_id, Span::new(check_in, check_out), exclude_reservation)
            .await
    }

    /// Whether any live booking holds the room on the night of `date`.
    pub async fn is_occupied_on(&self, room_id: Ulid, date: NaiveDate) -> bool {
        !self.is_free(room_id, Span::day(date), None).await
    }

    async fn is_free(&self, room_id: Ulid, query: Span, exclude: Option<Ulid>) -> bool {
        let Some(rs) = self.get_room_state(&room_id) else {
            tracing::warn!(%room_id, "availability check for unknown room");
            metrics::counter!(crate::observability::AVAILABILITY_CHECKS_TOTAL, "result" => "error").increment(1);
            return false;
        };
        let guard = rs.read().await;
        match self.bookings_on(&guard, &query, exclude) {
            Ok(hits) if hits.is_empty() => {
                metrics::counter!(crate::observability::AVAILABILITY_CHECKS_TOTAL, "result" => "free").increment(1);
                true
            }
            Ok(_) => {
                metrics::counter!(crate::observability::AVAILABILITY_CHECKS_TOTAL, "result" => "taken").increment(1);
                false
            }
            Err(e) => {
                tracing::warn!(%room_id, error = %e, "availability check failed, reporting room as taken");
                metrics::counter!(crate::observability::AVAILABILITY_CHECKS_TOTAL, "result" => "error").increment(1);
                false
            }
        }
    }
}

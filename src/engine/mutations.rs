use chrono::{Datelike, NaiveDateTime};
use tokio::sync::OwnedRwLockReadGuard;
use ulid::Ulid;

use crate::guests::{GuestCountInput, resolve_guest_composition};
use crate::model::*;
use crate::time::parse_flexible_time;

use super::allocation::{allocate_rooms, price_per_night, rebalance_rows, stay_nights};
use super::projection::{merge_rows, reservation_rows};
use super::validation::{ValidationContext, validate_payment, validate_reservation, validate_room};
use super::{
    Engine, EngineError, FieldErrors, PaymentInput, ReservationInput, RoomConflict, RoomGuards, WalCommand,
    format_code, parse_code,
};

const INITIAL_DEPOSIT_NOTE: &str = "initial deposit";
const DEPOSIT_ADJUSTMENT_NOTE: &str = "deposit adjustment";
/// Times a cancellation re-takes its locks when the rooms move underneath it.
const RELOCK_ATTEMPTS: usize = 3;

fn held<'a>(guards: &'a RoomGuards, room_id: &Ulid) -> Result<&'a RoomState, EngineError> {
    guards
        .get(room_id)
        .map(|guard| &**guard)
        .ok_or(EngineError::NotFound(*room_id))
}

impl Engine {
    fn reject_invalid(&self, errors: FieldErrors) -> Result<(), EngineError> {
        if !errors.is_empty() {
            metrics::counter!(crate::observability::VALIDATION_FAILURES_TOTAL).increment(1);
            tracing::debug!(%errors, "input rejected");
        }
        errors.into_result()
    }

    fn normalize_time(&self, raw: Option<&str>) -> String {
        parse_flexible_time(raw.unwrap_or_default(), &self.default_check_in_time)
    }

    /// Events recording `payment`, creating its method in the lookup first
    /// when it is not there yet.
    fn payment_events(&self, payment: Payment) -> Vec<Event> {
        let mut events = Vec::with_capacity(2);
        if !self.payment_methods.contains_key(payment.method.code()) {
            events.push(Event::PaymentMethodAdded {
                method: PaymentMethodRecord {
                    code: payment.method.code().into(),
                    name: payment.method.display_name().into(),
                },
            });
        }
        events.push(Event::PaymentRecorded { payment });
        events
    }

    fn deposit_payment(
        reservation_id: Ulid,
        amount: Money,
        method: Option<&str>,
        note: &str,
        created_by: Option<String>,
        at: NaiveDateTime,
    ) -> Payment {
        Payment {
            id: Ulid::new(),
            reservation_id,
            amount,
            method: PaymentMethod::normalize(method),
            bank_name: None,
            reference: None,
            note: Some(note.into()),
            reverses: None,
            paid_at: at,
            created_by,
        }
    }

    fn reject_conflicts(&self, guards: &RoomGuards, rooms: &[Ulid], span: &Span, exclude: Option<Ulid>) -> Result<(), EngineError> {
        for room_id in rooms {
            let rs = held(guards, room_id)?;
            if !rs.room.is_bookable() {
                return Err(EngineError::invalid(
                    "room_ids",
                    format!("Room {} is not available for booking.", rs.room.room_number),
                ));
            }
            if let Some(conflict) = self.find_conflict(rs, span, exclude)? {
                metrics::counter!(crate::observability::ROOM_CONFLICTS_TOTAL).increment(1);
                tracing::info!(room = %conflict.room_number, date = %conflict.date, "room already booked");
                return Err(EngineError::Conflict(conflict));
            }
        }
        Ok(())
    }

    // ── Rooms & customers ────────────────────────────────

    pub async fn create_room(&self, mut room: Room) -> Result<Room, EngineError> {
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }
        room.room_number = room.room_number.trim().to_string();
        let taken = self.room_by_number(&room.room_number).await.is_some();
        self.reject_invalid(validate_room(&room, taken))?;

        self.commit(&mut RoomGuards::new(), vec![Event::RoomSaved { room: room.clone() }])
            .await?;
        tracing::info!(room = %room.room_number, "room created");
        Ok(room)
    }

    /// Replace a room's attributes. The id is kept; so are its bookings.
    pub async fn update_room(&self, mut room: Room) -> Result<Room, EngineError> {
        room.room_number = room.room_number.trim().to_string();
        let taken = self
            .room_by_number(&room.room_number)
            .await
            .is_some_and(|other| other.id != room.id);
        self.reject_invalid(validate_room(&room, taken))?;

        let mut guards = self.lock_rooms([room.id]).await?;
        self.commit(&mut guards, vec![Event::RoomSaved { room: room.clone() }])
            .await?;
        Ok(room)
    }

    async fn modify_room(&self, room_id: Ulid, change: impl FnOnce(&mut Room)) -> Result<Room, EngineError> {
        let mut guards = self.lock_rooms([room_id]).await?;
        let mut room = held(&guards, &room_id)?.room.clone();
        change(&mut room);
        self.commit(&mut guards, vec![Event::RoomSaved { room: room.clone() }])
            .await?;
        Ok(room)
    }

    pub async fn set_maintenance(&self, room_id: Ulid, on: bool) -> Result<Room, EngineError> {
        let room = self.modify_room(room_id, |room| room.maintenance = on).await?;
        tracing::info!(room = %room.room_number, maintenance = on, "maintenance flag changed");
        Ok(room)
    }

    /// Soft-delete: the room stops being bookable but keeps its history.
    pub async fn deactivate_room(&self, room_id: Ulid) -> Result<Room, EngineError> {
        let now = self.clock.now();
        let room = self
            .modify_room(room_id, |room| {
                room.active = false;
                room.deleted_at.get_or_insert(now);
            })
            .await?;
        tracing::info!(room = %room.room_number, "room deactivated");
        Ok(room)
    }

    /// Insert or update a customer.
    pub async fn register_customer(&self, mut customer: Customer) -> Result<Customer, EngineError> {
        customer.name = customer.name.trim().to_string();
        if customer.name.is_empty() {
            return Err(EngineError::invalid("name", "Customer name is required."));
        }
        self.commit(
            &mut RoomGuards::new(),
            vec![Event::CustomerSaved {
                customer: customer.clone(),
            }],
        )
        .await?;
        Ok(customer)
    }

    // ── Reservations ─────────────────────────────────────

    /// Book one or more rooms for a customer as a single unit of work:
    /// reservation, room rows, deposit payment and calendar rows.
    pub async fn create_reservation(&self, input: ReservationInput) -> Result<Reservation, EngineError> {
        self.insert_reservation(input, None).await
    }

    /// Record a single-room reservation from the pre-junction schema. The
    /// room is kept on the reservation itself and no room rows are written.
    pub async fn import_legacy_reservation(&self, input: ReservationInput, code: String) -> Result<Reservation, EngineError> {
        let mut errors = FieldErrors::new();
        if parse_code(&code).is_none() {
            errors.add("code", "Code must look like RES-YYYY-NNNN.");
        } else if self.reservation_by_code(&code).is_some() {
            errors.add("code", format!("Reservation {code} already exists."));
        }
        if input.distinct_rooms().len() > 1 {
            errors.add("room_ids", "A legacy reservation holds exactly one room.");
        }
        self.reject_invalid(errors)?;
        self.insert_reservation(input, Some(code)).await
    }

    async fn insert_reservation(&self, input: ReservationInput, legacy_code: Option<String>) -> Result<Reservation, EngineError> {
        let now = self.clock.now();
        let today = now.date();
        let room_ids = input.distinct_rooms();
        let rooms = self.rooms_by_ids(&room_ids).await;
        let customer_exists = input.customer_id.is_some_and(|id| self.customers.contains_key(&id));
        self.reject_invalid(validate_reservation(
            &input,
            &ValidationContext {
                today,
                reject_past_check_in: legacy_code.is_none(),
                require_rooms: true,
                customer_exists,
                rooms: &rooms,
            },
        ))?;
        let (Some(customer_id), Some(check_in), Some(check_out)) =
            (input.customer_id, input.check_in_date, input.check_out_date)
        else {
            return Err(EngineError::invalid("check_in_date", "Check-in and check-out dates are required."));
        };
        let span = Span::new(check_in, check_out);

        let mut guards = self.lock_rooms(room_ids.iter().copied()).await?;
        self.reject_conflicts(&guards, &room_ids, &span, None)?;

        let guests = resolve_guest_composition(&GuestCountInput {
            adults: input.adults,
            children: input.children,
            guests_count: input.guests_count,
            room_guests: Some(&input.room_guests),
        });

        // Held until commit so two bookings can never draw the same number.
        let mut codes = self.codes.lock().await;
        let legacy = legacy_code.is_some();
        let code = match legacy_code {
            Some(code) => code,
            None => {
                let year = today.year();
                format_code(year, codes.get(&year).copied().unwrap_or(0) + 1)
            }
        };

        let deposit = input.deposit;
        let balance_due = (input.total_amount - deposit).max(Money::ZERO);
        let reservation = Reservation {
            id: Ulid::new(),
            code,
            customer_id,
            room_id: if legacy { room_ids.first().copied() } else { None },
            check_in_date: check_in,
            check_out_date: check_out,
            check_in_time: self.normalize_time(input.check_in_time.as_deref()),
            total_amount: input.total_amount,
            deposit_amount: deposit,
            balance_due,
            payment_status: PaymentStatus::derive(balance_due, deposit),
            guests,
            guest_ids: input.guest_ids.clone(),
            notes: input.notes.clone(),
            attachment: input.attachment.clone(),
            created_at: now,
            deleted_at: None,
        };

        let rows = if legacy {
            Vec::new()
        } else {
            allocate_rooms(&reservation, &room_ids, &input.room_guests)
        };
        let mut events = vec![Event::ReservationSaved {
            reservation: reservation.clone(),
        }];
        if !rows.is_empty() {
            events.push(Event::RoomsAllocated {
                reservation_id: reservation.id,
                released_rooms: Vec::new(),
                rows: rows.clone(),
            });
        }
        if deposit > Money::ZERO {
            events.extend(self.payment_events(Self::deposit_payment(
                reservation.id,
                deposit,
                input.payment_method.as_deref(),
                INITIAL_DEPOSIT_NOTE,
                input.created_by.clone(),
                now,
            )));
        }
        let daily = merge_rows(&guards, reservation_rows(&reservation, &rows));
        if !daily.is_empty() {
            events.push(Event::DailyStatusUpserted { rows: daily });
        }

        if let Err(e) = self.commit(&mut guards, events).await {
            tracing::error!(code = %reservation.code, error = %e, "reservation not created, nothing applied");
            return Err(e);
        }
        if let Some((year, seq)) = parse_code(&reservation.code) {
            let highest = codes.entry(year).or_insert(0);
            *highest = (*highest).max(seq);
        }
        drop(codes);

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        tracing::info!(
            code = %reservation.code,
            rooms = room_ids.len(),
            total = %reservation.total_amount,
            "reservation created"
        );
        Ok(self.get_reservation(reservation.id).unwrap_or(reservation))
    }

    /// Change a reservation's dates, rooms, guests or amounts.
    ///
    /// With `preserve_room_assignments` and existing room rows, the rows are
    /// kept and only the money is re-split across them. Otherwise the rows
    /// are replaced from `input.room_ids`. The deposit never drops below what
    /// has already been paid.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        input: ReservationInput,
        preserve_room_assignments: bool,
    ) -> Result<Reservation, EngineError> {
        let now = self.clock.now();
        let current = self.get_reservation(id).ok_or(EngineError::NotFound(id))?;
        if current.is_cancelled() {
            return Err(EngineError::Locked(current.code));
        }

        let existing_rooms = self.allocated_rooms(id);
        let preserve = preserve_room_assignments && !existing_rooms.is_empty();
        let mut checked = input.clone();
        if preserve {
            checked.room_ids.clear();
        }
        let new_rooms = checked.distinct_rooms();
        let rooms = self.rooms_by_ids(&new_rooms).await;
        let customer_exists = input.customer_id.is_some_and(|c| self.customers.contains_key(&c));
        self.reject_invalid(validate_reservation(
            &checked,
            &ValidationContext {
                today: now.date(),
                reject_past_check_in: input.check_in_date != Some(current.check_in_date),
                require_rooms: false,
                customer_exists,
                rooms: &rooms,
            },
        ))?;
        if !preserve && new_rooms.is_empty() {
            return Err(EngineError::NoRoomsSelected);
        }
        let (Some(customer_id), Some(check_in), Some(check_out)) =
            (input.customer_id, input.check_in_date, input.check_out_date)
        else {
            return Err(EngineError::invalid("check_in_date", "Check-in and check-out dates are required."));
        };
        let span = Span::new(check_in, check_out);

        let lock_set = existing_rooms
            .iter()
            .chain(new_rooms.iter())
            .chain(current.room_id.iter())
            .copied()
            .collect::<Vec<_>>();
        let mut guards = self.lock_rooms(lock_set).await?;
        let _ledger = self.ledger.lock().await;

        // Re-read under the locks: a cancel or another update may have landed.
        let current = self.get_reservation(id).ok_or(EngineError::NotFound(id))?;
        if current.is_cancelled() {
            return Err(EngineError::Locked(current.code));
        }
        let held_rooms = self.allocated_rooms(id);
        if held_rooms.iter().any(|room| !guards.contains_key(room)) {
            return Err(EngineError::Inconsistent(format!(
                "rooms of {} changed during the update, retry",
                current.code
            )));
        }
        let existing_rows: Vec<ReservationRoom> = held_rooms
            .iter()
            .filter_map(|room| guards.get(room).and_then(|rs| rs.allocation_for(id).cloned()))
            .collect();

        let net_paid = self.net_paid(id);
        let deposit = input.deposit.max(net_paid);

        let mut updated = current.clone();
        updated.customer_id = customer_id;
        updated.check_in_date = check_in;
        updated.check_out_date = check_out;
        if input.check_in_time.is_some() {
            updated.check_in_time = self.normalize_time(input.check_in_time.as_deref());
        }
        updated.total_amount = input.total_amount;
        updated.guests = resolve_guest_composition(&GuestCountInput {
            adults: input.adults,
            children: input.children,
            guests_count: input.guests_count,
            room_guests: Some(&input.room_guests),
        });
        updated.guest_ids = input.guest_ids.clone();
        updated.notes = input.notes.clone();
        if input.attachment.is_some() {
            updated.attachment = input.attachment.clone();
        }
        updated.deposit_amount = deposit;
        updated.balance_due = (updated.total_amount - deposit).max(Money::ZERO);
        updated.payment_status = PaymentStatus::derive(updated.balance_due, deposit);

        let (rows, mode) = if preserve && !existing_rows.is_empty() {
            (rebalance_rows(&existing_rows, &updated), "preserve")
        } else {
            if new_rooms.is_empty() {
                return Err(EngineError::NoRoomsSelected);
            }
            self.reject_conflicts(&guards, &new_rooms, &span, Some(id))?;
            updated.room_id = None;
            (allocate_rooms(&updated, &new_rooms, &input.room_guests), "replace")
        };

        let mut events = vec![
            Event::ReservationSaved {
                reservation: updated.clone(),
            },
            Event::RoomsAllocated {
                reservation_id: id,
                released_rooms: held_rooms.clone(),
                rows: rows.clone(),
            },
        ];
        if deposit > net_paid {
            events.extend(self.payment_events(Self::deposit_payment(
                id,
                deposit - net_paid,
                input.payment_method.as_deref(),
                DEPOSIT_ADJUSTMENT_NOTE,
                input.created_by.clone(),
                now,
            )));
        }
        let has_stays = guards
            .values()
            .any(|rs| rs.stays.iter().any(|s| s.reservation_id == Some(id)));
        if mode == "replace" && !has_stays {
            events.push(Event::NightsPurged {
                reservation_id: id,
                room_ids: guards.keys().copied().collect(),
            });
        }
        events.push(Event::DailyStatusReleased {
            reservation_id: id,
            room_ids: guards.keys().copied().collect(),
        });
        let daily = merge_rows(&guards, reservation_rows(&updated, &rows));
        if !daily.is_empty() {
            events.push(Event::DailyStatusUpserted { rows: daily });
        }

        if let Err(e) = self.commit(&mut guards, events).await {
            tracing::error!(code = %updated.code, error = %e, "reservation update rolled back");
            return Err(e);
        }
        metrics::counter!(crate::observability::RESERVATIONS_UPDATED_TOTAL, "mode" => mode).increment(1);
        tracing::info!(code = %updated.code, mode, "reservation updated");
        Ok(self.get_reservation(id).unwrap_or(updated))
    }

    /// Soft-delete a reservation and free its calendar days. Cancelled
    /// reservations are read-only from then on.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let mut attempt = 0;
        let (mut guards, current) = loop {
            let current = self.get_reservation(id).ok_or(EngineError::NotFound(id))?;
            if current.is_cancelled() {
                return Err(EngineError::Locked(current.code));
            }
            let mut rooms = self.allocated_rooms(id);
            rooms.extend(current.room_id);
            let guards = self.lock_rooms(rooms).await?;

            // An update may have moved the reservation while we waited.
            let current = self.get_reservation(id).ok_or(EngineError::NotFound(id))?;
            if current.is_cancelled() {
                return Err(EngineError::Locked(current.code));
            }
            let mut held_rooms = self.allocated_rooms(id);
            held_rooms.extend(current.room_id);
            if held_rooms.iter().all(|room| guards.contains_key(room)) {
                break (guards, current);
            }
            attempt += 1;
            if attempt >= RELOCK_ATTEMPTS {
                return Err(EngineError::Inconsistent(format!(
                    "rooms of {} kept changing during the cancellation, retry",
                    current.code
                )));
            }
            tracing::debug!(code = %current.code, attempt, "rooms moved under cancellation, relocking");
        };
        let events = vec![
            Event::ReservationCancelled {
                id,
                at: self.clock.now(),
            },
            Event::DailyStatusReleased {
                reservation_id: id,
                room_ids: guards.keys().copied().collect(),
            },
        ];
        if let Err(e) = self.commit(&mut guards, events).await {
            tracing::error!(code = %current.code, error = %e, "cancellation rolled back");
            return Err(e);
        }
        metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        tracing::info!(code = %current.code, "reservation cancelled");
        self.get_reservation(id).ok_or(EngineError::NotFound(id))
    }

    // ── Payments ─────────────────────────────────────────

    pub async fn record_payment(&self, reservation_id: Ulid, input: PaymentInput) -> Result<Reservation, EngineError> {
        self.reject_invalid(validate_payment(&input))?;
        let _ledger = self.ledger.lock().await;
        let reservation = self
            .get_reservation(reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        if reservation.is_cancelled() {
            return Err(EngineError::Locked(reservation.code));
        }
        let payment = Payment {
            id: Ulid::new(),
            reservation_id,
            amount: input.amount,
            method: PaymentMethod::normalize(input.method.as_deref()),
            bank_name: input.bank_name,
            reference: input.reference,
            note: input.note,
            reverses: None,
            paid_at: self.clock.now(),
            created_by: input.created_by,
        };
        let amount = payment.amount;
        self.commit(&mut RoomGuards::new(), self.payment_events(payment))
            .await?;
        tracing::info!(code = %reservation.code, %amount, "payment recorded");
        self.get_reservation(reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))
    }

    /// Cancel a payment by recording its negative counterpart.
    pub async fn reverse_payment(&self, payment_id: Ulid, created_by: Option<String>) -> Result<Payment, EngineError> {
        let _ledger = self.ledger.lock().await;
        let original = self
            .payments
            .iter()
            .find_map(|list| list.iter().find(|p| p.id == payment_id).cloned())
            .ok_or(EngineError::NotFound(payment_id))?;
        if original.reverses.is_some() {
            return Err(EngineError::invalid("payment_id", "A reversal cannot itself be reversed."));
        }
        if self
            .payments_for(original.reservation_id)
            .iter()
            .any(|p| p.reverses == Some(payment_id))
        {
            return Err(EngineError::invalid("payment_id", "This payment was already reversed."));
        }
        let reservation = self
            .get_reservation(original.reservation_id)
            .ok_or(EngineError::NotFound(original.reservation_id))?;
        if reservation.is_cancelled() {
            return Err(EngineError::Locked(reservation.code));
        }

        let reversal = Payment {
            id: Ulid::new(),
            reservation_id: original.reservation_id,
            amount: -original.amount,
            method: original.method,
            bank_name: original.bank_name.clone(),
            reference: original.reference.clone(),
            note: Some(format!("reversal of payment {payment_id}")),
            reverses: Some(payment_id),
            paid_at: self.clock.now(),
            created_by,
        };
        self.commit(
            &mut RoomGuards::new(),
            vec![Event::PaymentRecorded {
                payment: reversal.clone(),
            }],
        )
        .await?;
        tracing::info!(code = %reservation.code, amount = %original.amount, "payment reversed");
        Ok(reversal)
    }

    // ── Stays ────────────────────────────────────────────

    /// Open a stay for a reservation's room and write its per-night charges.
    pub async fn check_in(&self, reservation_id: Ulid, room_id: Ulid, at: NaiveDateTime) -> Result<Stay, EngineError> {
        if self.is_historic_date(at.date()) {
            return Err(EngineError::HistoricDate(at.date()));
        }
        let mut guards = self.lock_rooms([room_id]).await?;
        let reservation = self
            .get_reservation(reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        if reservation.is_cancelled() {
            return Err(EngineError::Locked(reservation.code));
        }

        let rs = held(&guards, &room_id)?;
        let planned = match rs.allocation_for(reservation_id) {
            Some(row) => Some((row.span(), row.price_per_night)),
            None if reservation.room_id == Some(room_id) => {
                let nights = stay_nights(reservation.check_in_date, reservation.check_out_date);
                Some((reservation.span(), price_per_night(reservation.total_amount, nights)))
            }
            None => None,
        };
        let Some((span, nightly)) = planned else {
            return Err(EngineError::invalid("room_id", "The room is not part of this reservation."));
        };
        if let Some(open) = rs.open_stay() {
            return Err(EngineError::Conflict(RoomConflict {
                room_id,
                room_number: rs.room.room_number.clone(),
                date: at.date(),
                reservation_id: open.reservation_id.unwrap_or(Ulid::nil()),
            }));
        }

        let stay = Stay {
            id: Ulid::new(),
            room_id,
            reservation_id: Some(reservation_id),
            check_in_at: at,
            check_out_at: None,
        };
        let nights: Vec<StayNight> = span
            .start
            .iter_days()
            .take_while(|date| *date < span.end)
            .filter(|date| {
                !rs.nights
                    .iter()
                    .any(|n| n.reservation_id == reservation_id && n.date == *date)
            })
            .map(|date| StayNight {
                id: Ulid::new(),
                reservation_id,
                room_id,
                stay_id: Some(stay.id),
                date,
                price: nightly,
            })
            .collect();
        let room_number = rs.room.room_number.clone();
        let night_count = nights.len();

        self.commit(
            &mut guards,
            vec![Event::StayOpened {
                stay: stay.clone(),
                nights,
            }],
        )
        .await?;
        tracing::info!(code = %reservation.code, room = %room_number, nights = night_count, "guest checked in");
        Ok(stay)
    }

    pub async fn check_out(&self, stay_id: Ulid, at: NaiveDateTime) -> Result<Stay, EngineError> {
        if self.is_historic_date(at.date()) {
            return Err(EngineError::HistoricDate(at.date()));
        }
        let room_id = self
            .stay_index
            .get(&stay_id)
            .map(|r| *r.value())
            .ok_or(EngineError::NotFound(stay_id))?;
        let mut guards = self.lock_rooms([room_id]).await?;
        let mut stay = held(&guards, &room_id)?
            .stays
            .iter()
            .find(|s| s.id == stay_id)
            .cloned()
            .ok_or(EngineError::NotFound(stay_id))?;
        if stay.check_out_at.is_some() {
            return Err(EngineError::invalid("stay_id", "The guest has already checked out."));
        }
        if at < stay.check_in_at {
            return Err(EngineError::invalid("check_out_at", "Check-out cannot precede check-in."));
        }
        if let Some(reservation) = stay.reservation_id.and_then(|id| self.get_reservation(id))
            && reservation.is_cancelled()
        {
            return Err(EngineError::Locked(reservation.code));
        }

        self.commit(&mut guards, vec![Event::StayClosed { stay_id, room_id, at }])
            .await?;
        stay.check_out_at = Some(at);
        tracing::info!(%room_id, %stay_id, "guest checked out");
        Ok(stay)
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL as a snapshot of the current state. Returns the number
    /// of units of work in the snapshot.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let (states, _gate) = loop {
            let mut ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
            ids.sort();
            let mut states: Vec<OwnedRwLockReadGuard<RoomState>> = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(rs) = self.get_room_state(id) {
                    states.push(rs.read_owned().await);
                }
            }
            let gate = self.commit_gate.write().await;
            // A room created while the read locks were being taken would be
            // missing from the snapshot; start over.
            if self.rooms.len() == states.len() {
                break (states, gate);
            }
        };

        let mut commits: Vec<Vec<Event>> = Vec::new();
        commits.push(
            states
                .iter()
                .map(|rs| Event::RoomSaved { room: rs.room.clone() })
                .collect(),
        );
        let mut people: Vec<Event> = self
            .customers
            .iter()
            .map(|c| Event::CustomerSaved {
                customer: c.value().clone(),
            })
            .collect();
        people.extend(self.payment_methods.iter().map(|m| Event::PaymentMethodAdded {
            method: m.value().clone(),
        }));
        commits.push(people);

        for reservation in self.reservations.iter() {
            let mut unit = vec![Event::ReservationSaved {
                reservation: reservation.value().clone(),
            }];
            let order = self.allocated_rooms(reservation.id);
            let rows: Vec<ReservationRoom> = order
                .iter()
                .filter_map(|room| {
                    states
                        .iter()
                        .find(|rs| rs.room.id == *room)
                        .and_then(|rs| rs.allocation_for(reservation.id).cloned())
                })
                .collect();
            if !rows.is_empty() {
                unit.push(Event::RoomsAllocated {
                    reservation_id: reservation.id,
                    released_rooms: Vec::new(),
                    rows,
                });
            }
            commits.push(unit);
        }
        for list in self.payments.iter() {
            if !list.is_empty() {
                commits.push(
                    list.iter()
                        .map(|p| Event::PaymentRecorded { payment: p.clone() })
                        .collect(),
                );
            }
        }
        for rs in &states {
            let mut unit: Vec<Event> = rs
                .stays
                .iter()
                .map(|stay| Event::StayOpened {
                    stay: stay.clone(),
                    nights: rs
                        .nights
                        .iter()
                        .filter(|n| n.stay_id == Some(stay.id))
                        .cloned()
                        .collect(),
                })
                .collect();
            if !rs.daily.is_empty() {
                unit.push(Event::DailyStatusUpserted {
                    rows: rs.daily.values().cloned().collect(),
                });
            }
            if !unit.is_empty() {
                commits.push(unit);
            }
        }
        commits.retain(|unit| !unit.is_empty());
        let count = commits.len();

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                commits,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        tracing::info!(units = count, "WAL compacted");
        Ok(count)
    }
}

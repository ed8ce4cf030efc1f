mod allocation;
mod availability;
mod display;
mod error;
mod mutations;
mod projection;
mod queries;
mod validation;

pub use allocation::{price_per_night, round_money, split_evenly, stay_nights};
pub use availability::{Booking, BookingContext, BookingSource, LegacyRoomSource, ReservationRoomSource};
pub use display::{DisplayStatus, RoomDisplay, planned_checkout_covers, stay_covers};
pub use error::{EngineError, FieldErrors, RoomConflict};
pub use projection::{determine_status, project_rows};
pub use validation::{PaymentInput, ReservationInput};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::cleaning::{AlwaysClean, CleaningStatusProvider};
use crate::clock::{Clock, SystemClock};
use crate::limits::DEFAULT_LOCK_TIMEOUT;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::time::DEFAULT_CHECK_IN_TIME;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Write guards held for the duration of a unit of work, keyed (and
/// therefore acquired) in room id order.
pub(crate) type RoomGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Vec<Event>>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    FailAppendsAfter {
        after: Option<usize>,
        response: oneshot::Sender<()>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                // Flush the batch before any compaction so no acknowledged
                // append is written into the file about to be replaced.
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// Write and fsync a batch as one all-or-nothing step. On any failure the
/// log is cut back to its last durable length, so no unit whose caller is
/// told "failed" can come back on replay.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(events, _)| wal.append_buffered(events))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        tracing::error!(units = batch.len(), error = %e, "WAL batch failed, rolling back");
        // A failed rollback poisons the log; the batch error is what callers see.
        let _ = wal.rollback();
    }
    result
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let batch = vec![(events, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
        #[cfg(test)]
        WalCommand::FailAppendsAfter { after, response } => {
            wal.fail_appends_after(after);
            let _ = response.send(());
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// Collaborators the engine consults but does not own.
#[derive(Clone)]
pub struct EngineSettings {
    pub clock: Arc<dyn Clock>,
    pub cleaning: Arc<dyn CleaningStatusProvider>,
    /// Normalized `HH:MM` used when a reservation carries no readable time.
    pub default_check_in_time: String,
    /// Booking sources consulted by the availability checker, in order.
    pub booking_sources: Vec<Arc<dyn BookingSource>>,
    /// A write that cannot get its room locks in time fails with `Timeout`.
    pub lock_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            cleaning: Arc::new(AlwaysClean),
            default_check_in_time: DEFAULT_CHECK_IN_TIME.into(),
            booking_sources: vec![Arc::new(LegacyRoomSource), Arc::new(ReservationRoomSource)],
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

pub struct Engine {
    rooms: DashMap<Ulid, SharedRoomState>,
    reservations: DashMap<Ulid, Reservation>,
    /// Reservation id → its payments, in recording order.
    payments: DashMap<Ulid, Vec<Payment>>,
    customers: DashMap<Ulid, Customer>,
    payment_methods: DashMap<String, PaymentMethodRecord>,
    /// Reservation id → rooms holding its junction rows.
    allocation_index: DashMap<Ulid, Vec<Ulid>>,
    /// Stay id → room id.
    stay_index: DashMap<Ulid, Ulid>,
    /// Highest reservation code sequence handed out per year.
    codes: Mutex<HashMap<i32, u32>>,
    /// Serializes payment bookkeeping that reads the ledger before writing it.
    ledger: Mutex<()>,
    /// Commits hold it shared; compaction holds it exclusively so the
    /// snapshot and the log swap see no commit in flight.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
    cleaning: Arc<dyn CleaningStatusProvider>,
    sources: Vec<Arc<dyn BookingSource>>,
    default_check_in_time: String,
    lock_timeout: Duration,
}

impl Engine {
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>, settings: EngineSettings) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut engine = Self {
            rooms: DashMap::new(),
            reservations: DashMap::new(),
            payments: DashMap::new(),
            customers: DashMap::new(),
            payment_methods: DashMap::new(),
            allocation_index: DashMap::new(),
            stay_index: DashMap::new(),
            codes: Mutex::new(HashMap::new()),
            ledger: Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
            clock: settings.clock,
            cleaning: settings.cleaning,
            sources: settings.booking_sources,
            default_check_in_time: settings.default_check_in_time,
            lock_timeout: settings.lock_timeout,
        };

        // Nobody else holds these Arcs yet, so every room lock taken while
        // applying is uncontended.
        let mut no_guards = RoomGuards::new();
        for events in &commits {
            for event in events {
                engine.apply(&mut no_guards, event);
            }
        }

        let mut seqs: HashMap<i32, u32> = HashMap::new();
        for entry in engine.reservations.iter() {
            if let Some((year, seq)) = parse_code(&entry.code) {
                let max = seqs.entry(year).or_insert(0);
                *max = (*max).max(seq);
            }
        }
        *engine.codes.get_mut() = seqs;

        tracing::info!(
            commits = commits.len(),
            rooms = engine.rooms.len(),
            reservations = engine.reservations.len(),
            "state replayed"
        );
        Ok(engine)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn default_check_in_time(&self) -> &str {
        &self.default_check_in_time
    }

    pub(crate) fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Acquire write locks on `ids` in sorted order to prevent deadlocks.
    /// Gives up with `Timeout` once the whole set took longer than the
    /// configured lock timeout; guards taken so far are released.
    pub(crate) async fn lock_rooms(&self, ids: impl IntoIterator<Item = Ulid>) -> Result<RoomGuards, EngineError> {
        let sorted: BTreeSet<Ulid> = ids.into_iter().collect();
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        let mut guards = RoomGuards::new();
        for id in sorted {
            let rs = self.get_room_state(&id).ok_or(EngineError::NotFound(id))?;
            let guard = tokio::time::timeout_at(deadline, rs.write_owned()).await.map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!(%id, timeout = ?self.lock_timeout, "room lock wait timed out");
                EngineError::Timeout(format!("room {id}"))
            })?;
            guards.insert(id, guard);
        }
        Ok(guards)
    }

    /// Write locks on every room, for whole-calendar rebuilds.
    pub(crate) async fn lock_all_rooms(&self) -> Result<RoomGuards, EngineError> {
        let ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
        self.lock_rooms(ids).await
    }

    /// Write the unit of work to the WAL via the group-commit writer.
    async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// WAL-append + apply + notify for one unit of work.
    ///
    /// Nothing is applied unless the whole record is durable, so a failed
    /// commit leaves memory exactly as it was. Callers must hold write guards
    /// on every room the events touch.
    pub(crate) async fn commit(&self, guards: &mut RoomGuards, events: Vec<Event>) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        let _gate = self.commit_gate.read().await;
        self.wal_append(&events).await?;
        for event in &events {
            self.apply(guards, event);
        }
        for event in &events {
            self.notify.publish(event);
        }
        Ok(())
    }

    async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))
    }

    /// Fail WAL appends once `after` more units were buffered (`None` heals).
    #[cfg(test)]
    pub(crate) async fn fail_wal_appends_after(&self, after: Option<usize>) {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::FailAppendsAfter { after, response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Number of units of work appended since the last compaction.
    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.appends_since_compact().await.unwrap_or(0)
    }

    /// Run `f` against a room's state: through the held guard when there is
    /// one, otherwise (replay) through an uncontended write lock.
    fn with_room(&self, guards: &mut RoomGuards, room_id: Ulid, f: impl FnOnce(&mut RoomState)) {
        if let Some(guard) = guards.get_mut(&room_id) {
            f(guard);
            return;
        }
        let Some(rs) = self.get_room_state(&room_id) else {
            tracing::warn!(%room_id, "event references unknown room, skipped");
            return;
        };
        match rs.try_write() {
            Ok(mut guard) => f(&mut guard),
            Err(_) => tracing::error!(%room_id, "room state locked outside a unit of work, event not applied"),
        };
    }

    fn apply(&self, guards: &mut RoomGuards, event: &Event) {
        match event {
            Event::RoomSaved { room } => {
                if self.rooms.contains_key(&room.id) {
                    let room = room.clone();
                    self.with_room(guards, room.id, |rs| rs.room = room);
                } else {
                    self.rooms.insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
                }
            }
            Event::CustomerSaved { customer } => {
                self.customers.insert(customer.id, customer.clone());
            }
            Event::PaymentMethodAdded { method } => {
                self.payment_methods.insert(method.code.clone(), method.clone());
            }
            Event::ReservationSaved { reservation } => {
                self.reservations.insert(reservation.id, reservation.clone());
                self.refresh_payment_fields(reservation.id);
            }
            Event::ReservationCancelled { id, at } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.deleted_at = Some(*at);
                }
            }
            Event::RoomsAllocated {
                reservation_id,
                released_rooms,
                rows,
            } => {
                for room_id in released_rooms {
                    self.with_room(guards, *room_id, |rs| {
                        rs.remove_allocations_for(*reservation_id);
                    });
                }
                let mut holding = Vec::with_capacity(rows.len());
                for row in rows {
                    let row = row.clone();
                    holding.push(row.room_id);
                    self.with_room(guards, row.room_id, |rs| {
                        rs.remove_allocations_for(row.reservation_id);
                        rs.insert_allocation(row);
                    });
                }
                if holding.is_empty() {
                    self.allocation_index.remove(reservation_id);
                } else {
                    self.allocation_index.insert(*reservation_id, holding);
                }
            }
            Event::PaymentRecorded { payment } => {
                {
                    let mut list = self.payments.entry(payment.reservation_id).or_default();
                    list.push(payment.clone());
                }
                self.refresh_payment_fields(payment.reservation_id);
            }
            Event::StayOpened { stay, nights } => {
                let (stay, nights) = (stay.clone(), nights.clone());
                self.stay_index.insert(stay.id, stay.room_id);
                self.with_room(guards, stay.room_id, |rs| {
                    rs.stays.push(stay);
                    rs.nights.extend(nights);
                });
            }
            Event::StayClosed { stay_id, room_id, at } => {
                self.with_room(guards, *room_id, |rs| {
                    if let Some(stay) = rs.stays.iter_mut().find(|s| s.id == *stay_id) {
                        stay.check_out_at = Some(*at);
                    }
                });
            }
            Event::NightsPurged {
                reservation_id,
                room_ids,
            } => {
                for room_id in room_ids {
                    self.with_room(guards, *room_id, |rs| {
                        rs.nights.retain(|n| n.reservation_id != *reservation_id);
                    });
                }
            }
            Event::DailyStatusUpserted { rows } => {
                let mut by_room: BTreeMap<Ulid, Vec<RoomDailyStatus>> = BTreeMap::new();
                for row in rows {
                    by_room.entry(row.room_id).or_default().push(row.clone());
                }
                for (room_id, rows) in by_room {
                    self.with_room(guards, room_id, |rs| {
                        for row in rows {
                            rs.daily.insert(row.date, row);
                        }
                    });
                }
            }
            Event::DailyStatusReleased {
                reservation_id,
                room_ids,
            } => {
                for room_id in room_ids {
                    self.with_room(guards, *room_id, |rs| {
                        rs.daily.retain(|_, row| row.reservation_id != Some(*reservation_id));
                    });
                }
            }
            Event::DailyStatusCleared { room_ids, from, to } => {
                for room_id in room_ids {
                    self.with_room(guards, *room_id, |rs| {
                        rs.daily.retain(|date, _| date < from || date > to);
                    });
                }
            }
        }
    }

    /// Re-derive deposit, balance and status from the recorded payments.
    ///
    /// The payment list entry stays locked while the reservation is written
    /// so concurrent payments cannot interleave a stale total. Lock order is
    /// always payments then reservations.
    fn refresh_payment_fields(&self, reservation_id: Ulid) {
        let list = self.payments.entry(reservation_id).or_default();
        let net: Money = list.iter().map(|p| p.amount).sum();
        if let Some(mut reservation) = self.reservations.get_mut(&reservation_id) {
            reservation.apply_paid_total(net);
        }
        drop(list);
    }
}

/// Split `RES-2024-0042` into `(2024, 42)`.
pub(crate) fn parse_code(code: &str) -> Option<(i32, u32)> {
    let rest = code.strip_prefix("RES-")?;
    let (year, seq) = rest.split_once('-')?;
    Some((year.parse().ok()?, seq.parse().ok()?))
}

pub(crate) fn format_code(year: i32, seq: u32) -> String {
    format!("RES-{year}-{seq:04}")
}

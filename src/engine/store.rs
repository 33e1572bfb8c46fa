use std::collections::HashSet;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("booking already exists: {0}")]
    AlreadyExists(BookingId),
    #[error("booking not found: {0}")]
    Missing(BookingId),
}

/// Persistence for bookings and the postponement relations linking them.
///
/// Multi-record operations (`issue_postponement`, `revert_postponement`) must
/// commit all of their records or none of them.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get(&self, id: BookingId) -> Option<Booking>;
    /// Active, non-moved-out bookings in a room on a day.
    async fn active_by_room_and_day(&self, room_id: RoomId, day: Weekday) -> Vec<Booking>;
    /// Active bookings whose sole instructor is `instructor`.
    async fn active_by_instructor(&self, instructor: InstructorId) -> Vec<Booking>;
    /// Every booking in a room, active or not.
    async fn bookings_in_room(&self, room_id: RoomId) -> Vec<Booking>;
    async fn insert(&self, booking: Booking) -> Result<(), StoreError>;
    async fn update(&self, booking: Booking) -> Result<(), StoreError>;
    async fn delete(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    async fn postponement(&self, id: PostponementId) -> Option<Postponement>;
    async fn postponements(&self) -> Vec<Postponement>;
    /// Postponements whose date lies strictly before `date`, oldest first.
    async fn postponed_before(&self, date: NaiveDate) -> Vec<Postponement>;
    /// Back-link search for a temporary move-in copied from `original_id`.
    async fn temporary_for_original(&self, original_id: BookingId) -> Option<Booking>;
    async fn issue_postponement(
        &self,
        postponement: Postponement,
        original: Booking,
        temporary: Booking,
    ) -> Result<(), StoreError>;
    /// Drop a relation, optionally restoring the original and deleting the temporary.
    async fn revert_postponement(
        &self,
        id: PostponementId,
        restored: Option<Booking>,
        temporary_id: Option<BookingId>,
    ) -> Result<(), StoreError>;
    /// Bookings whose placement names a postponement that no longer exists.
    async fn dangling_placements(&self) -> Vec<Booking>;
}

/// Junction view of multi-instructor assignments.
#[async_trait]
pub trait AssignmentIndex: Send + Sync {
    /// Replace a booking's assignment and display name in one write.
    async fn replace_assignments(
        &self,
        booking_id: BookingId,
        assignment: Option<InstructorAssignment>,
        instructor_name: Option<String>,
    ) -> Result<Booking, StoreError>;
    async fn assignments(&self, booking_id: BookingId) -> Vec<AssignmentRow>;
    /// Active bookings reaching `instructor` through a roster, in any role.
    async fn bookings_for_instructor(&self, instructor: InstructorId) -> Vec<Booking>;
}

/// Rooms and instructors, owned by the administration side of the system.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn room(&self, id: RoomId) -> Option<Room>;
    async fn instructor(&self, id: InstructorId) -> Option<Instructor>;
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, flush once,
/// answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
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
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── In-memory store ──────────────────────────────────────

/// Reference store: `DashMap` tables and indexes, optionally made durable by
/// a write-ahead log. Every mutation is logged before it is applied.
pub struct InMemoryStore {
    bookings: DashMap<BookingId, Booking>,
    by_room: DashMap<RoomId, HashSet<BookingId>>,
    by_instructor: DashMap<InstructorId, HashSet<BookingId>>,
    postponements: DashMap<PostponementId, Postponement>,
    rooms: DashMap<RoomId, Room>,
    instructors: DashMap<InstructorId, Instructor>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Volatile store with no WAL.
    pub fn new() -> Self {
        Self {
            bookings: DashMap::new(),
            by_room: DashMap::new(),
            by_instructor: DashMap::new(),
            postponements: DashMap::new(),
            rooms: DashMap::new(),
            instructors: DashMap::new(),
            wal_tx: None,
        }
    }

    /// Replay the WAL at `path` and keep appending to it. Must be called
    /// inside a tokio runtime: the group-commit writer is spawned here.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut store = Self::new();
        for event in &events {
            store.apply_event(event);
        }
        store.wal_tx = Some(wal_tx);
        tracing::info!(
            "replayed {} events: {} bookings, {} postponements",
            events.len(),
            store.bookings.len(),
            store.postponements.len()
        );
        Ok(store)
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub async fn upsert_room(&self, room: Room) -> Result<(), StoreError> {
        self.persist_and_apply(Event::RoomUpserted(room)).await
    }

    pub async fn upsert_instructor(&self, instructor: Instructor) -> Result<(), StoreError> {
        self.persist_and_apply(Event::InstructorUpserted(instructor)).await
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    async fn persist_and_apply(&self, event: Event) -> Result<(), StoreError> {
        self.wal_append(&event).await?;
        self.apply_event(&event);
        Ok(())
    }

    /// Apply an event to the tables. Relation records are written before the
    /// bookings that point at them and removed after, so a concurrent scan
    /// never sees a booking referencing a relation that is about to exist.
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::RoomUpserted(room) => {
                self.rooms.insert(room.id, room.clone());
            }
            Event::InstructorUpserted(instructor) => {
                self.instructors.insert(instructor.id, instructor.clone());
            }
            Event::BookingInserted(booking) | Event::BookingUpdated(booking) => {
                self.put_booking(booking.clone());
            }
            Event::BookingDeleted { id } => {
                self.remove_booking(id);
            }
            Event::PostponementIssued {
                postponement,
                original,
                temporary,
            } => {
                self.postponements.insert(postponement.id, postponement.clone());
                self.put_booking(original.clone());
                self.put_booking(temporary.clone());
            }
            Event::PostponementReverted {
                id,
                restored,
                temporary_id,
            } => {
                if let Some(original) = restored
                    && self.bookings.contains_key(&original.id)
                {
                    self.put_booking(original.clone());
                }
                if let Some(temporary_id) = temporary_id {
                    self.remove_booking(temporary_id);
                }
                self.postponements.remove(id);
            }
        }
    }

    fn put_booking(&self, booking: Booking) {
        let id = booking.id;
        let indexed = booking.clone();
        if let Some(old) = self.bookings.insert(id, booking) {
            self.unindex(&old);
        }
        self.index(&indexed);
    }

    fn remove_booking(&self, id: &BookingId) -> Option<Booking> {
        let (_, old) = self.bookings.remove(id)?;
        self.unindex(&old);
        Some(old)
    }

    fn index(&self, booking: &Booking) {
        self.by_room.entry(booking.room_id).or_default().insert(booking.id);
        for instructor in booking.instructors() {
            self.by_instructor.entry(*instructor).or_default().insert(booking.id);
        }
    }

    fn unindex(&self, booking: &Booking) {
        if let Some(mut ids) = self.by_room.get_mut(&booking.room_id) {
            ids.remove(&booking.id);
        }
        for instructor in booking.instructors() {
            if let Some(mut ids) = self.by_instructor.get_mut(instructor) {
                ids.remove(&booking.id);
            }
        }
    }

    fn indexed(&self, index: &DashMap<Ulid, HashSet<BookingId>>, key: &Ulid) -> Vec<Booking> {
        let ids: Vec<BookingId> = index
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.bookings.get(id).map(|b| b.value().clone()))
            .collect()
    }

    fn instructor_bookings(&self, instructor: InstructorId) -> Vec<Booking> {
        self.indexed(&self.by_instructor, &instructor)
            .into_iter()
            .filter(|b| b.active && b.involves(instructor))
            .collect()
    }

    // ── Compaction ───────────────────────────────────────────

    /// Minimal event list that recreates the current state.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = Vec::new();
        events.extend(self.rooms.iter().map(|r| Event::RoomUpserted(r.value().clone())));
        events.extend(
            self.instructors
                .iter()
                .map(|i| Event::InstructorUpserted(i.value().clone())),
        );

        let mut paired = HashSet::new();
        for entry in self.postponements.iter() {
            let postponement = entry.value();
            let original = self.bookings.get(&postponement.original_id).map(|b| b.value().clone());
            let temporary = self.bookings.get(&postponement.temporary_id).map(|b| b.value().clone());
            if let (Some(original), Some(temporary)) = (original, temporary) {
                paired.insert(original.id);
                paired.insert(temporary.id);
                events.push(Event::PostponementIssued {
                    postponement: postponement.clone(),
                    original,
                    temporary,
                });
            }
        }

        events.extend(
            self.bookings
                .iter()
                .filter(|b| !paired.contains(b.key()))
                .map(|b| Event::BookingInserted(b.value().clone())),
        );
        events
    }

    /// Rewrite the WAL with the current snapshot. No-op for volatile stores.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let events = self.snapshot_events();
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl BookingStore for InMemoryStore {
    async fn get(&self, id: BookingId) -> Option<Booking> {
        self.bookings.get(&id).map(|b| b.value().clone())
    }

    async fn active_by_room_and_day(&self, room_id: RoomId, day: Weekday) -> Vec<Booking> {
        self.indexed(&self.by_room, &room_id)
            .into_iter()
            .filter(|b| b.room_id == room_id && b.slot.day == day && b.holds_room())
            .collect()
    }

    async fn active_by_instructor(&self, instructor: InstructorId) -> Vec<Booking> {
        self.instructor_bookings(instructor)
            .into_iter()
            .filter(|b| matches!(b.assignment, Some(InstructorAssignment::Sole(_))))
            .collect()
    }

    async fn bookings_in_room(&self, room_id: RoomId) -> Vec<Booking> {
        self.indexed(&self.by_room, &room_id)
            .into_iter()
            .filter(|b| b.room_id == room_id)
            .collect()
    }

    async fn insert(&self, booking: Booking) -> Result<(), StoreError> {
        if self.bookings.contains_key(&booking.id) {
            return Err(StoreError::AlreadyExists(booking.id));
        }
        self.persist_and_apply(Event::BookingInserted(booking)).await
    }

    async fn update(&self, booking: Booking) -> Result<(), StoreError> {
        if !self.bookings.contains_key(&booking.id) {
            return Err(StoreError::Missing(booking.id));
        }
        self.persist_and_apply(Event::BookingUpdated(booking)).await
    }

    async fn delete(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        let Some(existing) = self.get(id).await else {
            return Ok(None);
        };
        self.persist_and_apply(Event::BookingDeleted { id }).await?;
        Ok(Some(existing))
    }

    async fn postponement(&self, id: PostponementId) -> Option<Postponement> {
        self.postponements.get(&id).map(|p| p.value().clone())
    }

    async fn postponements(&self) -> Vec<Postponement> {
        let mut all: Vec<Postponement> = self.postponements.iter().map(|p| p.value().clone()).collect();
        all.sort_by_key(|p| (p.date, p.start));
        all
    }

    async fn postponed_before(&self, date: NaiveDate) -> Vec<Postponement> {
        let mut due: Vec<Postponement> = self
            .postponements
            .iter()
            .filter(|p| p.has_elapsed(date))
            .map(|p| p.value().clone())
            .collect();
        due.sort_by_key(|p| (p.date, p.start));
        due
    }

    async fn temporary_for_original(&self, original_id: BookingId) -> Option<Booking> {
        self.bookings
            .iter()
            .find(|b| {
                matches!(b.placement, Placement::TemporaryMoveIn { original, .. } if original == original_id)
            })
            .map(|b| b.value().clone())
    }

    async fn issue_postponement(
        &self,
        postponement: Postponement,
        original: Booking,
        temporary: Booking,
    ) -> Result<(), StoreError> {
        if !self.bookings.contains_key(&original.id) {
            return Err(StoreError::Missing(original.id));
        }
        if self.bookings.contains_key(&temporary.id) {
            return Err(StoreError::AlreadyExists(temporary.id));
        }
        self.persist_and_apply(Event::PostponementIssued {
            postponement,
            original,
            temporary,
        })
        .await
    }

    async fn revert_postponement(
        &self,
        id: PostponementId,
        restored: Option<Booking>,
        temporary_id: Option<BookingId>,
    ) -> Result<(), StoreError> {
        self.persist_and_apply(Event::PostponementReverted {
            id,
            restored,
            temporary_id,
        })
        .await
    }

    async fn dangling_placements(&self) -> Vec<Booking> {
        self.bookings
            .iter()
            .filter(|b| {
                b.placement
                    .postponement()
                    .is_some_and(|p| !self.postponements.contains_key(&p))
            })
            .map(|b| b.value().clone())
            .collect()
    }
}

#[async_trait]
impl AssignmentIndex for InMemoryStore {
    async fn replace_assignments(
        &self,
        booking_id: BookingId,
        assignment: Option<InstructorAssignment>,
        instructor_name: Option<String>,
    ) -> Result<Booking, StoreError> {
        let mut booking = self.get(booking_id).await.ok_or(StoreError::Missing(booking_id))?;
        booking.assignment = assignment;
        booking.instructor_name = instructor_name;
        self.persist_and_apply(Event::BookingUpdated(booking.clone())).await?;
        Ok(booking)
    }

    async fn assignments(&self, booking_id: BookingId) -> Vec<AssignmentRow> {
        self.bookings
            .get(&booking_id)
            .and_then(|b| b.assignment.as_ref().map(|a| a.junction_rows(booking_id)))
            .unwrap_or_default()
    }

    async fn bookings_for_instructor(&self, instructor: InstructorId) -> Vec<Booking> {
        self.instructor_bookings(instructor)
            .into_iter()
            .filter(|b| matches!(b.assignment, Some(InstructorAssignment::Roster { .. })))
            .collect()
    }
}

#[async_trait]
impl Directory for InMemoryStore {
    async fn room(&self, id: RoomId) -> Option<Room> {
        self.rooms.get(&id).map(|r| r.value().clone())
    }

    async fn instructor(&self, id: InstructorId) -> Option<Instructor> {
        self.instructors.get(&id).map(|i| i.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn booking(room_id: RoomId, day: Weekday, assignment: Option<InstructorAssignment>) -> Booking {
        Booking {
            id: Ulid::new(),
            room_id,
            department_id: Ulid::new(),
            slot: Slot::new(day, t("08:00"), t("09:00")).unwrap(),
            study_type: StudyType::Morning,
            stage: AcademicStage::First,
            cohort: Cohort::Theoretical { section: None },
            subject: "Calculus".into(),
            notes: None,
            assignment,
            instructor_name: None,
            active: true,
            placement: Placement::Regular,
        }
    }

    #[tokio::test]
    async fn room_index_follows_updates() {
        let store = InMemoryStore::new();
        let r1 = Ulid::new();
        let r2 = Ulid::new();
        let mut b = booking(r1, Weekday::Monday, None);
        store.insert(b.clone()).await.unwrap();
        assert_eq!(store.active_by_room_and_day(r1, Weekday::Monday).await.len(), 1);
        assert!(store.active_by_room_and_day(r1, Weekday::Tuesday).await.is_empty());

        b.room_id = r2;
        store.update(b.clone()).await.unwrap();
        assert!(store.active_by_room_and_day(r1, Weekday::Monday).await.is_empty());
        assert_eq!(store.active_by_room_and_day(r2, Weekday::Monday).await.len(), 1);
    }

    #[tokio::test]
    async fn inactive_and_moved_out_do_not_hold_the_room() {
        let store = InMemoryStore::new();
        let room = Ulid::new();
        let mut inactive = booking(room, Weekday::Monday, None);
        inactive.active = false;
        let mut moved = booking(room, Weekday::Monday, None);
        moved.placement = Placement::MovedOut {
            postponement: Ulid::new(),
        };
        store.insert(inactive).await.unwrap();
        store.insert(moved).await.unwrap();

        assert!(store.active_by_room_and_day(room, Weekday::Monday).await.is_empty());
        assert_eq!(store.bookings_in_room(room).await.len(), 2);
    }

    #[tokio::test]
    async fn instructor_lookups_split_by_assignment_variant() {
        let store = InMemoryStore::new();
        let d1 = Ulid::new();
        let d2 = Ulid::new();
        let sole = booking(Ulid::new(), Weekday::Monday, Some(InstructorAssignment::Sole(d1)));
        let roster = booking(
            Ulid::new(),
            Weekday::Monday,
            Some(InstructorAssignment::roster(vec![d2, d1], Some(d2)).unwrap()),
        );
        store.insert(sole.clone()).await.unwrap();
        store.insert(roster.clone()).await.unwrap();

        let legacy = store.active_by_instructor(d1).await;
        assert_eq!(legacy.len(), 1);
        assert_eq!(legacy[0].id, sole.id);

        let junction = store.bookings_for_instructor(d1).await;
        assert_eq!(junction.len(), 1);
        assert_eq!(junction[0].id, roster.id);

        let rows = store.assignments(roster.id).await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.instructor_id == d2 && r.is_primary));
        assert!(store.assignments(sole.id).await.is_empty());
    }

    #[tokio::test]
    async fn replace_assignments_reindexes() {
        let store = InMemoryStore::new();
        let d1 = Ulid::new();
        let d2 = Ulid::new();
        let b = booking(Ulid::new(), Weekday::Monday, Some(InstructorAssignment::Sole(d1)));
        store.insert(b.clone()).await.unwrap();

        let updated = store
            .replace_assignments(b.id, Some(InstructorAssignment::Sole(d2)), Some("D2".into()))
            .await
            .unwrap();
        assert_eq!(updated.instructor_name.as_deref(), Some("D2"));
        assert!(store.active_by_instructor(d1).await.is_empty());
        assert_eq!(store.active_by_instructor(d2).await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_and_missing_update_rejected() {
        let store = InMemoryStore::new();
        let b = booking(Ulid::new(), Weekday::Monday, None);
        store.insert(b.clone()).await.unwrap();
        assert!(matches!(store.insert(b.clone()).await, Err(StoreError::AlreadyExists(_))));

        let stranger = booking(Ulid::new(), Weekday::Monday, None);
        assert!(matches!(store.update(stranger).await, Err(StoreError::Missing(_))));
        assert!(store.delete(Ulid::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dangling_placements_found() {
        let store = InMemoryStore::new();
        let original = Ulid::new();
        let mut orphan = booking(Ulid::new(), Weekday::Monday, None);
        orphan.placement = Placement::TemporaryMoveIn {
            postponement: Ulid::new(),
            original,
        };
        store.insert(orphan.clone()).await.unwrap();
        store.insert(booking(Ulid::new(), Weekday::Monday, None)).await.unwrap();

        let dangling = store.dangling_placements().await;
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].id, orphan.id);
        let found = store.temporary_for_original(original).await.unwrap();
        assert_eq!(found.id, orphan.id);
    }
}

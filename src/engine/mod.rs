mod conflict;
mod error;
mod locks;
mod mutations;
mod postpone;
mod queries;
mod reconcile;
mod store;
mod validate;

pub use conflict::{Candidate, ConflictScope};
pub use error::EngineError;
pub use locks::{LockKey, LockSet, LockTable};
pub use postpone::PostponementOutcome;
pub use queries::free_windows;
pub use reconcile::ReconcileReport;
pub use store::{AssignmentIndex, BookingStore, Directory, InMemoryStore, StoreError};
pub use validate::{
    BookingDraft, BookingRequest, InstructorSelection, PostponeDraft, PostponeRequest, cohort,
};

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::model::*;
use crate::notice::{Notice, NoticeSink};

/// The scheduling core. Holds no timetable state of its own: every read and
/// write goes through the injected store handles, and the lock table makes
/// each check-then-commit sequence atomic with respect to other callers.
pub struct Engine {
    bookings: Arc<dyn BookingStore>,
    assignments: Arc<dyn AssignmentIndex>,
    directory: Arc<dyn Directory>,
    notices: Arc<dyn NoticeSink>,
    locks: LockTable,
}

impl Engine {
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        assignments: Arc<dyn AssignmentIndex>,
        directory: Arc<dyn Directory>,
        notices: Arc<dyn NoticeSink>,
    ) -> Self {
        Self {
            bookings,
            assignments,
            directory,
            notices,
            locks: LockTable::new(),
        }
    }

    /// Engine over a single store serving all three roles.
    pub fn with_store(store: Arc<InMemoryStore>, notices: Arc<dyn NoticeSink>) -> Self {
        Self::new(store.clone(), store.clone(), store, notices)
    }

    async fn load(&self, id: BookingId) -> Result<Booking, EngineError> {
        self.bookings
            .get(id)
            .await
            .ok_or(EngineError::booking_not_found(id))
    }

    /// Lock everything a change to booking `id` must hold: its current room,
    /// both rooms of a postponement it belongs to, and whatever `extra` adds.
    /// The booking is reloaded under the locks and returned; if it moved in
    /// the meantime, the locks are released and taken again.
    async fn lock_booking(
        &self,
        id: BookingId,
        extra: impl Fn(&Booking) -> Vec<LockKey>,
    ) -> Result<(LockSet, Booking), EngineError> {
        let mut seen = self.load(id).await?;
        loop {
            let locks = self.locks.acquire(self.booking_keys(&seen, &extra).await).await;
            let current = self.load(id).await?;
            if locks.covers(&self.booking_keys(&current, &extra).await) {
                return Ok((locks, current));
            }
            debug!("booking {id} changed rooms while locking, retrying");
            drop(locks);
            seen = current;
        }
    }

    async fn booking_keys(
        &self,
        booking: &Booking,
        extra: &impl Fn(&Booking) -> Vec<LockKey>,
    ) -> Vec<LockKey> {
        let mut keys = extra(booking);
        keys.push(LockKey::Room(booking.room_id));
        if let Some(pid) = booking.placement.postponement()
            && let Some(p) = self.bookings.postponement(pid).await
        {
            keys.extend([LockKey::Room(p.origin.room_id), LockKey::Room(p.room_id)]);
        }
        keys
    }

    /// A room that exists and accepts bookings.
    async fn usable_room(&self, id: RoomId) -> Result<Room, EngineError> {
        let room = self
            .directory
            .room(id)
            .await
            .ok_or(EngineError::NotFound { kind: "room", id })?;
        if !room.active {
            return Err(EngineError::RoomUnavailable(id));
        }
        Ok(room)
    }

    async fn room_name(&self, id: RoomId) -> String {
        match self.directory.room(id).await {
            Some(room) => room.name,
            None => id.to_string(),
        }
    }

    /// Check every assigned instructor exists and derive the display name.
    async fn instructor_name(
        &self,
        assignment: Option<&InstructorAssignment>,
    ) -> Result<Option<String>, EngineError> {
        let Some(assignment) = assignment else {
            return Ok(None);
        };
        let mut names = HashMap::new();
        for id in assignment.instructors() {
            let instructor = self
                .directory
                .instructor(*id)
                .await
                .ok_or(EngineError::NotFound { kind: "instructor", id: *id })?;
            names.insert(*id, instructor.name);
        }
        Ok(Some(display_name(assignment, |id| names.get(&id).cloned())))
    }

    /// Best-effort delivery; failures never undo the change being announced.
    fn emit_notice(&self, notice: Notice) {
        let title = notice.title.clone();
        if let Err(e) = self.notices.emit(notice) {
            warn!("notice {title:?} not delivered: {e}");
            metrics::counter!(crate::observability::NOTICE_FAILURES_TOTAL).increment(1);
        }
    }
}

/// Display name for an assignment: the primary instructor's name, or for a
/// roster whose primary cannot be resolved, a fixed placeholder.
pub fn display_name(
    assignment: &InstructorAssignment,
    name_of: impl Fn(InstructorId) -> Option<String>,
) -> String {
    match assignment {
        InstructorAssignment::Sole(id) => name_of(*id).unwrap_or_else(|| id.to_string()),
        InstructorAssignment::Roster { primary, .. } => {
            name_of(*primary).unwrap_or_else(|| MULTIPLE_INSTRUCTORS.to_string())
        }
    }
}

fn lock_keys(rooms: &[RoomId], instructors: &[InstructorId]) -> Vec<LockKey> {
    rooms
        .iter()
        .map(|id| LockKey::Room(*id))
        .chain(instructors.iter().map(|id| LockKey::Instructor(*id)))
        .collect()
}

/// Bookings in an in-flight postponement change only through the pair operations.
fn ensure_regular(booking: &Booking) -> Result<(), EngineError> {
    if booking.placement != Placement::Regular {
        return Err(EngineError::InvalidState {
            id: booking.id,
            reason: "booking is part of an in-flight postponement",
        });
    }
    Ok(())
}

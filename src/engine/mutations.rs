use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::conflict::Candidate;
use super::validate::{BookingRequest, InstructorSelection};
use super::{Engine, EngineError, ensure_regular, lock_keys};

impl Engine {
    /// Validate, conflict-check and insert a new lecture.
    pub async fn create_booking(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let draft = request.validate()?;
        let room = self.usable_room(draft.room_id).await?;
        let instructor_name = self.instructor_name(draft.assignment.as_ref()).await?;

        let booking = Booking {
            id: Ulid::new(),
            room_id: room.id,
            department_id: draft.department_id.unwrap_or(room.department_id),
            slot: draft.slot,
            study_type: draft.study_type,
            stage: draft.stage,
            cohort: draft.cohort,
            subject: draft.subject,
            notes: draft.notes,
            assignment: draft.assignment,
            instructor_name,
            active: true,
            placement: Placement::Regular,
        };

        let _locks = self
            .locks
            .acquire(lock_keys(&[booking.room_id], booking.instructors()))
            .await;
        self.ensure_clear(&Candidate::of(&booking), booking.instructors(), None)
            .await?;
        self.bookings.insert(booking.clone()).await?;

        metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
        info!("booked {} {:?} at {} in room {}", booking.id, booking.subject, booking.slot, booking.room_id);
        Ok(booking)
    }

    /// Replace every field of a booking. The booking never conflicts with its
    /// own previous state.
    pub async fn update_booking(
        &self,
        id: BookingId,
        request: BookingRequest,
    ) -> Result<Booking, EngineError> {
        let draft = request.validate()?;
        let room = self.usable_room(draft.room_id).await?;
        let instructor_name = self.instructor_name(draft.assignment.as_ref()).await?;
        let instructors: Vec<InstructorId> = draft
            .assignment
            .as_ref()
            .map(|a| a.instructors().to_vec())
            .unwrap_or_default();

        // Holds the current room as well as the destination.
        let (_locks, current) = self
            .lock_booking(id, |_| lock_keys(&[room.id], &instructors))
            .await?;
        ensure_regular(&current)?;

        let updated = Booking {
            id,
            room_id: room.id,
            department_id: draft.department_id.unwrap_or(current.department_id),
            slot: draft.slot,
            study_type: draft.study_type,
            stage: draft.stage,
            cohort: draft.cohort,
            subject: draft.subject,
            notes: draft.notes,
            assignment: draft.assignment,
            instructor_name,
            active: current.active,
            placement: Placement::Regular,
        };
        if updated.active {
            self.ensure_clear(&Candidate::of(&updated), &instructors, Some(id))
                .await?;
        }
        self.bookings.update(updated.clone()).await?;

        metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
        info!("updated {id} to {} in room {}", updated.slot, updated.room_id);
        Ok(updated)
    }

    /// Replace the instructor assignment wholesale and refresh the display name.
    pub async fn assign_instructors(
        &self,
        id: BookingId,
        selection: InstructorSelection,
    ) -> Result<Booking, EngineError> {
        let assignment = selection.into_assignment()?;
        let instructor_name = self.instructor_name(assignment.as_ref()).await?;
        let instructors: Vec<InstructorId> = assignment
            .as_ref()
            .map(|a| a.instructors().to_vec())
            .unwrap_or_default();

        let (_locks, current) = self
            .lock_booking(id, |_| lock_keys(&[], &instructors))
            .await?;
        ensure_regular(&current)?;

        if current.active {
            self.ensure_clear(&Candidate::of(&current), &instructors, Some(id))
                .await?;
        }
        let updated = self
            .assignments
            .replace_assignments(id, assignment, instructor_name)
            .await?;
        info!("reassigned {id} to {:?}", updated.instructor_name);
        Ok(updated)
    }

    /// Deactivation always succeeds; reactivation is checked like a new booking.
    pub async fn set_active(&self, id: BookingId, active: bool) -> Result<Booking, EngineError> {
        let (_locks, mut booking) = self
            .lock_booking(id, |b| lock_keys(&[], b.instructors()))
            .await?;
        if booking.active == active {
            return Ok(booking);
        }
        ensure_regular(&booking)?;

        booking.active = active;
        if active {
            self.ensure_clear(&Candidate::of(&booking), booking.instructors(), Some(id))
                .await?;
        }
        self.bookings.update(booking.clone()).await?;
        info!("booking {id} active={active}");
        Ok(booking)
    }

    /// Hard-delete a booking. A booking in an in-flight postponement has its
    /// pair dissolved first, so no half is left behind.
    pub async fn delete_booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        let (_locks, booking) = self.lock_booking(id, |_| Vec::new()).await?;
        if let Some(pid) = booking.placement.postponement()
            && let Some(p) = self.bookings.postponement(pid).await
        {
            self.dissolve(&p).await?;
        }
        // Dissolving the pair already removed a temporary half.
        if self.bookings.get(id).await.is_some() {
            self.bookings.delete(id).await?;
        }
        info!("deleted booking {id}");
        Ok(booking)
    }

    /// Delete every booking in a room, as done when the room itself is removed.
    pub async fn delete_room_bookings(&self, room_id: RoomId) -> Result<usize, EngineError> {
        let mut deleted = 0;
        for booking in self.bookings.bookings_in_room(room_id).await {
            match self.delete_booking(booking.id).await {
                Ok(_) => deleted += 1,
                // Dissolving an earlier pair may already have removed it.
                Err(EngineError::NotFound { .. }) => {
                    debug!("booking {} already gone", booking.id);
                }
                Err(e) => return Err(e),
            }
        }
        info!("deleted {deleted} bookings from room {room_id}");
        Ok(deleted)
    }
}

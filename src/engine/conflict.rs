use std::collections::HashMap;
use std::fmt;

use crate::model::*;

use super::{Engine, EngineError};

/// Which bookings a candidate is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictScope {
    /// Bookings of the same study type holding the candidate's room.
    Room,
    /// Every active booking the instructor teaches, in any room.
    Instructor(InstructorId),
}

impl ConflictScope {
    pub fn label(&self) -> &'static str {
        match self {
            ConflictScope::Room => "room",
            ConflictScope::Instructor(_) => "instructor",
        }
    }
}

impl fmt::Display for ConflictScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictScope::Room => f.write_str("room"),
            ConflictScope::Instructor(id) => write!(f, "instructor {id}"),
        }
    }
}

/// The placement being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub room_id: RoomId,
    pub slot: Slot,
    pub study_type: StudyType,
}

impl Candidate {
    pub fn of(booking: &Booking) -> Self {
        Self {
            room_id: booking.room_id,
            slot: booking.slot,
            study_type: booking.study_type,
        }
    }
}

/// Room-scope filter over bookings already known to hold the room.
pub(crate) fn room_conflicts(
    candidate: &Candidate,
    occupants: impl IntoIterator<Item = Booking>,
    exclude: Option<BookingId>,
) -> Vec<Booking> {
    let mut hits: Vec<Booking> = occupants
        .into_iter()
        .filter(|b| Some(b.id) != exclude)
        .filter(|b| b.room_id == candidate.room_id && b.holds_room())
        .filter(|b| b.study_type == candidate.study_type)
        .filter(|b| b.slot.overlaps(&candidate.slot))
        .collect();
    hits.sort_by_key(|b| (b.slot.start, b.id));
    hits
}

/// Instructor-scope filter. Study type and room are irrelevant: one person
/// cannot teach two overlapping lectures anywhere.
pub(crate) fn instructor_conflicts(
    candidate: &Candidate,
    instructor: InstructorId,
    taught: impl IntoIterator<Item = Booking>,
    exclude: Option<BookingId>,
) -> Vec<Booking> {
    // Legacy and roster lookups may both return the same booking.
    let unique: HashMap<BookingId, Booking> = taught.into_iter().map(|b| (b.id, b)).collect();
    let mut hits: Vec<Booking> = unique
        .into_values()
        .filter(|b| Some(b.id) != exclude)
        .filter(|b| b.active && b.involves(instructor))
        .filter(|b| b.slot.overlaps(&candidate.slot))
        .collect();
    hits.sort_by_key(|b| (b.slot.start, b.id));
    hits
}

impl Engine {
    /// Every booking the candidate would collide with in `scope`. Read-only.
    pub async fn find_conflicts(
        &self,
        candidate: &Candidate,
        scope: ConflictScope,
        exclude: Option<BookingId>,
    ) -> Vec<Booking> {
        match scope {
            ConflictScope::Room => {
                let occupants = self
                    .bookings
                    .active_by_room_and_day(candidate.room_id, candidate.slot.day)
                    .await;
                room_conflicts(candidate, occupants, exclude)
            }
            ConflictScope::Instructor(instructor) => {
                let mut taught = self.bookings.active_by_instructor(instructor).await;
                taught.extend(self.assignments.bookings_for_instructor(instructor).await);
                instructor_conflicts(candidate, instructor, taught, exclude)
            }
        }
    }

    /// Fail with the conflicting bookings of the first scope that has any.
    /// Room scope is checked first, then each instructor in order.
    pub(super) async fn ensure_clear(
        &self,
        candidate: &Candidate,
        instructors: &[InstructorId],
        exclude: Option<BookingId>,
    ) -> Result<(), EngineError> {
        let scopes = std::iter::once(ConflictScope::Room)
            .chain(instructors.iter().map(|id| ConflictScope::Instructor(*id)));
        for scope in scopes {
            let conflicts = self.find_conflicts(candidate, scope, exclude).await;
            if !conflicts.is_empty() {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL, "scope" => scope.label())
                    .increment(1);
                return Err(EngineError::Conflict { scope, conflicts });
            }
        }
        Ok(())
    }
}

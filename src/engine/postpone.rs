use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notice::{Notice, NoticeScope};

use super::conflict::{Candidate, ConflictScope};
use super::locks::LockKey;
use super::validate::PostponeRequest;
use super::{Engine, EngineError};

/// Result of a successful postponement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostponementOutcome {
    pub postponement: Postponement,
    /// The original, now moved out of its room.
    pub original: Booking,
    /// The temporary copy occupying the target room.
    pub temporary: Booking,
}

fn check_postponable(booking: &Booking) -> Result<(), EngineError> {
    let reason = match booking.placement {
        Placement::TemporaryMoveIn { .. } => "a temporary move-in cannot be postponed",
        Placement::MovedOut { .. } => "booking is already postponed",
        Placement::Regular if !booking.active => "inactive bookings cannot be postponed",
        Placement::Regular => return Ok(()),
    };
    Err(EngineError::InvalidState {
        id: booking.id,
        reason,
    })
}

impl Engine {
    /// Move one lecture to another room and time for a single date. The
    /// original is flagged moved out and a temporary copy takes the target
    /// slot; both halves and the relation commit together.
    pub async fn postpone(
        &self,
        original_id: BookingId,
        request: PostponeRequest,
    ) -> Result<PostponementOutcome, EngineError> {
        let draft = request.validate()?;
        let original = self.load(original_id).await?;
        check_postponable(&original)?;
        let target = self.usable_room(draft.room_id).await?;

        let (locks, original) = self
            .lock_booking(original_id, |_| vec![LockKey::Room(target.id)])
            .await?;
        check_postponable(&original)?;

        let candidate = Candidate {
            room_id: target.id,
            slot: draft.slot,
            study_type: original.study_type,
        };
        let conflicts = self
            .find_conflicts(&candidate, ConflictScope::Room, Some(original.id))
            .await;
        if !conflicts.is_empty() {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL, "scope" => "room").increment(1);
            return Err(EngineError::Conflict {
                scope: ConflictScope::Room,
                conflicts,
            });
        }
        // Instructor scope does not block a postponement; clashes are only logged.
        for instructor in original.instructors() {
            let busy = self
                .find_conflicts(&candidate, ConflictScope::Instructor(*instructor), Some(original.id))
                .await;
            if let Some(first) = busy.first() {
                warn!(
                    "postponing {} double-books instructor {instructor}: {} also runs {} in room {}",
                    original.id, first.id, first.slot, first.room_id
                );
            }
        }

        let pid = Ulid::new();
        let temporary = Booking {
            id: Ulid::new(),
            room_id: target.id,
            slot: draft.slot,
            active: true,
            placement: Placement::TemporaryMoveIn {
                postponement: pid,
                original: original.id,
            },
            ..original.clone()
        };
        let postponement = Postponement {
            id: pid,
            original_id: original.id,
            temporary_id: temporary.id,
            date: draft.date,
            room_id: target.id,
            start: draft.slot.start,
            end: draft.slot.end,
            reason: draft.reason,
            origin: OriginSnapshot {
                room_id: original.room_id,
                slot: original.slot,
            },
        };
        let moved = Booking {
            placement: Placement::MovedOut { postponement: pid },
            ..original
        };
        self.bookings
            .issue_postponement(postponement.clone(), moved.clone(), temporary.clone())
            .await?;
        drop(locks);

        metrics::counter!(crate::observability::POSTPONEMENTS_ISSUED_TOTAL).increment(1);
        info!(
            "postponed {} to room {} on {} {}-{}",
            moved.id, target.id, postponement.date, postponement.start, postponement.end
        );

        let origin_room = self.room_name(moved.room_id).await;
        self.emit_notice(Notice {
            title: format!("Lecture moved: {}", moved.subject),
            body: postponed_body(&moved, &postponement, &origin_room, &target.name),
            scope: NoticeScope::Department(moved.department_id),
            booking_id: Some(moved.id),
        });

        Ok(PostponementOutcome {
            postponement,
            original: moved,
            temporary,
        })
    }

    /// Undo an in-flight postponement ahead of its date. Either half of the
    /// pair may be named. Returns the restored original.
    pub async fn cancel_postponement(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let booking = self.load(booking_id).await?;
        let Some(pid) = booking.placement.postponement() else {
            return Err(EngineError::InvalidState {
                id: booking_id,
                reason: "booking is not part of a postponement",
            });
        };
        if self.bookings.postponement(pid).await.is_none() {
            self.repair_dangling(booking_id).await?;
            return Err(EngineError::Inconsistency {
                id: pid,
                detail: format!("relation missing for booking {booking_id}; placement repaired"),
            });
        }

        let (_locks, booking) = self.lock_booking(booking_id, |_| Vec::new()).await?;
        let relation = match booking.placement.postponement() {
            Some(pid) => self.bookings.postponement(pid).await,
            None => None,
        };
        let Some(p) = relation else {
            return Err(EngineError::InvalidState {
                id: booking_id,
                reason: "postponement was already reverted",
            });
        };
        let restored = self.dissolve(&p).await?.ok_or_else(|| EngineError::Inconsistency {
            id: p.id,
            detail: format!("original {} could not be restored", p.original_id),
        })?;

        info!("cancelled postponement {} of {}", p.id, p.original_id);
        self.emit_notice(Notice {
            title: format!("Lecture move cancelled: {}", restored.subject),
            body: format!(
                "{} returns to its usual slot, {}, on {}.",
                restored.subject, restored.slot, p.date
            ),
            scope: NoticeScope::Department(restored.department_id),
            booking_id: Some(restored.id),
        });
        Ok(restored)
    }
}

fn postponed_body(
    original: &Booking,
    postponement: &Postponement,
    origin_room: &str,
    target_room: &str,
) -> String {
    let mut body = format!(
        "{} (usually {} in {}) takes place in {} on {}, {} from {} to {}.",
        original.subject,
        original.slot,
        origin_room,
        target_room,
        postponement.date,
        Weekday::of(postponement.date),
        postponement.start,
        postponement.end,
    );
    if let Some(reason) = &postponement.reason {
        body.push_str(" Reason: ");
        body.push_str(reason);
    }
    body
}

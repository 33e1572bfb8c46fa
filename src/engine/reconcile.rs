use std::time::Instant;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::model::*;
use crate::observability::{
    RECONCILE_DURATION_SECONDS, RECONCILE_FAILURES_TOTAL, RECONCILE_REPAIRED_TOTAL,
    RECONCILE_REVERTED_TOTAL,
};

use super::conflict::{Candidate, ConflictScope};
use super::locks::LockKey;
use super::{Engine, EngineError};

/// Tally of one reconciliation sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Elapsed postponements whose pair was dissolved.
    pub reverted: usize,
    /// Dangling halves repaired after their relation vanished.
    pub repaired: usize,
    /// Candidates already handled by a concurrent caller.
    pub skipped: usize,
    /// Records that could not be processed; retried on the next sweep.
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

impl Engine {
    /// Revert every postponement whose date lies before `as_of`, then heal
    /// bookings left pointing at a relation that no longer exists. Safe to
    /// run repeatedly and concurrently; a failure on one record never stops
    /// the sweep.
    pub async fn reconcile(&self, as_of: NaiveDate) -> ReconcileReport {
        let started = Instant::now();
        let mut report = ReconcileReport::default();

        for p in self.bookings.postponed_before(as_of).await {
            match self.revert_elapsed(p.id, as_of).await {
                Ok(true) => report.reverted += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!("reverting postponement {} failed: {e}", p.id);
                    report.failed += 1;
                }
            }
        }

        for booking in self.bookings.dangling_placements().await {
            match self.repair_dangling(booking.id).await {
                Ok(true) => report.repaired += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!("repairing booking {} failed: {e}", booking.id);
                    report.failed += 1;
                }
            }
        }

        metrics::counter!(RECONCILE_REVERTED_TOTAL).increment(report.reverted as u64);
        metrics::counter!(RECONCILE_REPAIRED_TOTAL).increment(report.repaired as u64);
        metrics::counter!(RECONCILE_FAILURES_TOTAL).increment(report.failed as u64);
        metrics::histogram!(RECONCILE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        info!(
            "reconciled as of {as_of}: {} reverted, {} repaired, {} skipped, {} failed",
            report.reverted, report.repaired, report.skipped, report.failed
        );
        report
    }

    async fn revert_elapsed(&self, id: PostponementId, as_of: NaiveDate) -> Result<bool, EngineError> {
        let Some(p) = self.bookings.postponement(id).await else {
            return Ok(false);
        };
        let _locks = self
            .locks
            .acquire([LockKey::Room(p.origin.room_id), LockKey::Room(p.room_id)])
            .await;
        // Another sweep may have got here first.
        let Some(p) = self.bookings.postponement(id).await else {
            debug!("postponement {id} already reverted");
            return Ok(false);
        };
        if !p.has_elapsed(as_of) {
            return Ok(false);
        }
        self.dissolve(&p).await?;
        info!("reverted postponement {} of {} dated {}", p.id, p.original_id, p.date);
        Ok(true)
    }

    /// Dissolve a pair in one store write: restore the original, delete the
    /// temporary, drop the relation. Missing halves are logged and skipped.
    /// Callers hold the locks of both rooms.
    pub(super) async fn dissolve(&self, p: &Postponement) -> Result<Option<Booking>, EngineError> {
        let restored = match self.bookings.get(p.original_id).await {
            Some(original) if original.placement == (Placement::MovedOut { postponement: p.id }) => {
                Some(self.restore_original(original).await)
            }
            Some(original) => {
                warn!(
                    "postponement {}: original {} no longer points at it ({:?})",
                    p.id, original.id, original.placement
                );
                None
            }
            None => {
                warn!("postponement {}: original {} is missing", p.id, p.original_id);
                None
            }
        };

        let temporary_id = self.locate_temporary(p).await;
        if temporary_id.is_none() {
            warn!("postponement {}: temporary half is missing", p.id);
        }

        self.bookings
            .revert_postponement(p.id, restored.clone(), temporary_id)
            .await?;
        Ok(restored)
    }

    /// The original back in its weekly slot. Its slot was free for others
    /// while it was moved out; if someone took it, it comes back inactive.
    async fn restore_original(&self, mut original: Booking) -> Booking {
        original.placement = Placement::Regular;
        if original.active {
            let taken = self
                .find_conflicts(&Candidate::of(&original), ConflictScope::Room, Some(original.id))
                .await;
            if let Some(first) = taken.first() {
                warn!(
                    "booking {} restored inactive: its slot is now held by {}",
                    original.id, first.id
                );
                original.active = false;
            }
        }
        original
    }

    /// Forward link first, then the temporary's own back-link.
    async fn locate_temporary(&self, p: &Postponement) -> Option<BookingId> {
        let owned_by = |b: &Booking| b.placement.postponement() == Some(p.id) && b.is_temporary_move_in();
        if let Some(temporary) = self.bookings.get(p.temporary_id).await
            && owned_by(&temporary)
        {
            return Some(temporary.id);
        }
        let fallback = self
            .bookings
            .temporary_for_original(p.original_id)
            .await
            .filter(|b| owned_by(b))?;
        warn!("postponement {}: forward link lost, found temporary {} by back-link", p.id, fallback.id);
        Some(fallback.id)
    }

    /// Heal one booking whose placement names a vanished relation: a moved-out
    /// original returns to regular, a temporary copy is deleted.
    pub(super) async fn repair_dangling(&self, id: BookingId) -> Result<bool, EngineError> {
        let Some(booking) = self.bookings.get(id).await else {
            return Ok(false);
        };
        let _locks = self.locks.acquire([LockKey::Room(booking.room_id)]).await;
        let Some(booking) = self.bookings.get(id).await else {
            return Ok(false);
        };
        let Some(pid) = booking.placement.postponement() else {
            return Ok(false);
        };
        if self.bookings.postponement(pid).await.is_some() {
            return Ok(false);
        }

        if booking.is_temporary_move_in() {
            self.bookings.delete(id).await?;
            warn!("deleted temporary booking {id} left behind by postponement {pid}");
        } else {
            let restored = self.restore_original(booking).await;
            self.bookings.update(restored).await?;
            warn!("restored booking {id} left moved out by postponement {pid}");
        }
        Ok(true)
    }
}

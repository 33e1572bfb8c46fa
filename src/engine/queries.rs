use std::collections::HashMap;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        self.load(id).await
    }

    /// Every booking placed in a room, moved-out and inactive ones included,
    /// ordered by day then start time.
    pub async fn room_timetable(&self, room_id: RoomId, day: Option<Weekday>) -> Vec<Booking> {
        let mut bookings: Vec<Booking> = self
            .bookings
            .bookings_in_room(room_id)
            .await
            .into_iter()
            .filter(|b| day.is_none_or(|d| b.slot.day == d))
            .collect();
        bookings.sort_by_key(|b| (b.slot.day, b.slot.start, b.id));
        bookings
    }

    /// Active bookings an instructor teaches, whether as sole instructor or
    /// roster member.
    pub async fn instructor_timetable(&self, instructor: InstructorId) -> Vec<Booking> {
        let mut taught = self.bookings.active_by_instructor(instructor).await;
        taught.extend(self.assignments.bookings_for_instructor(instructor).await);
        let unique: HashMap<BookingId, Booking> = taught.into_iter().map(|b| (b.id, b)).collect();
        let mut bookings: Vec<Booking> = unique.into_values().collect();
        bookings.sort_by_key(|b| (b.slot.day, b.slot.start, b.id));
        bookings
    }

    /// Junction rows of a multi-instructor booking. Empty for sole or
    /// unassigned bookings.
    pub async fn assignments(&self, booking_id: BookingId) -> Result<Vec<AssignmentRow>, EngineError> {
        self.load(booking_id).await?;
        Ok(self.assignments.assignments(booking_id).await)
    }

    /// The relation a booking belongs to, if any.
    pub async fn postponement_for(&self, booking_id: BookingId) -> Result<Option<Postponement>, EngineError> {
        let booking = self.load(booking_id).await?;
        Ok(match booking.placement.postponement() {
            Some(pid) => self.bookings.postponement(pid).await,
            None => None,
        })
    }

    pub async fn active_postponements(&self) -> Vec<Postponement> {
        self.bookings.postponements().await
    }

    /// Windows of `day` in which a booking of `study_type` fits in the room.
    pub async fn room_free_windows(
        &self,
        room_id: RoomId,
        day: Weekday,
        study_type: StudyType,
    ) -> Result<Vec<Slot>, EngineError> {
        self.directory
            .room(room_id)
            .await
            .ok_or(EngineError::NotFound { kind: "room", id: room_id })?;
        let occupied: Vec<Slot> = self
            .bookings
            .active_by_room_and_day(room_id, day)
            .await
            .into_iter()
            .filter(|b| b.holds_room() && b.study_type == study_type)
            .map(|b| b.slot)
            .collect();
        Ok(free_windows(day, &occupied))
    }
}

type Span = (TimeOfDay, TimeOfDay);

/// Complement of the occupied slots within one day. Back-to-back bookings
/// leave no gap between them.
pub fn free_windows(day: Weekday, occupied: &[Slot]) -> Vec<Slot> {
    let mut busy: Vec<Span> = occupied
        .iter()
        .filter(|s| s.day == day)
        .map(|s| (s.start, s.end))
        .collect();
    busy.sort();
    let busy = merge_overlapping(&busy);

    subtract_intervals(&[(TimeOfDay::MIDNIGHT, TimeOfDay::END_OF_DAY)], &busy)
        .into_iter()
        .map(|(start, end)| Slot { day, start, end })
        .collect()
}

/// Merge sorted overlapping or touching spans into disjoint spans.
fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.0 <= last.1
        {
            last.1 = last.1.max(span.1);
            continue;
        }
        merged.push(span);
    }
    merged
}

fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &(start, end) in base {
        let mut current = start;
        while ri < to_remove.len() && to_remove[ri].1 <= current {
            ri += 1;
        }
        let mut j = ri;
        while j < to_remove.len() && to_remove[j].0 < end {
            let (r_start, r_end) = to_remove[j];
            if r_start > current {
                result.push((current, r_start));
            }
            current = current.max(r_end);
            j += 1;
        }
        if current < end {
            result.push((current, end));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(start: &str, end: &str) -> Slot {
        Slot::new(Weekday::Monday, start.parse().unwrap(), end.parse().unwrap()).unwrap()
    }

    #[test]
    fn empty_day_is_one_window() {
        let free = free_windows(Weekday::Monday, &[]);
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].start, TimeOfDay::MIDNIGHT);
        assert_eq!(free[0].end, TimeOfDay::END_OF_DAY);
    }

    #[test]
    fn back_to_back_bookings_merge() {
        let free = free_windows(Weekday::Monday, &[slot("09:00", "10:00"), slot("08:00", "09:00")]);
        assert_eq!(free, vec![slot("00:00", "08:00"), Slot { end: TimeOfDay::END_OF_DAY, ..slot("10:00", "11:00") }]);
    }

    #[test]
    fn gaps_between_bookings_are_free() {
        let free = free_windows(
            Weekday::Monday,
            &[slot("08:00", "09:30"), slot("09:00", "10:00"), slot("11:00", "12:00")],
        );
        assert_eq!(free[1], slot("10:00", "11:00"));
        assert_eq!(free.len(), 3);
    }

    #[test]
    fn other_days_ignored() {
        let tuesday = Slot::new(Weekday::Tuesday, "08:00".parse().unwrap(), "09:00".parse().unwrap()).unwrap();
        assert_eq!(free_windows(Weekday::Monday, &[tuesday]).len(), 1);
    }
}

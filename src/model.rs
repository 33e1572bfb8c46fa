use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

pub type BookingId = Ulid;
pub type RoomId = Ulid;
pub type DepartmentId = Ulid;
pub type InstructorId = Ulid;
pub type PostponementId = Ulid;

/// Display name used when a roster's primary instructor cannot be resolved.
pub const MULTIPLE_INSTRUCTORS: &str = "multiple instructors";

/// Malformed input, rejected before any store access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid time {0:?}: expected HH:MM")]
    InvalidTime(String),
    #[error("invalid date {0:?}: expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid {field}: {value:?}")]
    InvalidEnum { field: &'static str, value: String },
    #[error("start {start} must be before end {end}")]
    EmptyWindow { start: TimeOfDay, end: TimeOfDay },
    #[error("section {section} is not offered for the {stage} stage")]
    InvalidSection { section: u8, stage: AcademicStage },
    #[error("{0}")]
    CohortMismatch(&'static str),
    #[error("instructor roster must not be empty")]
    EmptyRoster,
    #[error("primary instructor {0} is not a roster member")]
    PrimaryNotInRoster(InstructorId),
    #[error("instructor {0} listed twice")]
    DuplicateInstructor(InstructorId),
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{0} must not be empty")]
    Blank(&'static str),
}

// ── Enumerations ─────────────────────────────────────────────────

macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                $(
                    if trimmed.eq_ignore_ascii_case($label) {
                        return Ok($name::$variant);
                    }
                )+
                Err(ValidationError::InvalidEnum {
                    field: $field,
                    value: s.to_string(),
                })
            }
        }
    };
}

labelled_enum!(
    /// Day of the week, Sunday-first as the institution's week starts on Sunday.
    Weekday, "day of week" {
        Sunday => "sunday",
        Monday => "monday",
        Tuesday => "tuesday",
        Wednesday => "wednesday",
        Thursday => "thursday",
        Friday => "friday",
        Saturday => "saturday",
    }
);

labelled_enum!(
    /// Morning and evening programs share rooms but never conflict with each other.
    StudyType, "study type" {
        Morning => "morning",
        Evening => "evening",
    }
);

labelled_enum!(
    AcademicStage, "academic stage" {
        First => "first",
        Second => "second",
        Third => "third",
        Fourth => "fourth",
    }
);

labelled_enum!(
    LectureType, "lecture type" {
        Theoretical => "theoretical",
        Practical => "practical",
    }
);

labelled_enum!(
    /// Practical lab group letter.
    Group, "group" {
        A => "A",
        B => "B",
        C => "C",
        D => "D",
        E => "E",
    }
);

impl Weekday {
    /// Day of week a calendar date falls on.
    pub fn of(date: NaiveDate) -> Self {
        date.weekday().into()
    }
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Sun => Weekday::Sunday,
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
        }
    }
}

impl AcademicStage {
    /// Highest theoretical section number offered for this stage.
    pub fn max_section(self) -> u8 {
        match self {
            AcademicStage::Second => 3,
            _ => 2,
        }
    }
}

/// Parse an ISO `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| ValidationError::InvalidDate(s.to_string()))
}

// ── Interval model ───────────────────────────────────────────────

/// Wall-clock time of day at minute precision (minutes since midnight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);
    /// Exclusive end of a day. Only produced internally, never parsed.
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(24 * 60);

    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self(u16::from(hour) * 60 + u16::from(minute)))
        } else {
            None
        }
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for TimeOfDay {
    type Err = ValidationError;

    /// Accepts `HH:MM`, and `HH:MM:00` as databases tend to render times.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidTime(s.to_string());
        let mut parts = s.trim().split(':');
        let hour = parts.next().ok_or_else(invalid)?;
        let minute = parts.next().ok_or_else(invalid)?;
        if let Some(seconds) = parts.next()
            && seconds != "00"
        {
            return Err(invalid());
        }
        if parts.next().is_some() || hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(invalid());
        }
        if !hour.bytes().chain(minute.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let hour: u8 = hour.parse().map_err(|_| invalid())?;
        let minute: u8 = minute.parse().map_err(|_| invalid())?;
        TimeOfDay::new(hour, minute).ok_or_else(invalid)
    }
}

/// A weekly `[start, end)` window on one day of the week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub day: Weekday,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Slot {
    pub fn new(day: Weekday, start: TimeOfDay, end: TimeOfDay) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::EmptyWindow { start, end });
        }
        Ok(Self { day, start, end })
    }

    /// Two slots conflict when they share a day and their windows intersect.
    /// A slot ending exactly when the other starts does not conflict.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.day == other.day
            && self.start < other.end
            && other.start < self.end
            && self.start != other.end
            && other.start != self.end
    }

    pub fn duration_minutes(&self) -> u16 {
        self.end.minutes() - self.start.minutes()
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}-{}", self.day, self.start, self.end)
    }
}

// ── Booking ──────────────────────────────────────────────────────

/// Which student cohort a booking targets. The lecture type decides whether a
/// section or a group applies; `None` means every cohort of that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cohort {
    Theoretical { section: Option<u8> },
    Practical { group: Option<Group> },
}

impl Cohort {
    pub fn lecture_type(&self) -> LectureType {
        match self {
            Cohort::Theoretical { .. } => LectureType::Theoretical,
            Cohort::Practical { .. } => LectureType::Practical,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(
            self,
            Cohort::Theoretical { section: None } | Cohort::Practical { group: None }
        )
    }
}

/// Who teaches a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructorAssignment {
    /// A single instructor, the legacy mode.
    Sole(InstructorId),
    /// Several instructors, exactly one of them primary.
    Roster {
        members: Vec<InstructorId>,
        primary: InstructorId,
    },
}

impl InstructorAssignment {
    /// Build a roster. The primary defaults to the first member.
    pub fn roster(
        members: Vec<InstructorId>,
        primary: Option<InstructorId>,
    ) -> Result<Self, ValidationError> {
        let first = *members.first().ok_or(ValidationError::EmptyRoster)?;
        for (i, id) in members.iter().enumerate() {
            if members[..i].contains(id) {
                return Err(ValidationError::DuplicateInstructor(*id));
            }
        }
        let primary = primary.unwrap_or(first);
        if !members.contains(&primary) {
            return Err(ValidationError::PrimaryNotInRoster(primary));
        }
        Ok(InstructorAssignment::Roster { members, primary })
    }

    pub fn instructors(&self) -> &[InstructorId] {
        match self {
            InstructorAssignment::Sole(id) => std::slice::from_ref(id),
            InstructorAssignment::Roster { members, .. } => members,
        }
    }

    pub fn primary(&self) -> InstructorId {
        match self {
            InstructorAssignment::Sole(id) => *id,
            InstructorAssignment::Roster { primary, .. } => *primary,
        }
    }

    /// True when the instructor teaches this booking in any role.
    pub fn involves(&self, instructor: InstructorId) -> bool {
        self.instructors().contains(&instructor)
    }

    /// Junction rows for roster assignments. Sole assignments have none.
    pub fn junction_rows(&self, booking_id: BookingId) -> Vec<AssignmentRow> {
        match self {
            InstructorAssignment::Sole(_) => Vec::new(),
            InstructorAssignment::Roster { members, primary } => members
                .iter()
                .map(|&instructor_id| AssignmentRow {
                    booking_id,
                    instructor_id,
                    is_primary: instructor_id == *primary,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRow {
    pub booking_id: BookingId,
    pub instructor_id: InstructorId,
    pub is_primary: bool,
}

/// Where a booking stands in the postponement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    Regular,
    /// Original booking suppressed while a postponement is in flight.
    MovedOut { postponement: PostponementId },
    /// Relocated copy displayed in the target room. `original` is the back
    /// link used when the relation record itself has gone missing.
    TemporaryMoveIn {
        postponement: PostponementId,
        original: BookingId,
    },
}

impl Placement {
    pub fn postponement(&self) -> Option<PostponementId> {
        match self {
            Placement::Regular => None,
            Placement::MovedOut { postponement }
            | Placement::TemporaryMoveIn { postponement, .. } => Some(*postponement),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub room_id: RoomId,
    pub department_id: DepartmentId,
    pub slot: Slot,
    pub study_type: StudyType,
    pub stage: AcademicStage,
    pub cohort: Cohort,
    pub subject: String,
    pub notes: Option<String>,
    pub assignment: Option<InstructorAssignment>,
    /// Denormalized from the assignment's primary instructor.
    pub instructor_name: Option<String>,
    pub active: bool,
    pub placement: Placement,
}

impl Booking {
    pub fn is_moved_out(&self) -> bool {
        matches!(self.placement, Placement::MovedOut { .. })
    }

    pub fn is_postponed(&self) -> bool {
        self.is_moved_out()
    }

    pub fn is_temporary_move_in(&self) -> bool {
        matches!(self.placement, Placement::TemporaryMoveIn { .. })
    }

    /// Whether this booking occupies its room.
    pub fn holds_room(&self) -> bool {
        self.active && !self.is_moved_out()
    }

    pub fn involves(&self, instructor: InstructorId) -> bool {
        self.assignment.as_ref().is_some_and(|a| a.involves(instructor))
    }

    pub fn instructors(&self) -> &[InstructorId] {
        match &self.assignment {
            Some(assignment) => assignment.instructors(),
            None => &[],
        }
    }
}

// ── Postponement ─────────────────────────────────────────────────

/// Pre-move placement of the original, kept on the relation for audit and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginSnapshot {
    pub room_id: RoomId,
    pub slot: Slot,
}

/// One in-flight relocation, owning both halves of the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Postponement {
    pub id: PostponementId,
    pub original_id: BookingId,
    pub temporary_id: BookingId,
    pub date: NaiveDate,
    pub room_id: RoomId,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub reason: Option<String>,
    pub origin: OriginSnapshot,
}

impl Postponement {
    /// Weekly slot the temporary booking occupies.
    pub fn slot(&self) -> Slot {
        Slot {
            day: Weekday::of(self.date),
            start: self.start,
            end: self.end,
        }
    }

    /// A postponement stays in force for its whole date.
    pub fn has_elapsed(&self, as_of: NaiveDate) -> bool {
        self.date < as_of
    }

    pub fn involves(&self, booking_id: BookingId) -> bool {
        self.original_id == booking_id || self.temporary_id == booking_id
    }
}

// ── Directory records ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub department_id: DepartmentId,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instructor {
    pub id: InstructorId,
    pub name: String,
    pub department_id: Option<DepartmentId>,
}

/// WAL record format. Flat, no nesting.
/// Multi-record transitions are one event so they replay atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomUpserted(Room),
    InstructorUpserted(Instructor),
    BookingInserted(Booking),
    BookingUpdated(Booking),
    BookingDeleted {
        id: BookingId,
    },
    PostponementIssued {
        postponement: Postponement,
        original: Booking,
        temporary: Booking,
    },
    PostponementReverted {
        id: PostponementId,
        restored: Option<Booking>,
        temporary_id: Option<BookingId>,
    },
}

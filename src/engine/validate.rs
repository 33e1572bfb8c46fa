//! Boundary request types and their shape validation. Everything here runs
//! before the store is touched.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::limits::*;
use crate::model::*;

/// Instructor choice as submitted by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructorSelection {
    #[default]
    Unassigned,
    Sole(InstructorId),
    Roster {
        members: Vec<InstructorId>,
        primary: Option<InstructorId>,
    },
}

impl InstructorSelection {
    pub fn into_assignment(self) -> Result<Option<InstructorAssignment>, ValidationError> {
        match self {
            InstructorSelection::Unassigned => Ok(None),
            InstructorSelection::Sole(id) => Ok(Some(InstructorAssignment::Sole(id))),
            InstructorSelection::Roster { members, primary } => {
                if members.len() > MAX_ROSTER_SIZE {
                    return Err(ValidationError::TooLong {
                        field: "instructor roster",
                        max: MAX_ROSTER_SIZE,
                    });
                }
                InstructorAssignment::roster(members, primary).map(Some)
            }
        }
    }
}

/// A booking as submitted: `HH:MM` times and enum labels as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRequest {
    pub room_id: RoomId,
    /// Defaults to the room's department.
    pub department_id: Option<DepartmentId>,
    pub day: String,
    pub start: String,
    pub end: String,
    pub study_type: String,
    pub stage: String,
    pub lecture_type: String,
    pub section: Option<u8>,
    pub group: Option<String>,
    pub subject: String,
    pub notes: Option<String>,
    pub instructors: InstructorSelection,
}

/// A shape-checked booking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDraft {
    pub room_id: RoomId,
    pub department_id: Option<DepartmentId>,
    pub slot: Slot,
    pub study_type: StudyType,
    pub stage: AcademicStage,
    pub cohort: Cohort,
    pub subject: String,
    pub notes: Option<String>,
    pub assignment: Option<InstructorAssignment>,
}

impl BookingRequest {
    pub fn validate(self) -> Result<BookingDraft, ValidationError> {
        let day: Weekday = self.day.parse()?;
        let slot = Slot::new(day, self.start.parse()?, self.end.parse()?)?;
        let study_type: StudyType = self.study_type.parse()?;
        let stage: AcademicStage = self.stage.parse()?;
        let lecture_type: LectureType = self.lecture_type.parse()?;
        let group = self.group.as_deref().map(str::parse::<Group>).transpose()?;
        let cohort = cohort(lecture_type, stage, self.section, group)?;

        let subject = self.subject.trim().to_string();
        if subject.is_empty() {
            return Err(ValidationError::Blank("subject"));
        }
        check_len("subject", &subject, MAX_SUBJECT_LEN)?;
        let notes = normalize_optional(self.notes);
        if let Some(notes) = &notes {
            check_len("notes", notes, MAX_NOTES_LEN)?;
        }

        Ok(BookingDraft {
            room_id: self.room_id,
            department_id: self.department_id,
            slot,
            study_type,
            stage,
            cohort,
            subject,
            notes,
            assignment: self.instructors.into_assignment()?,
        })
    }
}

/// Resolve the cohort for a lecture type. Only the field matching the
/// lecture type may be set; leaving it empty targets every cohort.
pub fn cohort(
    lecture_type: LectureType,
    stage: AcademicStage,
    section: Option<u8>,
    group: Option<Group>,
) -> Result<Cohort, ValidationError> {
    match lecture_type {
        LectureType::Theoretical => {
            if group.is_some() {
                return Err(ValidationError::CohortMismatch(
                    "theoretical lectures take a section, not a group",
                ));
            }
            if let Some(section) = section
                && !(1..=stage.max_section()).contains(&section)
            {
                return Err(ValidationError::InvalidSection { section, stage });
            }
            Ok(Cohort::Theoretical { section })
        }
        LectureType::Practical => {
            if section.is_some() {
                return Err(ValidationError::CohortMismatch(
                    "practical lectures take a group, not a section",
                ));
            }
            Ok(Cohort::Practical { group })
        }
    }
}

/// Relocation of one lecture to another room and time on a given date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostponeRequest {
    pub room_id: RoomId,
    pub date: String,
    pub start: String,
    pub end: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostponeDraft {
    pub room_id: RoomId,
    pub date: NaiveDate,
    pub slot: Slot,
    pub reason: Option<String>,
}

impl PostponeRequest {
    pub fn validate(self) -> Result<PostponeDraft, ValidationError> {
        let date = parse_date(&self.date)?;
        let slot = Slot::new(Weekday::of(date), self.start.parse()?, self.end.parse()?)?;
        let reason = normalize_optional(self.reason);
        if let Some(reason) = &reason {
            check_len("reason", reason, MAX_REASON_LEN)?;
        }
        Ok(PostponeDraft {
            room_id: self.room_id,
            date,
            slot,
            reason,
        })
    }
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn request() -> BookingRequest {
        BookingRequest {
            room_id: Ulid::new(),
            department_id: None,
            day: "monday".into(),
            start: "08:00".into(),
            end: "09:00".into(),
            study_type: "morning".into(),
            stage: "first".into(),
            lecture_type: "theoretical".into(),
            section: Some(1),
            group: None,
            subject: "  Calculus ".into(),
            notes: Some("   ".into()),
            instructors: InstructorSelection::Sole(Ulid::new()),
        }
    }

    #[test]
    fn valid_request_normalizes() {
        let draft = request().validate().unwrap();
        assert_eq!(draft.subject, "Calculus");
        assert_eq!(draft.notes, None);
        assert_eq!(draft.slot.day, Weekday::Monday);
        assert_eq!(draft.cohort, Cohort::Theoretical { section: Some(1) });
    }

    #[test]
    fn start_must_precede_end() {
        let mut req = request();
        req.start = "10:00".into();
        req.end = "09:00".into();
        assert!(matches!(req.validate(), Err(ValidationError::EmptyWindow { .. })));
    }

    #[test]
    fn malformed_fields_rejected() {
        let mut req = request();
        req.day = "someday".into();
        assert!(matches!(req.validate(), Err(ValidationError::InvalidEnum { field: "day of week", .. })));

        let mut req = request();
        req.start = "8am".into();
        assert!(matches!(req.validate(), Err(ValidationError::InvalidTime(_))));

        let mut req = request();
        req.stage = "fifth".into();
        assert!(req.validate().is_err());

        let mut req = request();
        req.subject = " ".into();
        assert_eq!(req.validate(), Err(ValidationError::Blank("subject")));

        let mut req = request();
        req.subject = "x".repeat(MAX_SUBJECT_LEN + 1);
        assert!(matches!(req.validate(), Err(ValidationError::TooLong { field: "subject", .. })));
    }

    #[test]
    fn section_three_only_for_second_stage() {
        assert!(cohort(LectureType::Theoretical, AcademicStage::First, Some(3), None).is_err());
        assert!(cohort(LectureType::Theoretical, AcademicStage::Second, Some(3), None).is_ok());
        assert!(cohort(LectureType::Theoretical, AcademicStage::Second, Some(4), None).is_err());
        assert!(cohort(LectureType::Theoretical, AcademicStage::Third, Some(0), None).is_err());
    }

    #[test]
    fn cohort_field_must_match_lecture_type() {
        assert!(matches!(
            cohort(LectureType::Practical, AcademicStage::First, Some(1), None),
            Err(ValidationError::CohortMismatch(_))
        ));
        assert!(matches!(
            cohort(LectureType::Theoretical, AcademicStage::First, None, Some(Group::A)),
            Err(ValidationError::CohortMismatch(_))
        ));
        assert_eq!(
            cohort(LectureType::Practical, AcademicStage::Fourth, None, Some(Group::E)),
            Ok(Cohort::Practical { group: Some(Group::E) })
        );
    }

    #[test]
    fn wildcard_cohorts_allowed() {
        let c = cohort(LectureType::Practical, AcademicStage::First, None, None).unwrap();
        assert!(c.is_wildcard());
        let c = cohort(LectureType::Theoretical, AcademicStage::First, None, None).unwrap();
        assert!(c.is_wildcard());
    }

    #[test]
    fn group_letter_parsed() {
        let mut req = request();
        req.lecture_type = "practical".into();
        req.section = None;
        req.group = Some("f".into());
        assert!(matches!(req.validate(), Err(ValidationError::InvalidEnum { field: "group", .. })));
    }

    #[test]
    fn oversized_roster_rejected() {
        let members = (0..=MAX_ROSTER_SIZE).map(|_| Ulid::new()).collect();
        let selection = InstructorSelection::Roster { members, primary: None };
        assert!(matches!(selection.into_assignment(), Err(ValidationError::TooLong { .. })));
    }

    #[test]
    fn postpone_day_follows_date() {
        let draft = PostponeRequest {
            room_id: Ulid::new(),
            date: "2026-10-21".into(),
            start: "10:00".into(),
            end: "11:00".into(),
            reason: Some(" Lab maintenance ".into()),
        }
        .validate()
        .unwrap();
        assert_eq!(draft.slot.day, Weekday::Wednesday);
        assert_eq!(draft.reason.as_deref(), Some("Lab maintenance"));
    }

    #[test]
    fn postpone_rejects_bad_date_and_window() {
        let base = PostponeRequest {
            room_id: Ulid::new(),
            date: "2026-13-01".into(),
            start: "10:00".into(),
            end: "11:00".into(),
            reason: None,
        };
        assert!(matches!(base.clone().validate(), Err(ValidationError::InvalidDate(_))));

        let mut inverted = base;
        inverted.date = "2026-10-21".into();
        inverted.start = "11:00".into();
        inverted.end = "11:00".into();
        assert!(matches!(inverted.validate(), Err(ValidationError::EmptyWindow { .. })));
    }
}

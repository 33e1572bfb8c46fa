pub const MAX_SUBJECT_LEN: usize = 200;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_ROSTER_SIZE: usize = 16;

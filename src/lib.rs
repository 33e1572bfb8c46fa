pub mod engine;
pub mod limits;
pub mod model;
pub mod notice;
pub mod observability;
pub mod sweep;
pub mod wal;

//! Tier generation pipeline: scaling, scheduling, and idle coordination.

pub mod idle;
pub mod scale;
pub mod scheduler;

pub type Result<T> = crate::Result<T>;

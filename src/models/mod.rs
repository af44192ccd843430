pub mod analysis;
pub mod inference;
pub mod job;

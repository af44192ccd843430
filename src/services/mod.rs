pub mod encryption;
pub mod executor;
pub mod fusion;
pub mod inference;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod worker;

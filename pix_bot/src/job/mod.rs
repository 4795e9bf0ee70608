pub mod expiration;
pub mod job_scheduler;

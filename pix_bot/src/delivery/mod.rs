pub mod handler;
pub mod retry;

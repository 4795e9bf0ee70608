pub mod dto;
pub mod state;
pub mod storage;

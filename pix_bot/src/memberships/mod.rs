pub mod dto;
pub mod storage;

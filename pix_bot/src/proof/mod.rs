pub mod cache;
pub mod dto;
pub mod ocr;
pub mod pipeline;
pub mod vision;

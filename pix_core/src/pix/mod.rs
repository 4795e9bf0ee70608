pub mod crc;
pub mod payload;
pub mod qr;

pub mod error;
pub mod helpers;
pub mod pix;
pub mod score;

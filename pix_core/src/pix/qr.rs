//! QR rendering for the copy-paste payload.

use std::io::Cursor;

use image::Luma;
use qrcode::QrCode;

use crate::error::{CoreError, CoreResult};

/// Renders the payload as a PNG suitable for `send_photo`. The QR is
/// regenerated on demand; only the payload string is ever persisted.
pub fn render_qr_png(payload: &str) -> CoreResult<Vec<u8>> {
    let code = QrCode::new(payload.as_bytes())
        .map_err(|e| CoreError::Validation(format!("payload does not fit a QR code: {}", e)))?;

    let img = code
        .render::<Luma<u8>>()
        .min_dimensions(320, 320)
        .build();

    let mut buf = Vec::new();
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| CoreError::Validation(format!("failed to encode QR png: {}", e)))?;

    Ok(buf)
}

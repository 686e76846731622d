//! Pairing material rendering.
//!
//! Raw QR contents are turned into an SVG image and embedded as a base64
//! `data:` URL at publish time. Codes pass through untouched. The raw value
//! is never logged, including on failure.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use qrcode::QrCode;
use qrcode::render::svg;
use tether_core::{PairingKind, PairingMaterial, PairingPayload};
use tracing::warn;

/// Prefix of every rendered QR payload.
pub const QR_DATA_URL_PREFIX: &str = "data:image/svg+xml;base64,";

const QR_MIN_DIMENSION: u32 = 256;

/// Render raw QR contents as an SVG `data:` URL.
pub fn qr_data_url(raw: &str) -> Result<String, qrcode::types::QrError> {
    let code = QrCode::new(raw.as_bytes())?;
    let image = code
        .render::<svg::Color<'_>>()
        .min_dimensions(QR_MIN_DIMENSION, QR_MIN_DIMENSION)
        .quiet_zone(true)
        .build();
    Ok(format!("{QR_DATA_URL_PREFIX}{}", STANDARD.encode(image)))
}

/// Displayable payload for `material`.
///
/// A QR string too long to encode falls back to the raw text so the
/// operator can still copy it.
#[must_use]
pub fn render_pairing(material: &PairingMaterial) -> PairingPayload {
    match material {
        PairingMaterial::Qr(raw) => {
            let value = qr_data_url(raw).unwrap_or_else(|error| {
                warn!(%error, len = raw.len(), "qr encoding failed, publishing raw pairing text");
                raw.clone()
            });
            PairingPayload {
                kind: PairingKind::Qr,
                value,
            }
        }
        PairingMaterial::Code(code) => PairingPayload {
            kind: PairingKind::Code,
            value: code.clone(),
        },
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

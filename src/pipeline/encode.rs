//! Image encoding: `DynamicImage` → PNG bytes, and PNG bytes → data URI.
//!
//! PNG is used at every hand-off. It is lossless and keeps the alpha channel
//! of the cutout, which the engraving software uses to mask the background.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an image as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Bytes, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        "Encoded {}x{} image → {} bytes PNG",
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(Bytes::from(buf))
}

/// Wrap encoded image bytes in a `data:` URI.
pub fn to_data_uri(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

/// Decode a base64 `data:` URI. Returns `None` if `s` is not one.
pub fn from_data_uri(s: &str) -> Option<Vec<u8>> {
    let rest = s.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    if !meta.ends_with(";base64") {
        return None;
    }
    STANDARD.decode(payload.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_keeps_alpha() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 7])));
        let png = encode_png(&img).expect("encode should succeed");
        let back = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(back.get_pixel(3, 3).0, [255, 0, 0, 7]);
    }

    #[test]
    fn data_uri_roundtrip() {
        let uri = to_data_uri(b"\x89PNG-ish", "image/png");
        assert!(uri.starts_with("data:image/png;base64,"));
        assert_eq!(from_data_uri(&uri).unwrap(), b"\x89PNG-ish");
    }

    #[test]
    fn from_data_uri_rejects_other_strings() {
        assert!(from_data_uri("https://example.com/x.png").is_none());
        assert!(from_data_uri("data:text/plain,hello").is_none());
    }
}

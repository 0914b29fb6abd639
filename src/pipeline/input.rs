//! Input resolution: turn a user-supplied path or URL into decoded photo bytes.
//!
//! The photo is kept as the original encoded bytes plus the decoded image.
//! The bytes are what we fall back to sending when no local change is made;
//! decoding up front means a file that is not an image is rejected before
//! any paid remote call.

use crate::error::EngraveError;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat};
use std::path::PathBuf;
use tracing::{debug, info};

/// A decoded source photo.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub bytes: Bytes,
    pub format: ImageFormat,
    pub image: DynamicImage,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to a decoded photo.
pub async fn resolve_input(
    input: &str,
    client: &reqwest::Client,
) -> Result<SourceImage, EngraveError> {
    let bytes = if is_url(input) {
        download_url(input, client).await?
    } else {
        read_local(input).await?
    };
    decode_source(bytes)
}

/// Decode already-uploaded bytes (e.g. from a form upload field).
pub fn decode_source(bytes: Bytes) -> Result<SourceImage, EngraveError> {
    let format = image::guess_format(&bytes).map_err(|e| EngraveError::UndecodableImage {
        stage: "input".into(),
        detail: e.to_string(),
    })?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(EngraveError::UndecodableImage {
            stage: "input".into(),
            detail: format!("unsupported format {format:?}, expected PNG or JPEG"),
        });
    }
    let image = image::load_from_memory_with_format(&bytes, format).map_err(|e| {
        EngraveError::UndecodableImage {
            stage: "input".into(),
            detail: e.to_string(),
        }
    })?;
    debug!(
        "Decoded source photo: {:?} {}x{} ({} bytes)",
        format,
        image.width(),
        image.height(),
        bytes.len()
    );
    Ok(SourceImage {
        bytes,
        format,
        image,
    })
}

async fn read_local(path_str: &str) -> Result<Bytes, EngraveError> {
    let path = PathBuf::from(path_str);
    match tokio::fs::read(&path).await {
        Ok(data) => Ok(Bytes::from(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(EngraveError::FileNotFound { path })
        }
        Err(e) => Err(EngraveError::Internal(format!(
            "cannot read {}: {e}",
            path.display()
        ))),
    }
}

async fn download_url(url: &str, client: &reqwest::Client) -> Result<Bytes, EngraveError> {
    info!("Downloading photo from: {}", url);

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| EngraveError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(EngraveError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    response
        .bytes()
        .await
        .map_err(|e| EngraveError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn jpeg_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([10, 20, 30])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/photo.jpg"));
        assert!(is_url("http://example.com/photo.jpg"));
        assert!(!is_url("/tmp/photo.jpg"));
        assert!(!is_url(""));
    }

    #[test]
    fn decode_accepts_jpeg() {
        let src = decode_source(Bytes::from(jpeg_bytes())).unwrap();
        assert_eq!(src.format, ImageFormat::Jpeg);
        assert_eq!((src.image.width(), src.image.height()), (8, 6));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_source(Bytes::from_static(b"%PDF-1.7 not a photo")).unwrap_err();
        assert!(matches!(err, EngraveError::UndecodableImage { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let client = reqwest::Client::new();
        let err = resolve_input("/definitely/not/here.jpg", &client)
            .await
            .unwrap_err();
        assert!(matches!(err, EngraveError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn local_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, jpeg_bytes()).unwrap();
        let client = reqwest::Client::new();
        let src = resolve_input(path.to_str().unwrap(), &client).await.unwrap();
        assert_eq!(src.image.width(), 8);
    }
}

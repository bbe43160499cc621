//! JSON and image file I/O for the run directory.

use image::{ImageFormat, RgbImage, codecs::jpeg::JpegEncoder};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt as _;

use super::spawn_blocking_propagating_panics;
use crate::prelude::*;

/// Read a JSON file.
pub async fn read_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse JSON from file at path: {:?}", path))
}

/// Write `value` as two-space indented UTF-8 JSON, with a trailing newline.
pub async fn write_json<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let mut json = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize JSON for {:?}", path))?;
    json.push('\n');
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {:?}", path))?;
    file.write_all(json.as_bytes())
        .await
        .with_context(|| format!("Failed to write {:?}", path))?;
    file.flush()
        .await
        .with_context(|| format!("Failed to flush {:?}", path))?;
    Ok(())
}

/// Save an image as PNG, off the async runtime.
pub async fn write_png(path: &Path, image: RgbImage) -> Result<()> {
    let path = path.to_owned();
    spawn_blocking_propagating_panics(move || {
        image
            .save_with_format(&path, ImageFormat::Png)
            .with_context(|| format!("Failed to write image {:?}", path))
    })
    .await
}

/// Save an image as JPEG at `quality`, off the async runtime.
pub async fn write_jpeg(path: &Path, image: RgbImage, quality: u8) -> Result<()> {
    let path = path.to_owned();
    spawn_blocking_propagating_panics(move || -> Result<()> {
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create {:?}", path))?;
        let mut writer = std::io::BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, quality)
            .encode_image(&image)
            .with_context(|| format!("Failed to write image {:?}", path))
    })
    .await
}

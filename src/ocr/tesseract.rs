//! Tesseract OCR engine.

use image::{GrayImage, ImageFormat};
use tokio::{process::Command, sync::Mutex};

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    prelude::*,
};

use super::OcrEngine;

/// OCR engine wrapping the `tesseract` CLI tool.
///
/// Calls are serialized: tesseract already uses several threads per call.
pub struct TesseractEngine {
    binary: PathBuf,
    language: String,
    lock: Mutex<()>,
}

impl TesseractEngine {
    pub fn new(binary: PathBuf, language: String) -> Self {
        Self {
            binary,
            language,
            lock: Mutex::new(()),
        }
    }

    /// Build the argument list for one call.
    fn args(&self, input: &Path, psm: u8, whitelist: Option<&str>) -> Vec<String> {
        let mut args = vec![
            input.display().to_string(),
            "stdout".to_owned(),
            "--psm".to_owned(),
            psm.to_string(),
            "-l".to_owned(),
            self.language.clone(),
        ];
        if let Some(whitelist) = whitelist {
            args.push("-c".to_owned());
            args.push(format!("tessedit_char_whitelist={whitelist}"));
        }
        args
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    #[instrument(level = "trace", skip_all, fields(psm = psm, width = image.width(), height = image.height()))]
    async fn recognize(
        &self,
        image: &GrayImage,
        psm: u8,
        whitelist: Option<&str>,
    ) -> Result<String> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let image = image.clone();
        let write_path = input_path.clone();
        spawn_blocking_propagating_panics(move || {
            image
                .save_with_format(&write_path, ImageFormat::Png)
                .context("cannot write tesseract input file")
        })
        .await?;

        let output = {
            let _guard = self.lock.lock().await;
            Command::new(&self.binary)
                .args(self.args(&input_path, psm, whitelist))
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("cannot run {}", self.binary.display()))?
        };
        check_for_command_failure("tesseract", &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

//! OCR engine interface.
//!
//! The process holds a single engine, shared by the number reader and the
//! plate-index locator. Tests substitute [`fake::ScriptedOcr`].

use std::sync::Arc;

use image::GrayImage;

use crate::prelude::*;

pub mod tesseract;

/// Tesseract page segmentation modes we use.
pub mod psm {
    /// Fully automatic segmentation, for whole pages.
    pub const AUTO: u8 = 3;
    /// A single uniform block of text.
    pub const BLOCK: u8 = 6;
    /// A single text line.
    pub const LINE: u8 = 7;
    /// A single word.
    pub const WORD: u8 = 8;
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize text in `image` using page segmentation mode `psm`,
    /// optionally restricted to the characters in `whitelist`.
    async fn recognize(
        &self,
        image: &GrayImage,
        psm: u8,
        whitelist: Option<&str>,
    ) -> Result<String>;
}

/// Create the process-wide OCR engine.
pub fn create_engine(binary: &Path, language: &str) -> Arc<dyn OcrEngine> {
    Arc::new(tesseract::TesseractEngine::new(binary.to_owned(), language.to_owned()))
}

#[cfg(test)]
pub mod fake {
    //! A scripted OCR engine for tests.

    use std::{collections::VecDeque, sync::Mutex, time::Duration};

    use super::*;

    /// One scripted reply.
    pub enum Reply {
        Text(&'static str),
        Fail,
        /// Sleep this long, then return empty text.
        Stall(Duration),
    }

    /// Returns scripted replies in call order, then empty strings.
    #[derive(Default)]
    pub struct ScriptedOcr {
        replies: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<(u32, u32, u8)>>,
    }

    impl ScriptedOcr {
        pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                calls: Mutex::default(),
            }
        }

        /// `(width, height, psm)` for every call so far.
        pub fn calls(&self) -> Vec<(u32, u32, u8)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OcrEngine for ScriptedOcr {
        async fn recognize(
            &self,
            image: &GrayImage,
            psm: u8,
            _whitelist: Option<&str>,
        ) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((image.width(), image.height(), psm));
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Text(text)) => Ok(text.to_owned()),
                Some(Reply::Fail) => Err(anyhow!("scripted OCR failure")),
                Some(Reply::Stall(duration)) => {
                    tokio::time::sleep(duration).await;
                    Ok(String::new())
                }
                None => Ok(String::new()),
            }
        }
    }
}

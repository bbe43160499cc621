use std::{process::ExitCode, str::FromStr};

use clap::{Parser, error::ErrorKind as ClapErrorKind};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{
    error::{ErrorKind, exit_code_for},
    prelude::*,
    ui::Ui,
};

mod assembly;
mod async_utils;
mod cmd;
mod coherence;
mod cpu_limit;
mod detectors;
mod document;
mod error;
mod fusion;
mod geometry;
mod imaging;
mod llm;
mod number_reader;
mod ocr;
mod pipeline;
mod plate_index;
mod prelude;
mod presets;
mod quality;
mod raster;
mod retry;
mod toml_utils;
mod ui;

/// Extract artwork reproductions and their catalogue numbers from a scanned
/// art catalogue.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OCR_BINARY (optional): Tesseract binary. Defaults to `tesseract`.
  - OCR_LANG (optional): Tesseract language. Defaults to `eng`.
  - LLM_URL (optional): Ollama generate endpoint.
  - LLM_MODEL_VISION (optional): Model used to re-read catalogue numbers.
  - LLM_MODEL_TEXT (optional): Model used to parse the table of plates.
  - PDFTOCAIRO_BINARY, PDFINFO_BINARY, PDFTOTEXT_BINARY (optional):
    Poppler tools.

  These variables may be set in a standard `.env` file.

Exit codes:
  0 success, 1 usage error, 2 document unreadable,
  3 some pages failed, 4 interrupted.
"#
)]
struct Opts {
    #[clap(flatten)]
    extract: cmd::extract::ExtractOpts,
}

/// Our entry point. Errors are printed here and turned into exit codes.
#[tokio::main]
async fn main() -> ExitCode {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    match real_main(ui).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<u8> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments. Usage errors exit with 1, not clap's 2.
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(err) => {
            let _ = err.print();
            return Ok(match err.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => 0,
                _ => ErrorKind::Usage.exit_code(),
            });
        }
    };
    debug!("Parsed options: {:?}", opts);

    if opts.extract.quiet {
        ui.hide_progress_bars();
    }

    cmd::extract::cmd_extract(ui, &opts.extract).await
}

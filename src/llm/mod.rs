//! Local LLM support, for adjudicating catalogue numbers and parsing
//! plate-index lines.
//!
//! Everything here is optional. Callers treat any error as "no opinion" and
//! fall back to their rule-based results.

use std::{
    error, fmt,
    io::Cursor,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use base64::{Engine as _, prelude::BASE64_STANDARD};
use handlebars::Handlebars;
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use schemars::{JsonSchema, schema_for};
use serde::de::DeserializeOwned;

use crate::{prelude::*, retry::IsKnownTransient};

pub mod ollama;

/// Default generation endpoint.
pub const DEFAULT_LLM_URL: &str = "http://localhost:11434/api/generate";

/// A request to a `/api/generate`-style endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    /// Base64-encoded JPEG images, without any `data:` prefix.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    pub stream: bool,
    /// JSON Schema the response must follow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Value>,
    pub options: GenerateOptions,
}

/// Sampling options.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub num_predict: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            num_predict: 512,
        }
    }
}

/// The part of the endpoint's reply we use.
#[derive(Debug, Deserialize)]
pub struct GenerateResponse {
    pub response: String,
}

/// Interface to an LLM generation endpoint.
#[async_trait]
pub trait LlmClient: Send + Sync + 'static {
    /// Run one non-streaming generation and return the raw response text.
    async fn generate(&self, request: &GenerateRequest) -> Result<String>;
}

/// Which models to use for which job.
#[derive(Clone, Debug)]
pub struct LlmModels {
    pub vision: String,
    pub text: String,
}

/// An LLM client plus the models we ask it for.
///
/// Clones share one breaker: once a call times out or the endpoint cannot be
/// reached, every later call fails at once without touching the network.
#[derive(Clone)]
pub struct Llm {
    pub client: Arc<dyn LlmClient>,
    pub models: LlmModels,
    unavailable: Arc<AtomicBool>,
}

impl fmt::Debug for Llm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Llm")
            .field("models", &self.models)
            .field("unavailable", &self.is_unavailable())
            .finish()
    }
}

/// Context attached to errors from the endpoint itself, as opposed to bad
/// replies.
#[derive(Debug)]
pub struct LlmUnavailable;

impl fmt::Display for LlmUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LLM endpoint unavailable")
    }
}

impl Llm {
    pub fn new(client: Arc<dyn LlmClient>, models: LlmModels) -> Self {
        Self {
            client,
            models,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Has an earlier call given up on the endpoint?
    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Relaxed)
    }

    /// Ask `model` for a JSON value of type `T`. The schema for `T` is sent
    /// with the request, and the reply is validated against it before
    /// deserializing.
    #[instrument(level = "debug", skip_all, fields(model = %model, images = images.len()))]
    pub async fn ask_json<T>(&self, model: &str, prompt: String, images: Vec<String>) -> Result<T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        if self.is_unavailable() {
            return Err(anyhow!("skipped after an earlier failure").context(LlmUnavailable));
        }
        let schema = response_schema::<T>()?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|err| anyhow!("invalid response schema: {err}"))?;
        let request = GenerateRequest {
            model: model.to_owned(),
            prompt,
            images,
            stream: false,
            format: Some(schema),
            options: GenerateOptions::default(),
        };
        let text = match self.client.generate(&request).await {
            Ok(text) => text,
            Err(err) => {
                if !self.unavailable.swap(true, Ordering::Relaxed) {
                    warn!("Not calling the LLM again during this run: {err:#}");
                }
                return Err(err.context(LlmUnavailable));
            }
        };
        let response = serde_json::from_str::<Value>(text.trim())
            .with_context(|| format!("LLM response is not JSON: {text:?}"))?;
        validator
            .validate(&response)
            .map_err(|err| anyhow!("LLM response failed validation: {err}"))?;
        debug!(%response, "LLM response");
        serde_json::from_value(response).context("cannot deserialize LLM response")
    }
}

/// The JSON Schema for `T`, without the `$schema` key that some endpoints
/// reject.
pub fn response_schema<T: JsonSchema>() -> Result<Value> {
    let mut schema = serde_json::to_value(schema_for!(T))?;
    schema
        .as_object_mut()
        .ok_or_else(|| anyhow!("Expected schema to be an object"))?
        .remove("$schema");
    Ok(schema)
}

/// Encode an image as base64 JPEG for a vision request.
pub fn jpeg_base64(image: &RgbImage) -> Result<String> {
    let mut bytes = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut bytes, 85)
        .encode_image(image)
        .context("cannot encode JPEG for LLM")?;
    Ok(BASE64_STANDARD.encode(bytes.into_inner()))
}

static PROMPTS: LazyLock<Handlebars<'static>> = LazyLock::new(|| {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .register_template_string("adjudicate", include_str!("prompts/adjudicate.hbs"))
        .expect("built-in prompt should parse");
    handlebars
        .register_template_string("plate_line", include_str!("prompts/plate_line.hbs"))
        .expect("built-in prompt should parse");
    handlebars
});

/// Render one of our built-in prompts.
pub fn render_prompt(name: &str, bindings: &Value) -> Result<String> {
    PROMPTS
        .render(name, bindings)
        .with_context(|| format!("cannot render {name} prompt"))
}

/// An error which occurred while calling an LLM.
#[derive(Debug)]
pub enum LlmError<E> {
    /// An error from the HTTP layer.
    Native(E),

    /// The request ran past its budget.
    Timeout(Duration),
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // The budget covers the whole call, retries included.
            LlmError::Timeout(_) => false,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "LLM error: {err}"),
            LlmError::Timeout(budget) => {
                write!(f, "LLM request timed out after {}s", budget.as_secs_f64())
            }
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout(_) => None,
        }
    }
}

#[cfg(test)]
pub mod fake {
    //! A scripted LLM for tests.

    use std::sync::Mutex;

    use super::*;

    /// Replies with canned text, in order, and records requests.
    #[derive(Default)]
    pub struct ScriptedLlm {
        replies: Mutex<Vec<Result<String, String>>>,
        requests: Mutex<Vec<GenerateRequest>>,
    }

    impl ScriptedLlm {
        pub fn new(replies: impl IntoIterator<Item = Result<&'static str, &'static str>>) -> Self {
            let mut replies = replies
                .into_iter()
                .map(|r| r.map(str::to_owned).map_err(str::to_owned))
                .collect::<Vec<_>>();
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                requests: Mutex::default(),
            }
        }

        pub fn requests(&self) -> Vec<GenerateRequest> {
            self.requests.lock().unwrap().clone()
        }

        /// Wrap in an [`Llm`] with test model names.
        pub fn into_llm(self: Arc<Self>) -> Llm {
            Llm::new(
                self,
                LlmModels {
                    vision: "vision-model".to_owned(),
                    text: "text-model".to_owned(),
                },
            )
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, request: &GenerateRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            match self.replies.lock().unwrap().pop() {
                Some(Ok(text)) => Ok(text),
                Some(Err(err)) => Err(anyhow!(err)),
                None => Err(anyhow!("no scripted reply")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{fake::ScriptedLlm, *};

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Answer {
        value: u32,
    }

    #[test]
    fn schema_has_no_dollar_schema() {
        let schema = response_schema::<Answer>().unwrap();
        assert!(schema.get("$schema").is_none());
        assert_eq!(schema["properties"]["value"]["type"], "integer");
    }

    #[test]
    fn request_omits_empty_images() {
        let request = GenerateRequest {
            model: "m".to_owned(),
            prompt: "p".to_owned(),
            images: vec![],
            stream: false,
            format: None,
            options: GenerateOptions::default(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("images").is_none());
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 512);
    }

    #[test]
    fn jpeg_encoding_is_base64() {
        let encoded = jpeg_base64(&RgbImage::new(8, 8)).unwrap();
        let bytes = BASE64_STANDARD.decode(encoded).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn ask_json_validates_and_parses() {
        let llm = Arc::new(ScriptedLlm::new([
            Ok(r#"{"value": 3}"#),
            Ok(r#"{"value": "three"}"#),
            Ok("not json"),
        ]))
        .into_llm();
        let ok: Answer = llm.ask_json("m", "p".to_owned(), vec![]).await.unwrap();
        assert_eq!(ok.value, 3);
        assert!(llm.ask_json::<Answer>("m", "p".to_owned(), vec![]).await.is_err());
        assert!(llm.ask_json::<Answer>("m", "p".to_owned(), vec![]).await.is_err());
        assert!(!llm.is_unavailable());
    }

    #[tokio::test]
    async fn endpoint_failure_stops_later_calls() {
        let scripted = Arc::new(ScriptedLlm::new([
            Err("connection refused"),
            Ok(r#"{"value": 3}"#),
        ]));
        let llm = scripted.clone().into_llm();
        let err = llm
            .ask_json::<Answer>("m", "p".to_owned(), vec![])
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<LlmUnavailable>().is_some());
        assert!(llm.clone().is_unavailable());

        let err = llm
            .ask_json::<Answer>("m", "p".to_owned(), vec![])
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<LlmUnavailable>().is_some());
        assert_eq!(scripted.requests().len(), 1);
    }

    #[test]
    fn prompts_render() {
        let text = render_prompt(
            "plate_line",
            &json!({ "number": 1, "text": "Guernica, 1937" }),
        )
        .unwrap();
        assert!(text.contains("Guernica, 1937"));
    }
}

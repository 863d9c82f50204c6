//! Client for a local KoboldCpp-style `/api/v1/generate` endpoint.

use base64::{engine::general_purpose::STANDARD, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use crate::config::InferenceConfig;

/// Returned in place of an analysis whenever the server cannot be used.
pub const FALLBACK_TEXT: &str = "Unable to analyze image at this time.";

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference request failed: {0}. Is the model server running?")]
    Transport(#[from] reqwest::Error),

    #[error("Inference server error ({status}): {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Malformed inference response: {0}")]
    Malformed(String),

    #[error("Failed to encode image: {0}")]
    Encoding(#[from] image::ImageError),

    #[error("Failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    n: u32,
    max_context_length: u32,
    max_length: u32,
    rep_pen: f32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    top_a: f32,
    typical: f32,
    tfs: f32,
    rep_pen_range: u32,
    rep_pen_slope: f32,
    sampler_order: &'a [u32],
    memory: &'a str,
    trim_stop: bool,
    images: Vec<String>,
    genkey: String,
    min_p: f32,
    dynatemp_range: f32,
    dynatemp_exponent: f32,
    smoothing_factor: f32,
    banned_tokens: &'a [String],
    render_special: bool,
    presence_penalty: f32,
    logit_bias: &'a HashMap<String, f32>,
    prompt: String,
    quiet: bool,
    stop_sequence: &'a [String],
    use_default_badwordsids: bool,
    bypass_eos: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    results: Vec<GenerateResult>,
}

#[derive(Debug, Deserialize)]
struct GenerateResult {
    text: String,
}

/// Wraps the user instruction in the chat-turn markers the model expects.
pub fn compose_prompt(instruction: &str) -> String {
    format!(
        "\n(Attached Image)\n<|eot_id|><|start_header_id|>user<|end_header_id|>\n\n{}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n",
        instruction
    )
}

/// JPEG-encodes and base64s an image. `None` sends a white 1x1 pixel.
pub fn encode_image(image: Option<&DynamicImage>, quality: u8) -> Result<String, image::ImageError> {
    let rgb = match image {
        Some(img) => img.to_rgb8(),
        None => RgbImage::from_pixel(1, 1, image::Rgb([255, 255, 255])),
    };
    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    rgb.write_with_encoder(encoder)?;
    Ok(STANDARD.encode(bytes))
}

pub struct ModelClient {
    http: Client,
    config: InferenceConfig,
}

impl ModelClient {
    /// Fails when the HTTP client cannot be built, so a request timeout is
    /// never silently lost.
    pub fn new(config: InferenceConfig) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(InferenceError::Client)?;
        Ok(Self { http, config })
    }

    /// Never fails: any transport, status or parse error yields
    /// [`FALLBACK_TEXT`].
    pub async fn analyze(&self, image: Option<&DynamicImage>, prompt: &str) -> String {
        match self.try_analyze(image, prompt).await {
            Ok(text) => text,
            Err(e) => {
                log::error!("[MODEL] {}", e);
                FALLBACK_TEXT.to_string()
            }
        }
    }

    pub async fn try_analyze(
        &self,
        image: Option<&DynamicImage>,
        prompt: &str,
    ) -> Result<String, InferenceError> {
        let start = Instant::now();
        let image_base64 = encode_image(image, self.config.jpeg_quality)?;
        let request = self.build_request(image_base64, prompt);

        let response = self
            .http
            .post(&self.config.url)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status { status, body });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;

        let text = body
            .results
            .into_iter()
            .next()
            .map(|r| r.text.trim().to_string())
            .ok_or_else(|| InferenceError::Malformed("empty results array".to_string()))?;

        log::info!(
            "[MODEL] {} chars in {}ms",
            text.len(),
            start.elapsed().as_millis()
        );
        Ok(text)
    }

    fn build_request<'a>(&'a self, image_base64: String, prompt: &str) -> GenerateRequest<'a> {
        let c = &self.config;
        GenerateRequest {
            n: c.n,
            max_context_length: c.max_context_length,
            max_length: c.max_length,
            rep_pen: c.rep_pen,
            temperature: c.temperature,
            top_p: c.top_p,
            top_k: c.top_k,
            top_a: c.top_a,
            typical: c.typical,
            tfs: c.tfs,
            rep_pen_range: c.rep_pen_range,
            rep_pen_slope: c.rep_pen_slope,
            sampler_order: &c.sampler_order,
            memory: &c.memory,
            trim_stop: c.trim_stop,
            images: vec![image_base64],
            genkey: c.genkey.clone().unwrap_or_else(fresh_genkey),
            min_p: c.min_p,
            dynatemp_range: c.dynatemp_range,
            dynatemp_exponent: c.dynatemp_exponent,
            smoothing_factor: c.smoothing_factor,
            banned_tokens: &c.banned_tokens,
            render_special: c.render_special,
            presence_penalty: c.presence_penalty,
            logit_bias: &c.logit_bias,
            prompt: compose_prompt(prompt),
            quiet: c.quiet,
            stop_sequence: &c.stop_sequence,
            use_default_badwordsids: c.use_default_badwordsids,
            bypass_eos: c.bypass_eos,
        }
    }
}

fn fresh_genkey() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("KCPP{}", &id[..8])
}

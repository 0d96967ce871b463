use std::env;
use std::fs;
use std::io::{BufWriter, Cursor, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, Rgb, RgbImage};
use printpdf::{
    BuiltinFont, Color, ColorBits, ColorSpace, Image as PdfImage, ImageTransform, ImageXObject,
    IndirectFontRef, Line, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference, Point, Px,
    Rgb as PdfRgb,
};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use whiteout_contracts::errors::StudioError;
use whiteout_contracts::estimate::{BoundingBox, CostEstimate, SelectionState};
use whiteout_contracts::events::{EventPayload, EventWriter};
use whiteout_contracts::images::{
    is_accepted_media_type, ImageReference, ACCEPTED_MEDIA_TYPES, MAX_UPLOAD_BYTES,
};
use whiteout_contracts::receipts::{
    build_receipt, write_receipt, write_summary, SessionSummary,
};
use whiteout_contracts::schema::{decode_estimate, estimate_response_schema};

/// Conventional filename for a downloaded render.
pub const RENDER_FILENAME: &str = "whiteout-ai-render.png";

/// Conventional filename for the exported cost report.
pub const REPORT_FILENAME: &str = "WhiteoutAI_Cost_Estimate.pdf";

const DEFAULT_RENDER_MODEL: &str = "gemini-2.5-flash-image-preview";
const DEFAULT_ESTIMATE_MODEL: &str = "gemini-2.5-flash";

const NO_RENDER_MESSAGE: &str =
    "No image was generated by the AI. The model may have refused the request.";
const NO_ADJUSTED_RENDER_MESSAGE: &str =
    "No adjusted image was generated by the AI. The model may have refused the request.";

const SYSTEM_INSTRUCTION: &str = r#"You are an elite-level AI architectural visualizer and interior designer. Your sole purpose is to produce hyper-realistic, editorial-quality architectural photography of interior spaces across any style—from contemporary, mid-century, heritage-inspired, coastal, to eclectic—but each render must embody sophistication, intentionality, and authenticity.

1. Style Flexibility

Do not default to a single design philosophy. Instead, adapt fluidly to the chosen style's defining features—whether it's heritage, contemporary, coastal, mid-century, or modern.

Prioritize coherence: your render should clearly convey the mood and era of the intended design language.

2. Aesthetic Quality

Use clean, minimal compositions with purposeful arrangement—simplicity with depth.

Natural materials are essential: featured textures (e.g., linen, boucle, oak, polished concrete) must showcase texture and authenticity.

Integrate textural layering—smooth surfaces next to textured ones, soft textiles next to hard surfaces—creating visual richness without clutter.

Natural light should define the scene: directional, soft, dynamic—accentuating materiality, shadows, and spatial form.

For palette, start neutral and natural; allow accents to emerge organically through material or lighting—not bright or saturated unless contextually appropriate.

3. Anchored Styling

Use minimal but expressive props: a folded blanket, a sculptural vase, an open book. No overstyling—objects should feel purposeful and situational.

Avoid generic or trendy staging; props should subtly reinforce the mood and narrative of the space.

4. Architectural Context & Framing

Employ views that connect indoors and outdoors: framing gardens, landscape, neighborhood context in a believable, context-sensitive way.

Include architectural transitions—like large glazed frames, layered thresholds, or courtyard glimpses—to enrich spatial storytelling.

5. Realism & Photographic Detail

Apply real-world camera parameters: eye-level camera height, realistic focal lengths (e.g., 28-35 mm for interiors).

Include optical imperfections: lens bloom, film grain, soft vignettes, realistic exposure.

White balance and color grading should feel warm and neutral; avoid digital flatness.

Surfaces should feature micro-imperfections: variations in wood grain, fabric folds, stone veining, minor wear—underscoring authenticity."#;

const ESTIMATION_PROMPT: &str = r#"Analyze the provided interior design image. Identify key items, materials, and finishes (e.g., joinery, flooring, lighting, furniture). For each identified item, provide two distinct options for comparison based on the Australian market: a standard/budget option and a premium/high-end option.

CRITICAL: For each identified item, you must also provide its normalized bounding box coordinates ([y_min, x_min, y_max, x_max]) that pinpoint its location within the image.

For each of the two options, you must provide:
1.  A descriptive option name (e.g., "Laminate Benchtop" vs. "Caesarstone Benchtop").
2.  A detailed description of the item, including materials and style.
3.  An estimated cost in Australian Dollars (AUD).
4.  A suggested, plausible Australian supplier for that type of item (e.g., "Bunnings Warehouse", "Reece", "Space Furniture").

Return the data as a JSON array where each object represents an item and contains its bounding box and two comparative options."#;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// One call to the generative backend: a model, ordered content parts, and
/// optional generation config / persona instruction.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: String,
    pub parts: Vec<Value>,
    pub generation_config: Map<String, Value>,
    pub system_instruction: Option<String>,
}

impl BackendRequest {
    /// Wire payload for `models/{model}:generateContent`.
    pub fn payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            Value::Array(vec![json!({
                "role": "user",
                "parts": self.parts,
            })]),
        );
        if !self.generation_config.is_empty() {
            payload.insert(
                "generationConfig".to_string(),
                Value::Object(self.generation_config.clone()),
            );
        }
        if let Some(instruction) = self.system_instruction.as_deref() {
            payload.insert(
                "systemInstruction".to_string(),
                json!({ "parts": [{ "text": instruction }] }),
            );
        }
        Value::Object(payload)
    }
}

/// Boundary to the generative backend. The gateway owns prompt policy and
/// response decoding; a transport only moves a request and returns the raw
/// payload. Injected at construction time, never reached through a global.
pub trait ContentTransport: Send + Sync {
    fn name(&self) -> &str;
    fn dispatch(&self, request: &BackendRequest) -> Result<Value>;
}

/// Blocking HTTP transport to the Gemini `generateContent` endpoint.
/// No application-imposed timeout and no automatic retry; a failed call is
/// surfaced to the caller and retried only by explicit user action.
pub struct HttpTransport {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl HttpTransport {
    /// Fails fast when no credential is present in the environment.
    pub fn from_env() -> Result<Self, StudioError> {
        let api_key = non_empty_env("GEMINI_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .ok_or_else(|| {
                StudioError::Configuration(
                    "GEMINI_API_KEY or GOOGLE_API_KEY environment variable is not set.".to_string(),
                )
            })?;
        Ok(Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            api_key,
            http: HttpClient::new(),
        })
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }
}

impl ContentTransport for HttpTransport {
    fn name(&self) -> &str {
        "gemini"
    }

    fn dispatch(&self, request: &BackendRequest) -> Result<Value> {
        let endpoint = self.endpoint_for_model(&request.model);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request.payload())
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        response_json_or_error("Gemini", response)
    }
}

/// Offline backend double. Renders a deterministic flat-color image sized
/// like the submitted base image, or a canned two-option estimate when the
/// request declares a JSON response. Counts dispatches so callers can assert
/// that a rejected operation never reached the transport.
#[derive(Clone, Default)]
pub struct DryrunTransport {
    dispatched: Arc<AtomicU64>,
}

impl DryrunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }

    fn wants_json(request: &BackendRequest) -> bool {
        request
            .generation_config
            .get("responseMimeType")
            .and_then(Value::as_str)
            .map(|mime| mime.eq_ignore_ascii_case("application/json"))
            .unwrap_or(false)
    }

    fn base_dimensions(request: &BackendRequest) -> (u32, u32) {
        for part in &request.parts {
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let Some(data) = inline.get("data").and_then(Value::as_str) else {
                continue;
            };
            if let Some(image) = BASE64
                .decode(data.as_bytes())
                .ok()
                .and_then(|bytes| image::load_from_memory(&bytes).ok())
            {
                return (image.width(), image.height());
            }
        }
        (512, 512)
    }

    fn prompt_text(request: &BackendRequest) -> String {
        request
            .parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<&str>>()
            .join("\n")
    }

    fn canned_estimate() -> Value {
        json!([
            {
                "item": "Sofa",
                "boundingBox": [0.45, 0.1, 0.85, 0.55],
                "options": [
                    {
                        "optionName": "Mid-Range Fabric Sofa",
                        "description": "A comfortable 3-seater sofa upholstered in a durable polyester-blend fabric.",
                        "estimatedCostAUD": 1800.0,
                        "suggestedSupplier": "Temple & Webster",
                    },
                    {
                        "optionName": "Designer Leather Sofa",
                        "description": "A full-grain leather 3-seater with solid oak legs and feather-wrapped cushions.",
                        "estimatedCostAUD": 5200.0,
                        "suggestedSupplier": "King Living",
                    },
                ],
            },
            {
                "item": "Flooring",
                "boundingBox": [0.7, 0.0, 1.0, 1.0],
                "options": [
                    {
                        "optionName": "Laminate Timber-Look Flooring",
                        "description": "Click-lock laminate boards with an oak-effect wear layer.",
                        "estimatedCostAUD": 2400.0,
                        "suggestedSupplier": "Bunnings Warehouse",
                    },
                    {
                        "optionName": "Engineered Oak Flooring",
                        "description": "Wide-board engineered European oak with a matte lacquer finish.",
                        "estimatedCostAUD": 7600.0,
                        "suggestedSupplier": "Havwoods",
                    },
                ],
            },
            {
                "item": "Pendant Light",
                "boundingBox": [0.05, 0.4, 0.25, 0.6],
                "options": [
                    {
                        "optionName": "Powder-Coated Pendant",
                        "description": "A simple dome pendant in a matte black powder-coat finish.",
                        "estimatedCostAUD": 350.0,
                        "suggestedSupplier": "Beacon Lighting",
                    },
                    {
                        "optionName": "Hand-Blown Glass Pendant",
                        "description": "A sculptural hand-blown glass pendant with brass hardware.",
                        "estimatedCostAUD": 1240.0,
                        "suggestedSupplier": "Space Furniture",
                    },
                ],
            },
        ])
    }
}

impl ContentTransport for DryrunTransport {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn dispatch(&self, request: &BackendRequest) -> Result<Value> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);

        if Self::wants_json(request) {
            let body = serde_json::to_string(&Self::canned_estimate())?;
            return Ok(json!({
                "candidates": [{ "content": { "parts": [{ "text": body }] } }],
            }));
        }

        let (width, height) = Self::base_dimensions(request);
        let (r, g, b) = color_from_prompt(&Self::prompt_text(request));
        let mut image = RgbImage::new(width, height);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .context("dryrun image encode failed")?;

        Ok(json!({
            "candidates": [{
                "content": {
                    "parts": [{
                        "inlineData": {
                            "mimeType": "image/png",
                            "data": BASE64.encode(bytes.into_inner()),
                        }
                    }]
                }
            }],
        }))
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// A produced render plus the request/response record for receipts.
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub image: ImageReference,
    pub request: Value,
    pub response_summary: Value,
}

/// A validated estimate plus the request/response record for receipts.
#[derive(Debug, Clone)]
pub struct EstimateOutcome {
    pub estimate: CostEstimate,
    pub request: Value,
    pub response_summary: Value,
}

/// Request/response boundary to the generative backend, covering design
/// generation, design adjustment, and cost estimation.
pub struct DesignGateway {
    transport: Box<dyn ContentTransport>,
    render_model: String,
    estimate_model: String,
}

impl DesignGateway {
    /// Builds the production gateway. Fails fast when no backend credential
    /// is configured.
    pub fn from_env() -> Result<Self, StudioError> {
        Ok(Self::with_transport(Box::new(HttpTransport::from_env()?)))
    }

    pub fn with_transport(transport: Box<dyn ContentTransport>) -> Self {
        Self {
            transport,
            render_model: non_empty_env("WHITEOUT_RENDER_MODEL")
                .unwrap_or_else(|| DEFAULT_RENDER_MODEL.to_string()),
            estimate_model: non_empty_env("WHITEOUT_ESTIMATE_MODEL")
                .unwrap_or_else(|| DEFAULT_ESTIMATE_MODEL.to_string()),
        }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Redesigns the base room photo. With a reference image present the
    /// instruction transfers lighting, materials, and palette only; the base
    /// image always constrains structure and aspect ratio.
    pub fn generate_design(
        &self,
        base: &ImageReference,
        reference: Option<&ImageReference>,
    ) -> Result<RenderOutcome, StudioError> {
        let mut parts = vec![inline_image_part(base)];
        if let Some(reference) = reference {
            parts.push(inline_image_part(reference));
        }
        parts.push(json!({ "text": generation_prompt(reference.is_some()) }));

        let request = BackendRequest {
            model: self.render_model.clone(),
            parts,
            generation_config: render_generation_config(),
            system_instruction: Some(SYSTEM_INSTRUCTION.to_string()),
        };
        let payload = self
            .transport
            .dispatch(&request)
            .map_err(|err| StudioError::Generation(error_chain_text(&err, 512)))?;

        let image = extract_inline_image(&payload)
            .ok_or_else(|| StudioError::Generation(NO_RENDER_MESSAGE.to_string()))?;
        Ok(RenderOutcome {
            image,
            request: request.payload(),
            response_summary: response_summary(&payload),
        })
    }

    /// Applies a free-text adjustment to the current render, optionally with
    /// a supporting visual reference. Rejects an empty instruction before
    /// anything reaches the transport.
    pub fn adjust_design(
        &self,
        current: &ImageReference,
        instruction: &str,
        support: Option<&ImageReference>,
    ) -> Result<RenderOutcome, StudioError> {
        if instruction.trim().is_empty() {
            return Err(StudioError::Validation(
                "Adjustment instructions cannot be empty.".to_string(),
            ));
        }

        let mut parts = vec![inline_image_part(current)];
        if let Some(support) = support {
            parts.push(inline_image_part(support));
        }
        parts.push(json!({ "text": adjustment_prompt(instruction, support.is_some()) }));

        let request = BackendRequest {
            model: self.render_model.clone(),
            parts,
            generation_config: render_generation_config(),
            system_instruction: Some(SYSTEM_INSTRUCTION.to_string()),
        };
        let payload = self
            .transport
            .dispatch(&request)
            .map_err(|err| StudioError::Adjustment(error_chain_text(&err, 512)))?;

        let image = extract_inline_image(&payload)
            .ok_or_else(|| StudioError::Adjustment(NO_ADJUSTED_RENDER_MESSAGE.to_string()))?;
        Ok(RenderOutcome {
            image,
            request: request.payload(),
            response_summary: response_summary(&payload),
        })
    }

    /// Requests the itemized estimate for an image. The declared response
    /// schema is re-validated structurally; a non-conforming body is a
    /// schema violation, never coerced into a partial estimate.
    pub fn estimate_cost(&self, image: &ImageReference) -> Result<EstimateOutcome, StudioError> {
        let mut generation_config = Map::new();
        generation_config.insert(
            "responseMimeType".to_string(),
            Value::String("application/json".to_string()),
        );
        generation_config.insert("responseSchema".to_string(), estimate_response_schema());

        let request = BackendRequest {
            model: self.estimate_model.clone(),
            parts: vec![inline_image_part(image), json!({ "text": ESTIMATION_PROMPT })],
            generation_config,
            system_instruction: None,
        };
        let payload = self
            .transport
            .dispatch(&request)
            .map_err(|err| StudioError::Estimation(error_chain_text(&err, 512)))?;

        let body = extract_text(&payload).unwrap_or_default();
        let body = body.trim();
        if body.is_empty() {
            return Err(StudioError::Estimation(
                "The model returned an empty response for the cost estimate.".to_string(),
            ));
        }
        let parsed: Value = serde_json::from_str(body).map_err(|err| {
            StudioError::SchemaValidation(format!(
                "The model returned a malformed JSON body for the cost estimate: {err}."
            ))
        })?;
        let estimate = decode_estimate(&parsed)?;
        Ok(EstimateOutcome {
            estimate,
            request: request.payload(),
            response_summary: response_summary(&payload),
        })
    }
}

fn render_generation_config() -> Map<String, Value> {
    let mut config = Map::new();
    config.insert(
        "responseModalities".to_string(),
        json!(["IMAGE", "TEXT"]),
    );
    config
}

fn generation_prompt(with_reference: bool) -> String {
    if with_reference {
        "Analyze the two provided images. The first image is a room that needs a redesign. \
         The second image is a style reference. Your task is to generate a photorealistic \
         interior design rendering of the first room, but apply the aesthetic from the second \
         image. Specifically, use the second image ONLY for its lighting, material textures, \
         and overall color palette. DO NOT copy any furniture or layout elements from the \
         second image. The final design must maintain the structure and layout of the first \
         image. CRITICAL COMMAND: The output image's aspect ratio MUST EXACTLY MATCH the \
         aspect ratio of the first input image. Do not crop, stretch, or change it to 1:1. \
         This is the most important rule."
            .to_string()
    } else {
        "Generate a photorealistic, high-quality interior design rendering based on the \
         provided image. Maintain the original room's core structure and layout but elevate \
         the design, materials, and lighting to a professional, aesthetically pleasing \
         standard. CRITICAL COMMAND: The output image's aspect ratio MUST EXACTLY MATCH the \
         aspect ratio of the uploaded image. Do not crop, stretch, or change it to 1:1. This \
         is the most important rule."
            .to_string()
    }
}

fn adjustment_prompt(instruction: &str, with_support: bool) -> String {
    let instruction = instruction.trim();
    if with_support {
        format!(
            "Using the first image as the base, apply the following adjustment: \
             \"{instruction}\". Use the second image as an additional visual reference for \
             this change. Maintain the photorealistic quality and overall style. CRITICAL \
             COMMAND: The output image's aspect ratio MUST EXACTLY MATCH the aspect ratio of \
             the first input image."
        )
    } else {
        format!(
            "Apply the following adjustment to the provided image: \"{instruction}\". \
             Maintain the photorealistic quality and the overall style of the image, only \
             changing what is requested. CRITICAL COMMAND: The output image's aspect ratio \
             MUST EXACTLY MATCH the aspect ratio of the provided input image. Do not modify \
             the dimensions. Output only the modified image."
        )
    }
}

fn inline_image_part(reference: &ImageReference) -> Value {
    json!({
        "inlineData": {
            "mimeType": reference.media_type,
            "data": reference.encoded_bytes,
        }
    })
}

/// Pulls the first inline image out of a `generateContent` response. A
/// response with no image part is how the backend declines a request.
fn extract_inline_image(payload: &Value) -> Option<ImageReference> {
    let candidates = payload.get("candidates").and_then(Value::as_array)?;
    for candidate in candidates {
        let Some(parts) = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
        else {
            continue;
        };
        for part in parts {
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty());
            let Some(data) = data else { continue };
            let media_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            return Some(ImageReference::new(media_type, data));
        }
    }
    None
}

/// Concatenates the text parts of the first candidate.
fn extract_text(payload: &Value) -> Option<String> {
    let candidate = payload
        .get("candidates")
        .and_then(Value::as_array)?
        .first()?;
    let parts = candidate
        .get("content")
        .and_then(Value::as_object)
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)?;
    let text = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<&str>>()
        .join("");
    (!text.is_empty()).then_some(text)
}

fn response_summary(payload: &Value) -> Value {
    json!({
        "candidates": payload
            .get("candidates")
            .and_then(Value::as_array)
            .map(|rows| rows.len())
            .unwrap_or(0),
        "usage_metadata": payload.get("usageMetadata").cloned().unwrap_or(Value::Null),
    })
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Reads a user-selected image file into a transportable reference. The
/// media type comes from the file extension; unsupported types and files
/// over the upload ceiling are rejected before the read.
pub fn ingest_image(path: &Path) -> Result<ImageReference, StudioError> {
    let media_type = mime_for_path(path)
        .filter(|media_type| is_accepted_media_type(media_type))
        .ok_or_else(|| {
            StudioError::Validation(format!(
                "Unsupported image type for {} (accepted: {}).",
                path.display(),
                ACCEPTED_MEDIA_TYPES.join(", ")
            ))
        })?;

    if let Ok(metadata) = fs::metadata(path) {
        if metadata.len() > MAX_UPLOAD_BYTES {
            return Err(StudioError::Validation(format!(
                "{} exceeds the 10 MB upload limit.",
                path.display()
            )));
        }
    }

    let bytes = fs::read(path)
        .map_err(|err| StudioError::Ingestion(format!("{} ({err})", path.display())))?;
    if bytes.len() as u64 > MAX_UPLOAD_BYTES {
        return Err(StudioError::Validation(format!(
            "{} exceeds the 10 MB upload limit.",
            path.display()
        )));
    }
    Ok(ImageReference::new(media_type, BASE64.encode(bytes)))
}

pub fn decode_image_bytes(reference: &ImageReference) -> Result<Vec<u8>> {
    BASE64
        .decode(reference.encoded_bytes.as_bytes())
        .context("image base64 decode failed")
}

pub fn decode_image(reference: &ImageReference) -> Result<DynamicImage> {
    let bytes = decode_image_bytes(reference)?;
    image::load_from_memory(&bytes).context("image decode failed")
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn extension_for_media_type(media_type: &str) -> &'static str {
    let lowered = media_type.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    "png"
}

// ---------------------------------------------------------------------------
// Annotated report renderer
// ---------------------------------------------------------------------------

/// A highlight region in rendered-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayRect {
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
}

/// Scales a normalized bounding box to a displayed image's dimensions.
pub fn overlay_rect(bounding_box: &BoundingBox, display_width: f64, display_height: f64) -> OverlayRect {
    OverlayRect {
        top: bounding_box.y_min * display_height,
        left: bounding_box.x_min * display_width,
        width: (bounding_box.x_max - bounding_box.x_min) * display_width,
        height: (bounding_box.y_max - bounding_box.y_min) * display_height,
    }
}

/// Which item highlights are visible: the hovered item's box during normal
/// interaction, every box while an export capture is in progress.
pub fn visible_boxes(item_count: usize, hovered: Option<usize>, exporting: bool) -> Vec<usize> {
    if exporting {
        return (0..item_count).collect();
    }
    hovered.filter(|index| *index < item_count).into_iter().collect()
}

const HIGHLIGHT_COLOR: [u8; 3] = [59, 130, 246];
const HIGHLIGHT_FILL_ALPHA: f64 = 0.3;
const HIGHLIGHT_BORDER_PX: u32 = 2;

/// Burns every item's highlight region into a copy of the source image.
/// This is the export capture: a static snapshot with no hover concept, so
/// all boxes are rendered simultaneously.
pub fn annotate_estimate_image(source: &DynamicImage, estimate: &CostEstimate) -> RgbImage {
    let mut canvas = source.to_rgb8();
    let (width, height) = (canvas.width(), canvas.height());
    if width == 0 || height == 0 {
        return canvas;
    }

    for item in &estimate.items {
        let rect = overlay_rect(&item.bounding_box, width as f64, height as f64);
        let x0 = (rect.left.round().max(0.0) as u32).min(width - 1);
        let y0 = (rect.top.round().max(0.0) as u32).min(height - 1);
        let x1 = ((rect.left + rect.width).round().max(0.0) as u32).clamp(x0 + 1, width);
        let y1 = ((rect.top + rect.height).round().max(0.0) as u32).clamp(y0 + 1, height);

        for y in y0..y1 {
            for x in x0..x1 {
                let on_border = x < x0 + HIGHLIGHT_BORDER_PX
                    || x + HIGHLIGHT_BORDER_PX >= x1
                    || y < y0 + HIGHLIGHT_BORDER_PX
                    || y + HIGHLIGHT_BORDER_PX >= y1;
                let pixel = canvas.get_pixel_mut(x, y);
                if on_border {
                    *pixel = Rgb(HIGHLIGHT_COLOR);
                } else {
                    *pixel = blend(*pixel, HIGHLIGHT_COLOR, HIGHLIGHT_FILL_ALPHA);
                }
            }
        }
    }
    canvas
}

fn blend(base: Rgb<u8>, overlay: [u8; 3], alpha: f64) -> Rgb<u8> {
    let mut out = [0u8; 3];
    for channel in 0..3 {
        let mixed = base.0[channel] as f64 * (1.0 - alpha) + overlay[channel] as f64 * alpha;
        out[channel] = mixed.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

// ---------------------------------------------------------------------------
// Paginated report
// ---------------------------------------------------------------------------

const A4_WIDTH_MM: f64 = 210.0;
const A4_HEIGHT_MM: f64 = 297.0;
const PAGE_MARGIN_MM: f64 = 15.0;
const CONTENT_TOP_MM: f64 = 20.0;
// Helvetica's average advance width, as a fraction of the font size.
const GLYPH_WIDTH_EM: f64 = 0.5;
const PT_TO_MM: f64 = 0.352778;

/// Vertical cursor measured from the top of an A4 page.
#[derive(Debug, Clone, Copy)]
struct PageCursor {
    y: f64,
}

impl PageCursor {
    fn new(y: f64) -> Self {
        Self { y }
    }

    fn advance(&mut self, delta: f64) {
        self.y += delta;
    }

    /// True when the next block of `needed` millimeters would run past the
    /// bottom margin.
    fn needs_break(&self, needed: f64) -> bool {
        self.y + needed > A4_HEIGHT_MM - PAGE_MARGIN_MM
    }
}

fn approx_text_width_mm(text: &str, font_size_pt: f64) -> f64 {
    text.chars().count() as f64 * font_size_pt * PT_TO_MM * GLYPH_WIDTH_EM
}

fn max_chars_for_width(width_mm: f64, font_size_pt: f64) -> usize {
    let char_width = font_size_pt * PT_TO_MM * GLYPH_WIDTH_EM;
    ((width_mm / char_width).floor() as usize).max(1)
}

/// Greedy word wrap; words longer than a line are split hard.
fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word = word;
        while word.chars().count() > max_chars {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let split: String = word.chars().take(max_chars).collect();
            word = &word[split.len()..];
            lines.push(split);
        }
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > max_chars && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

/// Currency with en-AU style thousands separators; whole-dollar amounts
/// print without a fraction.
pub fn format_currency(amount: f64) -> String {
    let cents = (amount * 100.0).round() as i64;
    let dollars = cents / 100;
    let fraction = (cents % 100).abs();
    let mut digits = dollars.abs().to_string();
    let mut grouped = String::new();
    while digits.len() > 3 {
        let split = digits.len() - 3;
        grouped = format!(",{}{}", &digits[split..], grouped);
        digits.truncate(split);
    }
    grouped = format!("{digits}{grouped}");
    let sign = if cents < 0 { "-" } else { "" };
    if fraction == 0 {
        format!("{sign}${grouped}")
    } else {
        format!("{sign}${grouped}.{fraction:02}")
    }
}

struct ReportFonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    italic: IndirectFontRef,
}

fn text_at(
    layer: &PdfLayerReference,
    fonts: &IndirectFontRef,
    text: &str,
    size_pt: f64,
    x_mm: f64,
    y_from_top_mm: f64,
) {
    layer.use_text(text, size_pt as f32, Mm(x_mm as f32), Mm((A4_HEIGHT_MM - y_from_top_mm) as f32), fonts);
}

fn rule_at(layer: &PdfLayerReference, y_from_top_mm: f64, thickness_pt: f64) {
    layer.set_outline_thickness(thickness_pt as f32);
    layer.set_outline_color(Color::Rgb(PdfRgb::new(0.0, 0.0, 0.0, None)));
    layer.add_line(Line {
        points: vec![
            (
                Point::new(Mm(PAGE_MARGIN_MM as f32), Mm((A4_HEIGHT_MM - y_from_top_mm) as f32)),
                false,
            ),
            (
                Point::new(Mm((A4_WIDTH_MM - PAGE_MARGIN_MM) as f32), Mm((A4_HEIGHT_MM - y_from_top_mm) as f32)),
                false,
            ),
        ],
        is_closed: false,
    });
}

fn set_text_gray(layer: &PdfLayerReference, level: f64) {
    layer.set_fill_color(Color::Rgb(PdfRgb::new(level as f32, level as f32, level as f32, None)));
}

fn new_breakdown_page(doc: &PdfDocumentReference) -> PdfLayerReference {
    let (page, layer) = doc.add_page(Mm(A4_WIDTH_MM as f32), Mm(A4_HEIGHT_MM as f32), "Layer 1");
    doc.get_page(page).get_layer(layer)
}

/// Assembles the full report in memory: a title page with the annotated
/// image, then itemized pages with the chosen option per item, then the
/// grand total. Returning bytes instead of writing incrementally means a
/// failed assembly never leaves a partial file behind.
pub fn render_cost_report(
    image: &ImageReference,
    estimate: &CostEstimate,
    selections: &SelectionState,
) -> Result<Vec<u8>, StudioError> {
    let source =
        decode_image(image).map_err(|err| StudioError::Export(error_chain_text(&err, 512)))?;
    let annotated = annotate_estimate_image(&source, estimate);
    let (px_width, px_height) = (annotated.width(), annotated.height());

    let (doc, title_page, title_layer) =
        PdfDocument::new("Design Cost Estimate", Mm(A4_WIDTH_MM as f32), Mm(A4_HEIGHT_MM as f32), "Layer 1");
    let fonts = ReportFonts {
        regular: doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|err| StudioError::Export(err.to_string()))?,
        bold: doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|err| StudioError::Export(err.to_string()))?,
        italic: doc
            .add_builtin_font(BuiltinFont::HelveticaOblique)
            .map_err(|err| StudioError::Export(err.to_string()))?,
    };

    // Page 1: title and the annotated capture.
    let layer = doc.get_page(title_page).get_layer(title_layer);
    let title = "Design Cost Estimate";
    let title_x = (A4_WIDTH_MM - approx_text_width_mm(title, 22.0)) / 2.0;
    text_at(&layer, &fonts.bold, title, 22.0, title_x.max(PAGE_MARGIN_MM), 20.0);

    let frame_width = A4_WIDTH_MM - 2.0 * 10.0;
    let frame_height = A4_HEIGHT_MM - 30.0 - PAGE_MARGIN_MM;
    let mut image_width_mm = frame_width;
    let mut image_height_mm = px_height as f64 * image_width_mm / px_width as f64;
    if image_height_mm > frame_height {
        image_height_mm = frame_height;
        image_width_mm = px_width as f64 * image_height_mm / px_height as f64;
    }
    let dpi = px_width as f64 * 25.4 / image_width_mm;
    let pdf_image = PdfImage::from(ImageXObject {
        width: Px(px_width as usize),
        height: Px(px_height as usize),
        color_space: ColorSpace::Rgb,
        bits_per_component: ColorBits::Bit8,
        interpolate: true,
        image_data: annotated.into_raw(),
        image_filter: None,
        smask: None,
        clipping_bbox: None,
    });
    pdf_image.add_to_layer(
        layer.clone(),
        ImageTransform {
            translate_x: Some(Mm(((A4_WIDTH_MM - image_width_mm) / 2.0) as f32)),
            translate_y: Some(Mm((A4_HEIGHT_MM - 30.0 - image_height_mm) as f32)),
            dpi: Some(dpi as f32),
            ..Default::default()
        },
    );

    // Page 2+: itemized breakdown.
    let mut layer = new_breakdown_page(&doc);
    set_text_gray(&layer, 0.0);
    text_at(&layer, &fonts.bold, "Itemized Breakdown", 18.0, PAGE_MARGIN_MM, 20.0);
    let mut cursor = PageCursor::new(35.0);

    let description_width = A4_WIDTH_MM - 2.0 * PAGE_MARGIN_MM;
    let description_chars = max_chars_for_width(description_width, 10.0);

    for (index, item) in estimate.items.iter().enumerate() {
        let option = &item.options[selections.option_for(index)];
        let description_lines = wrap_text(&option.description, description_chars);
        let block_height = 13.0 + description_lines.len() as f64 * 4.0 + 12.0;
        if cursor.needs_break(block_height) {
            layer = new_breakdown_page(&doc);
            cursor = PageCursor::new(CONTENT_TOP_MM);
        }

        rule_at(&layer, cursor.y - 5.0, 0.75);

        set_text_gray(&layer, 0.0);
        text_at(&layer, &fonts.bold, &item.label, 14.0, PAGE_MARGIN_MM, cursor.y);
        let cost = format_currency(option.estimated_cost);
        let cost_x = A4_WIDTH_MM - PAGE_MARGIN_MM - approx_text_width_mm(&cost, 12.0);
        text_at(&layer, &fonts.regular, &cost, 12.0, cost_x, cursor.y);

        cursor.advance(7.0);
        text_at(&layer, &fonts.bold, &option.name, 12.0, PAGE_MARGIN_MM, cursor.y);

        cursor.advance(6.0);
        set_text_gray(&layer, 0.4);
        for line in &description_lines {
            text_at(&layer, &fonts.italic, line, 10.0, PAGE_MARGIN_MM, cursor.y);
            cursor.advance(4.0);
        }

        set_text_gray(&layer, 0.0);
        let supplier = format!("Supplier: {}", option.supplier);
        text_at(&layer, &fonts.regular, &supplier, 10.0, PAGE_MARGIN_MM, cursor.y + 2.0);
        cursor.advance(12.0);
    }

    if cursor.needs_break(25.0) {
        layer = new_breakdown_page(&doc);
        cursor = PageCursor::new(CONTENT_TOP_MM);
    }
    rule_at(&layer, cursor.y, 1.5);
    cursor.advance(10.0);
    set_text_gray(&layer, 0.0);
    text_at(&layer, &fonts.bold, "Total Estimated Cost:", 16.0, PAGE_MARGIN_MM, cursor.y);
    let total = format_currency(estimate.total_cost(selections));
    let total_x = A4_WIDTH_MM - PAGE_MARGIN_MM - approx_text_width_mm(&total, 16.0);
    text_at(&layer, &fonts.bold, &total, 16.0, total_x, cursor.y);

    let mut buffer = Vec::new();
    {
        let mut writer = BufWriter::new(&mut buffer);
        doc.save(&mut writer)
            .map_err(|err| StudioError::Export(err.to_string()))?;
        writer
            .flush()
            .map_err(|err| StudioError::Export(err.to_string()))?;
    }
    Ok(buffer)
}

// ---------------------------------------------------------------------------
// Workflow controllers
// ---------------------------------------------------------------------------

/// Design-studio phase, derived from the busy flag and the presence of a
/// live render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudioPhase {
    Idle,
    Generating,
    Generated,
    Adjusting,
}

/// Cost-page phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorPhase {
    Idle,
    Estimating,
    Estimated,
}

/// The upload -> generate -> adjust workflow. Holds the current base,
/// reference, and adjustment-support images plus at most one live render;
/// each successful adjustment replaces the render rather than versioning
/// it. One in-flight call at a time, gated by the busy flag.
pub struct DesignStudio {
    gateway: DesignGateway,
    session_dir: PathBuf,
    events: EventWriter,
    base_image: Option<ImageReference>,
    reference_image: Option<ImageReference>,
    adjustment_image: Option<ImageReference>,
    generated_image: Option<ImageReference>,
    busy: bool,
    status_message: String,
    last_error: Option<String>,
    started_at: String,
    renders: u64,
    adjustments: u64,
}

impl DesignStudio {
    pub fn new(gateway: DesignGateway, session_dir: impl Into<PathBuf>) -> Result<Self> {
        let session_dir = session_dir.into();
        fs::create_dir_all(&session_dir)?;
        let session_id = session_id_for(&session_dir);
        let events = EventWriter::new(session_dir.join("events.jsonl"), session_id);
        events.emit(
            "session_started",
            map_object(json!({
                "surface": "design_studio",
                "transport": gateway.transport_name(),
            })),
        )?;
        Ok(Self {
            gateway,
            session_dir,
            events,
            base_image: None,
            reference_image: None,
            adjustment_image: None,
            generated_image: None,
            busy: false,
            status_message: String::new(),
            last_error: None,
            started_at: now_utc_iso(),
            renders: 0,
            adjustments: 0,
        })
    }

    pub fn phase(&self) -> StudioPhase {
        match (self.busy, self.generated_image.is_some()) {
            (true, false) => StudioPhase::Generating,
            (true, true) => StudioPhase::Adjusting,
            (false, true) => StudioPhase::Generated,
            (false, false) => StudioPhase::Idle,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn base_image(&self) -> Option<&ImageReference> {
        self.base_image.as_ref()
    }

    pub fn generated_image(&self) -> Option<&ImageReference> {
        self.generated_image.as_ref()
    }

    /// A new base photo supersedes the old one and discards the live render
    /// and any stale error.
    pub fn set_base_image(&mut self, image: ImageReference) {
        self.base_image = Some(image);
        self.generated_image = None;
        self.last_error = None;
    }

    pub fn set_reference_image(&mut self, image: ImageReference) {
        self.reference_image = Some(image);
    }

    pub fn clear_reference_image(&mut self) {
        self.reference_image = None;
    }

    pub fn set_adjustment_image(&mut self, image: ImageReference) {
        self.adjustment_image = Some(image);
    }

    pub fn clear_adjustment_image(&mut self) {
        self.adjustment_image = None;
    }

    /// Resumes a prior render (e.g. from a saved artifact) as the live
    /// image so it can be adjusted further.
    pub fn set_generated_image(&mut self, image: ImageReference) {
        self.generated_image = Some(image);
        self.last_error = None;
    }

    /// Generates the redesign for the current base image. The prior render
    /// is discarded only once validation has passed and the request is
    /// about to be dispatched.
    pub fn generate(&mut self) -> Result<ImageReference, StudioError> {
        if self.busy {
            return Err(StudioError::Validation(
                "Another request is already in progress.".to_string(),
            ));
        }
        let Some(base) = self.base_image.clone() else {
            return Err(StudioError::Validation(
                "Please upload a base design image first.".to_string(),
            ));
        };

        self.busy = true;
        self.status_message = "Our AI is re-imagining your space...".to_string();
        self.last_error = None;
        self.generated_image = None;

        let result = self
            .gateway
            .generate_design(&base, self.reference_image.as_ref());
        let result = match result {
            Ok(outcome) => {
                self.generated_image = Some(outcome.image.clone());
                self.renders += 1;
                self.record_render("generate", &outcome);
                Ok(outcome.image)
            }
            Err(err) => Err(self.record_failure("generate", err)),
        };
        self.busy = false;
        result
    }

    /// Applies a free-text adjustment to the live render; on success the
    /// result replaces the render and the support image is consumed.
    pub fn adjust(&mut self, instruction: &str) -> Result<ImageReference, StudioError> {
        if self.busy {
            return Err(StudioError::Validation(
                "Another request is already in progress.".to_string(),
            ));
        }
        let Some(current) = self.generated_image.clone() else {
            return Err(StudioError::Validation(
                "There is no generated image to adjust.".to_string(),
            ));
        };
        if instruction.trim().is_empty() {
            return Err(StudioError::Validation(
                "Please enter an adjustment instruction.".to_string(),
            ));
        }

        self.busy = true;
        self.status_message = "Applying your adjustments...".to_string();
        self.last_error = None;

        let result = self
            .gateway
            .adjust_design(&current, instruction, self.adjustment_image.as_ref());
        let result = match result {
            Ok(outcome) => {
                self.generated_image = Some(outcome.image.clone());
                self.adjustment_image = None;
                self.adjustments += 1;
                self.record_render("adjust", &outcome);
                Ok(outcome.image)
            }
            Err(err) => Err(self.record_failure("adjust", err)),
        };
        self.busy = false;
        result
    }

    /// Offers the live render as a direct download under the conventional
    /// filename.
    pub fn save_render(&self, dir: &Path) -> Result<PathBuf, StudioError> {
        let Some(image) = self.generated_image.as_ref() else {
            return Err(StudioError::Validation(
                "There is no generated image to download.".to_string(),
            ));
        };
        let bytes = decode_image_bytes(image)
            .map_err(|err| StudioError::Export(error_chain_text(&err, 512)))?;
        let path = dir.join(RENDER_FILENAME);
        fs::write(&path, bytes)
            .map_err(|err| StudioError::Export(format!("{} ({err})", path.display())))?;
        Ok(path)
    }

    pub fn finish(&self) -> Result<()> {
        let summary = SessionSummary {
            session_id: self.events.session_id().to_string(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            renders: self.renders,
            adjustments: self.adjustments,
            estimates: 0,
            exports: 0,
        };
        write_summary(&self.session_dir.join("summary.json"), &summary)?;
        self.events.emit("session_finished", EventPayload::new())?;
        Ok(())
    }

    fn record_render(&mut self, action: &str, outcome: &RenderOutcome) {
        let artifact_id = uuid::Uuid::new_v4().to_string();
        match persist_render_artifact(
            &self.session_dir,
            action,
            &artifact_id,
            &outcome.image,
            &outcome.request,
            &outcome.response_summary,
        ) {
            Ok(path) => {
                let _ = self.events.emit(
                    "render_created",
                    map_object(json!({
                        "action": action,
                        "artifact_id": artifact_id,
                        "image_path": path.to_string_lossy().to_string(),
                    })),
                );
            }
            Err(err) => {
                let _ = self.events.emit(
                    "artifact_write_failed",
                    map_object(json!({
                        "action": action,
                        "message": error_chain_text(&err, 512),
                    })),
                );
            }
        }
        self.status_message.clear();
    }

    fn record_failure(&mut self, action: &str, err: StudioError) -> StudioError {
        self.last_error = Some(err.to_string());
        self.status_message.clear();
        let _ = self.events.emit(
            "operation_failed",
            map_object(json!({
                "action": action,
                "kind": err.kind(),
                "message": err.to_string(),
            })),
        );
        err
    }
}

/// The independent cost page: its own image, estimate, and selection state,
/// decoupled from the design-studio workflow.
pub struct CostEstimator {
    gateway: DesignGateway,
    session_dir: PathBuf,
    events: EventWriter,
    image: Option<ImageReference>,
    estimate: Option<CostEstimate>,
    selections: SelectionState,
    hovered: Option<usize>,
    exporting: bool,
    busy: bool,
    status_message: String,
    last_error: Option<String>,
    started_at: String,
    estimates: u64,
    exports: u64,
}

impl CostEstimator {
    pub fn new(gateway: DesignGateway, session_dir: impl Into<PathBuf>) -> Result<Self> {
        let session_dir = session_dir.into();
        fs::create_dir_all(&session_dir)?;
        let session_id = session_id_for(&session_dir);
        let events = EventWriter::new(session_dir.join("events.jsonl"), session_id);
        events.emit(
            "session_started",
            map_object(json!({
                "surface": "cost_estimator",
                "transport": gateway.transport_name(),
            })),
        )?;
        Ok(Self {
            gateway,
            session_dir,
            events,
            image: None,
            estimate: None,
            selections: SelectionState::default(),
            hovered: None,
            exporting: false,
            busy: false,
            status_message: String::new(),
            last_error: None,
            started_at: now_utc_iso(),
            estimates: 0,
            exports: 0,
        })
    }

    pub fn phase(&self) -> EstimatorPhase {
        if self.busy {
            EstimatorPhase::Estimating
        } else if self.estimate.is_some() {
            EstimatorPhase::Estimated
        } else {
            EstimatorPhase::Idle
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn image(&self) -> Option<&ImageReference> {
        self.image.as_ref()
    }

    pub fn estimate(&self) -> Option<&CostEstimate> {
        self.estimate.as_ref()
    }

    pub fn selections(&self) -> &SelectionState {
        &self.selections
    }

    /// A new photo supersedes the old one; its estimate no longer describes
    /// anything on screen, so both it and the selections are discarded.
    pub fn set_image(&mut self, image: ImageReference) {
        self.image = Some(image);
        self.estimate = None;
        self.selections = SelectionState::default();
        self.hovered = None;
        self.last_error = None;
    }

    /// Requests a fresh estimate for the current image. The prior estimate
    /// stays installed until a validated replacement arrives; the estimate
    /// and its reset selection map are installed in one step so no observer
    /// sees one without the other.
    pub fn analyze(&mut self) -> Result<(), StudioError> {
        if self.busy {
            return Err(StudioError::Validation(
                "Another request is already in progress.".to_string(),
            ));
        }
        let Some(image) = self.image.clone() else {
            return Err(StudioError::Validation(
                "Please upload an image to analyze.".to_string(),
            ));
        };

        self.busy = true;
        self.status_message = "Analyzing design and preparing your comparison...".to_string();
        self.last_error = None;

        let result = match self.gateway.estimate_cost(&image) {
            Ok(outcome) => {
                self.selections = SelectionState::for_estimate(&outcome.estimate);
                self.estimate = Some(outcome.estimate.clone());
                self.estimates += 1;
                self.record_estimate(&outcome);
                Ok(())
            }
            Err(err) => Err(self.record_failure("estimate", err)),
        };
        self.busy = false;
        result
    }

    /// Records the user's tier choice for one item.
    pub fn select(&mut self, item_index: usize, option_index: usize) -> Result<(), StudioError> {
        let Some(estimate) = self.estimate.as_ref() else {
            return Err(StudioError::Validation(
                "There is no cost estimate yet.".to_string(),
            ));
        };
        self.selections.select(estimate, item_index, option_index)
    }

    pub fn total_cost(&self) -> f64 {
        self.estimate
            .as_ref()
            .map(|estimate| estimate.total_cost(&self.selections))
            .unwrap_or(0.0)
    }

    pub fn hover(&mut self, item_index: Option<usize>) {
        self.hovered = item_index;
    }

    /// Highlight regions the renderer should draw right now.
    pub fn visible_overlay(&self) -> Vec<usize> {
        let count = self.estimate.as_ref().map(CostEstimate::len).unwrap_or(0);
        visible_boxes(count, self.hovered, self.exporting)
    }

    /// Exports the annotated report. All boxes are switched visible for the
    /// capture, the document is assembled in memory, and a single write
    /// produces the artifact; any failure leaves no partial file.
    pub fn export_report(&mut self, path: Option<&Path>) -> Result<PathBuf, StudioError> {
        if self.busy {
            return Err(StudioError::Validation(
                "Another request is already in progress.".to_string(),
            ));
        }
        let (Some(image), Some(estimate)) = (self.image.clone(), self.estimate.clone()) else {
            return Err(StudioError::Validation(
                "Cannot export PDF. Missing data or elements.".to_string(),
            ));
        };

        self.busy = true;
        self.exporting = true;
        let default_path = self.session_dir.join(REPORT_FILENAME);
        let target = path.unwrap_or(&default_path).to_path_buf();

        let result = render_cost_report(&image, &estimate, &self.selections)
            .and_then(|bytes| {
                fs::write(&target, bytes)
                    .map_err(|err| StudioError::Export(format!("{} ({err})", target.display())))
            });
        let result = match result {
            Ok(()) => {
                self.exports += 1;
                let _ = self.events.emit(
                    "report_exported",
                    map_object(json!({
                        "report_path": target.to_string_lossy().to_string(),
                        "items": estimate.len(),
                        "total": estimate.total_cost(&self.selections),
                    })),
                );
                Ok(target)
            }
            Err(err) => Err(self.record_failure("export", err)),
        };
        self.exporting = false;
        self.busy = false;
        result
    }

    pub fn finish(&self) -> Result<()> {
        let summary = SessionSummary {
            session_id: self.events.session_id().to_string(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            renders: 0,
            adjustments: 0,
            estimates: self.estimates,
            exports: self.exports,
        };
        write_summary(&self.session_dir.join("summary.json"), &summary)?;
        self.events.emit("session_finished", EventPayload::new())?;
        Ok(())
    }

    fn record_estimate(&mut self, outcome: &EstimateOutcome) {
        let digest = stable_hash(&outcome.request);
        let receipt = build_receipt(
            "estimate",
            &digest,
            &outcome.request,
            &outcome.response_summary,
            None,
        );
        let receipt_path = self
            .session_dir
            .join(format!("receipt-{}.json", &digest[..12]));
        if let Err(err) = write_receipt(&receipt_path, &receipt) {
            let _ = self.events.emit(
                "artifact_write_failed",
                map_object(json!({
                    "action": "estimate",
                    "message": error_chain_text(&err, 512),
                })),
            );
        }
        let _ = self.events.emit(
            "estimate_ready",
            map_object(json!({
                "items": self.estimate.as_ref().map(CostEstimate::len).unwrap_or(0),
                "total": self.total_cost(),
            })),
        );
        self.status_message.clear();
    }

    fn record_failure(&mut self, action: &str, err: StudioError) -> StudioError {
        self.last_error = Some(err.to_string());
        self.status_message.clear();
        let _ = self.events.emit(
            "operation_failed",
            map_object(json!({
                "action": action,
                "kind": err.kind(),
                "message": err.to_string(),
            })),
        );
        err
    }
}

fn persist_render_artifact(
    session_dir: &Path,
    action: &str,
    artifact_id: &str,
    image: &ImageReference,
    request: &Value,
    response_summary: &Value,
) -> Result<PathBuf> {
    let stamp = timestamp_millis();
    let ext = extension_for_media_type(&image.media_type);
    let image_path = session_dir.join(format!("render-{stamp}.{ext}"));
    fs::write(&image_path, decode_image_bytes(image)?)
        .with_context(|| format!("failed to write {}", image_path.display()))?;

    let digest = stable_hash(request);
    let receipt = build_receipt(action, &digest, request, response_summary, Some(&image_path));
    let receipt_path = session_dir.join(format!("receipt-{stamp}-{}.json", &artifact_id[..8]));
    write_receipt(&receipt_path, &receipt)?;
    Ok(image_path)
}

fn session_id_for(session_dir: &Path) -> String {
    session_dir
        .file_name()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(backend: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{backend} response body read failed"))?;
    if !status.is_success() {
        anyhow::bail!(
            "{backend} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{backend} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn stable_hash(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

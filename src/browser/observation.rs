//! Page observation: screenshot within a byte budget plus labeled elements.

use super::{bounded, BrowserPage, ElementLabel, ScrollPosition};
use crate::providers::ImagePayload;
use crate::util::{collapse_whitespace, truncate_with_ellipsis};
use anyhow::{Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const JPEG_QUALITIES: [u8; 3] = [80, 60, 40];
const MAX_DOWNSCALES: u32 = 4;
const MIN_DIMENSION: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    pub max_elements: usize,
    pub screenshot_budget_bytes: usize,
    pub max_element_text_chars: usize,
    /// Upper bound on each page read during capture.
    pub action_timeout_ms: u64,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            max_elements: 60,
            screenshot_budget_bytes: 1_500_000,
            max_element_text_chars: 80,
            action_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub url: String,
    pub title: String,
    pub screenshot: Option<ImagePayload>,
    pub elements: Vec<ElementLabel>,
    pub scroll: Option<ScrollPosition>,
    pub signature: Option<u64>,
    /// Screenshot size relative to the page's own pixels; below 1.0 after a
    /// downscale.
    pub image_scale: f64,
}

/// Capture the current page. Only the URL is mandatory: a missing
/// screenshot or element list degrades the observation instead of failing it.
pub async fn capture(page: &dyn BrowserPage, config: &ObservationConfig) -> Result<Observation> {
    let limit = Duration::from_millis(config.action_timeout_ms);
    let url = bounded(limit, "URL read", page.current_url())
        .await
        .context("failed to read current URL")?;
    let title = bounded(limit, "title read", page.title())
        .await
        .unwrap_or_default();

    let (screenshot, image_scale) = match bounded(limit, "screenshot", page.screenshot()).await {
        Ok(png) => match fit_screenshot(&png, config.screenshot_budget_bytes) {
            Ok((payload, scale)) => (Some(payload), scale),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "Screenshot could not be encoded");
                (None, 1.0)
            }
        },
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "Screenshot capture failed");
            (None, 1.0)
        }
    };

    let elements = match bounded(
        limit,
        "element extraction",
        page.query_elements(config.max_elements),
    )
    .await
    {
        Ok(elements) => sanitize_elements(elements, config),
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "Element extraction failed");
            Vec::new()
        }
    };

    Ok(Observation {
        url,
        title,
        screenshot,
        elements,
        scroll: bounded(limit, "scroll read", page.scroll_position())
            .await
            .ok(),
        signature: bounded(limit, "signature read", page.content_signature())
            .await
            .ok(),
        image_scale,
    })
}

/// Encode a PNG screenshot for the model, re-encoding as JPEG and then
/// halving its size until it fits `budget` bytes. Returns the payload and the
/// scale applied.
pub fn fit_screenshot(png: &[u8], budget: usize) -> Result<(ImagePayload, f64)> {
    let image = image::load_from_memory(png).context("screenshot is not a decodable image")?;
    if png.len() <= budget {
        return Ok((payload("image/png", png, &image), 1.0));
    }

    for quality in JPEG_QUALITIES {
        let jpeg = encode_jpeg(&image, quality)?;
        if jpeg.len() <= budget {
            tracing::debug!(quality, bytes = jpeg.len(), "Screenshot re-encoded as JPEG");
            return Ok((payload("image/jpeg", &jpeg, &image), 1.0));
        }
    }

    let min_quality = JPEG_QUALITIES[JPEG_QUALITIES.len() - 1];
    let mut scaled = image;
    let mut scale = 1.0;
    let mut smallest = None;
    for _ in 0..MAX_DOWNSCALES {
        let (width, height) = (scaled.width() / 2, scaled.height() / 2);
        if width < MIN_DIMENSION || height < MIN_DIMENSION {
            break;
        }
        scaled = scaled.resize_exact(width, height, FilterType::Triangle);
        scale /= 2.0;
        let jpeg = encode_jpeg(&scaled, min_quality)?;
        if jpeg.len() <= budget {
            tracing::debug!(scale, bytes = jpeg.len(), "Screenshot downscaled");
            return Ok((payload("image/jpeg", &jpeg, &scaled), scale));
        }
        smallest = Some((payload("image/jpeg", &jpeg, &scaled), scale));
    }

    match smallest {
        Some(best) => {
            tracing::warn!(budget, "Screenshot still over budget at minimum size");
            Ok(best)
        }
        None => Ok((
            payload("image/jpeg", &encode_jpeg(&scaled, min_quality)?, &scaled),
            scale,
        )),
    }
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&rgb)
        .context("failed to encode screenshot as JPEG")?;
    Ok(out)
}

fn payload(media_type: &str, bytes: &[u8], image: &DynamicImage) -> ImagePayload {
    ImagePayload {
        media_type: media_type.to_string(),
        data_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
        width: image.width(),
        height: image.height(),
    }
}

/// Drop invisible boxes, tidy text fields and cap the count.
pub fn sanitize_elements(elements: Vec<ElementLabel>, config: &ObservationConfig) -> Vec<ElementLabel> {
    let tidy = |value: Option<String>| {
        value
            .map(|v| collapse_whitespace(&v))
            .filter(|v| !v.is_empty())
            .map(|v| truncate_with_ellipsis(&v, config.max_element_text_chars))
    };
    elements
        .into_iter()
        .filter(|el| !el.bbox.is_empty())
        .take(config.max_elements)
        .map(|el| ElementLabel {
            text: tidy(el.text),
            role: tidy(el.role),
            placeholder: tidy(el.placeholder),
            aria_label: tidy(el.aria_label),
            ..el
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::blank_png;
    use crate::browser::{BoundingBox, MockPage};

    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbImage::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(7919) ^ y.wrapping_mul(104_729)).wrapping_mul(2_654_435_761);
            image::Rgb([(v >> 8) as u8, (v >> 16) as u8, (v >> 24) as u8])
        });
        let mut out = std::io::Cursor::new(Vec::new());
        image.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn small_png_passes_through() {
        let png = blank_png(20, 10);
        let (payload, scale) = fit_screenshot(&png, 1_000_000).unwrap();
        assert_eq!(payload.media_type, "image/png");
        assert_eq!((payload.width, payload.height), (20, 10));
        assert_eq!(scale, 1.0);
    }

    #[test]
    fn oversized_png_becomes_jpeg() {
        let png = noisy_png(200, 200);
        let (payload, scale) = fit_screenshot(&png, png.len() - 1).unwrap();
        assert_eq!(payload.media_type, "image/jpeg");
        assert_eq!(scale, 1.0);
    }

    #[test]
    fn noisy_image_is_downscaled() {
        let png = noisy_png(512, 512);
        let (payload, scale) = fit_screenshot(&png, 20_000).unwrap();
        assert_eq!(payload.media_type, "image/jpeg");
        assert!(scale < 1.0);
        assert_eq!(payload.width, (512.0 * scale) as u32);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(fit_screenshot(b"not an image", 10).is_err());
    }

    #[test]
    fn sanitize_filters_and_truncates() {
        let mut hidden = ElementLabel::new(1, "div");
        hidden.bbox = BoundingBox::default();
        let long = ElementLabel::new(2, "a").with_text(format!("  Read\n more {}", "x".repeat(200)));
        let blank = ElementLabel::new(3, "button").with_text("   ");
        let config = ObservationConfig {
            max_element_text_chars: 20,
            ..ObservationConfig::default()
        };
        let out = sanitize_elements(vec![hidden, long, blank], &config);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, 2);
        let text = out[0].text.as_deref().unwrap();
        assert!(text.starts_with("Read more x"));
        assert!(text.ends_with("..."));
        assert_eq!(out[1].text, None);
    }

    #[tokio::test]
    async fn capture_collects_everything() {
        let page = MockPage::new("https://example.com")
            .with_title("Example")
            .with_elements(vec![ElementLabel::new(1, "button").with_text("Go")]);
        let observation = capture(&page, &ObservationConfig::default()).await.unwrap();
        assert_eq!(observation.url, "https://example.com");
        assert_eq!(observation.title, "Example");
        assert_eq!(observation.elements.len(), 1);
        assert!(observation.screenshot.is_some());
        assert_eq!(observation.scroll, Some(ScrollPosition::default()));
    }

    #[tokio::test]
    async fn stalled_screenshot_degrades_after_timeout() {
        let page = MockPage::new("https://example.com")
            .with_elements(vec![ElementLabel::new(1, "button").with_text("Go")]);
        page.stall("screenshot");
        let config = ObservationConfig {
            action_timeout_ms: 50,
            ..ObservationConfig::default()
        };
        let observation = tokio::time::timeout(Duration::from_secs(5), capture(&page, &config))
            .await
            .expect("capture must return once the screenshot times out")
            .unwrap();
        assert!(observation.screenshot.is_none());
        assert_eq!(observation.elements.len(), 1);
    }

    #[tokio::test]
    async fn undecodable_screenshot_degrades() {
        let page = MockPage::new("https://example.com").with_screenshot(b"junk".to_vec());
        let observation = capture(&page, &ObservationConfig::default()).await.unwrap();
        assert!(observation.screenshot.is_none());
        assert_eq!(observation.image_scale, 1.0);
    }
}

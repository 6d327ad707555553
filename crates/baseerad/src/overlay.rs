//! Face box and label drawn onto the displayed frame.

use ab_glyph::{FontArc, PxScale};
use baseera_core::BoundingBox;
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const CYAN: Rgb<u8> = Rgb([0, 255, 255]);

const LABEL_SCALE: f32 = 22.0;
const BOX_THICKNESS: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationKind {
    AwaitingBlink,
    /// Blink seen; waiting for the recognition cooldown.
    Verified,
    Recognized(String),
    Unknown,
}

impl AnnotationKind {
    pub fn label(&self) -> &str {
        match self {
            Self::AwaitingBlink => "Blink!",
            Self::Verified => "Verified",
            Self::Recognized(name) => name,
            Self::Unknown => "Unknown",
        }
    }

    pub fn color(&self) -> Rgb<u8> {
        match self {
            Self::AwaitingBlink => YELLOW,
            Self::Verified => CYAN,
            Self::Recognized(_) => GREEN,
            Self::Unknown => RED,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub region: BoundingBox,
    pub kind: AnnotationKind,
}

/// Renders frames for display. Without a font only the box is drawn.
pub struct Overlay {
    font: Option<FontArc>,
}

impl Overlay {
    pub fn without_labels() -> Self {
        Self { font: None }
    }

    pub fn load(font_path: Option<&Path>) -> Self {
        let Some(path) = font_path else {
            tracing::info!("no overlay font configured; labels disabled");
            return Self::without_labels();
        };
        let font = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| FontArc::try_from_vec(bytes).map_err(|e| e.to_string()));
        match font {
            Ok(font) => Self { font: Some(font) },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "overlay font unusable; labels disabled");
                Self::without_labels()
            }
        }
    }

    pub fn render(&self, frame: &GrayImage, annotation: Option<&Annotation>) -> RgbImage {
        let mut canvas = DynamicImage::ImageLuma8(frame.clone()).to_rgb8();
        if let Some(annotation) = annotation {
            self.annotate(&mut canvas, annotation);
        }
        canvas
    }

    fn annotate(&self, canvas: &mut RgbImage, annotation: &Annotation) {
        let Some((x, y, w, h)) = annotation.region.clamped(canvas.width(), canvas.height()) else {
            return;
        };
        let color = annotation.kind.color();
        for inset in 0..BOX_THICKNESS {
            if w <= 2 * inset || h <= 2 * inset {
                break;
            }
            let rect = Rect::at((x + inset) as i32, (y + inset) as i32).of_size(w - 2 * inset, h - 2 * inset);
            draw_hollow_rect_mut(canvas, rect, color);
        }

        if let Some(font) = &self.font {
            let text_y = (y as i32 - LABEL_SCALE as i32 - 4).max(0);
            draw_text_mut(
                canvas,
                color,
                x as i32,
                text_y,
                PxScale::from(LABEL_SCALE),
                font,
                annotation.kind.label(),
            );
        }
    }
}

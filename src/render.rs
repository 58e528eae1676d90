use crate::errors::{Result, SpoolerError};
use printpdf::{Mm, Op, PdfDocument, PdfPage, PdfSaveOptions, PdfWarnMsg, Pt, RawImage, RawImageData, RawImageFormat, XObjectTransform};
use tracing::{debug, instrument};

/// Converts a raw label image into a document the print system accepts.
///
/// Must be deterministic and free of side effects; the spooler runs it on the
/// blocking thread pool and maps any error to a failed job.
#[cfg_attr(test, mockall::automock)]
pub trait DocumentRenderer: Send + Sync {
    fn render(&self, image: &[u8]) -> Result<Vec<u8>>;
}

/// Renders an image as a single PDF page of exactly the image's size.
///
/// Page size is `pixels / dpi` inches, so at the default 72 DPI one image
/// pixel maps to one PDF point.
#[derive(Debug, Clone)]
pub struct PdfRenderer {
    dpi: f32,
    title: String,
}

impl Default for PdfRenderer {
    fn default() -> Self {
        Self::new(72.0)
    }
}

impl PdfRenderer {
    pub fn new(dpi: f32) -> Self {
        Self {
            dpi,
            title: "Label".to_string(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    fn px_to_mm(&self, px: u32) -> Mm {
        Mm(px as f32 / self.dpi * 25.4)
    }
}

impl DocumentRenderer for PdfRenderer {
    #[instrument(skip(self, image), fields(bytes = image.len()))]
    fn render(&self, image: &[u8]) -> Result<Vec<u8>> {
        let decoded = ::image::load_from_memory(image)
            .map_err(|e| SpoolerError::Render(format!("Failed to decode image: {}", e)))?;

        let (width, height) = (decoded.width(), decoded.height());
        if width == 0 || height == 0 {
            return Err(SpoolerError::Render("Image has no pixels".to_string()));
        }

        let raw = RawImage {
            pixels: RawImageData::U8(decoded.to_rgb8().into_raw()),
            width: width as usize,
            height: height as usize,
            data_format: RawImageFormat::RGB8,
            tag: Vec::new(),
        };

        let mut doc = PdfDocument::new(&self.title);
        let xobject_id = doc.add_image(&raw);

        // Native size at the configured DPI fills the page exactly
        let ops = vec![Op::UseXobject {
            id: xobject_id,
            transform: XObjectTransform {
                translate_x: Some(Pt(0.0)),
                translate_y: Some(Pt(0.0)),
                scale_x: None,
                scale_y: None,
                dpi: Some(self.dpi),
                rotate: None,
            },
        }];

        let page = PdfPage::new(self.px_to_mm(width), self.px_to_mm(height), ops);
        doc.with_pages(vec![page]);

        let mut warnings: Vec<PdfWarnMsg> = Vec::new();
        let output = doc.save(&PdfSaveOptions::default(), &mut warnings);

        debug!(width, height, pdf_bytes = output.len(), warnings = warnings.len(), "Label rendered");
        Ok(output)
    }
}

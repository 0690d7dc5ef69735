use std::{
    fs::File,
    io::BufWriter,
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use printpdf::{
    BuiltinFont, Color, Image, ImageTransform, IndirectFontRef, Line, Mm, PdfDocument,
    PdfDocumentReference, PdfLayerReference, Point, Rgb,
};

use crate::pipeline::state::{GalleryItem, ImageRef};
use crate::storage::LocalStore;

use super::font::{FontResolver, FontSources, FontState};
use super::layout::{
    group_by_batch, measure_row_mm, pad_seq, report_id, sanitize_label, text_width_mm, wrap_text,
    PageCursor, BASE_ROW_MM, CONTENT_WIDTH_MM, ITEM_ESTIMATE_MM, LINE_HEIGHT_MM, MARGIN_MM,
    PAGE_HEIGHT_MM, PAGE_WIDTH_MM,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const EMBED_DPI: f32 = 300.0;
const CHART_HEIGHT_MM: f32 = 70.0;
const IMAGE_HEIGHT_MM: f32 = 60.0;
const ASSET_TIMEOUT_SECS: u64 = 30;

/// Optional summary charts rendered side by side under the report header.
#[derive(Debug, Clone, Default)]
pub struct ChartImages {
    pub pie: Option<ImageRef>,
    pub bar: Option<ImageRef>,
}

pub struct ReportConfig {
    pub output_dir: PathBuf,
    pub font_sources: FontSources,
    /// Durable store for the report sequence counter and the font cache.
    /// `None` (or a store that fails to open) degrades the sequence to a
    /// timestamp.
    pub store_path: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            font_sources: FontSources::default(),
            store_path: Some(PathBuf::from(".corroscan/store.json")),
        }
    }
}

struct ReportFonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    state: FontState,
}

impl ReportFonts {
    fn has_cjk(&self) -> bool {
        self.state.has_cjk()
    }
}

/// Builds the batch-grouped PDF report out of completed gallery items.
/// Asset failures (images, charts, fonts) degrade locally; only an unwritable
/// output file is an error.
pub struct ReportGenerator {
    config: ReportConfig,
    store: Option<LocalStore>,
    client: reqwest::Client,
    fonts: FontResolver,
    font_state: FontState,
}

impl ReportGenerator {
    pub fn new(config: ReportConfig) -> Self {
        let store = config.store_path.as_ref().and_then(|path| {
            match LocalStore::new(path.clone()) {
                Ok(store) => Some(store),
                Err(err) => {
                    log_warn!("local store unavailable, degrading to timestamps: {err:?}");
                    None
                }
            }
        });
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ASSET_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let fonts = FontResolver::new(config.font_sources.clone());
        Self {
            config,
            store,
            client,
            fonts,
            font_state: FontState::Unloaded,
        }
    }

    /// Font decision made for the most recent document.
    pub fn font_state(&self) -> FontState {
        self.font_state
    }

    /// Generates the report. Returns `Ok(None)` for an empty item list — no
    /// file is written and the sequence counter is untouched.
    pub async fn generate(
        &mut self,
        items: &[GalleryItem],
        charts: Option<&ChartImages>,
    ) -> Result<Option<PathBuf>> {
        if items.is_empty() {
            return Ok(None);
        }

        let seq = match &self.store {
            Some(store) => store.next_report_seq(),
            None => Utc::now().timestamp().max(0) as u64,
        };
        let report_id = report_id(Local::now().date_naive(), seq);

        let (doc, page, layer) = PdfDocument::new(
            "Corrosion Detection Report",
            Mm(PAGE_WIDTH_MM),
            Mm(PAGE_HEIGHT_MM),
            "content",
        );
        let mut layer = doc.get_page(page).get_layer(layer);

        // The CJK decision is made once and applies to every label below.
        let (state, font_bytes) = self.fonts.resolve(self.store.as_ref(), &self.client).await;
        self.font_state = state;
        let fonts = match font_bytes {
            Some(bytes) => match doc.add_external_font(bytes.as_slice()) {
                Ok(font) => ReportFonts {
                    regular: font.clone(),
                    bold: font,
                    state,
                },
                Err(err) => {
                    log_warn!("embedding CJK font failed: {err}");
                    self.font_state = FontState::Unavailable;
                    builtin_fonts(&doc)?
                }
            },
            None => builtin_fonts(&doc)?,
        };
        let has_cjk = fonts.has_cjk();

        let mut cursor = PageCursor::new();

        // Header: centered title, then id, timestamp and item count.
        let title = "Corrosion Detection Report";
        let title_x = (PAGE_WIDTH_MM - text_width_mm(title, 18.0)) / 2.0;
        draw_text(&layer, title, 18.0, title_x.max(MARGIN_MM), cursor.y_mm, &fonts.bold);
        cursor.advance(12.0);
        draw_text(
            &layer,
            &format!("Report ID: {report_id}"),
            12.0,
            MARGIN_MM,
            cursor.y_mm,
            &fonts.regular,
        );
        cursor.advance(8.0);
        draw_text(
            &layer,
            &format!("Date: {}", Local::now().format("%Y-%m-%d %H:%M:%S")),
            10.0,
            MARGIN_MM,
            cursor.y_mm,
            &fonts.regular,
        );
        cursor.advance(8.0);
        draw_text(
            &layer,
            &format!("Total Images: {}", items.len()),
            10.0,
            MARGIN_MM,
            cursor.y_mm,
            &fonts.regular,
        );
        cursor.advance(12.0);

        if let Some(charts) = charts {
            let chart_w = CONTENT_WIDTH_MM / 2.0 - 5.0;
            let mut drew = false;
            if let Some(pie) = &charts.pie {
                match self
                    .embed_image(&layer, pie, MARGIN_MM, cursor.y_mm, chart_w, CHART_HEIGHT_MM)
                    .await
                {
                    Ok(()) => drew = true,
                    Err(err) => log_error!("pie chart skipped: {err:?}"),
                }
            }
            if let Some(bar) = &charts.bar {
                match self
                    .embed_image(
                        &layer,
                        bar,
                        MARGIN_MM + chart_w + 10.0,
                        cursor.y_mm,
                        chart_w,
                        CHART_HEIGHT_MM,
                    )
                    .await
                {
                    Ok(()) => drew = true,
                    Err(err) => log_error!("bar chart skipped: {err:?}"),
                }
            }
            if drew {
                cursor.advance(CHART_HEIGHT_MM + 10.0);
            }
        }

        let groups = group_by_batch(items);
        for (b, group) in groups.iter().enumerate() {
            let label_number = group.label_number(b);
            let batch_label = group.display_label(b);
            let batch_title = if has_cjk {
                format!("批次 #{} ({})", pad_seq(label_number, 2), batch_label)
            } else {
                format!("Batch #{} ({})", pad_seq(label_number, 2), batch_label)
            };
            draw_text(&layer, &batch_title, 13.0, MARGIN_MM, cursor.y_mm, &fonts.bold);
            cursor.advance(8.0);

            for (i, &idx) in group.indices.iter().enumerate() {
                let item = &items[idx];

                // Coarse estimate; the exact check happens again at the tables.
                if cursor.needs_break(ITEM_ESTIMATE_MM) {
                    layer = next_page(&doc);
                    cursor.reset();
                }

                let item_label = format!(
                    "{}-B{}-{}-{}",
                    report_id,
                    pad_seq(label_number, 2),
                    pad_seq(i as u64 + 1, 2),
                    sanitize_label(&batch_label)
                );
                draw_text(
                    &layer,
                    &format!("ID: {item_label}"),
                    12.0,
                    MARGIN_MM,
                    cursor.y_mm,
                    &fonts.bold,
                );
                cursor.advance(6.0);
                draw_text(
                    &layer,
                    &format!("File: {}", item.filename),
                    9.0,
                    MARGIN_MM,
                    cursor.y_mm,
                    &fonts.regular,
                );
                cursor.advance(8.0);

                let img_w = CONTENT_WIDTH_MM / 2.0 - 2.0;
                match self
                    .embed_image(&layer, &item.input, MARGIN_MM, cursor.y_mm, img_w, IMAGE_HEIGHT_MM)
                    .await
                {
                    Ok(()) => draw_text(
                        &layer,
                        "Before",
                        10.0,
                        MARGIN_MM,
                        cursor.y_mm + IMAGE_HEIGHT_MM + 6.0,
                        &fonts.bold,
                    ),
                    Err(err) => log_error!("before image skipped for {}: {err:?}", item.filename),
                }
                if let Some(output) = &item.output {
                    match self
                        .embed_image(
                            &layer,
                            output,
                            MARGIN_MM + img_w + 4.0,
                            cursor.y_mm,
                            img_w,
                            IMAGE_HEIGHT_MM,
                        )
                        .await
                    {
                        Ok(()) => draw_text(
                            &layer,
                            "After",
                            10.0,
                            MARGIN_MM + img_w + 4.0,
                            cursor.y_mm + IMAGE_HEIGHT_MM + 6.0,
                            &fonts.bold,
                        ),
                        Err(err) => {
                            log_error!("after image skipped for {}: {err:?}", item.filename)
                        }
                    }
                }
                cursor.advance(IMAGE_HEIGHT_MM + 10.0);

                let col_w = CONTENT_WIDTH_MM / 3.0;
                let cell_w = col_w - 4.0;

                let count_val = item.metrics.count.unwrap_or(0);
                let area_pct = format!("{:.2}%", item.metrics.area_ratio.unwrap_or(0.0) * 100.0);
                let avg_conf = item
                    .metrics
                    .avg_conf
                    .filter(|v| *v > 0.0)
                    .map(|v| format!("{v:.2}"))
                    .unwrap_or_else(|| "0".to_string());
                let metric_cells = [
                    wrap_text(&count_val.to_string(), cell_w, 9.0),
                    wrap_text(&area_pct, cell_w, 9.0),
                    wrap_text(&avg_conf, cell_w, 9.0),
                ];
                let metric_row_h = measure_row_mm(&metric_cells);

                let params_cells = [
                    wrap_text(&item.params.model, cell_w, 9.0),
                    wrap_text(&item.params.conf.to_string(), cell_w, 9.0),
                    wrap_text(&item.params.iou.to_string(), cell_w, 9.0),
                ];
                let params_row_h = measure_row_mm(&params_cells);

                // Exact height, recomputed from the wrapped content.
                let needed = BASE_ROW_MM + metric_row_h + params_row_h + 10.0;
                if cursor.needs_break(needed) {
                    layer = next_page(&doc);
                    cursor.reset();
                }

                layer.set_outline_color(Color::Rgb(Rgb::new(0.7, 0.7, 0.7, None)));
                layer.set_outline_thickness(0.1);

                let metric_headers = if has_cjk {
                    ["数量", "面积占比", "平均置信度"]
                } else {
                    ["Count", "Area %", "Avg Conf"]
                };
                for (c, header) in metric_headers.iter().enumerate() {
                    let x = MARGIN_MM + c as f32 * col_w;
                    draw_rect(&layer, x, cursor.y_mm, col_w, BASE_ROW_MM);
                    draw_text(&layer, header, 9.0, x + 2.0, cursor.y_mm + 5.0, &fonts.bold);
                }

                let metric_y = cursor.y_mm + BASE_ROW_MM;
                for (c, lines) in metric_cells.iter().enumerate() {
                    let x = MARGIN_MM + c as f32 * col_w;
                    draw_rect(&layer, x, metric_y, col_w, metric_row_h);
                    draw_lines(&layer, lines, 9.0, x + 2.0, metric_y + 5.0, &fonts.regular);
                }

                let params_y = metric_y + metric_row_h;
                let params_headers = if has_cjk {
                    ["模型", "Conf", "IOU"]
                } else {
                    ["Model", "Conf", "IOU"]
                };
                for c in 0..3 {
                    let x = MARGIN_MM + c as f32 * col_w;
                    draw_rect(&layer, x, params_y, col_w, params_row_h);
                    draw_text(&layer, params_headers[c], 9.0, x + 2.0, params_y + 5.0, &fonts.bold);
                    draw_lines(
                        &layer,
                        &params_cells[c],
                        9.0,
                        x + 2.0,
                        params_y + 10.0,
                        &fonts.regular,
                    );
                }

                cursor.y_mm = params_y + params_row_h + 12.0;
            }

            cursor.advance(4.0);
        }

        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("failed to create {}", self.config.output_dir.display())
        })?;
        let path = self
            .config
            .output_dir
            .join(format!("corrosion_report_{report_id}.pdf"));
        let file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        doc.save(&mut BufWriter::new(file)).context("failed to write report")?;
        log_info!("report {report_id} written to {}", path.display());
        Ok(Some(path))
    }

    /// Decodes, normalizes to RGB and embeds one image into the given box.
    /// Remote references are fetched first; embedded bytes are used directly.
    async fn embed_image(
        &self,
        layer: &PdfLayerReference,
        image: &ImageRef,
        x_mm: f32,
        y_top_mm: f32,
        width_mm: f32,
        height_mm: f32,
    ) -> Result<()> {
        let bytes = self.image_bytes(image).await?;
        let decoded = image::load_from_memory(&bytes).context("image decode failed")?;
        let rgb = image::DynamicImage::ImageRgb8(decoded.to_rgb8());
        let mut png = Vec::new();
        rgb.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .context("image re-encode failed")?;

        let embeddable =
            printpdf::image_crate::load_from_memory(&png).context("image reload failed")?;
        let pdf_image = Image::from_dynamic_image(&embeddable);
        let px_w = pdf_image.image.width.0 as f32;
        let px_h = pdf_image.image.height.0 as f32;
        let natural_w_mm = px_w * 25.4 / EMBED_DPI;
        let natural_h_mm = px_h * 25.4 / EMBED_DPI;

        pdf_image.add_to_layer(
            layer.clone(),
            ImageTransform {
                translate_x: Some(Mm(x_mm)),
                translate_y: Some(Mm(PAGE_HEIGHT_MM - y_top_mm - height_mm)),
                scale_x: Some(width_mm / natural_w_mm),
                scale_y: Some(height_mm / natural_h_mm),
                dpi: Some(EMBED_DPI),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn image_bytes(&self, image: &ImageRef) -> Result<Vec<u8>> {
        match image {
            ImageRef::Embedded(bytes) => Ok(bytes.clone()),
            ImageRef::Remote(url) => {
                let bytes = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .with_context(|| format!("image fetch failed: {url}"))?
                    .error_for_status()
                    .with_context(|| format!("image fetch rejected: {url}"))?
                    .bytes()
                    .await?;
                Ok(bytes.to_vec())
            }
        }
    }
}

fn builtin_fonts(doc: &PdfDocumentReference) -> Result<ReportFonts> {
    Ok(ReportFonts {
        regular: doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .context("builtin font unavailable")?,
        bold: doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .context("builtin font unavailable")?,
        state: FontState::Unavailable,
    })
}

fn next_page(doc: &PdfDocumentReference) -> PdfLayerReference {
    let (page, layer) = doc.add_page(Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "content");
    doc.get_page(page).get_layer(layer)
}

// y is measured from the top edge; the PDF origin sits bottom-left.
fn draw_text(
    layer: &PdfLayerReference,
    text: &str,
    size_pt: f32,
    x_mm: f32,
    y_top_mm: f32,
    font: &IndirectFontRef,
) {
    layer.use_text(text, size_pt, Mm(x_mm), Mm(PAGE_HEIGHT_MM - y_top_mm), font);
}

fn draw_lines(
    layer: &PdfLayerReference,
    lines: &[String],
    size_pt: f32,
    x_mm: f32,
    y_top_mm: f32,
    font: &IndirectFontRef,
) {
    for (i, line) in lines.iter().enumerate() {
        draw_text(layer, line, size_pt, x_mm, y_top_mm + i as f32 * LINE_HEIGHT_MM, font);
    }
}

fn draw_rect(layer: &PdfLayerReference, x_mm: f32, y_top_mm: f32, w_mm: f32, h_mm: f32) {
    let y = PAGE_HEIGHT_MM - y_top_mm;
    let line = Line {
        points: vec![
            (Point::new(Mm(x_mm), Mm(y)), false),
            (Point::new(Mm(x_mm + w_mm), Mm(y)), false),
            (Point::new(Mm(x_mm + w_mm), Mm(y - h_mm)), false),
            (Point::new(Mm(x_mm), Mm(y - h_mm)), false),
        ],
        is_closed: true,
    };
    layer.add_line(line);
}

//! Pure layout math for the report: batch grouping, text wrapping with a
//! deterministic width estimate, dynamic row heights, and the page cursor.
//! No drawing happens here, which keeps all of it unit-testable.

use chrono::NaiveDate;

use crate::pipeline::state::GalleryItem;

// A4 portrait, all lengths in millimeters.
pub const PAGE_WIDTH_MM: f32 = 210.0;
pub const PAGE_HEIGHT_MM: f32 = 297.0;
pub const MARGIN_MM: f32 = 10.0;
pub const CONTENT_WIDTH_MM: f32 = PAGE_WIDTH_MM - MARGIN_MM * 2.0;

/// Minimum table row height.
pub const BASE_ROW_MM: f32 = 8.0;
pub const LINE_HEIGHT_MM: f32 = 4.5;
pub const CELL_PAD_MM: f32 = 4.0;

/// Conservative whole-item height used for the coarse page check; the exact
/// check from wrapped content happens again before the tables.
pub const ITEM_ESTIMATE_MM: f32 = 100.0;

const PT_TO_MM: f32 = 25.4 / 72.0;

/// Items without a batch id share this bucket.
pub const UNBATCHED: &str = "N/A";

pub fn pad_seq(value: u64, width: usize) -> String {
    format!("{value:0width$}")
}

/// Batch labels end up inside item identifiers; whitespace becomes `_`.
pub fn sanitize_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join("_")
}

/// `R{yyyy}{mm}{dd}{seq:04}`.
pub fn report_id(date: NaiveDate, seq: u64) -> String {
    format!("R{}{}", date.format("%Y%m%d"), pad_seq(seq, 4))
}

/// One report section: gallery indices sharing a batch id, in input order.
#[derive(Debug)]
pub struct BatchGroup {
    pub id: String,
    /// Minimum `batch_order` seen across the group's items.
    pub order_hint: Option<u32>,
    pub indices: Vec<usize>,
}

impl BatchGroup {
    /// Human-readable batch number; positional when no order was given.
    pub fn label_number(&self, position: usize) -> u64 {
        self.order_hint
            .map(u64::from)
            .unwrap_or(position as u64 + 1)
    }

    pub fn display_label(&self, position: usize) -> String {
        if self.id == UNBATCHED {
            format!("Batch-{}", pad_seq(self.label_number(position), 2))
        } else {
            self.id.clone()
        }
    }
}

/// Groups items by batch id, preserving first-seen order of the groups.
pub fn group_by_batch(items: &[GalleryItem]) -> Vec<BatchGroup> {
    let mut groups: Vec<BatchGroup> = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let id = item
            .batch_id
            .clone()
            .unwrap_or_else(|| UNBATCHED.to_string());
        let pos = match groups.iter().position(|g| g.id == id) {
            Some(pos) => pos,
            None => {
                groups.push(BatchGroup {
                    id,
                    order_hint: None,
                    indices: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[pos];
        group.indices.push(idx);
        if let Some(order) = item.batch_order {
            group.order_hint = Some(group.order_hint.map_or(order, |hint| hint.min(order)));
        }
    }
    groups
}

// Width estimate without real font metrics: CJK glyphs advance a full em,
// everything else half an em.
fn glyph_em(ch: char) -> f32 {
    let code = ch as u32;
    let is_wide = (0x2E80..=0x9FFF).contains(&code)
        || (0xF900..=0xFAFF).contains(&code)
        || (0xFF00..=0xFF60).contains(&code);
    if is_wide {
        1.0
    } else {
        0.5
    }
}

/// Estimated rendered width of one line.
pub fn text_width_mm(text: &str, font_size_pt: f32) -> f32 {
    let em_mm = font_size_pt * PT_TO_MM;
    text.chars().map(|ch| glyph_em(ch) * em_mm).sum()
}

/// Character-wraps `text` into lines no wider than `max_width_mm`. Always
/// yields at least one line; explicit newlines are honored.
pub fn wrap_text(text: &str, max_width_mm: f32, font_size_pt: f32) -> Vec<String> {
    let em_mm = font_size_pt * PT_TO_MM;
    let max = max_width_mm.max(em_mm);
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut width = 0.0f32;
    for ch in text.chars() {
        if ch == '\n' {
            lines.push(std::mem::take(&mut line));
            width = 0.0;
            continue;
        }
        let advance = glyph_em(ch) * em_mm;
        if width + advance > max && !line.is_empty() {
            lines.push(std::mem::take(&mut line));
            width = 0.0;
        }
        line.push(ch);
        width += advance;
    }
    if !line.is_empty() || lines.is_empty() {
        lines.push(line);
    }
    lines
}

pub fn row_height_mm(line_count: usize) -> f32 {
    (line_count.max(1) as f32 * LINE_HEIGHT_MM + CELL_PAD_MM).max(BASE_ROW_MM)
}

/// A row is as tall as its longest cell needs.
pub fn measure_row_mm(cells: &[Vec<String>]) -> f32 {
    let longest = cells.iter().map(Vec::len).max().unwrap_or(1);
    row_height_mm(longest)
}

/// Vertical position measured from the top of the page; drawing code converts
/// to PDF bottom-left coordinates at the last moment.
#[derive(Debug, Clone, Copy)]
pub struct PageCursor {
    pub y_mm: f32,
}

impl PageCursor {
    pub fn new() -> Self {
        Self { y_mm: MARGIN_MM }
    }

    pub fn advance(&mut self, dy: f32) {
        self.y_mm += dy;
    }

    /// True when fewer than `needed` mm remain above the bottom edge.
    pub fn needs_break(&self, needed: f32) -> bool {
        self.y_mm > PAGE_HEIGHT_MM - needed
    }

    pub fn reset(&mut self) {
        self.y_mm = MARGIN_MM;
    }
}

impl Default for PageCursor {
    fn default() -> Self {
        Self::new()
    }
}

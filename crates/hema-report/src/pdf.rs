//! 报告 PDF 渲染

use crate::compiler::ReportDraft;
use hema_core::{HemaError, PatientInfo, Report, Result};
use printpdf::path::{PaintMode, WindingOrder};
use printpdf::*;
use std::borrow::Cow;
use std::io::BufWriter;

const PAGE_WIDTH: Mm = Mm(210.0);
const PAGE_HEIGHT: Mm = Mm(297.0);
const TOP: f32 = 280.0;
const BOTTOM: f32 = 20.0;
const WRAP_CHARS: usize = 90;

// 图表区域
const CHART_LEFT: f32 = 75.0;
const BAR_MAX: f32 = 90.0;
const TREND_WIDTH: f32 = 150.0;
const TREND_HEIGHT: f32 = 50.0;

/// 分类配色，按类别序号循环使用
const PALETTE: [(f32, f32, f32); 6] = [
    (0.80, 0.16, 0.16),
    (0.16, 0.45, 0.75),
    (0.20, 0.60, 0.30),
    (0.90, 0.55, 0.10),
    (0.50, 0.30, 0.65),
    (0.40, 0.40, 0.40),
];

const DISCLAIMER: &str =
    "Automated screening result. Final diagnosis requires review by a qualified hematologist.";

/// 报告 PDF 渲染器
///
/// 使用内置 Helvetica 字体，不依赖外部字体文件。内置字体只支持 WinAnsi 字符集，
/// 其余字符输出为 `?`，见 [`win_ansi`]。
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfRenderer;

impl PdfRenderer {
    /// 渲染单次诊断报告
    pub fn render_report(&self, draft: &ReportDraft) -> Result<Vec<u8>> {
        let mut page = PageWriter::new("Blood Cancer Analysis Report")?;

        page.title("Blood Cancer Analysis Report");
        page.small(&format!(
            "Generated: {}",
            draft.generated_at.format("%Y-%m-%d %H:%M UTC")
        ));
        page.small(&format!("Report ID: {}", draft.id));

        page.heading("Patient Information");
        patient_rows(&mut page, &draft.patient);
        page.row("Sample file", &draft.sample.original_filename);
        page.row(
            "Received",
            &draft.sample.received_at.format("%Y-%m-%d %H:%M UTC").to_string(),
        );
        page.row("Checksum", &draft.sample.checksum[..16.min(draft.sample.checksum.len())]);

        page.heading("Test Results");
        page.row(
            "Predicted class",
            &format!(
                "{} ({:.1}%)",
                draft.inference.top_label(),
                draft.inference.top_probability() * 100.0
            ),
        );
        page.row("Model", &draft.inference.model_version().to_string());

        page.heading("Cell Distribution");
        page.table_header("Cell Type", "Percentage");
        for (i, (label, pct)) in draft.inference.class_percentages().iter().enumerate() {
            page.bar(label, *pct, i);
        }

        page.heading("Risk Assessment");
        page.strong(&draft.assessment.headline());
        for finding in &draft.assessment.findings {
            page.bullet(finding);
        }

        page.heading("Recommendations");
        for recommendation in &draft.recommendations {
            page.bullet(recommendation);
        }

        page.gap(8.0);
        page.small(DISCLAIMER);

        page.finish()
    }

    /// 渲染患者历次报告汇总，报告按生成时间排列
    pub fn render_summary(&self, patient: &PatientInfo, reports: &[Report]) -> Result<Vec<u8>> {
        let mut page = PageWriter::new("Blood Cancer Analysis Summary Report")?;

        page.title("Blood Cancer Analysis Summary Report");
        page.heading("Patient Information");
        patient_rows(&mut page, patient);
        page.row("Total analyses", &reports.len().to_string());

        let mut ordered: Vec<&Report> = reports.iter().collect();
        ordered.sort_by_key(|r| r.generated_at());

        if !ordered.is_empty() {
            page.heading("Cell Distribution Trends");
            page.trend_chart(&class_series(&ordered));
        }

        for report in ordered {
            page.heading(&format!(
                "{} - {} Risk",
                report.generated_at().format("%Y-%m-%d %H:%M"),
                report.assessment().level
            ));
            page.row(
                "Predicted class",
                &format!(
                    "{} ({:.1}%)",
                    report.inference().top_label(),
                    report.inference().top_probability() * 100.0
                ),
            );
            let distribution = report
                .inference()
                .class_percentages()
                .iter()
                .map(|(label, pct)| format!("{} {:.1}%", label, pct))
                .collect::<Vec<_>>()
                .join(", ");
            page.paragraph(&distribution);
            page.row("Status", report.status().as_str());
        }

        page.gap(8.0);
        page.small(DISCLAIMER);

        page.finish()
    }
}

fn patient_rows(page: &mut PageWriter, patient: &PatientInfo) {
    page.row("Patient ID", &patient.patient_id);
    page.row("Name", patient.name.as_deref().unwrap_or("-"));
    page.row(
        "Age",
        &patient.age.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string()),
    );
}

/// 各类别在历次报告中的百分比，类别按首次出现的顺序排列，缺失记为 0
fn class_series(reports: &[&Report]) -> Vec<(String, Vec<f32>)> {
    let mut series: Vec<(String, Vec<f32>)> = Vec::new();
    for (i, report) in reports.iter().enumerate() {
        for (label, pct) in report.inference().class_percentages() {
            let index = match series.iter().position(|(l, _)| l == label) {
                Some(index) => index,
                None => {
                    series.push((label.to_string(), vec![0.0; reports.len()]));
                    series.len() - 1
                }
            };
            series[index].1[i] = pct;
        }
    }
    series
}

/// 百分比对应的条形长度（毫米）
fn bar_length(pct: f32, max: f32) -> f32 {
    if pct.is_finite() {
        pct.clamp(0.0, 100.0) / 100.0 * max
    } else {
        0.0
    }
}

/// 折线各点坐标；单个点居中
fn trend_points(values: &[f32], left: f32, bottom: f32, width: f32, height: f32) -> Vec<(f32, f32)> {
    let step = if values.len() > 1 {
        width / (values.len() - 1) as f32
    } else {
        0.0
    };
    values
        .iter()
        .enumerate()
        .map(|(i, pct)| {
            let x = if values.len() > 1 {
                left + step * i as f32
            } else {
                left + width / 2.0
            };
            (x, bottom + bar_length(*pct, height))
        })
        .collect()
}

fn palette(index: usize) -> Color {
    let (r, g, b) = PALETTE[index % PALETTE.len()];
    Color::Rgb(Rgb::new(r, g, b, None))
}

fn black() -> Color {
    Color::Rgb(Rgb::new(0.0, 0.0, 0.0, None))
}

fn point(x: f32, y: f32) -> (Point, bool) {
    (Point::new(Mm(x), Mm(y)), false)
}

/// 转为内置字体可编码的文本
///
/// WinAnsi 覆盖 ASCII、Latin-1 以及少量排版符号；其他字符替换为 `?`，
/// 避免被编码器静默丢弃。
pub fn win_ansi(text: &str) -> Cow<'_, str> {
    if text.chars().all(is_win_ansi) {
        return Cow::Borrowed(text);
    }
    Cow::Owned(
        text.chars()
            .map(|c| if is_win_ansi(c) { c } else { '?' })
            .collect(),
    )
}

fn is_win_ansi(c: char) -> bool {
    matches!(c, ' '..='~' | '\u{A0}'..='\u{FF}')
        || matches!(
            c,
            '€' | '‚' | 'ƒ' | '„' | '…' | '†' | '‡' | 'ˆ' | '‰' | 'Š' | '‹' | 'Œ' | 'Ž'
                | '‘' | '’' | '“' | '”' | '•' | '–' | '—' | '˜' | '™' | 'š' | '›' | 'œ'
                | 'ž' | 'Ÿ'
        )
}

fn pdf_error(e: impl std::fmt::Display) -> HemaError {
    HemaError::Internal(format!("PDF render error: {e}"))
}

/// 逐行写入并在页尾自动换页
struct PageWriter {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    y: Mm,
}

impl PageWriter {
    fn new(title: &str) -> Result<Self> {
        let (doc, page, layer) = PdfDocument::new(title, PAGE_WIDTH, PAGE_HEIGHT, "Layer 1");
        let layer = doc.get_page(page).get_layer(layer);
        let regular = doc.add_builtin_font(BuiltinFont::Helvetica).map_err(pdf_error)?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(pdf_error)?;

        Ok(Self {
            doc,
            layer,
            regular,
            bold,
            y: Mm(TOP),
        })
    }

    fn ensure_room(&mut self, needed: f32) {
        if self.y.0 - needed < BOTTOM {
            let (page, layer) = self.doc.add_page(PAGE_WIDTH, PAGE_HEIGHT, "Layer 1");
            self.layer = self.doc.get_page(page).get_layer(layer);
            self.y = Mm(TOP);
        }
    }

    fn text(&self, text: &str, size: f32, x: f32, y: f32, bold: bool) {
        let font = if bold { &self.bold } else { &self.regular };
        self.layer.use_text(win_ansi(text), size, Mm(x), Mm(y), font);
    }

    fn write(&mut self, text: &str, size: f32, x: f32, bold: bool, advance: f32) {
        self.ensure_room(advance);
        self.text(text, size, x, self.y.0, bold);
        self.y -= Mm(advance);
    }

    fn fill_rect(&self, left: f32, bottom: f32, width: f32, height: f32, color: Color) {
        self.layer.set_fill_color(color);
        self.layer.add_polygon(Polygon {
            rings: vec![vec![
                point(left, bottom),
                point(left, bottom + height),
                point(left + width, bottom + height),
                point(left + width, bottom),
            ]],
            mode: PaintMode::Fill,
            winding_order: WindingOrder::NonZero,
        });
        // 文字沿用填充色
        self.layer.set_fill_color(black());
    }

    fn stroke(&self, points: &[(f32, f32)], color: Color, thickness: f32) {
        if points.len() < 2 {
            return;
        }
        self.layer.set_outline_color(color);
        self.layer.set_outline_thickness(thickness);
        self.layer.add_line(Line {
            points: points.iter().map(|(x, y)| point(*x, *y)).collect(),
            is_closed: false,
        });
        self.layer.set_outline_color(black());
    }

    fn gap(&mut self, mm: f32) {
        self.y -= Mm(mm);
    }

    fn title(&mut self, text: &str) {
        self.write(text, 16.0, 20.0, true, 9.0);
    }

    fn heading(&mut self, text: &str) {
        self.gap(4.0);
        // 标题不单独留在页尾
        self.ensure_room(16.0);
        self.write(text, 11.0, 20.0, true, 6.0);
    }

    fn small(&mut self, text: &str) {
        for line in wrap_text(text, WRAP_CHARS + 10) {
            self.write(&line, 8.0, 20.0, false, 4.0);
        }
    }

    fn strong(&mut self, text: &str) {
        for line in wrap_text(text, WRAP_CHARS) {
            self.write(&line, 9.5, 25.0, true, 5.0);
        }
    }

    fn paragraph(&mut self, text: &str) {
        for line in wrap_text(text, WRAP_CHARS) {
            self.write(&line, 9.0, 25.0, false, 4.5);
        }
    }

    fn bullet(&mut self, text: &str) {
        for (i, line) in wrap_text(text, WRAP_CHARS - 4).into_iter().enumerate() {
            let line = if i == 0 {
                format!("- {}", line)
            } else {
                format!("  {}", line)
            };
            self.write(&line, 9.0, 25.0, false, 4.5);
        }
    }

    fn row(&mut self, label: &str, value: &str) {
        self.ensure_room(4.5);
        self.text(label, 9.0, 25.0, self.y.0, true);
        self.text(value, 9.0, 75.0, self.y.0, false);
        self.y -= Mm(4.5);
    }

    fn table_header(&mut self, left: &str, right: &str) {
        self.ensure_room(5.0);
        self.text(left, 9.5, 25.0, self.y.0, true);
        self.text(right, 9.5, 75.0, self.y.0, true);
        self.y -= Mm(5.0);
    }

    /// 一行横向条形：类别名、按百分比缩放的色条、数值
    fn bar(&mut self, label: &str, pct: f32, index: usize) {
        self.ensure_room(6.0);
        let y = self.y.0;
        self.text(label, 9.0, 25.0, y, true);
        self.fill_rect(CHART_LEFT, y - 0.8, BAR_MAX, 3.6, Color::Rgb(Rgb::new(0.92, 0.92, 0.92, None)));
        let length = bar_length(pct, BAR_MAX);
        if length > 0.0 {
            self.fill_rect(CHART_LEFT, y - 0.8, length, 3.6, palette(index));
        }
        self.text(&format!("{:.1}%", pct), 9.0, CHART_LEFT + BAR_MAX + 3.0, y, false);
        self.y -= Mm(6.0);
    }

    /// 折线图：每个类别一条线，纵轴 0-100%，横轴为报告先后顺序
    fn trend_chart(&mut self, series: &[(String, Vec<f32>)]) {
        let legend_rows = series.len().div_ceil(3) as f32;
        self.ensure_room(TREND_HEIGHT + 12.0 + legend_rows * 4.5);

        let left = 35.0;
        let top = self.y.0 - 2.0;
        let bottom = top - TREND_HEIGHT;
        let grey = || Color::Rgb(Rgb::new(0.75, 0.75, 0.75, None));

        for pct in [0.0, 50.0, 100.0] {
            let y = bottom + bar_length(pct, TREND_HEIGHT);
            self.stroke(&[(left, y), (left + TREND_WIDTH, y)], grey(), 0.5);
            self.text(&format!("{:.0}%", pct), 7.0, 22.0, y - 1.0, false);
        }
        self.stroke(&[(left, bottom), (left, top)], black(), 0.8);

        let count = series.first().map(|(_, v)| v.len()).unwrap_or(0);
        let axis = vec![0.0; count];
        for (index, (_, values)) in series.iter().enumerate() {
            let points = trend_points(values, left, bottom, TREND_WIDTH, TREND_HEIGHT);
            self.stroke(&points, palette(index), 1.5);
            for (x, y) in &points {
                self.fill_rect(x - 0.8, y - 0.8, 1.6, 1.6, palette(index));
            }
        }
        for (i, (x, _)) in trend_points(&axis, left, bottom, TREND_WIDTH, TREND_HEIGHT)
            .into_iter()
            .enumerate()
        {
            self.text(&format!("#{}", i + 1), 7.0, x - 1.5, bottom - 4.0, false);
        }

        self.y = Mm(bottom - 9.0);
        for (index, (label, _)) in series.iter().enumerate() {
            let column = (index % 3) as f32;
            let x = left + column * 50.0;
            self.fill_rect(x, self.y.0 - 0.5, 3.0, 3.0, palette(index));
            self.text(label, 8.0, x + 4.5, self.y.0, false);
            if index % 3 == 2 || index + 1 == series.len() {
                self.y -= Mm(4.5);
            }
        }
    }

    fn finish(self) -> Result<Vec<u8>> {
        let mut buf = BufWriter::new(Vec::new());
        self.doc.save(&mut buf).map_err(pdf_error)?;
        buf.into_inner()
            .map_err(|e| HemaError::Internal(format!("PDF buffer error: {e}")))
    }
}

fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.len() + word.len() + 1 > max_chars && !current.is_empty() {
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

use anyhow::{Context, Result, anyhow, bail};
use calamine::{Data, Reader, Xlsx, open_workbook};
use chrono::NaiveDate;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// One spreadsheet cell, reduced to the scalars the merge cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    /// Numeric view: numbers as-is, text parsed after thousands-comma removal.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            Cell::Text(s) => s.replace(',', "").trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Date(d) => Some(*d),
            Cell::Text(s) => parse_date_text(s),
            _ => None,
        }
    }

    /// Canonical string form. Integral floats print without fraction or
    /// exponent, so an identifier that went through xlsx as a float matches
    /// the same identifier stored as text.
    pub fn render(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => render_number(*n),
            Cell::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Cell::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// A sheet as a header row plus uniform-width data rows.
#[derive(Debug, Clone)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn width(&self) -> usize {
        self.headers.len()
    }

    /// First matching column; duplicate header names resolve to the first.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Check the file content really is a workbook before handing it to the
/// parser. xlsx is a zip container, so plain zip is accepted too.
fn ensure_xlsx(path: &Path) -> Result<()> {
    const BUF_SIZE: usize = 8192;
    let mut file =
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut buf = [0u8; BUF_SIZE];
    let n = file.read(&mut buf)?;

    if n == 0 {
        bail!("{} is empty", path.display());
    }

    match infer::get(&buf[..n]) {
        Some(kind) if kind.mime_type() == XLSX_MIME || kind.mime_type() == "application/zip" => {
            Ok(())
        }
        Some(kind) => Err(anyhow!(
            "{} is not an Excel workbook (detected {})",
            path.display(),
            kind.mime_type()
        )),
        None => Err(anyhow!("{} is not an Excel workbook", path.display())),
    }
}

/// Load the first sheet of an xlsx file. Row 0 is the header row; empty
/// header cells are named `Column <n>` so same-shaped workbooks align.
pub fn read_workbook(path: &Path) -> Result<Table> {
    if !path.is_file() {
        bail!("input must be a file: {}", path.display());
    }
    ensure_xlsx(path)?;

    let mut workbook: Xlsx<_> =
        open_workbook(path).with_context(|| format!("failed to open {}", path.display()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow!("{} contains no sheets", path.display()))?
        .with_context(|| format!("failed to read the first sheet of {}", path.display()))?;

    let mut rows_iter = range.rows();
    let header_row = rows_iter
        .next()
        .ok_or_else(|| anyhow!("{}: first sheet is empty", path.display()))?;

    let headers: Vec<String> = header_row
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let name = cell.to_string().trim().to_string();
            if name.is_empty() {
                format!("Column {}", i + 1)
            } else {
                name
            }
        })
        .collect();

    let rows: Vec<Vec<Cell>> = rows_iter
        .map(|row| row.iter().map(convert_cell).collect())
        .collect();

    if rows.is_empty() {
        bail!("{}: no data rows below the header", path.display());
    }

    debug!(
        rows = rows.len(),
        cols = headers.len(),
        "loaded {}",
        path.display()
    );

    Ok(Table { headers, rows })
}

fn convert_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                Cell::Empty
            } else {
                Cell::Text(t.to_string())
            }
        }
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(dt) => Cell::Date(dt.date()),
            None => Cell::Empty,
        },
        Data::DateTimeIso(s) => match parse_date_text(s) {
            Some(d) => Cell::Date(d),
            None => Cell::Text(s.clone()),
        },
        Data::DurationIso(s) => Cell::Text(s.clone()),
        // Cell-level errors (#DIV/0! etc.) carry no usable value
        Data::Error(_) => Cell::Empty,
    }
}

/// Date recognition for text cells: ISO, slashed, or bare 8-digit form.
/// A trailing time part (`T..` or ` ..`) is ignored.
pub fn parse_date_text(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let head = s.split(['T', ' ']).next().unwrap_or(s);

    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(head, fmt) {
            return Some(d);
        }
    }

    // chrono's %Y is greedy, so 20250524 is sliced by hand
    if head.len() == 8 && head.bytes().all(|b| b.is_ascii_digit()) {
        let year = head[0..4].parse().ok()?;
        let month = head[4..6].parse().ok()?;
        let day = head[6..8].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    None
}

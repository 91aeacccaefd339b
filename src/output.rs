use crate::table::{Cell, Table};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rust_xlsxwriter::{Format, Workbook};
use std::path::Path;

/// Identifier columns Excel would otherwise fold into scientific notation
pub fn default_id_columns() -> Vec<String> {
    vec!["渠道ID".into(), "Ad Group ID".into(), "Ad ID".into()]
}

/// Write the merged table. Identifier columns get the text format so long
/// IDs survive a round trip through Excel, dates land as ISO strings, and
/// empty cells are filled with "N/A".
pub fn write_workbook(path: &Path, table: &Table, date_col: usize, id_cols: &[String]) -> Result<()> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("merged").ok();

    let header_format = Format::new().set_bold();
    let text_format = Format::new().set_num_format("@");

    let is_id: Vec<bool> = table
        .headers
        .iter()
        .map(|h| id_cols.iter().any(|c| c == h))
        .collect();

    for (c, name) in table.headers.iter().enumerate() {
        sheet.write_string_with_format(0, c as u16, name.as_str(), &header_format)?;
    }

    let pb = ProgressBar::new(table.rows.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("[{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );

    for (r, row) in table.rows.iter().enumerate() {
        pb.inc(1);
        let excel_row = (r + 1) as u32;

        for (c, cell) in row.iter().enumerate() {
            let col = c as u16;
            if is_id[c] {
                let value = if cell.is_empty() {
                    "N/A".to_string()
                } else {
                    cell.render()
                };
                sheet.write_string_with_format(excel_row, col, value, &text_format)?;
                continue;
            }
            match cell {
                Cell::Empty => {
                    sheet.write_string(excel_row, col, "N/A")?;
                }
                Cell::Number(n) => {
                    sheet.write_number(excel_row, col, *n)?;
                }
                Cell::Bool(b) => {
                    sheet.write_boolean(excel_row, col, *b)?;
                }
                Cell::Text(s) => {
                    sheet.write_string(excel_row, col, s.as_str())?;
                }
                Cell::Date(d) => {
                    sheet.write_string(excel_row, col, d.format("%Y-%m-%d").to_string())?;
                }
            }
        }
    }

    for c in 0..table.headers.len() {
        if is_id[c] {
            sheet.set_column_width(c as u16, 16).ok();
        }
    }
    sheet.set_column_width(date_col as u16, 12).ok();
    sheet.set_freeze_panes(1, 0).ok();

    pb.finish_with_message("done");

    workbook
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

const PREVIEW_COL_WIDTH: usize = 24;

/// Fixed-width text preview of the first `limit` rows.
pub fn render_preview(table: &Table, limit: usize) -> String {
    let shown = table.rows.len().min(limit);

    let mut widths: Vec<usize> = table
        .headers
        .iter()
        .map(|h| h.chars().count().min(PREVIEW_COL_WIDTH))
        .collect();
    let mut rendered: Vec<Vec<String>> = Vec::with_capacity(shown);
    for row in &table.rows[..shown] {
        let cells: Vec<String> = row.iter().map(preview_cell).collect();
        for (c, s) in cells.iter().enumerate() {
            widths[c] = widths[c].max(s.chars().count().min(PREVIEW_COL_WIDTH));
        }
        rendered.push(cells);
    }

    let mut out = String::new();
    push_row(&mut out, &table.headers, &widths);
    for row in &rendered {
        push_row(&mut out, row, &widths);
    }
    if table.rows.len() > shown {
        out.push_str(&format!("... {} more rows\n", table.rows.len() - shown));
    }
    out
}

fn preview_cell(cell: &Cell) -> String {
    if cell.is_empty() {
        "N/A".into()
    } else {
        cell.render()
    }
}

fn push_row(out: &mut String, cells: &[String], widths: &[usize]) {
    let mut line = String::new();
    for (c, s) in cells.iter().enumerate() {
        if c > 0 {
            line.push_str("  ");
        }
        let mut v: String = s.chars().take(widths[c]).collect();
        while v.chars().count() < widths[c] {
            v.push(' ');
        }
        line.push_str(&v);
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

use crate::cli::Args;
use crate::output;
use crate::table::{self, Cell, Table};
use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Metric columns carried by default, beyond the leading block
fn default_metric_patterns() -> Vec<String> {
    vec![
        "投放花费".into(),
        "应用设备激活数".into(),
        "付费用户数(首日)".into(),
        "d0".into(),
    ]
}

/// Build a GlobSet from column-name patterns
fn compile_globs(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p).context("Invalid column pattern")?);
    }
    Ok(builder.build()?)
}

/// Which columns are carried into the result and the role each one plays.
/// `date`, `keys` and `metrics` are positions into `names`; the `*_idx`
/// vectors map those positions back to each source sheet.
#[derive(Debug, Clone)]
pub struct ColumnPlan {
    pub names: Vec<String>,
    pub table1_idx: Vec<usize>,
    pub combined_idx: Vec<usize>,
    pub date: usize,
    pub keys: Vec<usize>,
    pub metrics: Vec<usize>,
}

impl ColumnPlan {
    fn key_names(&self) -> Vec<&str> {
        self.keys.iter().map(|&p| self.names[p].as_str()).collect()
    }

    fn metric_names(&self) -> Vec<&str> {
        self.metrics
            .iter()
            .map(|&p| self.names[p].as_str())
            .collect()
    }
}

/// Infer the carried columns from table1's header: the leading block unioned
/// with metric-pattern matches, then aligned by header name in the combined
/// sheet.
pub fn plan_columns(
    table1: &Table,
    combined: &Table,
    lead_cols: usize,
    metric_patterns: &[String],
    group_by: &[String],
    date_col: Option<&str>,
    id_cols: &[String],
) -> Result<ColumnPlan> {
    let metric_globs = compile_globs(metric_patterns)?;

    let mut carried: BTreeSet<usize> = (0..lead_cols.min(table1.width())).collect();
    for (idx, name) in table1.headers.iter().enumerate() {
        if metric_globs.is_match(name) {
            carried.insert(idx);
        }
    }
    if carried.is_empty() {
        bail!("no columns selected; raise --lead-cols or add --metric patterns");
    }

    let table1_idx: Vec<usize> = carried.into_iter().collect();
    let names: Vec<String> = table1_idx
        .iter()
        .map(|&i| table1.headers[i].clone())
        .collect();

    // Collect every alignment failure before giving up
    let mut combined_idx = Vec::with_capacity(names.len());
    let mut missing = Vec::new();
    for name in &names {
        match combined.column_index(name) {
            Some(i) => combined_idx.push(i),
            None => missing.push(name.clone()),
        }
    }
    if !missing.is_empty() {
        bail!(
            "combined workbook is missing columns: {}",
            missing.join(", ")
        );
    }

    let date = find_date_column(table1, &names, &table1_idx, date_col)?;

    let numeric: Vec<bool> = (0..names.len())
        .map(|pos| column_is_numeric(table1, combined, table1_idx[pos], combined_idx[pos]))
        .collect();

    let keys = resolve_key_columns(&names, group_by, id_cols, date, &numeric)?;

    // Identifier columns are never summed, whatever their cells hold
    let metrics: Vec<usize> = (0..names.len())
        .filter(|&pos| {
            pos != date
                && !keys.contains(&pos)
                && !id_cols.iter().any(|c| c == &names[pos])
                && numeric[pos]
        })
        .collect();

    if metrics.is_empty() {
        warn!("no metric columns; matching rows will only be deduplicated");
    }

    Ok(ColumnPlan {
        names,
        table1_idx,
        combined_idx,
        date,
        keys,
        metrics,
    })
}

fn find_date_column(
    table1: &Table,
    names: &[String],
    table1_idx: &[usize],
    requested: Option<&str>,
) -> Result<usize> {
    if let Some(name) = requested {
        return names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| anyhow!("--date-col {:?} is not among the carried columns", name));
    }

    if let Some(pos) = names
        .iter()
        .position(|n| n.to_lowercase().contains("date") || n.contains("日期"))
    {
        return Ok(pos);
    }

    // Last resort: the first carried column that mostly parses as dates
    for (pos, &src) in table1_idx.iter().enumerate() {
        let mut non_empty = 0usize;
        let mut dates = 0usize;
        for row in &table1.rows {
            let cell = &row[src];
            if cell.is_empty() {
                continue;
            }
            non_empty += 1;
            if cell.as_date().is_some() {
                dates += 1;
            }
        }
        if non_empty > 0 && dates * 2 >= non_empty {
            return Ok(pos);
        }
    }

    bail!("could not find a date column; pass --date-col")
}

fn resolve_key_columns(
    names: &[String],
    group_by: &[String],
    id_cols: &[String],
    date: usize,
    numeric: &[bool],
) -> Result<Vec<usize>> {
    if !group_by.is_empty() {
        let mut keys = Vec::with_capacity(group_by.len());
        for name in group_by {
            let pos = names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| anyhow!("--group-by {:?} is not among the carried columns", name))?;
            if pos == date {
                bail!("--group-by {:?} is already the date column", name);
            }
            if !keys.contains(&pos) {
                keys.push(pos);
            }
        }
        return Ok(keys);
    }

    // Identifier columns make the natural key when present
    let id_keys: Vec<usize> = names
        .iter()
        .enumerate()
        .filter(|&(pos, name)| pos != date && id_cols.iter().any(|c| c == name))
        .map(|(pos, _)| pos)
        .collect();
    if !id_keys.is_empty() {
        return Ok(id_keys);
    }

    // Otherwise every carried non-numeric column
    let dim_keys: Vec<usize> = (0..names.len())
        .filter(|&pos| pos != date && !numeric[pos])
        .collect();
    if dim_keys.is_empty() {
        bail!("cannot determine key columns; pass --group-by");
    }
    Ok(dim_keys)
}

fn numeric_in(table: &Table, src: usize) -> (usize, usize) {
    let mut non_empty = 0usize;
    let mut numeric = 0usize;
    for row in &table.rows {
        let cell = &row[src];
        if cell.is_empty() {
            continue;
        }
        non_empty += 1;
        if cell.as_number().is_some() {
            numeric += 1;
        }
    }
    (non_empty, numeric)
}

fn column_is_numeric(table1: &Table, combined: &Table, t1_src: usize, comb_src: usize) -> bool {
    let (a_total, a_num) = numeric_in(table1, t1_src);
    let (b_total, b_num) = numeric_in(combined, comb_src);
    a_total + b_total > 0 && a_num == a_total && b_num == b_total
}

/// Counters reported after the merge
#[derive(Debug, Default)]
pub struct MergeReport {
    pub rows_table1: usize,
    pub rows_combined: usize,
    pub skipped_out_of_range: usize,
    pub skipped_bad_date: usize,
    pub keys_both: usize,
    pub keys_table1_only: usize,
    pub keys_combined_only: usize,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub table: Table,
    pub report: MergeReport,
}

struct Entry {
    date: NaiveDate,
    cells: Vec<Cell>,
    sums: Vec<Option<f64>>,
    from_table1: bool,
    from_combined: bool,
}

impl Entry {
    fn new(date: NaiveDate, plan: &ColumnPlan) -> Self {
        let mut cells = vec![Cell::Empty; plan.names.len()];
        cells[plan.date] = Cell::Date(date);
        Entry {
            date,
            cells,
            sums: vec![None; plan.metrics.len()],
            from_table1: false,
            from_combined: false,
        }
    }
}

struct Accumulator<'a> {
    plan: &'a ColumnPlan,
    first: NaiveDate,
    second: NaiveDate,
    dims: Vec<usize>,
    index: HashMap<(NaiveDate, Vec<String>), usize>,
    entries: Vec<Entry>,
    report: MergeReport,
}

impl<'a> Accumulator<'a> {
    fn new(plan: &'a ColumnPlan, first: NaiveDate, second: NaiveDate) -> Self {
        let dims = (0..plan.names.len())
            .filter(|&pos| pos != plan.date && !plan.metrics.contains(&pos))
            .collect();
        Accumulator {
            plan,
            first,
            second,
            dims,
            index: HashMap::new(),
            entries: Vec::new(),
            report: MergeReport::default(),
        }
    }

    fn fold(&mut self, table: &Table, src_idx: &[usize], from_table1: bool) -> Result<()> {
        let mut bad_dates = 0usize;

        for row in &table.rows {
            let Some(date) = row[src_idx[self.plan.date]].as_date() else {
                self.report.skipped_bad_date += 1;
                bad_dates += 1;
                continue;
            };
            if date != self.first && date != self.second {
                self.report.skipped_out_of_range += 1;
                continue;
            }

            // Keys compare in rendered form so a numeric ID matches its
            // text twin from the other workbook
            let key: Vec<String> = self
                .plan
                .keys
                .iter()
                .map(|&pos| row[src_idx[pos]].render())
                .collect();

            let slot = match self.index.get(&(date, key.clone())) {
                Some(&i) => i,
                None => {
                    let i = self.entries.len();
                    self.entries.push(Entry::new(date, self.plan));
                    self.index.insert((date, key), i);
                    i
                }
            };

            let entry = &mut self.entries[slot];
            if from_table1 {
                entry.from_table1 = true;
            } else {
                entry.from_combined = true;
            }

            for (mi, &pos) in self.plan.metrics.iter().enumerate() {
                if let Some(v) = row[src_idx[pos]].as_number() {
                    *entry.sums[mi].get_or_insert(0.0) += v;
                }
            }

            for &pos in &self.dims {
                let cell = &row[src_idx[pos]];
                if entry.cells[pos].is_empty() && !cell.is_empty() {
                    entry.cells[pos] = cell.clone();
                }
            }
        }

        if !table.rows.is_empty() && bad_dates == table.rows.len() {
            bail!(
                "no readable dates in column {:?}; check --date-col and the sheet layout",
                self.plan.names[self.plan.date]
            );
        }
        Ok(())
    }

    fn finish(self) -> Result<MergeOutcome> {
        let Accumulator {
            plan,
            first,
            second,
            mut entries,
            mut report,
            ..
        } = self;

        if entries.is_empty() {
            bail!("no rows dated {first} or {second} in either workbook");
        }

        for e in &entries {
            match (e.from_table1, e.from_combined) {
                (true, true) => report.keys_both += 1,
                (true, false) => report.keys_table1_only += 1,
                (false, true) => report.keys_combined_only += 1,
                (false, false) => {}
            }
        }

        // Stable sort: first-date rows lead, insertion order survives
        entries.sort_by_key(|e| e.date);

        let rows: Vec<Vec<Cell>> = entries
            .into_iter()
            .map(|mut e| {
                for (mi, &pos) in plan.metrics.iter().enumerate() {
                    e.cells[pos] = match e.sums[mi] {
                        Some(v) => Cell::Number(v),
                        None => Cell::Empty,
                    };
                }
                e.cells
            })
            .collect();

        Ok(MergeOutcome {
            table: Table {
                headers: plan.names.clone(),
                rows,
            },
            report,
        })
    }
}

/// Fold both workbooks into one table keyed by date plus group identifiers.
/// Metrics add up across sources; dimensions take the first non-empty value,
/// combined sheet first so its labels win.
pub fn merge_tables(
    table1: &Table,
    combined: &Table,
    plan: &ColumnPlan,
    first: NaiveDate,
    second: NaiveDate,
) -> Result<MergeOutcome> {
    let mut acc = Accumulator::new(plan, first, second);
    acc.report.rows_table1 = table1.rows.len();
    acc.report.rows_combined = combined.rows.len();

    acc.fold(combined, &plan.combined_idx, false)?;
    acc.fold(table1, &plan.table1_idx, true)?;
    acc.finish()
}

/// Fill missing date flags from the distinct dates in the combined sheet.
pub fn resolve_dates(
    combined: &Table,
    date_src: usize,
    first: Option<NaiveDate>,
    second: Option<NaiveDate>,
) -> Result<(NaiveDate, NaiveDate)> {
    if let (Some(f), Some(s)) = (first, second) {
        if f > s {
            bail!("--first-date {f} is after --second-date {s}");
        }
        if f == s {
            warn!("first and second date are both {f}");
        }
        return Ok((f, s));
    }

    let mut distinct: BTreeSet<NaiveDate> = combined
        .rows
        .iter()
        .filter_map(|row| row[date_src].as_date())
        .collect();
    if let Some(pinned) = first.or(second) {
        distinct.remove(&pinned);
    }

    let mut iter = distinct.iter().copied();
    let candidates = (iter.next(), iter.next());

    if let Some(f) = first {
        return match candidates {
            (None, _) => {
                warn!("no other date in the combined workbook; using {f} for both dates");
                Ok((f, f))
            }
            (Some(other), None) if other > f => Ok((f, other)),
            (Some(other), None) => {
                bail!("inferred second date {other} is before --first-date {f}")
            }
            _ => {
                bail!("cannot infer the second date: several candidates remain; pass --second-date")
            }
        };
    }
    if let Some(s) = second {
        return match candidates {
            (None, _) => {
                warn!("no other date in the combined workbook; using {s} for both dates");
                Ok((s, s))
            }
            (Some(other), None) if other < s => Ok((other, s)),
            (Some(other), None) => {
                bail!("inferred first date {other} is after --second-date {s}")
            }
            _ => bail!("cannot infer the first date: several candidates remain; pass --first-date"),
        };
    }

    match candidates {
        (None, _) => {
            bail!("combined workbook has no readable dates; pass --first-date and --second-date")
        }
        (Some(only), None) => {
            warn!("only {only} present in the combined workbook; using it for both dates");
            Ok((only, only))
        }
        (Some(f), Some(s)) if distinct.len() == 2 => Ok((f, s)),
        _ => {
            let all: Vec<String> = distinct.iter().map(|d| d.to_string()).collect();
            bail!(
                "combined workbook covers {} dates ({}); pass --first-date and --second-date",
                distinct.len(),
                all.join(", ")
            )
        }
    }
}

/// Totals over in-range rows must survive the merge (within epsilon).
fn check_totals(
    table1: &Table,
    combined: &Table,
    result: &Table,
    plan: &ColumnPlan,
    first: NaiveDate,
    second: NaiveDate,
) -> Result<()> {
    for &pos in &plan.metrics {
        let input = metric_total(table1, &plan.table1_idx, plan, pos, first, second)
            + metric_total(combined, &plan.combined_idx, plan, pos, first, second);
        let merged: f64 = result.rows.iter().filter_map(|r| r[pos].as_number()).sum();

        let tolerance = 1e-6_f64.max(input.abs() * 1e-6);
        if (input - merged).abs() > tolerance {
            bail!(
                "sanity check failed for {:?}: inputs total {input}, merged total {merged}",
                plan.names[pos]
            );
        }
    }
    Ok(())
}

fn metric_total(
    table: &Table,
    src_idx: &[usize],
    plan: &ColumnPlan,
    pos: usize,
    first: NaiveDate,
    second: NaiveDate,
) -> f64 {
    table
        .rows
        .iter()
        .filter(|row| {
            matches!(row[src_idx[plan.date]].as_date(), Some(d) if d == first || d == second)
        })
        .filter_map(|row| row[src_idx[pos]].as_number())
        .sum()
}

/// Output files are named after the second date, e.g. 0525_results.xlsx
fn default_output_name(second_date: NaiveDate) -> PathBuf {
    PathBuf::from(format!("{}_results.xlsx", second_date.format("%m%d")))
}

fn print_plan(plan: &ColumnPlan) {
    println!("Columns: {}", plan.names.join(", "));
    println!(
        "Key: {} + [{}]",
        plan.names[plan.date],
        plan.key_names().join(", ")
    );
    let metrics = plan.metric_names();
    if metrics.is_empty() {
        println!("Metrics: (none)");
    } else {
        println!("Metrics: {}", metrics.join(", "));
    }
}

fn print_report(report: &MergeReport) {
    println!(
        "Read {} rows from table 1 and {} rows from the combined table.",
        report.rows_table1, report.rows_combined
    );
    if report.skipped_out_of_range > 0 {
        println!(
            "Skipped {} rows dated outside the merge window.",
            report.skipped_out_of_range
        );
    }
    if report.skipped_bad_date > 0 {
        println!(
            "Skipped {} rows with unreadable dates.",
            report.skipped_bad_date
        );
    }
    let total = report.keys_both + report.keys_table1_only + report.keys_combined_only;
    println!(
        "{} merged rows: {} from both inputs, {} only in table 1, {} only in the combined table.",
        total, report.keys_both, report.keys_table1_only, report.keys_combined_only
    );
}

pub fn run(args: Args) -> Result<()> {
    // Parse both workbooks in parallel
    let (table1, combined) = rayon::join(
        || table::read_workbook(&args.table1),
        || table::read_workbook(&args.combined),
    );
    let table1 = table1.with_context(|| format!("reading {}", args.table1.display()))?;
    let combined = combined.with_context(|| format!("reading {}", args.combined.display()))?;

    let metric_patterns = if args.metric.is_empty() {
        default_metric_patterns()
    } else {
        args.metric.clone()
    };
    let id_cols = if args.id_col.is_empty() {
        output::default_id_columns()
    } else {
        args.id_col.clone()
    };

    let plan = plan_columns(
        &table1,
        &combined,
        args.lead_cols,
        &metric_patterns,
        &args.group_by,
        args.date_col.as_deref(),
        &id_cols,
    )?;
    debug!(
        "carrying {} columns, key [{}], {} metrics",
        plan.names.len(),
        plan.key_names().join(", "),
        plan.metrics.len()
    );

    let (first_date, second_date) = resolve_dates(
        &combined,
        plan.combined_idx[plan.date],
        args.first_date,
        args.second_date,
    )?;
    debug!(%first_date, %second_date, "merge window resolved");

    let outcome = merge_tables(&table1, &combined, &plan, first_date, second_date)?;

    if args.sanity_check {
        check_totals(
            &table1,
            &combined,
            &outcome.table,
            &plan,
            first_date,
            second_date,
        )?;
    }

    // Determine default output
    let output_path = if let Some(o) = &args.output {
        o.clone()
    } else {
        default_output_name(second_date)
    };

    if args.dry_run {
        println!("Dry-run. Would write {}:", output_path.display());
        print_plan(&plan);
        print_report(&outcome.report);
        return Ok(());
    }

    if output_path.exists() && !args.no_confirm {
        return Err(anyhow!(
            "{} already exists; use --no-confirm to overwrite.",
            output_path.display()
        ));
    }

    output::write_workbook(&output_path, &outcome.table, plan.date, &id_cols)?;

    if !args.no_preview && args.preview_rows > 0 {
        print!(
            "{}",
            output::render_preview(&outcome.table, args.preview_rows)
        );
    }
    print_report(&outcome.report);
    println!("Merged workbook written to {}", output_path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txt(s: &str) -> Cell {
        Cell::Text(s.into())
    }

    fn num(v: f64) -> Cell {
        Cell::Number(v)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, d).unwrap()
    }

    fn date_cell(d: u32) -> Cell {
        Cell::Date(day(d))
    }

    fn tbl(headers: &[&str], rows: Vec<Vec<Cell>>) -> Table {
        Table {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows,
        }
    }

    fn sample_tables() -> (Table, Table) {
        let table1 = tbl(
            &["日期", "渠道", "渠道ID", "投放花费", "note", "d0"],
            vec![
                vec![
                    date_cell(24),
                    txt("tt"),
                    num(1001.0),
                    num(10.0),
                    Cell::Empty,
                    num(1.0),
                ],
                vec![
                    date_cell(24),
                    txt("ks"),
                    num(1002.0),
                    num(20.0),
                    txt("evening"),
                    num(2.0),
                ],
            ],
        );
        let combined = tbl(
            &["日期", "渠道", "渠道ID", "投放花费", "note", "d0"],
            vec![
                vec![
                    date_cell(24),
                    txt("tt"),
                    txt("1001"),
                    num(5.0),
                    txt("morning"),
                    num(0.5),
                ],
                vec![
                    date_cell(25),
                    txt("tt"),
                    num(1001.0),
                    num(7.0),
                    Cell::Empty,
                    num(0.7),
                ],
                vec![
                    date_cell(25),
                    txt("ks"),
                    num(1002.0),
                    num(9.0),
                    Cell::Empty,
                    Cell::Empty,
                ],
            ],
        );
        (table1, combined)
    }

    fn sample_plan(table1: &Table, combined: &Table) -> ColumnPlan {
        plan_columns(
            table1,
            combined,
            12,
            &default_metric_patterns(),
            &[],
            None,
            &crate::output::default_id_columns(),
        )
        .unwrap()
    }

    #[test]
    fn plan_carries_lead_block_and_metric_matches() {
        let table1 = tbl(
            &["日期", "渠道", "渠道ID", "投放花费", "note", "d0"],
            vec![vec![
                date_cell(24),
                txt("tt"),
                num(1.0),
                num(2.0),
                txt("x"),
                num(3.0),
            ]],
        );
        let combined = table1.clone();
        let plan = plan_columns(
            &table1,
            &combined,
            3,
            &default_metric_patterns(),
            &[],
            None,
            &crate::output::default_id_columns(),
        )
        .unwrap();

        assert_eq!(plan.names, vec!["日期", "渠道", "渠道ID", "投放花费", "d0"]);
        assert_eq!(plan.table1_idx, vec![0, 1, 2, 3, 5]);
        assert_eq!(plan.date, 0);
        assert_eq!(plan.keys, vec![2]);
        assert_eq!(plan.metrics, vec![3, 4]);
    }

    #[test]
    fn plan_reports_missing_columns_at_once() {
        let table1 = tbl(
            &["日期", "渠道ID", "投放花费", "d0"],
            vec![vec![date_cell(24), num(1.0), num(2.0), num(3.0)]],
        );
        let combined = tbl(&["日期", "渠道ID"], vec![vec![date_cell(24), num(1.0)]]);
        let err = plan_columns(
            &table1,
            &combined,
            12,
            &default_metric_patterns(),
            &[],
            None,
            &crate::output::default_id_columns(),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("投放花费") && msg.contains("d0"), "{msg}");
    }

    #[test]
    fn metric_patterns_accept_globs() {
        let table1 = tbl(
            &["日期", "渠道ID", "消耗", "d0", "d7"],
            vec![vec![date_cell(24), num(1.0), num(2.0), num(3.0), num(4.0)]],
        );
        let combined = table1.clone();
        let plan = plan_columns(
            &table1,
            &combined,
            2,
            &["d?".to_string()],
            &[],
            None,
            &crate::output::default_id_columns(),
        )
        .unwrap();
        assert_eq!(plan.names, vec!["日期", "渠道ID", "d0", "d7"]);
    }

    #[test]
    fn plan_rejects_unknown_group_by() {
        let (table1, combined) = sample_tables();
        let err = plan_columns(
            &table1,
            &combined,
            12,
            &default_metric_patterns(),
            &["campaign".to_string()],
            None,
            &crate::output::default_id_columns(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("campaign"));
    }

    #[test]
    fn merge_sums_shared_keys_and_fills_dimensions() {
        let (table1, combined) = sample_tables();
        let plan = sample_plan(&table1, &combined);
        let out = merge_tables(&table1, &combined, &plan, day(24), day(25)).unwrap();

        assert_eq!(out.table.rows.len(), 4);

        // (24, 1001) exists in both: metrics add, the note comes from the
        // combined sheet, and the text ID matched the numeric ID
        let r0 = &out.table.rows[0];
        assert_eq!(r0[0], Cell::Date(day(24)));
        assert_eq!(r0[2].render(), "1001");
        assert_eq!(r0[3], Cell::Number(15.0));
        assert_eq!(r0[4], Cell::Text("morning".into()));
        assert_eq!(r0[5], Cell::Number(1.5));

        // (24, 1002) only in table 1
        let r1 = &out.table.rows[1];
        assert_eq!(r1[2].render(), "1002");
        assert_eq!(r1[3], Cell::Number(20.0));
        assert_eq!(r1[4], Cell::Text("evening".into()));

        // (25, 1002): d0 had no value anywhere and stays empty
        let r3 = &out.table.rows[3];
        assert_eq!(r3[0], Cell::Date(day(25)));
        assert_eq!(r3[5], Cell::Empty);

        assert_eq!(out.report.keys_both, 1);
        assert_eq!(out.report.keys_table1_only, 1);
        assert_eq!(out.report.keys_combined_only, 2);
    }

    #[test]
    fn merge_prefers_combined_dimensions_on_conflict() {
        let table1 = tbl(
            &["日期", "渠道ID", "投放花费", "note"],
            vec![vec![date_cell(24), num(1001.0), num(2.0), txt("evening")]],
        );
        let combined = tbl(
            &["日期", "渠道ID", "投放花费", "note"],
            vec![vec![date_cell(24), num(1001.0), num(3.0), txt("morning")]],
        );
        let plan = sample_plan(&table1, &combined);
        let out = merge_tables(&table1, &combined, &plan, day(24), day(25)).unwrap();

        // both sides carry a note for the same key; the combined sheet's wins
        assert_eq!(out.table.rows.len(), 1);
        assert_eq!(out.table.rows[0][3], Cell::Text("morning".into()));
        assert_eq!(out.table.rows[0][2], Cell::Number(5.0));
        assert_eq!(out.report.keys_both, 1);
    }

    #[test]
    fn merge_skips_rows_outside_the_window() {
        let (table1, mut combined) = sample_tables();
        combined.rows.push(vec![
            date_cell(20),
            txt("tt"),
            num(1001.0),
            num(99.0),
            Cell::Empty,
            num(9.0),
        ]);
        let plan = sample_plan(&table1, &combined);
        let out = merge_tables(&table1, &combined, &plan, day(24), day(25)).unwrap();

        assert_eq!(out.report.skipped_out_of_range, 1);
        assert_eq!(out.table.rows.len(), 4);
        // the skipped row's spend must not leak into (24, 1001)
        assert_eq!(out.table.rows[0][3], Cell::Number(15.0));
    }

    #[test]
    fn merge_fails_when_the_window_matches_no_rows() {
        let (table1, combined) = sample_tables();
        let plan = sample_plan(&table1, &combined);
        let err = merge_tables(&table1, &combined, &plan, day(1), day(2)).unwrap_err();
        assert!(err.to_string().contains("no rows dated"));
    }

    #[test]
    fn merge_aggregates_duplicate_keys_within_one_workbook() {
        let table1 = tbl(
            &["日期", "渠道ID", "投放花费"],
            vec![vec![date_cell(24), num(7.0), num(1.0)]],
        );
        let combined = tbl(
            &["日期", "渠道ID", "投放花费"],
            vec![
                vec![date_cell(24), num(7.0), num(2.0)],
                vec![date_cell(24), txt("7"), num(4.0)],
            ],
        );
        let plan = plan_columns(
            &table1,
            &combined,
            12,
            &default_metric_patterns(),
            &["渠道ID".to_string()],
            None,
            &crate::output::default_id_columns(),
        )
        .unwrap();
        let out = merge_tables(&table1, &combined, &plan, day(24), day(25)).unwrap();

        assert_eq!(out.table.rows.len(), 1);
        assert_eq!(out.table.rows[0][2], Cell::Number(7.0));
        assert_eq!(out.report.keys_both, 1);
    }

    #[test]
    fn merge_fails_when_a_workbook_has_no_readable_dates() {
        let (_, combined) = sample_tables();
        let table1 = tbl(
            &["日期", "渠道", "渠道ID", "投放花费", "note", "d0"],
            vec![vec![
                txt("garbage"),
                txt("tt"),
                num(1.0),
                num(2.0),
                Cell::Empty,
                num(3.0),
            ]],
        );
        let plan = sample_plan(&table1, &combined);
        let err = merge_tables(&table1, &combined, &plan, day(24), day(25)).unwrap_err();
        assert!(err.to_string().contains("no readable dates"));
    }

    #[test]
    fn resolve_dates_infers_pair_from_combined() {
        let combined = tbl(
            &["日期"],
            vec![
                vec![date_cell(25)],
                vec![date_cell(24)],
                vec![date_cell(25)],
            ],
        );
        let pair = (day(24), day(25));
        assert_eq!(resolve_dates(&combined, 0, None, None).unwrap(), pair);
        assert_eq!(
            resolve_dates(&combined, 0, Some(day(24)), None).unwrap(),
            pair
        );
        assert_eq!(
            resolve_dates(&combined, 0, None, Some(day(25))).unwrap(),
            pair
        );
        assert_eq!(
            resolve_dates(&combined, 0, Some(day(24)), Some(day(25))).unwrap(),
            pair
        );
    }

    #[test]
    fn resolve_dates_allows_a_single_date_window() {
        let combined = tbl(&["日期"], vec![vec![date_cell(24)]]);
        assert_eq!(
            resolve_dates(&combined, 0, None, None).unwrap(),
            (day(24), day(24))
        );
        assert_eq!(
            resolve_dates(&combined, 0, Some(day(24)), None).unwrap(),
            (day(24), day(24))
        );
    }

    #[test]
    fn resolve_dates_rejects_ambiguity_and_misorder() {
        let combined = tbl(
            &["日期"],
            vec![vec![date_cell(1)], vec![date_cell(2)], vec![date_cell(3)]],
        );
        assert!(resolve_dates(&combined, 0, None, None).is_err());
        assert!(resolve_dates(&combined, 0, Some(day(25)), Some(day(24))).is_err());

        let dateless = tbl(&["日期"], vec![vec![txt("x")]]);
        assert!(resolve_dates(&dateless, 0, None, None).is_err());
    }

    #[test]
    fn sanity_check_catches_lost_rows() {
        let (table1, combined) = sample_tables();
        let plan = sample_plan(&table1, &combined);
        let out = merge_tables(&table1, &combined, &plan, day(24), day(25)).unwrap();

        check_totals(&table1, &combined, &out.table, &plan, day(24), day(25)).unwrap();

        let mut broken = out.table.clone();
        broken.rows.remove(0);
        let err = check_totals(&table1, &combined, &broken, &plan, day(24), day(25)).unwrap_err();
        assert!(err.to_string().contains("sanity check failed"));
    }

    #[test]
    fn default_output_name_uses_the_second_date() {
        assert_eq!(
            default_output_name(day(25)),
            PathBuf::from("0525_results.xlsx")
        );
    }

    #[test]
    fn run_merges_two_workbooks_end_to_end() {
        use calamine::{Data, Reader, Xlsx, open_workbook};
        use rust_xlsxwriter::Workbook;

        fn write_input(path: &std::path::Path, rows: &[(&str, f64, f64, f64)]) {
            let mut wb = Workbook::new();
            let sheet = wb.add_worksheet();
            for (c, name) in ["日期", "渠道ID", "投放花费", "d0"].iter().enumerate() {
                sheet.write_string(0, c as u16, *name).unwrap();
            }
            for (r, (date, id, spend, d0)) in rows.iter().enumerate() {
                let row = (r + 1) as u32;
                sheet.write_string(row, 0, *date).unwrap();
                sheet.write_number(row, 1, *id).unwrap();
                sheet.write_number(row, 2, *spend).unwrap();
                sheet.write_number(row, 3, *d0).unwrap();
            }
            wb.save(path).unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let t1_path = dir.path().join("table1.xlsx");
        let comb_path = dir.path().join("combined.xlsx");
        let out_path = dir.path().join("merged.xlsx");

        write_input(&t1_path, &[("2025-05-24", 8001.0, 10.5, 1.0)]);
        write_input(
            &comb_path,
            &[
                ("2025-05-24", 8001.0, 4.5, 0.5),
                ("2025-05-25", 8001.0, 7.0, 0.25),
                ("2025-05-25", 8002.0, 3.0, 0.0),
            ],
        );

        let args = Args {
            table1: t1_path,
            combined: comb_path,
            first_date: None,
            second_date: None,
            output: Some(out_path.clone()),
            lead_cols: 12,
            metric: vec![],
            group_by: vec![],
            date_col: None,
            id_col: vec![],
            preview_rows: 10,
            no_preview: true,
            sanity_check: true,
            dry_run: false,
            no_confirm: false,
            verbose: false,
        };
        run(args).unwrap();

        let mut wb: Xlsx<_> = open_workbook(&out_path).unwrap();
        let range = wb.worksheet_range_at(0).unwrap().unwrap();
        let rows: Vec<Vec<Data>> = range.rows().map(|r| r.to_vec()).collect();

        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0][1], Data::String("渠道ID".into()));
        // the identifier came back as text, not a float
        assert_eq!(rows[1][1], Data::String("8001".into()));
        assert_eq!(rows[1][0], Data::String("2025-05-24".into()));
        assert_eq!(rows[1][2], Data::Float(15.0));
        assert_eq!(rows[1][3], Data::Float(1.5));
    }

    #[test]
    fn run_refuses_to_overwrite_without_no_confirm() {
        use rust_xlsxwriter::Workbook;

        let dir = tempfile::tempdir().unwrap();
        let t1_path = dir.path().join("t1.xlsx");
        let comb_path = dir.path().join("comb.xlsx");
        let out_path = dir.path().join("out.xlsx");

        for path in [&t1_path, &comb_path] {
            let mut wb = Workbook::new();
            let sheet = wb.add_worksheet();
            sheet.write_string(0, 0, "日期").unwrap();
            sheet.write_string(0, 1, "渠道ID").unwrap();
            sheet.write_string(0, 2, "投放花费").unwrap();
            sheet.write_string(1, 0, "2025-05-24").unwrap();
            sheet.write_number(1, 1, 1.0).unwrap();
            sheet.write_number(1, 2, 2.0).unwrap();
            wb.save(path).unwrap();
        }
        std::fs::write(&out_path, b"keep me").unwrap();

        let args = Args {
            table1: t1_path,
            combined: comb_path,
            first_date: Some(day(24)),
            second_date: Some(day(24)),
            output: Some(out_path.clone()),
            lead_cols: 12,
            metric: vec![],
            group_by: vec![],
            date_col: None,
            id_col: vec![],
            preview_rows: 0,
            no_preview: true,
            sanity_check: false,
            dry_run: false,
            no_confirm: false,
            verbose: false,
        };
        let err = run(args).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read(&out_path).unwrap(), b"keep me");
    }
}

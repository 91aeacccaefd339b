use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Merge two daily report workbooks by date and group ID."
)]
pub struct Args {
    /// Partial-period workbook (e.g. 3 PM to midnight of the first date)
    pub table1: PathBuf,

    /// Combined workbook covering both dates
    pub combined: PathBuf,

    /// First reporting date (YYYY-MM-DD); inferred from the combined workbook when omitted
    #[arg(long = "first-date", value_parser = parse_cli_date)]
    pub first_date: Option<NaiveDate>,

    /// Second reporting date (YYYY-MM-DD); inferred from the combined workbook when omitted
    #[arg(long = "second-date", value_parser = parse_cli_date)]
    pub second_date: Option<NaiveDate>,

    /// Output file name; defaults to <MMDD>_results.xlsx from the second date
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Leading table1 columns always carried into the result
    #[arg(long = "lead-cols", default_value_t = 12)]
    pub lead_cols: usize,

    /// Column-name patterns carried beyond the leading block (repeatable)
    #[arg(short = 'm', long = "metric")]
    pub metric: Vec<String>,

    /// Key columns rows are merged on, besides the date (repeatable)
    #[arg(short = 'g', long = "group-by")]
    pub group_by: Vec<String>,

    /// Date column name; auto-detected when not given
    #[arg(long = "date-col")]
    pub date_col: Option<String>,

    /// Identifier columns written as text to avoid scientific notation (repeatable)
    #[arg(long = "id-col")]
    pub id_col: Vec<String>,

    /// Preview rows printed after the merge
    #[arg(long = "preview-rows", default_value_t = 10)]
    pub preview_rows: usize,

    /// Skip the preview table
    #[arg(long = "no-preview")]
    pub no_preview: bool,

    /// Cross-check merged metric totals against the inputs
    #[arg(long = "sanity-check")]
    pub sanity_check: bool,

    /// Dry-run mode (no file written)
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Overwrite an existing output file without refusing
    #[arg(long = "no-confirm")]
    pub no_confirm: bool,

    /// Verbose logging
    #[arg(long = "verbose")]
    pub verbose: bool,
}

fn parse_cli_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("invalid date '{s}': {e}"))
}

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::NaiveDateTime;
use log::{error, info, warn};

use crate::data::store::{Bar, StockMetadata};

const BAR_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y%m%d%H%M%S"];

impl Bar {
    /// Parse `timestamp,open,high,low,close,volume`.
    pub fn from_csv_line(ticker: &str, line: &str, line_num: usize) -> Result<Self, String> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();

        if fields.len() != 6 {
            return Err(format!(
                "Invalid CSV format at line {}: expected 6 fields, got {}",
                line_num + 1,
                fields.len()
            ));
        }

        let timestamp = BAR_TIMESTAMP_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(fields[0], fmt).ok())
            .ok_or_else(|| format!("Invalid timestamp at line {}: {}", line_num + 1, fields[0]))?;

        Ok(Bar {
            ticker: ticker.to_string(),
            timestamp,
            open: fields[1].parse()
                .map_err(|e| format!("Invalid open price at line {}: {}", line_num + 1, e))?,
            high: fields[2].parse()
                .map_err(|e| format!("Invalid high price at line {}: {}", line_num + 1, e))?,
            low: fields[3].parse()
                .map_err(|e| format!("Invalid low price at line {}: {}", line_num + 1, e))?,
            close: fields[4].parse()
                .map_err(|e| format!("Invalid close price at line {}: {}", line_num + 1, e))?,
            volume: fields[5].parse()
                .map_err(|e| format!("Invalid volume at line {}: {}", line_num + 1, e))?,
        })
    }
}

impl StockMetadata {
    /// Parse `ticker,name,current_price,per,pbr`. Empty or `N/A` ratios
    /// become `None`.
    pub fn from_csv_line(line: &str, line_num: usize) -> Result<Self, String> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();

        if fields.len() != 5 {
            return Err(format!(
                "Invalid CSV format at line {}: expected 5 fields, got {}",
                line_num + 1,
                fields.len()
            ));
        }

        Ok(StockMetadata {
            ticker: fields[0].to_string(),
            name: fields[1].to_string(),
            current_price: fields[2].parse()
                .map_err(|e| format!("Invalid current price at line {}: {}", line_num + 1, e))?,
            per: parse_ratio(fields[3]),
            pbr: parse_ratio(fields[4]),
        })
    }
}

fn parse_ratio(value: &str) -> Option<f64> {
    match value {
        "" | "N/A" => None,
        v => v.parse().ok(),
    }
}

fn is_header(line: &str, line_num: usize) -> bool {
    line_num == 0
        && line
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic())
            .unwrap_or(false)
}

pub struct DataLoader;

impl DataLoader {
    /// Load every row of `path` with `parse`, skipping blank lines, a leading
    /// header and rows that fail to parse.
    fn load_rows<T>(
        path: &Path,
        parse: impl Fn(&str, usize) -> Result<T, String>,
    ) -> Result<Vec<T>, Box<dyn std::error::Error>> {
        let file = File::open(path)
            .map_err(|e| format!("Failed to open file {}: {}", path.display(), e))?;

        let reader = BufReader::new(file);
        let mut rows = Vec::new();
        let mut errors = 0;

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result?;

            if line.trim().is_empty() || is_header(&line, line_num) {
                continue;
            }

            match parse(&line, line_num) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    error!("{}: {}", path.display(), e);
                    errors += 1;
                }
            }
        }

        if errors > 0 && rows.is_empty() {
            return Err(format!("Failed to load any valid data. {} errors encountered", errors).into());
        }

        if errors > 0 {
            warn!("Loaded {} records from {} with {} errors", rows.len(), path.display(), errors);
        } else {
            info!("Successfully loaded {} records from {}", rows.len(), path.display());
        }

        Ok(rows)
    }

    pub fn load_bars_from_csv(path: &Path, ticker: &str) -> Result<Vec<Bar>, Box<dyn std::error::Error>> {
        Self::load_rows(path, |line, line_num| Bar::from_csv_line(ticker, line, line_num))
    }

    /// Load `<ticker>.csv` files from `data_dir`, keyed by file stem.
    pub fn load_bar_dir(data_dir: &Path) -> Result<HashMap<String, Vec<Bar>>, Box<dyn std::error::Error>> {
        let mut bars = HashMap::new();

        for entry in std::fs::read_dir(data_dir)? {
            let path = entry?.path();

            if path.extension() != Some(std::ffi::OsStr::new("csv")) {
                continue;
            }

            if let Some(ticker) = path.file_stem().and_then(|s| s.to_str()) {
                if ticker == "stocks" {
                    continue;
                }
                match Self::load_bars_from_csv(&path, ticker) {
                    Ok(series) => {
                        info!("Loaded {} bars for ticker: {}", series.len(), ticker);
                        bars.insert(ticker.to_string(), series);
                    }
                    Err(e) => {
                        error!("Failed to load bars for ticker {}: {}", ticker, e);
                    }
                }
            }
        }

        info!("Successfully loaded bars for {} tickers", bars.len());
        Ok(bars)
    }

    pub fn load_stocks(path: &Path) -> Result<Vec<StockMetadata>, Box<dyn std::error::Error>> {
        Self::load_rows(path, StockMetadata::from_csv_line)
    }
}

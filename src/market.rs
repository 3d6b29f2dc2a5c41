//! Market-data store: lazy parquet scans over the per-timeframe OHLCV
//! tables plus the security and fundamental dimension tables.
//!
//! Ingestion lives elsewhere; this layer only resolves paths and hands out
//! `LazyFrame`s for the compiler to build on. Layout under `data_dir`:
//!
//! | file | columns |
//! |------|---------|
//! | `ohlcv_1m.parquet` … `ohlcv_1w.parquet` | `security_id`, `timestamp` (Datetime ms), `open`, `high`, `low`, `close`, `volume` (+ `extended_hours` on 1m) |
//! | `securities.parquet` | `security_id`, `ticker`, `sector`, `industry`, `market`, `locale`, `exchange`, `active` |
//! | `fundamentals.parquet` | `security_id` plus one numeric column per metric |

use std::path::{Path, PathBuf};

use polars::prelude::*;

use crate::error::{PipelineError, Result};

pub const SECURITY_ID_COL: &str = "security_id";
pub const TIMESTAMP_COL: &str = "timestamp";
pub const TICKER_COL: &str = "ticker";
pub const EXTENDED_HOURS_COL: &str = "extended_hours";

pub struct MarketStore {
    data_dir: PathBuf,
}

impl MarketStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn scan(&self, file: &str) -> Result<LazyFrame> {
        let path = self.data_dir.join(file);
        if !path.exists() {
            return Err(PipelineError::Query {
                message: format!("market table missing: {file}"),
                plan: String::new(),
            });
        }
        let path_str = path.to_string_lossy().to_string();
        LazyFrame::scan_parquet(path_str.as_str().into(), ScanArgsParquet::default()).map_err(
            |e| PipelineError::Query {
                message: format!("cannot scan {file}: {e}"),
                plan: String::new(),
            },
        )
    }

    /// Raw bars for one timeframe tag (`1m`, `1h`, `1d`, `1w`).
    pub fn bars(&self, timeframe: &str) -> Result<LazyFrame> {
        self.scan(&format!("ohlcv_{timeframe}.parquet"))
    }

    pub fn securities(&self) -> Result<LazyFrame> {
        self.scan("securities.parquet")
    }

    pub fn fundamentals(&self) -> Result<LazyFrame> {
        self.scan("fundamentals.parquet")
    }

    /// Bars joined with the security dimension and (when present) the
    /// fundamental columns: the base relation every compiled query starts
    /// from. Fundamentals are optional: a data dir without the file still
    /// serves pure-OHLCV strategies.
    pub fn universe(&self, timeframe: &str) -> Result<LazyFrame> {
        let joined = self.bars(timeframe)?.join(
            self.securities()?,
            [col(SECURITY_ID_COL)],
            [col(SECURITY_ID_COL)],
            JoinArgs::new(JoinType::Inner),
        );

        if self.data_dir.join("fundamentals.parquet").exists() {
            Ok(joined.join(
                self.fundamentals()?,
                [col(SECURITY_ID_COL)],
                [col(SECURITY_ID_COL)],
                JoinArgs::new(JoinType::Left),
            ))
        } else {
            Ok(joined)
        }
    }

    /// Fundamental column names for the dynamic vocabulary, lowercased,
    /// `security_id` excluded.
    pub fn fundamental_columns(&self) -> Result<Vec<String>> {
        let mut lf = self.fundamentals()?;
        let schema = lf.collect_schema().map_err(|e| PipelineError::Query {
            message: format!("cannot read fundamentals schema: {e}"),
            plan: String::new(),
        })?;
        Ok(schema
            .iter_names()
            .map(|n| n.to_lowercase())
            .filter(|n| n != SECURITY_ID_COL)
            .collect())
    }
}

//! Append-only capture of raw ticker polls.
//!
//! One CSV per venue under `{data_dir}/raw`, header written on first use.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

pub struct RawRecorder {
    base_path: PathBuf,
}

impl RawRecorder {
    pub fn new(data_dir: &str) -> Result<Self> {
        let base_path = PathBuf::from(data_dir).join("raw");
        std::fs::create_dir_all(&base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;
        Ok(Self { base_path })
    }

    /// Append one `{timestamp, venue, symbol, price}` row to the venue's
    /// ticker capture file. Blocking file IO; callers offload it.
    pub fn append_ticker(
        &self,
        venue: &str,
        symbol: &str,
        price: Option<f64>,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let path = self.base_path.join(format!("{}_ticker.csv", venue));
        let existed = path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if !existed {
            writer.write_record(["timestamp", "venue", "symbol", "price"])?;
        }
        writer.write_record([
            ts.to_rfc3339(),
            venue.to_string(),
            symbol.to_string(),
            price.map(|p| p.to_string()).unwrap_or_default(),
        ])?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_rows_append_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = RawRecorder::new(dir.path().to_str().unwrap()).unwrap();

        let ts = Utc::now();
        recorder
            .append_ticker("sim", "BTC/USDT", Some(35000.0), ts)
            .unwrap();
        recorder.append_ticker("sim", "BTC/USDT", None, ts).unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("raw").join("sim_ticker.csv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,venue,symbol,price");
        assert!(lines[1].contains("35000"));
    }
}

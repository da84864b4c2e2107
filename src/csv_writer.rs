use anyhow::Result;
use csv::Writer;
use std::io::Write;
use std::path::Path;

use crate::models::ReelRecord;

/// `{target}_reels.csv`
pub fn csv_filename(target_username: &str) -> String {
    format!("{}_reels.csv", target_username)
}

pub struct CsvExporter<W: Write> {
    writer: Writer<W>,
}

impl CsvExporter<std::fs::File> {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self::from_writer(std::fs::File::create(path)?))
    }
}

impl<W: Write> CsvExporter<W> {
    pub fn from_writer(inner: W) -> Self {
        Self {
            writer: Writer::from_writer(inner),
        }
    }

    pub fn write_header(&mut self) -> Result<()> {
        self.writer
            .write_record(["link", "views", "likes", "comments", "virality"])?;
        Ok(())
    }

    pub fn write_reel(&mut self, reel: &ReelRecord) -> Result<()> {
        self.writer.write_record([
            reel.link.clone(),
            reel.views.to_string(),
            reel.likes.to_string(),
            reel.comments.to_string(),
            format!("{:.3}", reel.virality),
        ])?;
        Ok(())
    }

    pub fn write_reels(&mut self, reels: &[ReelRecord]) -> Result<()> {
        self.write_header()?;
        for reel in reels {
            self.write_reel(reel)?;
        }
        Ok(())
    }

    pub fn finalize(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer.into_inner().map_err(|e| e.into_error())?)
    }
}

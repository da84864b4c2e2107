use anyhow::Result;
use rust_xlsxwriter::{Color, Format, FormatBorder, Workbook};
use std::path::Path;

use crate::models::ReelRecord;

pub const SHEET_NAME: &str = "Reels";

const HEADERS: [&str; 5] = ["Link", "Views", "Likes", "Comments", "Virality"];

/// `{target}_reels.xlsx`
pub fn report_filename(target_username: &str) -> String {
    format!("{}_reels.xlsx", target_username)
}

pub struct ExcelExporter {
    workbook: Workbook,
}

impl ExcelExporter {
    pub fn new() -> Self {
        Self {
            workbook: Workbook::new(),
        }
    }

    pub fn write_reels(&mut self, reels: &[ReelRecord]) -> Result<()> {
        let worksheet = self.workbook.add_worksheet();
        worksheet.set_name(SHEET_NAME)?;

        let header_format = Format::new()
            .set_bold()
            .set_background_color(Color::RGB(0x000080))
            .set_font_color(Color::White)
            .set_border(FormatBorder::Thin);

        for (col, header) in HEADERS.iter().enumerate() {
            worksheet.write_with_format(0, col as u16, *header, &header_format)?;
        }

        worksheet.set_column_width(0, 45)?; // Link
        worksheet.set_column_width(1, 12)?;
        worksheet.set_column_width(2, 12)?;
        worksheet.set_column_width(3, 12)?;
        worksheet.set_column_width(4, 12)?;
        worksheet.set_freeze_panes(1, 0)?;

        let cell_format = Format::new().set_border(FormatBorder::Thin);
        let count_format = Format::new()
            .set_border(FormatBorder::Thin)
            .set_num_format("#,##0");
        let virality_format = Format::new()
            .set_border(FormatBorder::Thin)
            .set_num_format("0.000");

        for (idx, reel) in reels.iter().enumerate() {
            let row = (idx + 1) as u32;

            worksheet.write_with_format(row, 0, &reel.link, &cell_format)?;
            worksheet.write_with_format(row, 1, reel.views as f64, &count_format)?;
            worksheet.write_with_format(row, 2, reel.likes as f64, &count_format)?;
            worksheet.write_with_format(row, 3, reel.comments as f64, &count_format)?;
            worksheet.write_with_format(row, 4, reel.virality, &virality_format)?;
        }

        Ok(())
    }

    pub fn save(mut self, path: &Path) -> Result<()> {
        self.workbook.save(path)?;
        Ok(())
    }

    pub fn to_bytes(mut self) -> Result<Vec<u8>> {
        Ok(self.workbook.save_to_buffer()?)
    }
}

impl Default for ExcelExporter {
    fn default() -> Self {
        Self::new()
    }
}

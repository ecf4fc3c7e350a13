//! MIS spreadsheet readers. The first row of the chosen sheet is the header.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use lead_tracker_core::MisRowInput;
use lead_tracker_store_sqlite::rows_from_table;

/// Sheet the MIS export normally carries its rows on.
pub const DEFAULT_SHEET: &str = "Main";

const WORKBOOK_EXTENSIONS: [&str; 5] = ["xlsx", "xlsm", "xlsb", "xls", "ods"];

pub fn read_mis_file(path: &Path, sheet: Option<&str>) -> Result<Vec<MisRowInput>> {
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let (headers, cells) = if extension == "csv" {
        read_csv(path)?
    } else if WORKBOOK_EXTENSIONS.contains(&extension.as_str()) {
        read_workbook(path, sheet)?
    } else {
        return Err(anyhow!(
            "unsupported MIS file `{}`: expected .csv or one of {}",
            path.display(),
            WORKBOOK_EXTENSIONS.join(", ")
        ));
    };

    rows_from_table(&headers, &cells)
}

fn read_csv(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open CSV {}", path.display()))?;

    let headers = reader
        .headers()
        .context("failed to read CSV header row")?
        .iter()
        .map(|header| header.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut cells = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("failed to read CSV row {}", index + 2))?;
        cells.push(record.iter().map(str::to_string).collect());
    }

    Ok((headers, cells))
}

fn read_workbook(path: &Path, sheet: Option<&str>) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open workbook {}", path.display()))?;

    let names = workbook.sheet_names();
    let chosen = match sheet {
        Some(requested) => names
            .iter()
            .find(|name| name.as_str() == requested)
            .cloned()
            .ok_or_else(|| anyhow!("sheet `{requested}` not found; available: {}", names.join(", ")))?,
        None => names
            .iter()
            .find(|name| name.as_str() == DEFAULT_SHEET)
            .or_else(|| names.first())
            .cloned()
            .ok_or_else(|| anyhow!("workbook {} has no sheets", path.display()))?,
    };
    if sheet.is_none() && chosen != DEFAULT_SHEET {
        tracing::warn!(sheet = chosen.as_str(), "no `Main` sheet; reading first sheet");
    }

    let range = workbook
        .worksheet_range(&chosen)
        .with_context(|| format!("failed to read sheet `{chosen}`"))?;

    let mut rows = range.rows();
    let headers = rows
        .next()
        .map(|header| header.iter().map(cell_to_string).collect())
        .unwrap_or_default();
    let cells = rows
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();

    Ok((headers, cells))
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(value) | Data::DateTimeIso(value) | Data::DurationIso(value) => value.clone(),
        Data::Int(value) => value.to_string(),
        Data::Float(value) => format!("{value}"),
        Data::Bool(value) => value.to_string(),
        Data::Error(err) => format!("#ERR({err:?})"),
        Data::DateTime(value) => format!("{value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lead_tracker_core::CAMPAIGN_ID_COLUMN;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    #[test]
    fn csv_rows_become_ingest_rows() {
        let path = std::env::temp_dir().join(format!(
            "lead-tracker-sheet-{}.csv",
            std::process::id()
        ));
        must(
            std::fs::write(
                &path,
                "\u{feff}FORM CAMPAIGN_ID,LEAD ID,Status\nPPIPL_RPM001,L-1,Contacted\n,,\nGOOGLE,L-2\n",
            )
            .map_err(anyhow::Error::from),
        );

        let rows = must(read_mis_file(&path, None));
        let _ = std::fs::remove_file(&path);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].campaign_id.as_deref(), Some("PPIPL_RPM001"));
        assert_eq!(rows[0].field("Status"), Some("Contacted"));
        assert_eq!(rows[1].fields.get(CAMPAIGN_ID_COLUMN).map(String::as_str), Some("GOOGLE"));
        assert_eq!(rows[1].field("Status"), None);
    }

    #[test]
    fn unsupported_extensions_are_rejected() {
        let err = match read_mis_file(Path::new("mis-report.pdf"), None) {
            Ok(_) => panic!("pdf must be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("unsupported MIS file"));
    }

    #[test]
    fn cells_render_as_plain_strings() {
        assert_eq!(cell_to_string(&Data::Float(2.0)), "2");
        assert_eq!(cell_to_string(&Data::Float(2.5)), "2.5");
        assert_eq!(cell_to_string(&Data::Int(42)), "42");
        assert_eq!(cell_to_string(&Data::Empty), "");
        assert_eq!(cell_to_string(&Data::String("PPIPL_RPM001".to_string())), "PPIPL_RPM001");
    }
}

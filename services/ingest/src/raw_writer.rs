//! Provenance: original bytes, per-sheet metadata and the stored grid.

use std::path::Path;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::{header_signature, serialize, SerializeOptions};
use crate::error::Result;
use crate::store::{RawFileRecord, RawSheetRecord, RawTableRecord, SheetStatus, Store};
use crate::worksheet::Worksheet;

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})[.\-/](\d{1,2})[.\-/](\d{1,2})\s*[-~～—至]+\s*(\d{4})[.\-/](\d{1,2})[.\-/](\d{1,2})")
        .unwrap()
});

static SINGLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})[.\-](\d{1,2})[.\-](\d{1,2})").unwrap());

static COMPACT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\D)(20\d{2})(\d{2})(\d{2})(?:\D|$)").unwrap());

pub fn file_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn ymd(y: &str, m: &str, d: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
}

/// Report period encoded in a vendor filename, e.g.
/// `涌益周度数据2024.01.05-2024.01.11.xlsx` or `钢联日度20240105.xlsx`.
pub fn report_date_range(filename: &str) -> Option<(NaiveDate, NaiveDate)> {
    if let Some(c) = RANGE_RE.captures(filename) {
        if let (Some(start), Some(end)) = (ymd(&c[1], &c[2], &c[3]), ymd(&c[4], &c[5], &c[6])) {
            return Some((start, end));
        }
    }
    if let Some(c) = SINGLE_RE.captures(filename) {
        if let Some(d) = ymd(&c[1], &c[2], &c[3]) {
            return Some((d, d));
        }
    }
    let c = COMPACT_RE.captures(filename)?;
    let d = ymd(&c[1], &c[2], &c[3])?;
    Some((d, d))
}

/// Final path component only, so an uploaded name cannot escape the batch dir.
fn safe_filename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "upload.bin".to_string())
}

/// Writes `bytes` to `<dir>/<batch_id>/<filename>`.
pub async fn save_to_fs(dir: &Path, batch_id: Uuid, filename: &str, bytes: &[u8]) -> Result<String> {
    let batch_dir = dir.join(batch_id.to_string());
    fs::create_dir_all(&batch_dir).await?;
    let path = batch_dir.join(safe_filename(filename));
    fs::write(&path, bytes).await?;
    Ok(path.to_string_lossy().to_string())
}

/// Records the uploaded file. Bytes are kept on disk when `raw_fs_dir` is set.
pub async fn write_raw_file(
    store: &mut dyn Store,
    batch_id: Uuid,
    filename: &str,
    bytes: &[u8],
    raw_fs_dir: Option<&Path>,
) -> Result<RawFileRecord> {
    let storage_path = match raw_fs_dir {
        Some(dir) => Some(save_to_fs(dir, batch_id, filename, bytes).await?),
        None => None,
    };
    let range = report_date_range(filename);
    let record = RawFileRecord {
        id: Uuid::new_v4(),
        batch_id,
        filename: filename.to_string(),
        file_hash: file_hash(bytes),
        file_size: i64::try_from(bytes.len()).unwrap_or(i64::MAX),
        storage_path,
        report_date_start: range.map(|r| r.0),
        report_date_end: range.map(|r| r.1),
    };
    store.insert_raw_file(&record).await?;
    info!(
        filename,
        hash = %record.file_hash,
        size = record.file_size,
        "raw file recorded"
    );
    Ok(record)
}

fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Records one sheet (status `pending`) and its serialized grid.
pub async fn write_raw_sheet(
    store: &mut dyn Store,
    raw_file_id: Uuid,
    sheet_index: usize,
    ws: &Worksheet,
    options: &SerializeOptions,
) -> Result<RawSheetRecord> {
    let sheet = RawSheetRecord {
        id: Uuid::new_v4(),
        raw_file_id,
        sheet_name: ws.name.clone(),
        sheet_index: to_i32(sheet_index),
        row_count: to_i32(ws.row_count()),
        col_count: to_i32(ws.col_count()),
        header_signature: header_signature(ws),
        parse_status: SheetStatus::Pending,
        parser_type: None,
        observation_count: 0,
        error_count: 0,
    };
    store.insert_raw_sheet(&sheet).await?;

    let table = serialize(ws, options);
    if table.skipped {
        warn!(
            sheet = %ws.name,
            estimated_bytes = table.estimated_bytes,
            limit = options.max_bytes,
            "sheet too large, grid not stored"
        );
    }
    let record = RawTableRecord {
        id: Uuid::new_v4(),
        raw_sheet_id: sheet.id,
        table_json: table.grid.as_ref().map(serde_json::to_value).transpose()?,
        merged_cells_json: serde_json::to_value(&table.merges)?,
        row_count: to_i32(table.row_count),
        col_count: to_i32(table.col_count),
        stored_rows: to_i32(table.stored_rows),
        truncated: table.truncated,
        skipped: table.skipped,
    };
    store.insert_raw_table(&record).await?;
    Ok(sheet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::worksheet::{Cell, MergeRect};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_report_date_range_forms() {
        assert_eq!(
            report_date_range("涌益咨询周度数据2024.01.05-2024.01.11.xlsx"),
            Some((d(2024, 1, 5), d(2024, 1, 11)))
        );
        assert_eq!(
            report_date_range("daily_2024-03-01.xlsx"),
            Some((d(2024, 3, 1), d(2024, 3, 1)))
        );
        assert_eq!(
            report_date_range("钢联日度20240105.xls"),
            Some((d(2024, 1, 5), d(2024, 1, 5)))
        );
        assert_eq!(report_date_range("prices.xlsx"), None);
    }

    #[test]
    fn test_file_hash_is_sha256_hex() {
        assert_eq!(
            file_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_safe_filename_strips_directories() {
        assert_eq!(safe_filename("../../etc/passwd"), "passwd");
        assert_eq!(safe_filename("a/b/report.xlsx"), "report.xlsx");
        assert_eq!(safe_filename(""), "upload.bin");
    }

    #[tokio::test]
    async fn test_write_raw_file_stores_bytes_under_batch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::new();
        let batch_id = Uuid::new_v4();
        let record = write_raw_file(&mut store, batch_id, "data_20240105.xlsx", b"bytes", Some(dir.path()))
            .await
            .unwrap();

        let expected = dir.path().join(batch_id.to_string()).join("data_20240105.xlsx");
        assert_eq!(record.storage_path.as_deref(), Some(expected.to_string_lossy().as_ref()));
        assert_eq!(std::fs::read(&expected).unwrap(), b"bytes");
        assert_eq!(record.file_size, 5);
        assert_eq!(record.report_date_start, Some(d(2024, 1, 5)));
        assert_eq!(store.raw_files().len(), 1);
    }

    #[tokio::test]
    async fn test_write_raw_sheet_records_metadata_and_skips_oversized_grid() {
        let mut store = MemoryStore::new();
        let ws = Worksheet::new(
            "价格",
            vec![
                vec![Cell::text("日期"), Cell::text("价格")],
                vec![Cell::text("2024-01-01"), Cell::Number(15.2)],
            ],
        )
        .with_merges(vec![MergeRect::new(0, 0, 0, 1)]);

        let sheet = write_raw_sheet(&mut store, Uuid::nil(), 0, &ws, &SerializeOptions::default())
            .await
            .unwrap();
        assert_eq!(sheet.row_count, 2);
        assert_eq!(sheet.parse_status, SheetStatus::Pending);
        assert!(sheet.header_signature.contains("日期"));

        let tiny = SerializeOptions {
            max_bytes: 10,
            ..SerializeOptions::default()
        };
        write_raw_sheet(&mut store, Uuid::nil(), 1, &ws, &tiny).await.unwrap();
        let tables = store.raw_tables();
        assert!(tables[0].table_json.is_some());
        assert!(tables[1].table_json.is_none());
        assert!(tables[1].skipped);
        assert_eq!(tables[1].row_count, 2);
        assert_eq!(tables[1].merged_cells_json.as_array().map(Vec::len), Some(1));
    }
}

//! Binary network files and their text sources.
//!
//! Layout of a weight or input file (little endian):
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ count: i32                               │
//! ├──────────────────────────────────────────┤
//! │ count × (row: i32, col: i32, value: T)   │
//! └──────────────────────────────────────────┘
//! ```
//! Golden label files hold `count: i32` followed by `count` i32 labels.
//!
//! Text sources use 1-based `row col value` lines (tab or space separated);
//! indices are converted to 0-based on the way in.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::dtype::Element;
use crate::error::SpindleError;
use crate::Result;

/// Bytes of the per-file count header.
pub const HEADER_BYTES: usize = 4;

/// One nonzero of a sparse matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparseEntry<T> {
    pub row: i32,
    pub col: i32,
    pub value: T,
}

impl<T: Element> SparseEntry<T> {
    pub fn new(row: i32, col: i32, value: T) -> Self {
        Self { row, col, value }
    }

    /// Bytes one record occupies on disk.
    pub const fn record_bytes() -> usize {
        8 + std::mem::size_of::<T>()
    }
}

/// Binary weight file name of a 0-based layer index.
pub fn weight_file_name(neurons: usize, layer: usize) -> String {
    format!("n{}-l{}.b", neurons, layer + 1)
}

/// Text weight file name of a 0-based layer index.
pub fn weight_text_name(neurons: usize, layer: usize) -> String {
    format!("n{}-l{}.tsv", neurons, layer + 1)
}

/// Path of a layer's binary weight file inside `dir`.
pub fn weight_path(dir: &Path, neurons: usize, layer: usize) -> PathBuf {
    dir.join(weight_file_name(neurons, layer))
}

// ============================================================================
// Binary triples
// ============================================================================

fn read_count(reader: &mut impl Read, path: &Path) -> Result<usize> {
    let mut header = [0u8; HEADER_BYTES];
    reader.read_exact(&mut header).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => SpindleError::malformed(path, "missing count header"),
        _ => SpindleError::io(path, e),
    })?;
    let count = i32::from_le_bytes(header);
    if count < 0 {
        return Err(SpindleError::malformed(path, format!("negative entry count {count}")));
    }
    Ok(count as usize)
}

fn expect_eof(reader: &mut impl Read, path: &Path) -> Result<()> {
    let mut probe = [0u8; 1];
    match reader.read(&mut probe) {
        Ok(0) => Ok(()),
        Ok(_) => Err(SpindleError::malformed(path, "trailing bytes after the last record")),
        Err(e) => Err(SpindleError::io(path, e)),
    }
}

/// Read only the entry count of a binary triple file.
pub fn read_entry_count(path: &Path) -> Result<usize> {
    let file = File::open(path).map_err(|e| SpindleError::io(path, e))?;
    let mut reader = BufReader::new(file);
    read_count(&mut reader, path)
}

/// Read every triple of a binary file, in file order.
pub fn read_entries<T: Element>(path: &Path) -> Result<Vec<SparseEntry<T>>> {
    let file = File::open(path).map_err(|e| SpindleError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let count = read_count(&mut reader, path)?;

    let record = SparseEntry::<T>::record_bytes();
    let mut buf = vec![0u8; record];
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        reader.read_exact(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => SpindleError::malformed(
                path,
                format!("truncated: header promises {count} records, found {i}"),
            ),
            _ => SpindleError::io(path, e),
        })?;
        let row = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let col = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let value = T::from_le_slice(&buf[8..]);
        entries.push(SparseEntry { row, col, value });
    }
    expect_eof(&mut reader, path)?;
    Ok(entries)
}

/// Write triples to a binary file, in order.
pub fn write_entries<T: Element>(path: &Path, entries: &[SparseEntry<T>]) -> Result<()> {
    let count = i32::try_from(entries.len())
        .map_err(|_| SpindleError::malformed(path, "too many entries for an i32 count"))?;
    let file = File::create(path).map_err(|e| SpindleError::io(path, e))?;
    let mut writer = BufWriter::new(file);

    let mut buf = Vec::with_capacity(SparseEntry::<T>::record_bytes());
    writer.write_all(&count.to_le_bytes()).map_err(|e| SpindleError::io(path, e))?;
    for entry in entries {
        buf.clear();
        buf.extend_from_slice(&entry.row.to_le_bytes());
        buf.extend_from_slice(&entry.col.to_le_bytes());
        entry.value.extend_le(&mut buf);
        writer.write_all(&buf).map_err(|e| SpindleError::io(path, e))?;
    }
    writer.flush().map_err(|e| SpindleError::io(path, e))
}

// ============================================================================
// Golden labels
// ============================================================================

/// Read one label per input row.
pub fn read_labels(path: &Path) -> Result<Vec<i32>> {
    let file = File::open(path).map_err(|e| SpindleError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let count = read_count(&mut reader, path)?;

    let mut labels = Vec::with_capacity(count);
    let mut buf = [0u8; 4];
    for i in 0..count {
        reader.read_exact(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => SpindleError::malformed(
                path,
                format!("truncated: header promises {count} labels, found {i}"),
            ),
            _ => SpindleError::io(path, e),
        })?;
        labels.push(i32::from_le_bytes(buf));
    }
    expect_eof(&mut reader, path)?;
    Ok(labels)
}

pub fn write_labels(path: &Path, labels: &[i32]) -> Result<()> {
    let count = i32::try_from(labels.len())
        .map_err(|_| SpindleError::malformed(path, "too many labels for an i32 count"))?;
    let file = File::create(path).map_err(|e| SpindleError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&count.to_le_bytes()).map_err(|e| SpindleError::io(path, e))?;
    for label in labels {
        writer.write_all(&label.to_le_bytes()).map_err(|e| SpindleError::io(path, e))?;
    }
    writer.flush().map_err(|e| SpindleError::io(path, e))
}

// ============================================================================
// Text sources
// ============================================================================

fn parse_index(field: &str, path: &Path, line_no: usize) -> Result<i32> {
    let one_based: i64 = field.parse().map_err(|_| {
        SpindleError::malformed(path, format!("line {line_no}: invalid index '{field}'"))
    })?;
    if one_based < 1 || one_based > i32::MAX as i64 {
        return Err(SpindleError::malformed(
            path,
            format!("line {line_no}: index {one_based} is not a positive 1-based i32"),
        ));
    }
    Ok((one_based - 1) as i32)
}

/// Parse `row col value` lines (1-based indices) into 0-based triples.
pub fn parse_text_entries<T: Element>(reader: impl BufRead, path: &Path) -> Result<Vec<SparseEntry<T>>> {
    let mut entries = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|e| SpindleError::io(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let [row, col, value] = fields.as_slice() else {
            return Err(SpindleError::malformed(
                path,
                format!("line {line_no}: expected 3 fields, found {}", fields.len()),
            ));
        };
        let value: f64 = value.parse().map_err(|_| {
            SpindleError::malformed(path, format!("line {line_no}: invalid value '{value}'"))
        })?;
        entries.push(SparseEntry {
            row: parse_index(row, path, line_no)?,
            col: parse_index(col, path, line_no)?,
            value: T::from_f64(value),
        });
    }
    Ok(entries)
}

/// Parse one integer label per line.
pub fn parse_text_labels(reader: impl BufRead, path: &Path) -> Result<Vec<i32>> {
    let mut labels = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| SpindleError::io(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let label = trimmed.parse::<i32>().map_err(|_| {
            SpindleError::malformed(path, format!("line {}: invalid label '{trimmed}'", idx + 1))
        })?;
        labels.push(label);
    }
    Ok(labels)
}

fn open_text(path: &Path) -> Result<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| SpindleError::io(path, e))
}

/// Convert one text triple file to binary. Returns the entry count.
pub fn convert_text_file<T: Element>(text: &Path, binary: &Path) -> Result<usize> {
    let entries = parse_text_entries::<T>(open_text(text)?, text)?;
    write_entries(binary, &entries)?;
    tracing::debug!(
        "converted {} ({} entries) -> {}",
        text.display(),
        entries.len(),
        binary.display()
    );
    Ok(entries.len())
}

/// Convert every layer of a text network directory into binary files.
///
/// Reads `n{neurons}-l{k}.tsv` for `k = 1..=layers` from `text_dir` and
/// writes `n{neurons}-l{k}.b` into `out_dir`. Returns the total entry count.
pub fn convert_weight_dir<T: Element>(
    text_dir: &Path,
    out_dir: &Path,
    neurons: usize,
    layers: usize,
) -> Result<usize> {
    std::fs::create_dir_all(out_dir).map_err(|e| SpindleError::io(out_dir, e))?;
    let mut total = 0;
    for layer in 0..layers {
        let text = text_dir.join(weight_text_name(neurons, layer));
        let binary = weight_path(out_dir, neurons, layer);
        total += convert_text_file::<T>(&text, &binary)?;
    }
    tracing::info!(
        "converted {} layers ({} nonzeros) from {} into {}",
        layers,
        total,
        text_dir.display(),
        out_dir.display()
    );
    Ok(total)
}

/// Convert a text label file to binary. Returns the label count.
pub fn convert_label_file(text: &Path, binary: &Path) -> Result<usize> {
    let labels = parse_text_labels(open_text(text)?, text)?;
    write_labels(binary, &labels)?;
    Ok(labels.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tmp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("spindle_format_{}_{name}", std::process::id()))
    }

    #[test]
    fn test_text_to_binary_roundtrip_preserves_order() {
        let text = "3\t1\t0.0625\n1 2 -0.5\n\n# comment\n2\t2\t1e-3\n1\t1\t32\n";
        let text_path = tmp("roundtrip.tsv");
        let bin_path = tmp("roundtrip.b");
        std::fs::write(&text_path, text).unwrap();

        let parsed = parse_text_entries::<f32>(Cursor::new(text), &text_path).unwrap();
        assert_eq!(convert_text_file::<f32>(&text_path, &bin_path).unwrap(), 4);
        let read_back = read_entries::<f32>(&bin_path).unwrap();

        assert_eq!(read_back, parsed);
        assert_eq!(read_back[0], SparseEntry::new(2, 0, 0.0625f32));
        assert_eq!(read_back[1], SparseEntry::new(0, 1, -0.5f32));
        assert_eq!(read_entry_count(&bin_path).unwrap(), 4);

        let _ = std::fs::remove_file(&text_path);
        let _ = std::fs::remove_file(&bin_path);
    }

    #[test]
    fn test_f64_records() {
        let path = tmp("f64.b");
        let entries = vec![SparseEntry::new(0, 7, 0.1f64), SparseEntry::new(5, 3, -2.25f64)];
        write_entries(&path, &entries).unwrap();
        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, HEADER_BYTES + 2 * SparseEntry::<f64>::record_bytes());
        assert_eq!(read_entries::<f64>(&path).unwrap(), entries);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_truncated_file() {
        let path = tmp("truncated.b");
        write_entries(&path, &[SparseEntry::new(0, 0, 1.0f32), SparseEntry::new(1, 1, 1.0f32)])
            .unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let err = read_entries::<f32>(&path).unwrap_err();
        assert!(matches!(err, SpindleError::Malformed { .. }), "{err}");
        assert!(err.to_string().contains("found 1"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_negative_count_and_trailing_bytes() {
        let path = tmp("negative.b");
        std::fs::write(&path, (-3i32).to_le_bytes()).unwrap();
        assert!(matches!(read_entries::<f32>(&path), Err(SpindleError::Malformed { .. })));

        let mut bytes = 0i32.to_le_bytes().to_vec();
        bytes.push(0xff);
        std::fs::write(&path, bytes).unwrap();
        let err = read_entries::<f32>(&path).unwrap_err();
        assert!(err.to_string().contains("trailing"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file() {
        let err = read_entries::<f32>(&tmp("does-not-exist.b")).unwrap_err();
        assert!(matches!(err, SpindleError::Io { .. }));
    }

    #[test]
    fn test_bad_text_lines() {
        let path = Path::new("bad.tsv");
        let err = parse_text_entries::<f32>(Cursor::new("1 2\n"), path).unwrap_err();
        assert!(err.to_string().contains("line 1"));
        let err = parse_text_entries::<f32>(Cursor::new("1 1 1\n0 1 1\n"), path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
        let err = parse_text_entries::<f32>(Cursor::new("1 1 abc\n"), path).unwrap_err();
        assert!(err.to_string().contains("invalid value"));
    }

    #[test]
    fn test_labels_roundtrip() {
        let text_path = tmp("labels.txt");
        let bin_path = tmp("labels.b");
        std::fs::write(&text_path, "3\n-1\n0\n1023\n").unwrap();
        assert_eq!(convert_label_file(&text_path, &bin_path).unwrap(), 4);
        assert_eq!(read_labels(&bin_path).unwrap(), vec![3, -1, 0, 1023]);
        let _ = std::fs::remove_file(&text_path);
        let _ = std::fs::remove_file(&bin_path);
    }

    #[test]
    fn test_weight_names() {
        assert_eq!(weight_file_name(1024, 0), "n1024-l1.b");
        assert_eq!(weight_text_name(65536, 119), "n65536-l120.tsv");
    }
}

use crate::device_map::DeviceMap;
use crate::parser::{LogRecord, is_target_date_line, parse_line};
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Per-file processing outcome. `Lines` counts the lines that matched the
/// date filter, not the records they expanded into (one line can carry many
/// detection events).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    Lines(usize),
    Error,
}

#[derive(Clone, Debug, Default)]
pub struct ArchiveData {
    pub records: Vec<LogRecord>,
    pub summary: BTreeMap<String, FileOutcome>,
}

pub fn extraction_dir(download_dir: &Path, address: &str, run_date: &str) -> PathBuf {
    download_dir.join(format!("{}_{}", address, run_date))
}

/// Unpacks one downloaded archive and parses every `.txt` file inside it.
/// Returns `None` when the archive itself cannot be opened or unpacked; the
/// caller then skips it in aggregation. A fault inside a single log file only
/// marks that file as `Error` in the summary.
pub fn process(
    archive_path: &Path,
    address: &str,
    run_date: &str,
    target_date_prefix: &str,
    map: &DeviceMap,
    download_dir: &Path,
) -> Option<ArchiveData> {
    let ext_dir = extraction_dir(download_dir, address, run_date);
    if let Err(e) = extract(archive_path, &ext_dir) {
        log::error!("[{}] Failed to extract {}: {}", address, archive_path.display(), e);
        return None;
    }
    log::info!("[{}] Extracted to {}", address, ext_dir.display());
    Some(scan_logs(&ext_dir, address, target_date_prefix, map))
}

fn extract(archive_path: &Path, ext_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(ext_dir)?;
    let file = std::fs::File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.unpack(ext_dir)
}

fn scan_logs(folder: &Path, address: &str, target_date_prefix: &str, map: &DeviceMap) -> ArchiveData {
    log::info!("[{}] Parsing folder {}", address, folder.display());
    let mut out = ArchiveData::default();
    for entry in WalkDir::new(folder).follow_links(false).into_iter().filter_map(Result::ok) {
        let p = entry.path();
        if !p.is_file() { continue; }
        let fname = match p.file_name().and_then(|n| n.to_str()) { Some(n) => n.to_string(), None => continue };
        if !fname.to_lowercase().ends_with(".txt") { continue; }
        match scan_file(p, target_date_prefix, map, &mut out.records) {
            Ok(matched) => { out.summary.insert(fname, FileOutcome::Lines(matched)); }
            Err(e) => {
                log::error!("[{}] Failed to parse {}: {}", address, p.display(), e);
                out.summary.insert(fname, FileOutcome::Error);
            }
        }
    }
    log::info!("[{}] Parsed {} records from {}", address, out.records.len(), folder.display());
    out
}

fn scan_file(
    path: &Path,
    target_date_prefix: &str,
    map: &DeviceMap,
    records: &mut Vec<LogRecord>,
) -> std::io::Result<usize> {
    let f = std::fs::File::open(path)?;
    let mut br = BufReader::new(f);
    let mut line = String::new();
    let mut matched = 0usize;
    loop {
        line.clear();
        if br.read_line(&mut line)? == 0 { break; }
        if is_target_date_line(&line, target_date_prefix) { matched += 1; }
        records.extend(parse_line(&line, target_date_prefix, map));
    }
    Ok(matched)
}

use crate::archive::{self, FileOutcome};
use crate::config::RunDates;
use crate::device_map::DeviceMap;
use crate::fetch::{Fetcher, parse_archive_name};
use crate::parser::LogRecord;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc;

/// Terminal state per device address after a full run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressState {
    FetchFailed,
    ProcessFailed,
    Cleaned,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub per_address: BTreeMap<String, AddressState>,
    pub devices_written: usize,
    pub total_records: usize,
}

pub struct Pipeline<'a> {
    pub addresses: Vec<String>,
    pub max_workers: usize,
    pub download_dir: PathBuf,
    pub dates: RunDates,
    pub device_map: DeviceMap,
    pub fetcher: &'a dyn Fetcher,
}

impl Pipeline<'_> {
    /// Runs all four phases. Cleanup always runs, whatever happened in the
    /// phases before it. Per-address faults never abort sibling work.
    pub fn run(&self) -> RunReport {
        let mut report = RunReport::default();

        log::info!("==== Phase 1: parallel download ====");
        let downloaded = self.fetch_all(&mut report);

        log::info!("==== Phase 2: processing {} downloaded archives ====", downloaded.len());
        let processed = self.process_all(&downloaded, &mut report);

        log::info!("==== Phase 3: writing per-device reports ====");
        self.write_reports(processed, &mut report);

        log::info!("==== Phase 4: removing transient files ====");
        self.cleanup(&downloaded, &mut report);
        report
    }

    /// Fans one fetch per address out over a bounded worker pool, collecting
    /// archive paths in completion order.
    fn fetch_all(&self, report: &mut RunReport) -> Vec<PathBuf> {
        let queue: Mutex<VecDeque<String>> = Mutex::new(self.addresses.iter().cloned().collect());
        let (tx, rx) = mpsc::channel::<(String, Option<PathBuf>)>();
        let workers = self.max_workers.clamp(1, self.addresses.len().max(1));
        std::thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                s.spawn(move || {
                    loop {
                        let address = match queue.lock() {
                            Ok(mut q) => match q.pop_front() { Some(a) => a, None => break },
                            Err(_) => break,
                        };
                        let result = self.fetcher.fetch(&address);
                        if tx.send((address, result)).is_err() { break; }
                    }
                });
            }
            drop(tx);
            let mut downloaded = Vec::new();
            for (address, result) in rx {
                match result {
                    Some(path) => { downloaded.push(path); }
                    None => { report.per_address.insert(address, AddressState::FetchFailed); }
                }
            }
            downloaded
        })
    }

    fn process_all(&self, downloaded: &[PathBuf], report: &mut RunReport) -> Vec<(String, Vec<LogRecord>)> {
        let mut out = Vec::new();
        for archive_path in downloaded {
            let filename = archive_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let Some((address, run_date)) = parse_archive_name(filename) else {
                log::error!("Cannot parse address from archive name {}; skipping.", filename);
                continue;
            };
            log::info!("[{}] Processing {}", address, filename);
            match archive::process(
                archive_path,
                &address,
                &run_date,
                &self.dates.data_date_str,
                &self.device_map,
                &self.download_dir,
            ) {
                Some(data) => {
                    log_summary(&address, &data.summary);
                    out.push((address, data.records));
                }
                None => {
                    report.per_address.insert(address, AddressState::ProcessFailed);
                }
            }
        }
        out
    }

    /// Merges records across archives by device identity and writes one CSV
    /// per device. When a device shows up in more than one archive the most
    /// recently processed address owns its report.
    fn write_reports(&self, processed: Vec<(String, Vec<LogRecord>)>, report: &mut RunReport) {
        let mut by_device: BTreeMap<String, Vec<LogRecord>> = BTreeMap::new();
        let mut device_to_address: HashMap<String, String> = HashMap::new();
        for (address, records) in processed {
            for rec in records {
                device_to_address.insert(rec.device.clone(), address.clone());
                by_device.entry(rec.device.clone()).or_default().push(rec);
            }
        }
        if by_device.is_empty() {
            log::info!("No records for {}; nothing to write.", self.dates.data_date_str);
            return;
        }
        for (device, rows) in &by_device {
            let address = device_to_address.get(device).map(String::as_str).unwrap_or("UNKNOWN_IP");
            let dir = self.download_dir.join(address);
            let csv_path = dir.join(format!(
                "{}_{}_{}.csv",
                device, self.dates.data_date_str, self.dates.run_timestamp_str
            ));
            match write_device_csv(&dir, &csv_path, rows) {
                Ok(()) => {
                    log::info!("[{}] Report written: {} ({} records)", device, csv_path.display(), rows.len());
                    report.devices_written += 1;
                    report.total_records += rows.len();
                }
                Err(e) => log::error!("[{}] Failed to write report {}: {}", device, csv_path.display(), e),
            }
        }
    }

    fn cleanup(&self, downloaded: &[PathBuf], report: &mut RunReport) {
        for archive_path in downloaded {
            let filename = archive_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if let Some((address, run_date)) = parse_archive_name(filename) {
                let ext_dir = archive::extraction_dir(&self.download_dir, &address, &run_date);
                if ext_dir.is_dir() {
                    match std::fs::remove_dir_all(&ext_dir) {
                        Ok(()) => log::info!("Removed extraction dir {}", ext_dir.display()),
                        Err(e) => log::error!("Failed to remove {}: {}", ext_dir.display(), e),
                    }
                }
                report.per_address.entry(address).or_insert(AddressState::Cleaned);
            }
            if archive_path.exists() {
                match std::fs::remove_file(archive_path) {
                    Ok(()) => log::info!("Removed archive {}", archive_path.display()),
                    Err(e) => log::error!("Failed to remove {}: {}", archive_path.display(), e),
                }
            }
        }
    }
}

fn log_summary(address: &str, summary: &BTreeMap<String, FileOutcome>) {
    log::info!("[{}] Per-file summary:", address);
    if summary.is_empty() {
        log::info!("   -> no .txt files found.");
        return;
    }
    for (file, outcome) in summary {
        match outcome {
            FileOutcome::Lines(n) => log::info!("   -> {}: {} matching lines", file, n),
            FileOutcome::Error => log::info!("   -> {}: error", file),
        }
    }
}

/// Fixed five-column report, BOM-prefixed so spreadsheets pick up UTF-8.
fn write_device_csv(dir: &Path, path: &Path, rows: &[LogRecord]) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut file = std::fs::File::create(path)?;
    file.write_all(b"\xef\xbb\xbf")?;
    let mut wtr = csv::Writer::from_writer(file);
    wtr.write_record(["device", "timestamp", "SpecDirName", "status", "detection_type"])?;
    for r in rows {
        wtr.write_record([&r.device, &r.timestamp, &r.spec_dir_name, &r.status, &r.detection_type])?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::archive_name;
    use chrono::TimeZone;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    const DATE: &str = "2025-01-15";

    fn test_dates() -> RunDates {
        let now = chrono::Local.with_ymd_and_hms(2025, 1, 16, 7, 0, 0).unwrap();
        RunDates::new(now, None)
    }

    fn build_archive(path: &Path, files: &[(&str, &[u8])]) {
        let f = std::fs::File::create(path).unwrap();
        let enc = GzEncoder::new(f, Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    /// Fetcher stub that materializes canned archives in the download dir, as
    /// the HTTP strategy would, or fails for addresses with no canned data.
    struct CannedFetcher {
        download_dir: PathBuf,
        bodies: HashMap<String, Vec<(String, Vec<u8>)>>,
    }

    impl Fetcher for CannedFetcher {
        fn fetch(&self, address: &str) -> Option<PathBuf> {
            let files = self.bodies.get(address)?;
            let dst = self.download_dir.join(archive_name(address, "20250116"));
            let borrowed: Vec<(&str, &[u8])> =
                files.iter().map(|(n, d)| (n.as_str(), d.as_slice())).collect();
            build_archive(&dst, &borrowed);
            Some(dst)
        }
    }

    fn line(device: &str, hour: u8, keys: usize) -> String {
        let mut obj = String::from("{");
        for k in 0..keys {
            if k > 0 { obj.push(','); }
            obj.push_str(&format!(r#""ev{}":{{"SpecDirName":"face","status":"ok"}}"#, k));
        }
        obj.push('}');
        format!("{}~{} {:02}:00:00~x~{}~end\n", device, DATE, hour, obj)
    }

    fn run_pipeline(
        dir: &Path,
        addresses: &[&str],
        bodies: HashMap<String, Vec<(String, Vec<u8>)>>,
    ) -> RunReport {
        let fetcher = CannedFetcher { download_dir: dir.to_path_buf(), bodies };
        let pipeline = Pipeline {
            addresses: addresses.iter().map(|s| s.to_string()).collect(),
            max_workers: 2,
            download_dir: dir.to_path_buf(),
            dates: test_dates(),
            device_map: DeviceMap::default(),
            fetcher: &fetcher,
        };
        pipeline.run()
    }

    fn transient_leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".tar.gz") || n.ends_with("_20250116"))
            .collect()
    }

    #[test]
    fn two_devices_three_records_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let body_a = format!("{}{}{}", line("cam-a", 1, 2), line("cam-a", 2, 1), line("cam-a", 3, 0));
        let body_b = line("cam-b", 4, 0);
        let mut bodies = HashMap::new();
        bodies.insert("10.0.0.1".to_string(), vec![("logs/a.txt".to_string(), body_a.into_bytes())]);
        bodies.insert("10.0.0.2".to_string(), vec![("logs/b.txt".to_string(), body_b.into_bytes())]);
        let report = run_pipeline(dir.path(), &["10.0.0.1", "10.0.0.2"], bodies);

        assert_eq!(report.total_records, 3);
        assert_eq!(report.devices_written, 1);
        assert_eq!(report.per_address.get("10.0.0.1"), Some(&AddressState::Cleaned));
        assert_eq!(report.per_address.get("10.0.0.2"), Some(&AddressState::Cleaned));

        // only cam-a had records, so only cam-a has a report
        let csv_dir = dir.path().join("10.0.0.1");
        let files: Vec<_> = std::fs::read_dir(&csv_dir).unwrap().filter_map(Result::ok).collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().to_string_lossy().to_string();
        assert!(name.starts_with("cam-a_2025-01-15_20250116_0700"));
        assert!(!dir.path().join("10.0.0.2").exists());

        let content = std::fs::read(files[0].path()).unwrap();
        assert!(content.starts_with(b"\xef\xbb\xbf"));
        let text = String::from_utf8(content[3..].to_vec()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("device,timestamp,SpecDirName,status,detection_type"));
        assert_eq!(lines.clone().count(), 3);
        assert!(lines.all(|l| l.starts_with("cam-a,2025-01-15")));
    }

    #[test]
    fn failed_fetch_contributes_nothing_and_run_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut bodies = HashMap::new();
        bodies.insert(
            "10.0.0.1".to_string(),
            vec![("logs/a.txt".to_string(), line("cam-a", 1, 1).into_bytes())],
        );
        // 10.0.0.9 has no canned archive: both "attempts" fail
        let report = run_pipeline(dir.path(), &["10.0.0.1", "10.0.0.9"], bodies);

        assert_eq!(report.per_address.get("10.0.0.9"), Some(&AddressState::FetchFailed));
        assert_eq!(report.per_address.get("10.0.0.1"), Some(&AddressState::Cleaned));
        assert_eq!(report.devices_written, 1);
        assert!(!dir.path().join("10.0.0.9").exists());
        assert!(transient_leftovers(dir.path()).is_empty());
    }

    #[test]
    fn corrupt_archive_is_skipped_and_still_cleaned() {
        let dir = tempfile::tempdir().unwrap();

        struct BrokenFetcher { download_dir: PathBuf }
        impl Fetcher for BrokenFetcher {
            fn fetch(&self, address: &str) -> Option<PathBuf> {
                let dst = self.download_dir.join(archive_name(address, "20250116"));
                std::fs::write(&dst, b"garbage, not a tar.gz").unwrap();
                Some(dst)
            }
        }

        let fetcher = BrokenFetcher { download_dir: dir.path().to_path_buf() };
        let pipeline = Pipeline {
            addresses: vec!["10.0.0.1".to_string()],
            max_workers: 1,
            download_dir: dir.path().to_path_buf(),
            dates: test_dates(),
            device_map: DeviceMap::default(),
            fetcher: &fetcher,
        };
        let report = pipeline.run();

        assert_eq!(report.per_address.get("10.0.0.1"), Some(&AddressState::ProcessFailed));
        assert_eq!(report.devices_written, 0);
        // the unprocessable archive is still deleted in phase 4
        assert!(!dir.path().join(archive_name("10.0.0.1", "20250116")).exists());
    }

    #[test]
    fn cleanup_removes_archives_and_extraction_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut bodies = HashMap::new();
        bodies.insert(
            "10.0.0.1".to_string(),
            vec![("logs/a.txt".to_string(), line("cam-a", 1, 1).into_bytes())],
        );
        run_pipeline(dir.path(), &["10.0.0.1"], bodies);

        assert!(!dir.path().join(archive_name("10.0.0.1", "20250116")).exists());
        assert!(!dir.path().join("10.0.0.1_20250116").exists());
        // the report itself survives cleanup
        assert!(dir.path().join("10.0.0.1").is_dir());
    }

    #[test]
    fn last_processed_address_owns_shared_device() {
        let dir = tempfile::tempdir().unwrap();

        // both archives report the same device identity
        struct TwinFetcher { download_dir: PathBuf }
        impl Fetcher for TwinFetcher {
            fn fetch(&self, address: &str) -> Option<PathBuf> {
                let dst = self.download_dir.join(archive_name(address, "20250116"));
                let body = format!("cam-x~{} 01:00:00~x~{{\"ev\":{{}}}}~end\n", DATE);
                let f = std::fs::File::create(&dst).unwrap();
                let enc = GzEncoder::new(f, Compression::default());
                let mut b = tar::Builder::new(enc);
                let mut h = tar::Header::new_gnu();
                h.set_size(body.len() as u64);
                h.set_mode(0o644);
                h.set_cksum();
                b.append_data(&mut h, "logs/x.txt", body.as_bytes()).unwrap();
                b.into_inner().unwrap().finish().unwrap();
                Some(dst)
            }
        }

        let fetcher = TwinFetcher { download_dir: dir.path().to_path_buf() };
        let pipeline = Pipeline {
            addresses: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            max_workers: 1,
            download_dir: dir.path().to_path_buf(),
            dates: test_dates(),
            device_map: DeviceMap::default(),
            fetcher: &fetcher,
        };
        let report = pipeline.run();

        assert_eq!(report.devices_written, 1);
        assert_eq!(report.total_records, 2);
        // exactly one address directory holds the merged report
        let dirs: Vec<_> = ["10.0.0.1", "10.0.0.2"]
            .iter()
            .filter(|a| dir.path().join(a).is_dir())
            .collect();
        assert_eq!(dirs.len(), 1);
    }
}

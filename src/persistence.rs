use chrono::{DateTime, Local};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// File name stamp for one experiment run.
pub fn run_stamp(start: DateTime<Local>) -> String {
    start.format("%m%d%Y-%H%M%S").to_string()
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Append-only log of every JSON telemetry payload received, one per line.
pub struct RawTelemetryLog {
    file: File,
}

impl RawTelemetryLog {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self {
            file: open_append(path.as_ref())?,
        })
    }

    pub fn for_run(log_dir: &Path, stamp: &str) -> io::Result<Self> {
        Self::open(log_dir.join(format!("exp-{stamp}_mqtt.txt")))
    }

    pub fn append(&mut self, json: &serde_json::Value) -> io::Result<()> {
        writeln!(self.file, "{json}")
    }
}

/// One change of transmission parameters decided by the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub datarate_from: u8,
    pub datarate_to: u8,
    pub power_from: u8,
    pub power_to: u8,
    pub transmissions: u32,
    pub gateway: String,
    pub snr: f64,
}

/// Append-only experiment log: start banner, one line per transition, end banner.
pub struct TransitionLog {
    path: PathBuf,
    file: File,
}

impl TransitionLog {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        Ok(Self {
            file: open_append(&path)?,
            path,
        })
    }

    pub fn for_run(log_dir: &Path, stamp: &str) -> io::Result<Self> {
        Self::open(log_dir.join(format!("exp-{stamp}_data.txt")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start(&mut self, stamp: &str) -> io::Result<()> {
        writeln!(self.file, "Starting experimentation at time:{stamp}")
    }

    pub fn record(&mut self, t: &Transition) -> io::Result<()> {
        let now = Local::now().format("%m/%d/%Y, %H:%M:%S");
        writeln!(
            self.file,
            "{now} : Datarate {} to {}\t\tTransmission Power {} to {} - Nb message : {} - Best GW {} - snr : {}",
            t.datarate_from, t.datarate_to, t.power_from, t.power_to, t.transmissions, t.gateway, t.snr
        )
    }

    pub fn finish(&mut self) -> io::Result<()> {
        let now = Local::now().format("%m/%d/%Y, %H:%M:%S");
        writeln!(self.file, "End of experimentation,time:{now}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_log_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TransitionLog::for_run(&dir.path().join("logs"), "01012026-000000").unwrap();

        log.start("01012026-000000").unwrap();
        log.record(&Transition {
            datarate_from: 0,
            datarate_to: 5,
            power_from: 1,
            power_to: 3,
            transmissions: 7,
            gateway: "gw-roof".into(),
            snr: 4.5,
        })
        .unwrap();
        log.finish().unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Starting experimentation"));
        assert!(lines[1].contains("Datarate 0 to 5"));
        assert!(lines[1].contains("Transmission Power 1 to 3"));
        assert!(lines[1].contains("Best GW gw-roof"));
        assert!(lines[2].starts_with("End of experimentation"));
    }

    #[test]
    fn raw_log_appends_compact_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.txt");
        {
            let mut log = RawTelemetryLog::open(&path).unwrap();
            log.append(&serde_json::json!({"a": 1})).unwrap();
        }
        let mut log = RawTelemetryLog::open(&path).unwrap();
        log.append(&serde_json::json!({"b": [1, 2]})).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "{\"a\":1}\n{\"b\":[1,2]}\n");
    }
}

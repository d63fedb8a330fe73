use eyre::{eyre, Result};
use log::debug;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

// Global timing storage for analysis
use lazy_static::lazy_static;
use std::sync::Mutex;

use crate::ProcessingMode;

lazy_static! {
    static ref TIMING_LOG: Mutex<Vec<TimingData>> = Mutex::new(Vec::new());
}

// Check if benchmark mode is enabled
pub fn is_benchmark_mode() -> bool {
    std::env::var("MBX_BENCHMARK").is_ok() || std::env::var("MBX_TIMING").is_ok()
}

// Timing instrumentation framework: how much of an invocation went to config
// loading, IPC with the daemon, and actual processing, per mode
#[derive(Debug, Clone)]
pub struct TimingData {
    pub total_duration: Duration,
    pub config_load_duration: Option<Duration>,
    pub ipc_duration: Option<Duration>,
    pub processing_duration: Duration,
    pub mode: ProcessingMode,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone)]
pub struct TimingCollector {
    start_time: Instant,
    config_start: Option<Instant>,
    ipc_start: Option<Instant>,
    processing_start: Option<Instant>,
    mode: ProcessingMode,
}

impl TimingCollector {
    pub fn new(mode: ProcessingMode) -> Self {
        TimingCollector {
            start_time: Instant::now(),
            config_start: None,
            ipc_start: None,
            processing_start: None,
            mode,
        }
    }

    pub fn start_config_load(&mut self) {
        self.config_start = Some(Instant::now());
    }

    pub fn start_ipc(&mut self) {
        self.ipc_start = Some(Instant::now());
    }

    pub fn start_processing(&mut self) {
        self.processing_start = Some(Instant::now());
    }

    pub fn set_mode(&mut self, mode: ProcessingMode) {
        self.mode = mode;
    }

    pub fn finalize(self) -> TimingData {
        TimingData {
            total_duration: self.start_time.elapsed(),
            config_load_duration: self.config_start.map(|start| start.elapsed()),
            ipc_duration: self.ipc_start.map(|start| start.elapsed()),
            processing_duration: self.processing_start.map(|start| start.elapsed()).unwrap_or_default(),
            mode: self.mode,
            timestamp: SystemTime::now(),
        }
    }
}

impl TimingData {
    pub fn log_detailed(&self) {
        if !is_benchmark_mode() {
            return;
        }

        let emoji = match self.mode {
            ProcessingMode::Daemon => "👹",
            ProcessingMode::Direct => "📥",
        };

        debug!("{} === TIMING BREAKDOWN ({:?}) ===", emoji, self.mode);
        debug!("  🎯 Total execution: {:.3}ms", self.total_duration.as_secs_f64() * 1000.0);

        if let Some(config_duration) = self.config_load_duration {
            debug!("  📋 Config loading: {:.3}ms", config_duration.as_secs_f64() * 1000.0);
        }

        if let Some(ipc_duration) = self.ipc_duration {
            debug!("  🔌 IPC communication: {:.3}ms", ipc_duration.as_secs_f64() * 1000.0);
        }

        debug!("  ⚙️  Processing: {:.3}ms", self.processing_duration.as_secs_f64() * 1000.0);
    }

    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{:?},{:.3},{:.3},{:.3},{:.3}",
            self.timestamp
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
            self.mode,
            self.total_duration.as_secs_f64() * 1000.0,
            self.config_load_duration.map(|d| d.as_secs_f64() * 1000.0).unwrap_or(0.0),
            self.ipc_duration.map(|d| d.as_secs_f64() * 1000.0).unwrap_or(0.0),
            self.processing_duration.as_secs_f64() * 1000.0
        )
    }
}

pub fn log_timing(timing: TimingData) {
    if is_benchmark_mode() {
        timing.log_detailed();
    }

    // Always keep an in-memory tail for the status command (minimal overhead)
    if let Ok(mut log) = TIMING_LOG.lock() {
        log.push(timing.clone());

        let len = log.len();
        if len > 1000 {
            log.drain(0..len - 1000);
        }
    }

    // Only persist to CSV when benchmark mode is enabled
    if is_benchmark_mode() {
        if let Ok(timing_file_path) = get_timing_file_path() {
            if let Some(parent) = timing_file_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            if let Ok(mut file) = OpenOptions::new()
                .create(true)
                .append(true)
                .open(timing_file_path)
            {
                use std::io::Write;
                let _ = writeln!(file, "{}", timing.to_csv_line());
            }
        }
    }
}

/// Average daemon and direct durations plus sample counts, from this
/// process's in-memory log.
pub fn get_timing_summary() -> Result<(Duration, Duration, usize, usize)> {
    let log = TIMING_LOG
        .lock()
        .map_err(|_| eyre!("timing log poisoned"))?;

    let daemon_timings: Vec<_> = log
        .iter()
        .filter(|t| matches!(t.mode, ProcessingMode::Daemon))
        .collect();
    let direct_timings: Vec<_> = log
        .iter()
        .filter(|t| matches!(t.mode, ProcessingMode::Direct))
        .collect();

    let daemon_avg = if daemon_timings.is_empty() {
        Duration::default()
    } else {
        daemon_timings.iter().map(|t| t.total_duration).sum::<Duration>()
            / daemon_timings.len() as u32
    };

    let direct_avg = if direct_timings.is_empty() {
        Duration::default()
    } else {
        direct_timings.iter().map(|t| t.total_duration).sum::<Duration>()
            / direct_timings.len() as u32
    };

    Ok((daemon_avg, direct_avg, daemon_timings.len(), direct_timings.len()))
}

pub fn get_timing_file_path() -> Result<PathBuf> {
    let home_dir = dirs::home_dir().ok_or_else(|| eyre!("Could not determine home directory"))?;
    Ok(crate::data_dir(&home_dir).join("timing_data.csv"))
}

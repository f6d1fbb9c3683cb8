use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static LOG_TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();
static CAPTURE: CaptureRing = CaptureRing::new();

/// One log line retained in the capture ring.
#[derive(Clone, Debug, Serialize)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub job: Option<String>,
    pub msg: String,
}

/// Bounded buffer of recent lines, served by the admin API.
struct CaptureRing {
    capacity: AtomicUsize,
    lines: Mutex<VecDeque<CapturedLog>>,
}

impl CaptureRing {
    const fn new() -> Self {
        Self {
            capacity: AtomicUsize::new(0),
            lines: Mutex::new(VecDeque::new()),
        }
    }

    fn is_enabled(&self) -> bool {
        self.capacity.load(Ordering::Relaxed) > 0
    }

    fn resize(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        if let Ok(mut lines) = self.lines.lock() {
            let excess = lines.len().saturating_sub(capacity);
            lines.drain(..excess);
        }
    }

    fn push(&self, entry: CapturedLog) {
        let capacity = self.capacity.load(Ordering::Relaxed);
        if capacity == 0 {
            return;
        }
        let Ok(mut lines) = self.lines.lock() else {
            return;
        };
        if lines.len() >= capacity {
            lines.pop_front();
        }
        lines.push_back(entry);
    }

    fn tail(&self, limit: usize) -> Vec<CapturedLog> {
        let Ok(lines) = self.lines.lock() else {
            return Vec::new();
        };
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }
}

thread_local! {
    static THREAD_JOB: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub fn init(config: LogConfig) {
    LOG_LEVEL.store(config.level as u8, Ordering::Relaxed);
    LOG_FORMAT.store(config.format as u8, Ordering::Relaxed);
    LOG_TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

/// Appends all subsequent output to `path` instead of stderr.
///
/// Can only be set once per process; a second call returns an error.
pub fn redirect_to_file(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    LOG_FILE
        .set(Mutex::new(file))
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "log file already set"))
}

/// Keeps the last `capacity` lines in memory; zero turns capture off.
pub fn enable_capture(capacity: usize) {
    CAPTURE.resize(capacity);
}

/// Up to `limit` of the most recent captured lines, oldest first.
pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    CAPTURE.tail(limit)
}

/// Tags every line logged from the current thread with a job label.
pub fn set_thread_job(job: Option<&str>) {
    THREAD_JOB.with(|slot| *slot.borrow_mut() = job.map(str::to_string));
}

pub fn thread_job() -> Option<String> {
    THREAD_JOB.with(|slot| slot.borrow().clone())
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let entry = CapturedLog {
        ts_ms: now.as_millis().try_into().unwrap_or(u64::MAX),
        level,
        target,
        job: thread_job(),
        msg: args.to_string(),
    };
    let format = match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => Format::Json,
        _ => Format::Text,
    };
    let timestamps = LOG_TIMESTAMPS.load(Ordering::Relaxed);
    let rendered = render(&entry, format, timestamps, (file, line));

    match LOG_FILE.get() {
        Some(file) => {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{rendered}");
            }
        }
        None => {
            let _ = writeln!(io::stderr().lock(), "{rendered}");
        }
    }

    if CAPTURE.is_enabled() {
        CAPTURE.push(entry);
    }
}

fn render(
    entry: &CapturedLog,
    format: Format,
    timestamps: bool,
    (file, line): (&'static str, u32),
) -> String {
    match format {
        Format::Text => {
            let mut out = String::with_capacity(entry.msg.len() + 64);
            if timestamps {
                let ts = Timestamp {
                    unix_seconds: entry.ts_ms / 1000,
                    millis: (entry.ts_ms % 1000) as u32,
                };
                out.push_str(&ts.to_string());
                out.push(' ');
            }
            out.push_str(entry.level.as_str());
            out.push(' ');
            out.push_str(entry.target);
            if let Some(job) = entry.job.as_deref() {
                out.push_str(" job=");
                out.push_str(job);
            }
            out.push_str(": ");
            out.push_str(&entry.msg);
            out
        }
        Format::Json => json!({
            "ts_ms": entry.ts_ms,
            "level": entry.level.as_str(),
            "target": entry.target,
            "file": file,
            "line": line,
            "job": entry.job,
            "msg": entry.msg,
        })
        .to_string(),
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

struct Timestamp {
    unix_seconds: u64,
    millis: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SECS_PER_DAY: u64 = 86_400;
        let days = (self.unix_seconds / SECS_PER_DAY) as i64;
        let secs_of_day = self.unix_seconds % SECS_PER_DAY;
        let (year, month, day) = civil_from_days(days);
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
            secs_of_day / 3600,
            (secs_of_day % 3600) / 60,
            secs_of_day % 60,
            self.millis
        )
    }
}

// Howard Hinnant's civil_from_days (public domain).
fn civil_from_days(days_since_unix_epoch: i64) -> (i32, u32, u32) {
    let z = days_since_unix_epoch + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = (yoe as i32) + (era as i32) * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = y + if m <= 2 { 1 } else { 0 };
    (year, m, d)
}

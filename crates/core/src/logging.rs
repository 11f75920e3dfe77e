//! Category-based logging shared by every GPU component.
//!
//! Messages are filtered by a per-category level that falls back to a global
//! level, rate limited per category, and written either to stderr or to a log
//! file drained by a background thread.
//!
//! # Categories
//!
//! - **Vram**: CPU-side transfers, shadow synchronisation, round trips
//! - **Rasterizer**: batch submission and pipeline state
//! - **Shaders**: shader generation, compilation and the program cache
//! - **Display**: display composition and host display interaction
//! - **Sync**: fences, stream buffers, frame resource rings
//! - **Present**: the presentation thread and swap chain status
//!
//! # Usage
//!
//! ```rust
//! use emu_core::logging::{log, LogCategory, LogLevel};
//!
//! // The closure only runs when the message will actually be written
//! log(LogCategory::Vram, LogLevel::Debug, || {
//!     format!("read back {}x{} at ({}, {})", 64, 32, 0, 0)
//! });
//! ```

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

const CATEGORY_COUNT: usize = 6;

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse a level name or digit (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            LogLevel::Off => "OFF",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

/// Log category for the GPU subsystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// VRAM transfers and shadow synchronisation
    Vram,
    /// Batch building and draw submission
    Rasterizer,
    /// Shader generation, compilation and caching
    Shaders,
    /// Display composition
    Display,
    /// Fences, stream buffers and frame resources
    Sync,
    /// Presentation
    Present,
}

impl LogCategory {
    /// Every category, in index order
    pub const ALL: [LogCategory; CATEGORY_COUNT] = [
        LogCategory::Vram,
        LogCategory::Rasterizer,
        LogCategory::Shaders,
        LogCategory::Display,
        LogCategory::Sync,
        LogCategory::Present,
    ];

    fn index(self) -> usize {
        match self {
            LogCategory::Vram => 0,
            LogCategory::Rasterizer => 1,
            LogCategory::Shaders => 2,
            LogCategory::Display => 3,
            LogCategory::Sync => 4,
            LogCategory::Present => 5,
        }
    }

    /// Parse a category name (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| format!("{:?}", c).eq_ignore_ascii_case(s))
    }
}

#[derive(Default)]
struct CategoryWindow {
    timestamps: VecDeque<Instant>,
    dropped: usize,
    last_drop_report: Option<Instant>,
}

/// Sliding one-second window limiting how many messages each category emits
struct RateLimiter {
    max_logs_per_second: AtomicUsize,
    window_duration: Duration,
    windows: Mutex<[CategoryWindow; CATEGORY_COUNT]>,
}

impl RateLimiter {
    fn new(max_logs_per_second: usize) -> Self {
        Self {
            max_logs_per_second: AtomicUsize::new(max_logs_per_second),
            window_duration: Duration::from_secs(1),
            windows: Mutex::new(Default::default()),
        }
    }

    fn set_max_logs_per_second(&self, max: usize) {
        self.max_logs_per_second.store(max, Ordering::Relaxed);
    }

    fn get_max_logs_per_second(&self) -> usize {
        self.max_logs_per_second.load(Ordering::Relaxed)
    }

    fn windows(&self) -> MutexGuard<'_, [CategoryWindow; CATEGORY_COUNT]> {
        // A panic while holding the lock cannot leave the window in a state
        // worse than "slightly miscounted", so poisoning is ignored.
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns whether the message may be written, plus a dropped-message
    /// count when one should be reported.
    fn should_allow(&self, category: LogCategory) -> (bool, Option<usize>) {
        let now = Instant::now();
        let mut windows = self.windows();
        let window = &mut windows[category.index()];

        while let Some(&front) = window.timestamps.front() {
            if now.duration_since(front) > self.window_duration {
                window.timestamps.pop_front();
            } else {
                break;
            }
        }

        if window.timestamps.len() < self.get_max_logs_per_second() {
            window.timestamps.push_back(now);
            if window.dropped > 0 {
                let dropped = std::mem::take(&mut window.dropped);
                window.last_drop_report = Some(now);
                return (true, Some(dropped));
            }
            return (true, None);
        }

        window.dropped += 1;
        let report_due = window
            .last_drop_report
            .map_or(true, |last| now.duration_since(last) >= self.window_duration);
        if report_due {
            let dropped = std::mem::take(&mut window.dropped);
            window.last_drop_report = Some(now);
            (false, Some(dropped))
        } else {
            (false, None)
        }
    }
}

/// Global logging configuration
pub struct LogConfig {
    global_level: AtomicU8,
    category_levels: [AtomicU8; CATEGORY_COUNT],
    log_sender: Mutex<Option<Sender<String>>>,
    file_logging_enabled: AtomicBool,
    rate_limiter: RateLimiter,
}

impl LogConfig {
    /// Everything off, 60 messages per second per category
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            category_levels: Default::default(),
            log_sender: Mutex::new(None),
            file_logging_enabled: AtomicBool::new(false),
            rate_limiter: RateLimiter::new(60),
        }
    }

    /// Process-wide configuration
    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.category_levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.category_levels[category.index()].load(Ordering::Relaxed))
    }

    /// A category with its own level ignores the global level; a category
    /// left at `Off` inherits it.
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        if level == LogLevel::Off {
            return false;
        }
        match self.get_level(category) {
            LogLevel::Off => level <= self.get_global_level(),
            category_level => level <= category_level,
        }
    }

    /// Apply a filter string such as `"warn,shaders=debug,vram=trace"`.
    ///
    /// A bare level sets the global level. Unknown entries are returned so
    /// the caller can report them.
    pub fn apply_filter(&self, filter: &str) -> Vec<String> {
        let mut rejected = Vec::new();
        for entry in filter.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once('=') {
                Some((name, level)) => {
                    match (LogCategory::from_str(name.trim()), LogLevel::from_str(level.trim())) {
                        (Some(category), Some(level)) => self.set_level(category, level),
                        _ => rejected.push(entry.to_string()),
                    }
                }
                None => match LogLevel::from_str(entry) {
                    Some(level) => self.set_global_level(level),
                    None => rejected.push(entry.to_string()),
                },
            }
        }
        rejected
    }

    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for category in LogCategory::ALL {
            self.set_level(category, LogLevel::Off);
        }
    }

    /// Maximum messages per second per category
    pub fn set_rate_limit(&self, max_logs_per_second: usize) {
        self.rate_limiter.set_max_logs_per_second(max_logs_per_second);
    }

    pub fn get_rate_limit(&self) -> usize {
        self.rate_limiter.get_max_logs_per_second()
    }

    /// Route output to `path`, appending. A background writer thread owns the
    /// file; replacing the sender stops the previous writer.
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new()
            .name("gpu-log-writer".to_string())
            .spawn(move || {
                let mut file = file;
                while let Ok(message) = receiver.recv() {
                    let _ = writeln!(file, "{}", message);
                    let _ = file.flush();
                }
            })?;

        *self.sender() = Some(sender);
        self.file_logging_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop writing to the log file and return to stderr
    pub fn clear_log_file(&self) {
        *self.sender() = None;
        self.file_logging_enabled.store(false, Ordering::Relaxed);
    }

    fn sender(&self) -> MutexGuard<'_, Option<Sender<String>>> {
        self.log_sender.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_message(&self, message: String) {
        if self.file_logging_enabled.load(Ordering::Relaxed) {
            if let Some(sender) = self.sender().as_ref() {
                if let Err(returned) = sender.send(message) {
                    eprintln!("{}", returned.0);
                }
                return;
            }
        }
        eprintln!("{}", message);
    }
}

fn format_line(category: LogCategory, level: LogLevel, message: &str) -> String {
    format!("[{:?}] {}: {}", category, level.tag(), message)
}

/// Write a message for `category` at `level`.
///
/// The closure is evaluated only when the message passes both the level
/// filter and the rate limiter, so formatting costs nothing when disabled.
/// When messages were dropped by the rate limiter a summary line is written
/// first.
///
/// ```rust
/// use emu_core::logging::{log, LogCategory, LogLevel};
///
/// log(LogCategory::Shaders, LogLevel::Info, || {
///     format!("compiled {} of {} programs", 12, 159)
/// });
/// ```
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }

    let (allowed, dropped) = config.rate_limiter.should_allow(category);
    if let Some(count) = dropped.filter(|&c| c > 0) {
        config.write_message(format_line(
            category,
            LogLevel::Warn,
            &format!("rate limit exceeded, {} message(s) dropped", count),
        ));
    }
    if allowed {
        config.write_message(format_line(category, level, &message_fn()));
    }
}

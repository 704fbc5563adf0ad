// src/logging/mod.rs - Async logger with console/file/telnet fan-out
//
// Core features:
// - Producers format a record and try_send it into a bounded ring; a
//   full ring falls back to a synchronous sink write so nothing is lost
// - One consumer thread drains the ring and fans out to the configured
//   sinks: console (ANSI color per level), file (append, no color),
//   connected admin-console clients (CRLF)
// - Installs itself as the `log` facade backend, so `debug!`/`warn!`
//   calls from every module in the process flow through the same ring
// - FATAL sits above the facade levels; with `abort_on_fatal` the
//   consumer terminates the process after the record is written

pub mod console;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use slab::Slab;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use self::console::ConsoleServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Level {
    /// Single-letter tag used inside formatted records.
    pub fn letter(self) -> &'static str {
        match self {
            Level::Trace => "T",
            Level::Debug => "D",
            Level::Info => "I",
            Level::Warning => "W",
            Level::Error => "E",
            Level::Fatal => "F",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }

    /// Case-insensitive; accepts full names, single letters and the
    /// common aliases (`warn`, `err`). Unknown input maps to Info.
    pub fn parse(s: &str) -> Level {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" | "T" => Level::Trace,
            "DEBUG" | "D" => Level::Debug,
            "INFO" | "I" => Level::Info,
            "WARNING" | "WARN" | "W" => Level::Warning,
            "ERROR" | "ERR" | "E" => Level::Error,
            "FATAL" | "F" => Level::Fatal,
            _ => Level::Info,
        }
    }

    fn from_u8(v: u8) -> Level {
        match v {
            0 => Level::Trace,
            1 => Level::Debug,
            2 => Level::Info,
            3 => Level::Warning,
            4 => Level::Error,
            _ => Level::Fatal,
        }
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Level::Error,
            log::Level::Warn => Level::Warning,
            log::Level::Info => Level::Info,
            log::Level::Debug => Level::Debug,
            log::Level::Trace => Level::Trace,
        }
    }
}

/// Which sinks receive records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Targets {
    pub console: bool,
    pub file: bool,
    pub telnet: bool,
}

impl Targets {
    pub const CONSOLE: Targets = Targets {
        console: true,
        file: false,
        telnet: false,
    };
}

#[derive(Debug, Clone)]
pub struct FileConfig {
    pub path: PathBuf,
    /// Size-based rolling, declared only; appends are always preserved.
    pub roll_size_mb: usize,
    pub roll_by_day: bool,
    pub max_files: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("otl.log"),
            roll_size_mb: 100,
            roll_by_day: false,
            max_files: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelnetConfig {
    pub port: u16,
    pub max_connections: usize,
    pub enable: bool,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            port: 2323,
            max_connections: 5,
            enable: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub targets: Targets,
    pub level: Level,
    pub file: FileConfig,
    pub telnet: TelnetConfig,
    pub enable_console: bool,
    pub abort_on_fatal: bool,
    pub queue_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            targets: Targets::CONSOLE,
            level: Level::Info,
            file: FileConfig::default(),
            telnet: TelnetConfig::default(),
            enable_console: true,
            abort_on_fatal: false,
            queue_size: 4096,
        }
    }
}

struct Record {
    timestamp: SystemTime,
    level: Level,
    module: String,
    file: String,
    line: u32,
    content: String,
    pid: u32,
    tid: u64,
}

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const MAGENTA: &str = "\x1b[35m";
    pub const CYAN: &str = "\x1b[36m";
    pub const WHITE: &str = "\x1b[37m";
}

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Trace => colors::WHITE,
        Level::Debug => colors::CYAN,
        Level::Info => colors::GREEN,
        Level::Warning => colors::YELLOW,
        Level::Error => colors::RED,
        Level::Fatal => colors::MAGENTA,
    }
}

fn format_timestamp(ts: SystemTime) -> String {
    let since_epoch = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_epoch.as_secs() as i64;
    let millis = since_epoch.subsec_millis();
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let t = secs as libc::time_t;
    unsafe {
        libc::localtime_r(&t, &mut tm);
    }
    format!(
        "{}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        millis
    )
}

fn format_record(record: &Record, color: bool) -> String {
    let letter = if color {
        format!(
            "{}{}{}",
            level_color(record.level),
            record.level.letter(),
            colors::RESET
        )
    } else {
        record.level.letter().to_string()
    };
    format!(
        "{} {}/{} ({}:{}) {}:{} {}",
        format_timestamp(record.timestamp),
        letter,
        record.module,
        record.pid,
        record.tid,
        record.file,
        record.line,
        record.content
    )
}

#[cfg(target_os = "linux")]
fn current_tid() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> u64 {
    0
}

/// Sink state shared between producers (fallback path), the consumer
/// thread, and the admin console.
pub(crate) struct Sinks {
    config: Mutex<LogConfig>,
    file: Mutex<Option<File>>,
    pub(crate) clients: Mutex<Slab<TcpStream>>,
}

impl Sinks {
    fn new(config: LogConfig) -> Self {
        Self {
            config: Mutex::new(config),
            file: Mutex::new(None),
            clients: Mutex::new(Slab::new()),
        }
    }

    fn config(&self) -> MutexGuard<'_, LogConfig> {
        self.config.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open_file_if_needed(&self) {
        let path = {
            let cfg = self.config();
            if !cfg.targets.file {
                None
            } else {
                Some(cfg.file.path.clone())
            }
        };
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        match path {
            Some(path) => {
                if file.is_none() {
                    match OpenOptions::new().create(true).append(true).open(&path) {
                        Ok(f) => *file = Some(f),
                        Err(e) => eprintln!("otl-log: cannot open {}: {e}", path.display()),
                    }
                }
            }
            None => *file = None,
        }
    }

    fn write_record(&self, record: &Record) {
        let (targets, enable_console, abort_on_fatal) = {
            let cfg = self.config();
            (cfg.targets, cfg.enable_console, cfg.abort_on_fatal)
        };

        if targets.file {
            let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(f) = file.as_mut() {
                let _ = writeln!(f, "{}", format_record(record, false));
            }
        }

        if targets.console && enable_console {
            let line = format_record(record, true);
            if record.level >= Level::Error {
                eprintln!("{line}");
            } else {
                println!("{line}");
            }
        }

        if targets.telnet {
            let line = format!("{}\r\n", format_record(record, false));
            let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
            let mut dead = Vec::new();
            for (key, stream) in clients.iter_mut() {
                if stream.write_all(line.as_bytes()).is_err() {
                    dead.push(key);
                }
            }
            for key in dead {
                clients.remove(key);
            }
        }

        if record.level == Level::Fatal && abort_on_fatal {
            eprintln!("process aborted by FATAL log");
            std::process::abort();
        }
    }
}

struct LoggerHandle {
    sinks: Arc<Sinks>,
    tx: Sender<Record>,
    worker: Option<JoinHandle<()>>,
    server: Option<ConsoleServer>,
}

static CORE: Mutex<Option<LoggerHandle>> = Mutex::new(None);
static ACTIVE_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static FACADE_INSTALL: Once = Once::new();

fn core_lock() -> MutexGuard<'static, Option<LoggerHandle>> {
    CORE.lock().unwrap_or_else(|p| p.into_inner())
}

fn consumer_loop(rx: Receiver<Record>, sinks: Arc<Sinks>) {
    // Ends when every sender is gone and the ring is drained.
    for record in rx.iter() {
        sinks.write_record(&record);
    }
}

/// Start (or restart) the logging service with `config` and install the
/// `log` facade backend.
pub fn init(config: LogConfig) {
    deinit();

    ACTIVE_LEVEL.store(config.level as u8, Ordering::Relaxed);
    let telnet = config.telnet.clone();
    let queue_size = config.queue_size.max(16);

    let sinks = Arc::new(Sinks::new(config));
    sinks.open_file_if_needed();

    let (tx, rx) = bounded(queue_size);
    let consumer_sinks = sinks.clone();
    let worker = std::thread::Builder::new()
        .name("otl-log".into())
        .spawn(move || consumer_loop(rx, consumer_sinks))
        .ok();

    let server = if telnet.enable {
        ConsoleServer::start(telnet.port, telnet.max_connections, sinks.clone())
    } else {
        None
    };

    *core_lock() = Some(LoggerHandle {
        sinks,
        tx,
        worker,
        server,
    });

    FACADE_INSTALL.call_once(|| {
        if log::set_boxed_logger(Box::new(FacadeLogger)).is_ok() {
            log::set_max_level(log::LevelFilter::Trace);
        }
    });
}

/// Stop the consumer and the admin console; pending records are drained
/// before the worker exits. Idempotent.
pub fn deinit() {
    let handle = core_lock().take();
    if let Some(mut handle) = handle {
        if let Some(server) = handle.server.take() {
            server.stop();
        }
        let worker = handle.worker.take();
        drop(handle); // drops the sender, unblocking the consumer
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

/// Replace the configuration. Sinks are (re)opened or closed to match;
/// the admin console is started or stopped as the telnet flag changes.
///
/// Server start/stop happens outside the global lock: the accept
/// thread logs through the facade, which takes that lock too.
pub fn update_config(config: LogConfig) {
    ACTIVE_LEVEL.store(config.level as u8, Ordering::Relaxed);
    let want_telnet = config.targets.telnet && config.telnet.enable;
    let telnet = config.telnet.clone();

    let (sinks, stopped_server, need_start) = {
        let mut core = core_lock();
        let Some(handle) = core.as_mut() else {
            return;
        };
        *handle.sinks.config() = config;
        handle.sinks.open_file_if_needed();
        let stopped = if want_telnet { None } else { handle.server.take() };
        let need_start = want_telnet && handle.server.is_none();
        (handle.sinks.clone(), stopped, need_start)
    };

    if let Some(server) = stopped_server {
        server.stop();
    }
    if need_start {
        if let Some(server) = ConsoleServer::start(telnet.port, telnet.max_connections, sinks) {
            let mut core = core_lock();
            match core.as_mut() {
                Some(handle) if handle.server.is_none() => handle.server = Some(server),
                // Logger went away or raced another start; discard ours.
                _ => {
                    drop(core);
                    server.stop();
                }
            }
        }
    }
}

pub fn get_config() -> LogConfig {
    core_lock()
        .as_ref()
        .map(|h| h.sinks.config().clone())
        .unwrap_or_default()
}

pub fn set_level(level: Level) {
    let mut config = get_config();
    config.level = level;
    update_config(config);
}

pub fn get_level() -> Level {
    Level::from_u8(ACTIVE_LEVEL.load(Ordering::Relaxed))
}

pub(crate) fn client_count() -> usize {
    core_lock()
        .as_ref()
        .map(|h| {
            h.sinks
                .clients
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .len()
        })
        .unwrap_or(0)
}

pub(crate) fn queue_len() -> usize {
    core_lock().as_ref().map(|h| h.tx.len()).unwrap_or(0)
}

/// Submit one record. Below-threshold levels are dropped (FATAL always
/// passes); a full ring degrades to a synchronous sink write.
pub fn log_message(level: Level, module: &str, file: &str, line: u32, content: String) {
    if level < get_level() && level != Level::Fatal {
        return;
    }

    let record = Record {
        timestamp: SystemTime::now(),
        level,
        module: module.to_string(),
        file: file.to_string(),
        line,
        content,
        pid: std::process::id(),
        tid: current_tid(),
    };

    let (tx, sinks) = {
        let core = core_lock();
        match core.as_ref() {
            Some(handle) => (handle.tx.clone(), handle.sinks.clone()),
            None => return,
        }
    };

    match tx.try_send(record) {
        Ok(()) => {}
        Err(TrySendError::Full(record)) | Err(TrySendError::Disconnected(record)) => {
            sinks.write_record(&record);
        }
    }
}

/// FATAL is not representable through the `log` facade; this is the
/// direct entry. Honors `abort_on_fatal`.
pub fn fatal(module: &str, content: impl Into<String>) {
    log_message(Level::Fatal, module, "", 0, content.into());
}

struct FacadeLogger;

impl log::Log for FacadeLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        Level::from(metadata.level()) >= get_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        log_message(
            record.level().into(),
            record.module_path().unwrap_or("-"),
            record.file().unwrap_or(""),
            record.line().unwrap_or(0),
            record.args().to_string(),
        );
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering_and_letters() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Error < Level::Fatal);
        assert_eq!(Level::Warning.letter(), "W");
        assert_eq!(Level::Fatal.name(), "FATAL");
    }

    #[test]
    fn test_level_parse_aliases() {
        assert_eq!(Level::parse("warn"), Level::Warning);
        assert_eq!(Level::parse("ERR"), Level::Error);
        assert_eq!(Level::parse("t"), Level::Trace);
        assert_eq!(Level::parse("nonsense"), Level::Info);
    }

    #[test]
    fn test_facade_level_mapping() {
        assert_eq!(Level::from(log::Level::Warn), Level::Warning);
        assert_eq!(Level::from(log::Level::Trace), Level::Trace);
    }

    #[test]
    fn test_format_record_plain() {
        let record = Record {
            timestamp: SystemTime::now(),
            level: Level::Info,
            module: "demo".into(),
            file: "demo.rs".into(),
            line: 42,
            content: "hello".into(),
            pid: 1,
            tid: 2,
        };
        let line = format_record(&record, false);
        assert!(line.contains(" I/demo "));
        assert!(line.contains("demo.rs:42 hello"));
        assert!(!line.contains("\x1b["));
    }

    #[test]
    fn test_format_record_colored_wraps_letter() {
        let record = Record {
            timestamp: SystemTime::now(),
            level: Level::Error,
            module: "m".into(),
            file: "f".into(),
            line: 1,
            content: "x".into(),
            pid: 0,
            tid: 0,
        };
        let line = format_record(&record, true);
        assert!(line.contains(colors::RED));
        assert!(line.contains(colors::RESET));
    }
}

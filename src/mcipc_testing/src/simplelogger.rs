use std::sync::{Mutex, Once};
use std::thread::current;

use log::{Level, Log, Metadata, Record, set_logger, set_max_level};

pub static LOGGER: SimpleLogger = SimpleLogger {};
static INITLOGGER: Once = Once::new();

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LogCall {
    pub level: Level,
    pub args: String,
    pub target: String,
    pub line: Option<u32>,
    pub file: Option<String>,
    pub module_path: Option<String>,
}

static LOGCALLS: Mutex<Vec<LogCall>> = Mutex::new(Vec::new());
static NUMBER_OF_ENABLED_CALLS: Mutex<usize> = Mutex::new(0);

/// Records every log call made by the mcipc crates.
///
/// Tests in one binary share the logger, so tests that count calls should
/// filter with [`SimpleLogger::calls_matching`] rather than rely on totals.
pub struct SimpleLogger {}

impl SimpleLogger {
    pub fn initialize_test_logger() {
        INITLOGGER.call_once(|| {
            set_logger(&LOGGER).unwrap();
            set_max_level(log::LevelFilter::Trace);
        });
    }

    pub fn num_enabled_calls(&self) -> usize {
        *NUMBER_OF_ENABLED_CALLS.lock().unwrap()
    }

    pub fn num_log_calls(&self) -> usize {
        LOGCALLS.lock().unwrap().len()
    }

    pub fn get_log_call(&self, idx: usize) -> Option<LogCall> {
        LOGCALLS.lock().unwrap().get(idx).cloned()
    }

    /// Recorded calls at `level` whose message contains `needle`.
    pub fn calls_matching(&self, level: Level, needle: &str) -> Vec<LogCall> {
        LOGCALLS
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.level == level && c.args.contains(needle))
            .cloned()
            .collect()
    }

    pub fn clear_log_calls(&self) {
        let mut logcalls = LOGCALLS.lock().unwrap();
        logcalls.clear();
        *NUMBER_OF_ENABLED_CALLS.lock().unwrap() = 0;
    }

    pub fn test_log_records<F: Fn(&Vec<LogCall>)>(&self, f: F) {
        let logcalls = LOGCALLS.lock().unwrap();
        f(&logcalls);
        drop(logcalls);
        self.clear_log_calls();
    }
}

/// Whether `target` belongs to one of the mcipc crates.
pub fn is_mcipc_target(target: &str) -> bool {
    target.starts_with("mcipc_common") || target.starts_with("mcipc_sim")
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let mut num_enabled = NUMBER_OF_ENABLED_CALLS.lock().unwrap();
        if is_mcipc_target(metadata.target()) {
            *num_enabled += 1;
        }
        is_mcipc_target(metadata.target()) && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut logcalls = LOGCALLS.lock().unwrap();
        logcalls.push(LogCall {
            level: record.level(),
            args: format!("{}", record.args()),
            target: record.target().to_string(),
            line: record.line(),
            file: record.file().map(|file| file.to_string()),
            module_path: record
                .module_path()
                .map(|module_path| module_path.to_string()),
        });

        println!("Thread {:?} {:?}", current().id(), record);
    }

    fn flush(&self) {}
}

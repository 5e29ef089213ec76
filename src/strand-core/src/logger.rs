//! Process-wide logging for the scheduler crates.
//!
//! Records pass a global level filter, get stamped with the calling thread's
//! registered name and — when the thread is a fiber mid-body — the job scope
//! installed around that body, then fan out to every registered [`Sink`].

use crate::thread::thread_name;
use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::fmt::{self, Arguments};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// How urgent a record is. `Fatal` panics once the sinks have seen it.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Level {
    Trace,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad(match self {
            Level::Trace => "trace",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        })
    }
}

/// One record, as handed to sinks.
pub struct Record {
    pub level: Level,
    /// Crate the record came from.
    pub target: &'static str,
    /// Label of the job body the calling thread is inside, if any. Installed
    /// with [`scope`]; the scheduler wraps every job body in one.
    pub scope: Option<String>,
    /// Name of the calling thread, resolved when the record is made.
    pub thread: String,
    pub time: DateTime<Local>,
    pub text: String,
}

/// A log destination.
pub trait Sink: Send + Sync {
    fn write(&self, record: &Record);
}

static SINKS: Lazy<RwLock<Vec<Arc<dyn Sink>>>> = Lazy::new(RwLock::default);

static FILTER: AtomicUsize = AtomicUsize::new(Level::Trace as usize);

/// Add a destination for every record that passes the level filter.
pub fn register_sink(sink: Arc<dyn Sink>) {
    SINKS.write().push(sink);
}

/// Drop records below `level` before they reach any sink.
pub fn set_filter(level: Level) {
    FILTER.store(level as usize, Ordering::Relaxed);
}

thread_local! {
    static SCOPE: RefCell<Option<String>> = RefCell::new(None);
}

/// Tag every record from the calling thread with `label` until the guard
/// drops. The guard lives on the fiber stack for the whole body, so the tag
/// survives suspensions.
#[must_use]
pub fn scope(label: String) -> ScopeGuard {
    SCOPE.with(|scope| *scope.borrow_mut() = Some(label));
    ScopeGuard { _priv: () }
}

pub struct ScopeGuard {
    _priv: (),
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPE.with(|scope| *scope.borrow_mut() = None);
    }
}

fn current_scope() -> Option<String> {
    SCOPE.with(|scope| scope.borrow().clone())
}

fn thread_label() -> String {
    let current = thread::current();
    match thread_name(current.id()) {
        Some(name) => name.as_ref().clone(),
        None => current.name().unwrap_or("unnamed").to_string(),
    }
}

#[doc(hidden)]
pub fn emit(level: Level, target: &'static str, args: Arguments) {
    if (level as usize) < FILTER.load(Ordering::Relaxed) {
        return;
    }

    let record = Record {
        level,
        target,
        scope: current_scope(),
        thread: thread_label(),
        time: Local::now(),
        text: args.to_string(),
    };

    for sink in SINKS.read().iter() {
        sink.write(&record);
    }

    if record.level == Level::Fatal {
        panic!("{}", record.text);
    }
}

#[macro_export]
macro_rules! st_log {
    ($level:expr, $($arg:tt)*) => ({
        $crate::logger::emit($level, env!("CARGO_PKG_NAME"), format_args!($($arg)*));
    })
}

#[macro_export]
macro_rules! st_trace {
    ($($arg:tt)*) => ($crate::st_log!($crate::logger::Level::Trace, $($arg)*))
}

#[macro_export]
macro_rules! st_info {
    ($($arg:tt)*) => ($crate::st_log!($crate::logger::Level::Info, $($arg)*))
}

#[macro_export]
macro_rules! st_warn {
    ($($arg:tt)*) => ($crate::st_log!($crate::logger::Level::Warn, $($arg)*))
}

#[macro_export]
macro_rules! st_error {
    ($($arg:tt)*) => ($crate::st_log!($crate::logger::Level::Error, $($arg)*))
}

#[macro_export]
macro_rules! st_fatal {
    ($($arg:tt)*) => ({
        $crate::st_log!($crate::logger::Level::Fatal, $($arg)*);
        unreachable!()
    })
}

/// Sink that prints colored records to stdout.
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {})
    }
}

impl Sink for StdoutSink {
    fn write(&self, record: &Record) {
        let mut out = StandardStream::stdout(ColorChoice::Auto);

        let mut tag = ColorSpec::new();
        tag.set_fg(Some(match record.level {
            Level::Trace => Color::Cyan,
            Level::Info => Color::Green,
            Level::Warn => Color::Yellow,
            Level::Error | Level::Fatal => Color::Red,
        }));
        if record.level == Level::Fatal {
            tag.set_bold(true);
        }

        let _ = write!(out, "{} ", record.time.format("%H:%M:%S%.3f"));
        let _ = out.set_color(&tag);
        let _ = write!(out, "{:>5}", record.level);
        let _ = out.reset();
        let _ = match &record.scope {
            Some(scope) => writeln!(
                out,
                " {} [{}] {}: {}",
                record.target, record.thread, scope, record.text
            ),
            None => writeln!(
                out,
                " {} [{}]: {}",
                record.target, record.thread, record.text
            ),
        };
        let _ = out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct CaptureSink {
        records: Mutex<Vec<(String, Option<String>)>>,
    }

    impl Sink for CaptureSink {
        fn write(&self, record: &Record) {
            self.records
                .lock()
                .push((record.text.clone(), record.scope.clone()));
        }
    }

    #[test]
    fn records_carry_the_thread_scope() {
        let sink = Arc::new(CaptureSink {
            records: Mutex::default(),
        });
        register_sink(sink.clone());

        crate::st_info!("outside any scope");
        {
            let _scope = scope("job `tile` (queue 1)".to_string());
            crate::st_info!("inside");
        }
        crate::st_info!("scope cleared");

        let records = sink.records.lock();
        assert!(records
            .iter()
            .any(|(text, scope)| text == "outside any scope" && scope.is_none()));
        assert!(records
            .iter()
            .any(|(text, scope)| text == "inside"
                && scope.as_deref() == Some("job `tile` (queue 1)")));
        assert!(records
            .iter()
            .any(|(text, scope)| text == "scope cleared" && scope.is_none()));
    }
}

//! Structured logging stamped with the simulated clock.
//!
//! Provides the [`tlog!`] macro for consistent log output in the format:
//!
//! ```text
//! t+0012.300s - src/relay.rs:42 - relay @R1: promoted to active for station-1
//! ```
//!
//! The timestamp is simulated time, published by the harness through
//! [`set_sim_time`] at the start of every step.  When writing to a terminal,
//! output is colour-coded:
//! - Timestamps and source locations are dimmed
//! - Node addresses and conversation ids get consistent colours based on
//!   their content
//!
//! By default log lines go to stderr.  Call [`set_writer`] to redirect output
//! to any [`std::io::Write`] implementor (file, in-memory buffer,
//! `std::io::sink()` to silence).  Installing a custom writer also disables
//! ANSI colour codes.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static SIM_TIME_MS: AtomicU64 = AtomicU64::new(0);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize the logging system. Call once at startup before any logging.
/// Detects whether stderr supports ANSI colours.
pub fn init() {
    let is_terminal = std::io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);
}

/// Replace the log writer.  All subsequent [`tlog!`] output goes to `w`.
/// Also disables ANSI colour codes.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    if let Ok(mut writer) = LOG_WRITER.lock() {
        *writer = w;
    }
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

/// Publish the current simulated time used to stamp log lines.
pub fn set_sim_time(now: Duration) {
    let millis = u64::try_from(now.as_millis()).unwrap_or(u64::MAX);
    SIM_TIME_MS.store(millis, Ordering::Relaxed);
}

/// Simulated time last published with [`set_sim_time`].
pub fn sim_time() -> Duration {
    Duration::from_millis(SIM_TIME_MS.load(Ordering::Relaxed))
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

const ADDR_COLOURS: &[&str] = &[
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[93m", // bright yellow
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[96m", // bright cyan
    "\x1b[32m", // green
    "\x1b[34m", // blue
    "\x1b[35m", // magenta
    "\x1b[36m", // cyan
];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ADDR_COLOURS[(hash as usize) % ADDR_COLOURS.len()]
}

const CONVERSATION_ID_LEN: usize = 8;

fn truncate(id: &str, len: usize) -> &str {
    let end = id
        .char_indices()
        .nth(len)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Format a network address with a stable colour, e.g. `@R1`.
pub fn addr(address: &str) -> String {
    if colour_enabled() {
        let colour = hash_colour(address);
        format!("{colour}@{address}{RESET}")
    } else {
        format!("@{address}")
    }
}

const CONVERSATION_COLOUR: &str = "\x1b[93m";

/// Format a conversation id, truncated, e.g. `c-9fQx01aB`.
pub fn conversation(id: &str) -> String {
    let short = truncate(id, CONVERSATION_ID_LEN);
    if colour_enabled() {
        format!("{CONVERSATION_COLOUR}c-{short}{RESET}")
    } else {
        format!("c-{short}")
    }
}

/// Format a simulated instant as `t+SSSS.mmms`.
pub fn format_timestamp(now: Duration) -> String {
    format!("t+{:04}.{:03}s", now.as_secs(), now.subsec_millis())
}

/// Write a single log line to the current writer.
///
/// Called by the [`tlog!`] macro; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp(sim_time());
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    if let Ok(mut writer) = LOG_WRITER.lock() {
        let _ = writeln!(*writer, "{formatted}");
    }
}

/// Emit a log line with the simulated timestamp and source location.
///
/// # Usage
///
/// ```ignore
/// tlog!("relay {}: flushed {} message(s)", logging::addr(&address), count);
/// ```
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}

use std::env;
use std::fmt::Arguments;
use std::sync::OnceLock;
use std::time::Instant;

/// Diagnostic channels of the engine. Trace and warning lines follow the
/// scheduler's decisions (admission, staging, paging, eviction); perf lines
/// carry the per-iteration and paging counters.
#[derive(Clone, Copy)]
enum Channel {
    Trace,
    Warning,
    Error,
    Perf,
}

impl Channel {
    fn label(self) -> &'static str {
        match self {
            Channel::Trace => "TRACE",
            Channel::Warning => "WARN",
            Channel::Error => "ERROR",
            Channel::Perf => "PERF",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Channel::Trace => "34",
            Channel::Warning => "33",
            Channel::Error => "91",
            Channel::Perf => "36",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Verbosity {
    Silent,
    Errors,
    Debug,
}

struct LogConfig {
    verbosity: Verbosity,
    perf: bool,
    color: bool,
    started: Instant,
}

static CONFIG: OnceLock<LogConfig> = OnceLock::new();

/// `GPUMUX_LOG` picks the verbosity: `silent` mutes everything, the default
/// keeps errors, and `1`/`debug` adds trace and warning lines. `GPUMUX_PERF`
/// switches the scheduler counters on; `NO_COLOR` strips the ANSI colors.
fn config() -> &'static LogConfig {
    CONFIG.get_or_init(|| LogConfig {
        verbosity: match env::var("GPUMUX_LOG").ok().as_deref().map(str::trim) {
            Some("silent") | Some("off") => Verbosity::Silent,
            Some("1") | Some("debug") => Verbosity::Debug,
            _ => Verbosity::Errors,
        },
        perf: env::var_os("GPUMUX_PERF").is_some_and(|v| v != "0"),
        color: env::var_os("NO_COLOR").is_none(),
        started: Instant::now(),
    })
}

fn emit(channel: Channel, args: Arguments) {
    let cfg = config();
    // Stamp with engine uptime rather than wall clock; scheduler iterations
    // and paging timings read against a common zero.
    let uptime = cfg.started.elapsed().as_secs_f64();
    if cfg.color {
        eprintln!(
            "{uptime:10.3}s [\u{001b}[{}m{}\u{001b}[0m] {args}",
            channel.color(),
            channel.label()
        );
    } else {
        eprintln!("{uptime:10.3}s [{}] {args}", channel.label());
    }
}

/// Scheduler decision trace, visible at debug verbosity.
pub fn trace_line(args: Arguments) {
    if config().verbosity >= Verbosity::Debug {
        emit(Channel::Trace, args);
    }
}

/// Degraded-but-continuing conditions, visible at debug verbosity.
pub fn warning_line(args: Arguments) {
    if config().verbosity >= Verbosity::Debug {
        emit(Channel::Warning, args);
    }
}

/// Failures; on unless explicitly silenced.
pub fn error_line(args: Arguments) {
    if config().verbosity >= Verbosity::Errors {
        emit(Channel::Error, args);
    }
}

/// Iteration and paging counters, gated by `GPUMUX_PERF`.
pub fn perf_line(args: Arguments) {
    if config().perf {
        emit(Channel::Perf, args);
    }
}

/// Trace one scheduler decision.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::logging::trace_line(format_args!($($arg)*))
    };
}

/// Report a degraded condition the engine can keep running through.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => {
        $crate::logging::warning_line(format_args!($($arg)*))
    };
}

/// Report a failure.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logging::error_line(format_args!($($arg)*))
    };
}

/// Record a scheduler or paging performance counter line.
#[macro_export]
macro_rules! perf {
    ($($arg:tt)*) => {
        $crate::logging::perf_line(format_args!($($arg)*))
    };
}

//! Logging initialisation.
//!
//! Verbosity is controlled by the `STEIN_LOGLEVEL` environment variable, a
//! single number:
//!
//! | value | effect               |
//! |-------|----------------------|
//! | -1    | everything off       |
//! | 0     | errors only          |
//! | 1     | + warnings           |
//! | 2     | + informational      |
//! | 3     | everything (default) |

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*};

/// Environment variable holding the numeric log level.
pub const LOG_LEVEL_ENV: &str = "STEIN_LOGLEVEL";

/// Map a numeric level onto a tracing filter.
#[must_use]
pub fn level_filter(level: i8) -> LevelFilter {
    match level {
        i8::MIN..=-1 => LevelFilter::OFF,
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber, reading the level from the environment.
///
/// Unset or unparseable values mean level 3. Calling this more than once is
/// a no-op; an application that installs its own subscriber first wins.
pub fn init() {
    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<i8>().ok())
        .unwrap_or(3);

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(level_filter(level))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping() {
        assert_eq!(level_filter(-1), LevelFilter::OFF);
        assert_eq!(level_filter(0), LevelFilter::ERROR);
        assert_eq!(level_filter(1), LevelFilter::WARN);
        assert_eq!(level_filter(2), LevelFilter::INFO);
        assert_eq!(level_filter(3), LevelFilter::TRACE);
        assert_eq!(level_filter(i8::MAX), LevelFilter::TRACE);
        assert_eq!(level_filter(i8::MIN), LevelFilter::OFF);
    }
}

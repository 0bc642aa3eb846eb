//! The process-wide logging front end. The core `srt` crate never installs a logger
//! itself — it only emits through the `log` facade — so this crate is pulled in by
//! perimeter binaries (`srt-cli`, tests) that want output on stderr.

mod logger;

pub use logger::Logger;

/// Install the leveled stderr logger as the global `log` backend at `level`.
///
/// Safe to call more than once from the same process; later calls after the first are
/// no-ops (mirrors `log::set_logger`'s own idempotency contract).
pub fn install(level: log::LevelFilter) {
	if log::set_logger(&Logger).is_ok() {
		log::set_max_level(level);
	}
}

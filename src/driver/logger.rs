use alloc::{format, sync::Arc};
use spin::Once;

use super::host_ops::HostOps;

static LOGGER: Once<HostLogger> = Once::new();

/// Installs the logger that forwards records to the host. Does nothing if a
/// logger is already installed.
pub(crate) fn init(host: Arc<dyn HostOps>, level: log::LevelFilter) {
    let logger = LOGGER.call_once(|| HostLogger { host });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

struct HostLogger {
    host: Arc<dyn HostOps>,
}

impl log::Log for HostLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let message = format!(
                "vmmon: {:>5}: {} ({}:{})",
                record.level(),
                record.args(),
                record.file().unwrap_or("<unknown>"),
                record.line().unwrap_or(0),
            );
            self.host.log(record.level(), &message);
        }
    }

    fn flush(&self) {}
}

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use std::sync::RwLock;

/// Process-wide logger that allows replacing the underlying implementation at runtime.
///
/// Adapter starts with an `env_logger` backend and switches to a DAP aware logger
/// (see [`crate::dap::DapLogger`]) when a client is connected.
pub static LOGGER_SWITCHER: Lazy<LoggerSwitcher> = Lazy::new(|| {
    let switcher = LoggerSwitcher::default();
    if log::set_logger(&*LOGGER_SWITCHER_REF).is_err() {
        // someone else already installed a global logger, keep working as a no-op
        eprintln!("global logger already installed, log switching disabled");
    }
    switcher
});

static LOGGER_SWITCHER_REF: Lazy<SwitcherRef> = Lazy::new(|| SwitcherRef);

struct SwitcherRef;

impl Log for SwitcherRef {
    fn enabled(&self, metadata: &Metadata) -> bool {
        LOGGER_SWITCHER.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        LOGGER_SWITCHER.log(record)
    }

    fn flush(&self) {
        LOGGER_SWITCHER.flush()
    }
}

#[derive(Default)]
pub struct LoggerSwitcher {
    inner: RwLock<Option<Box<dyn Log>>>,
}

impl LoggerSwitcher {
    /// Replace current logger and global max level.
    pub fn switch<L: Log + 'static>(&self, logger: L, filter: LevelFilter) {
        if let Ok(mut inner) = self.inner.write() {
            *inner = Some(Box::new(logger));
        }
        log::set_max_level(filter);
    }

    /// Drop current logger, all log records are discarded after this call.
    pub fn disable(&self) {
        if let Ok(mut inner) = self.inner.write() {
            *inner = None;
        }
        log::set_max_level(LevelFilter::Off);
    }
}

impl Log for LoggerSwitcher {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner
            .read()
            .map(|inner| inner.as_ref().is_some_and(|l| l.enabled(metadata)))
            .unwrap_or_default()
    }

    fn log(&self, record: &Record) {
        if let Ok(inner) = self.inner.read() {
            if let Some(logger) = inner.as_ref() {
                logger.log(record)
            }
        }
    }

    fn flush(&self) {
        if let Ok(inner) = self.inner.read() {
            if let Some(logger) = inner.as_ref() {
                logger.flush()
            }
        }
    }
}

/// Install `env_logger` as a current logger.
pub fn init_env_logger() {
    let logger = env_logger::Logger::from_default_env();
    let filter = logger.filter();
    LOGGER_SWITCHER.switch(logger, filter);
}

//! `log` backend writing to an RTT up channel.
use core::{cell::RefCell, fmt::Write};

use cortex_m::interrupt;

static LOG_CHANNEL: interrupt::Mutex<RefCell<Option<rtt_target::UpChannel>>> =
    interrupt::Mutex::new(RefCell::new(None));

struct Logger;

impl log::Log for Logger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        interrupt::free(move |cs| {
            let mut log_channel = LOG_CHANNEL.borrow(cs).borrow_mut();
            if let Some(channel) = &mut *log_channel {
                // A full channel drops the record
                let _ = writeln!(
                    channel,
                    "[{:5} {}] {}",
                    record.level(),
                    record.target(),
                    record.args()
                );
            }
        });
    }

    fn flush(&self) {}
}

/// Install the RTT logger at `level`.
pub fn init(level: log::LevelFilter) {
    let channels = rtt_target::rtt_init! {
        up: {
            0: {
                size: 1024
                mode: NoBlockSkip
                name: "Log"
            }
        }
    };
    interrupt::free(move |cs| {
        *LOG_CHANNEL.borrow(cs).borrow_mut() = Some(channels.up.0);
    });
    // Don't call `unwrap` to reduce the code size
    let _ = log::set_logger(&Logger);
    log::set_max_level(level);
}

use crate::config;
use log::LevelFilter;
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Logger, Root},
    encode::pattern::PatternEncoder,
    init_config, Config,
};

/// The pattern to use when logging
const LOGGING_PATTERN: &str = "[{d} {h({l})} {M}] {m}{n}";

/// Setup function for setting up the Log4rs logging. Only a console
/// appender is configured; an implant writing log files to disk would
/// defeat the purpose of the compiled-in level switch.
pub fn setup() {
    let logging_level = config::log_level();
    if logging_level == LevelFilter::Off {
        // Don't initialize logger at all if logging is disabled
        return;
    }

    let pattern = Box::new(PatternEncoder::new(LOGGING_PATTERN));
    let console = Box::new(ConsoleAppender::builder().encoder(pattern).build());

    let config = Config::builder()
        .appender(Appender::builder().build("stdout", console))
        .logger(
            Logger::builder()
                .appenders(["stdout"])
                .additive(false)
                .build("specter", logging_level),
        )
        .build(Root::builder().appenders(["stdout"]).build(LevelFilter::Warn))
        .expect("Failed to create logging config");

    init_config(config).expect("Unable to initialize logger");
}

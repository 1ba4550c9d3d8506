/// console logging bootstrap for binaries and integration tests.
///
use anyhow::Result;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

/// install a console appender at the given level.  returns an error if
/// a logger is already installed, which callers are free to ignore.
pub fn init_console(level: LevelFilter) -> Result<()> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} {h({l})} {t} - {m}{n}",
        )))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))?;

    log4rs::init_config(config)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_an_error() {
        let first = init_console(LevelFilter::Warn);
        let second = init_console(LevelFilter::Warn);
        // exactly one of the two can win the global logger slot
        assert!(first.is_ok() || second.is_err());
    }
}

use fern::colors::{Color, ColoredLevelConfig};
use fern::Dispatch;
use std::path::Path;

pub use log::{debug, error, info, trace, warn};

/// Installs the global dispatcher: colored stderr sink plus an optional
/// log file. Intended to be called once by the host during startup.
pub fn setup_logger<P: AsRef<Path>>(
    log_file_path: Option<P>,
    log_level: log::LevelFilter,
) -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::White);

    let base_config = Dispatch::new().level(log_level);

    let stderr_config = Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{time}][{target}] {level:<5} {message}",
                time = chrono::Local::now().format("%H:%M:%S"),
                target = record.target(),
                level = colors.color(record.level()),
                message = message,
            ))
        })
        .chain(std::io::stderr());

    let base_config = base_config.chain(stderr_config);

    let base_config = match log_file_path {
        Some(path) => {
            let file_config = Dispatch::new()
                .format(move |out, message, record| {
                    out.finish(format_args!(
                        "[{time}][{target}] {level:<5} {message}",
                        time = chrono::Local::now().format("%H:%M:%S"),
                        target = record.target(),
                        level = record.level(),
                        message = message,
                    ))
                })
                .chain(fern::log_file(path)?);
            base_config.chain(file_config)
        }
        None => base_config,
    };

    base_config.apply()?;
    Ok(())
}

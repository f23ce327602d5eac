use chrono::Local;
use fern::Dispatch;
use std::path::Path;
use std::{process, thread};

use crate::config::LoadwatchConfig;

/// Install the global logger as requested in `cfg.logging`.
///
/// Relative log file paths resolve against `base_dir`. Without a file, lines go to stderr.
/// Calling this when a logger is already installed fails with `SetLoggerError`.
pub fn init_logger(cfg: &LoadwatchConfig, base_dir: &Path) -> Result<(), fern::InitError> {
    if !cfg.logging.enable {
        return Ok(());
    }

    let dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!(
                "[{}][{:5}][{}][pid={}][tid={:?}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                process::id(),
                thread::current().id(),
                msg
            ))
        })
        .level(cfg.level_filter());

    let dispatch = match &cfg.logging.file {
        Some(file) => dispatch.chain(fern::log_file(base_dir.join(file))?),
        None => dispatch.chain(std::io::stderr()),
    };

    dispatch.apply()?;
    Ok(())
}

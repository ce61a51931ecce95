//! File-backed logging, installed once via `log::set_boxed_logger`.
//!
//! Format: `YYYYMMDDHHMMSS.mmm:t@<tid>:<LEVEL> <message>\n`, flushed after
//! every line. Built on `fern` for dispatch and `chrono` for the timestamp.

use std::path::Path;

use crate::config::LogLevel;
use crate::error::{Error, Result};

fn thread_id_numeric() -> u64 {
    // std::thread::ThreadId's Debug output is "ThreadId(<n>)"; there is no
    // stable way to get the integer directly.
    let id = format!("{:?}", std::thread::current().id());
    id.chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

/// Installs the process-wide logger writing to `file_path` at `level`.
///
/// Safe to call more than once only at process start; `fern`/`log` will
/// return an error if a logger is already installed, which we surface as
/// `SyscallFailed` since it indicates a programmer-ordering mistake rather
/// than a runtime condition.
pub fn init(file_path: &Path, level: LogLevel) -> Result<()> {
    let log_file = fern::log_file(file_path)
        .map_err(|e| Error::SyscallFailed(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    fern::Dispatch::new()
        .format(|out, message, record| {
            let now = chrono::Local::now();
            out.finish(format_args!(
                "{}:t@{}:{} {}",
                now.format("%Y%m%d%H%M%S%.3f"),
                thread_id_numeric(),
                record.level(),
                message
            ))
        })
        .level(level.into())
        .chain(log_file)
        .apply()
        .map_err(|e| Error::SyscallFailed(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_parsed_numeric() {
        // Never panics; worst case is 0 if the Debug format ever changes.
        let _ = thread_id_numeric();
    }
}

// src/logging.rs
//
// Daemon log output. Every line goes to stderr; with `--log-dir` (or
// `[logging] log_dir`) it is also appended to one file per daemon run.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Always names the newest run's file
const LOG_LINK_NAME: &str = "slcand.log";

/// File for the current run, if file logging is on.
pub(crate) static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Local wall-clock stamp prefixed to every line.
pub(crate) fn stamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Open `<log_dir>/<YYYYmmdd-HHMMSS>-slcand.log` and repoint the
/// `slcand.log` link at it. Returns the new file's path.
pub(crate) fn init_file_logging(log_dir: &Path) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create log dir {}: {}", log_dir.display(), e))?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-slcand.log")
        .to_string();
    let log_path = log_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to create log file: {}", e))?;

    #[cfg(unix)]
    {
        let symlink_path = log_dir.join(LOG_LINK_NAME);
        let _ = std::fs::remove_file(&symlink_path);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &symlink_path) {
            eprintln!(
                "{} [logging] Failed to create {} symlink: {}",
                stamp(),
                LOG_LINK_NAME,
                e
            );
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }

    eprintln!(
        "{} [logging] File logging started: {}",
        stamp(),
        log_path.display()
    );

    Ok(log_path)
}

/// Close the run's log file; later lines go to stderr only.
pub(crate) fn stop_file_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if guard.is_some() {
            *guard = None;
            eprintln!("{} [logging] File logging stopped", stamp());
        }
    }
}

/// `tlog!("[component] ...")`: one log line with a local `HH:MM:SS.mmm` stamp.
macro_rules! tlog {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let msg = format!("{} {}", $crate::logging::stamp(), format_args!($($arg)*));
        eprintln!("{}", msg);
        if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
            if let Some(ref mut f) = *guard {
                let _ = writeln!(f, "{}", msg);
            }
        }
    }};
}

use anyhow::Result;
use simplelog::*;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

use crate::config::Config;

pub fn init(cfg: &Config) -> Result<()> {
    let level = match cfg.log.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn"  => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _       => LevelFilter::Info,
    };

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));

    if let Some(path) = cfg.log.file.clone() {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        let file_cfg = simplelog::ConfigBuilder::new()
            .set_target_level(LevelFilter::Off)
            .set_location_level(LevelFilter::Off)
            .set_thread_level(LevelFilter::Off)
            .build();
        loggers.push(WriteLogger::new(level, file_cfg, file));
    }

    CombinedLogger::init(loggers)?;

    set_activity_log(cfg.paths().activity_log());
    Ok(())
}

// --- activity log ------------------------------------------------------------
//
// Short human-readable lines about client lifecycle (what an operator looking
// at the hotspot wants to see), kept separate from the debug log and capped.

const ACTIVITY_LOG_MAX_BYTES: usize = 25 * 1024;

static ACTIVITY_LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static ACTIVITY_LOG_LOCK: Mutex<()> = Mutex::new(());

/// Where [`activity`] writes. First call wins; without it activity lines only
/// reach the `log` facade.
pub fn set_activity_log(path: PathBuf) {
    let _ = ACTIVITY_LOG_PATH.set(path);
}

fn activity(msg: &str) {
    let Some(path) = ACTIVITY_LOG_PATH.get() else {
        return;
    };

    let _guard = match ACTIVITY_LOG_LOCK.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    // Drop consecutive duplicates (e.g. the same cleanup warning on retry).
    if let Ok(data) = fs::read(path) {
        let s = String::from_utf8_lossy(&data);
        if s.lines().last().map(str::trim_end) == Some(msg) {
            return;
        }
    }

    if let Ok(mut f) = fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(f, "{}", msg);
        let _ = f.flush();
    }

    let _ = trim_file_keep_last_utf8(path, ACTIVITY_LOG_MAX_BYTES);
}

fn trim_file_keep_last_utf8(path: &Path, max_bytes: usize) -> Result<()> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };
    if meta.len() as usize <= max_bytes {
        return Ok(());
    }
    let data = fs::read(path)?;
    if data.len() <= max_bytes {
        return Ok(());
    }
    let mut start = data.len().saturating_sub(max_bytes);

    while start < data.len() && std::str::from_utf8(&data[start..]).is_err() {
        start += 1;
    }

    // Keep whole lines when the next newline is close.
    if let Some(pos) = data[start..].iter().position(|b| *b == b'\n') {
        if pos < 1024 {
            start += pos + 1;
        }
    }

    fs::write(path, &data[start..])?;
    Ok(())
}

pub fn activity_info(msg: &str) {
    log::info!("{msg}");
    activity(&format!("INFO  {}", msg));
}

pub fn activity_warn(msg: &str) {
    log::warn!("{msg}");
    activity(&format!("WARN  {}", msg));
}

pub fn activity_error(msg: &str) {
    log::error!("{msg}");
    activity(&format!("ERROR {}", msg));
}

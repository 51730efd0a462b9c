use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

pub const DEFAULT_AUDIT_LOG: &str = "exchange_log.txt";

/// Append-only file recording every exchange command that produced rates.
///
/// Writes are serialized so concurrent sessions never interleave lines.
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record_exchange(&self, date: &str) -> std::io::Result<()> {
        let line = format!(
            "{} Executed 'exchange' command for date: {date}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f")
        );

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

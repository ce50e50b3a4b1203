use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::time;
use tokio_util::sync::CancellationToken;
use log::{info, error, warn};

use crate::server::router::NotificationRouter;

/// One line of the stats log.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSample {
    pub connections: usize,
    pub online_users: usize,
    pub rate_windows: usize,
    pub pending_messages: i64,
    pub cpu_usage: f32,
}

impl StatsSample {
    pub fn to_line(&self, timestamp: &str) -> String {
        format!(
            "{}, {}, {}, {}, {}, {:.1}%",
            timestamp, self.connections, self.online_users, self.rate_windows, self.pending_messages, self.cpu_usage
        )
    }
}

pub async fn collect(router: &NotificationRouter, system: &mut System) -> StatsSample {
    system.refresh_cpu();
    let cpus = system.cpus();
    let cpu_usage = if cpus.is_empty() {
        0.0
    } else {
        cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
    };

    let pending_messages = match router.messages().pending_count().await {
        Ok(count) => count,
        Err(e) => {
            warn!("[STATS] Failed to count pending messages: {}", e);
            -1
        }
    };

    StatsSample {
        connections: router.registry().connection_count(),
        online_users: router.registry().online_users().len(),
        rate_windows: router.limiter().tracked_users(),
        pending_messages,
        cpu_usage,
    }
}

fn open_log(log_path: &str) -> Option<File> {
    if let Some(parent) = std::path::Path::new(log_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!("[STATS] Unable to create directory for '{}': {}", log_path, e);
                return None;
            }
        }
    }

    let mut file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            error!("[STATS] Unable to open stats log file '{}': {}", log_path, e);
            return None;
        }
    };

    if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        if let Err(e) = writeln!(file, "# Ruggine Notify Stats Log")
            .and_then(|_| writeln!(file, "# Timestamp, Connections, Online_Users, Rate_Windows, Pending_Messages, CPU_Usage"))
        {
            error!("[STATS] Failed to write header to stats log: {}", e);
            return None;
        }
        info!("[STATS] Stats log initialized: {}", log_path);
    }
    Some(file)
}

/// Appends a sample every `every` until `cancel` fires.
pub async fn start_stats_logger(
    router: Arc<NotificationRouter>,
    log_path: String,
    every: Duration,
    cancel: CancellationToken,
) {
    let Some(mut file) = open_log(&log_path) else { return };
    let mut system = System::new();
    let mut ticker = time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let sample = collect(&router, &mut system).await;
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

        info!(
            "[STATS] Connections: {}, Online users: {}, Rate windows: {}, Pending: {}, CPU: {:.1}%",
            sample.connections, sample.online_users, sample.rate_windows, sample.pending_messages, sample.cpu_usage
        );

        if let Err(e) = writeln!(file, "{}", sample.to_line(&timestamp)) {
            error!("[STATS] Failed to write to stats log: {}", e);
        } else if let Err(e) = file.flush() {
            error!("[STATS] Failed to flush stats log: {}", e);
        }
    }
}

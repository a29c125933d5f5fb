//! Gateway log file.
//!
//! `env_logger` formats every record with the node id, so the files of all
//! cluster nodes can be merged, and pushes it through a channel. A pingora
//! service owns the file and drains the channel into it.

use std::{
    io::{self, Write},
    path::Path,
};

use async_trait::async_trait;
use env_logger::Builder;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, metadata, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

use crate::config;

/// `io::Write` end of the record channel handed to `env_logger`.
pub struct RecordSender {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for RecordSender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .send(buf.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes the records of this node to `log.path`.
pub struct GatewayLog {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
    node_id: String,
}

impl GatewayLog {
    pub fn new(config: config::Log, node_id: &str) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
            node_id: node_id.to_string(),
        }
    }

    fn record_sender(&self) -> RecordSender {
        RecordSender {
            sender: self.sender.clone(),
        }
    }

    /// Installs the global logger. Records go to the file once the service runs.
    pub fn init_env_logger(&self) {
        let node_id = self.node_id.clone();
        Builder::from_env(env_logger::Env::default())
            .filter(None, self.config.level_filter())
            .format(move |buf, record| {
                writeln!(
                    buf,
                    "{} {:<5} [{node_id}] {}: {}",
                    buf.timestamp_millis(),
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .target(env_logger::Target::Pipe(Box::new(self.record_sender())))
            .init();
    }
}

async fn open_log_file(path: &str) -> io::Result<File> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && metadata(parent).await.is_err() {
            create_dir_all(parent).await?;
        }
    }
    OpenOptions::new().append(true).create(true).open(path).await
}

#[async_trait]
impl Service for GatewayLog {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let mut file = match open_log_file(&self.config.path).await {
            Ok(file) => BufWriter::new(file),
            Err(e) => {
                // the logger itself has nowhere to go
                eprintln!("Gateway log {} unavailable: {e}", self.config.path);
                return;
            }
        };
        log::info!(
            "Node {} logging to {} at {}",
            self.node_id,
            self.config.path,
            self.config.level_filter()
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },

                record = self.receiver.recv() => {
                    let Some(record) = record else { break };
                    if let Err(e) = file.write_all(&record).await {
                        eprintln!("Dropped a gateway log record: {e}");
                    }
                }
            }
        }

        // records logged before the shutdown signal
        while let Ok(record) = self.receiver.try_recv() {
            if file.write_all(&record).await.is_err() {
                break;
            }
        }
        if let Err(e) = file.flush().await {
            eprintln!("Failed to flush gateway log {}: {e}", self.config.path);
        }
    }

    fn name(&self) -> &'static str {
        "gateway log"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_config(path: &str) -> config::Log {
        config::Log {
            path: path.to_string(),
            level: "debug".to_string(),
        }
    }

    #[tokio::test]
    async fn test_records_reach_the_channel() {
        let mut gateway_log = GatewayLog::new(log_config("unused.log"), "node-a");
        let mut sender = gateway_log.record_sender();
        sender.write_all(b"module registered\n").unwrap();
        assert_eq!(
            gateway_log.receiver.recv().await.unwrap(),
            b"module registered\n".to_vec()
        );

        drop(gateway_log);
        assert!(sender.write_all(b"too late\n").is_err());
    }

    #[tokio::test]
    async fn test_open_log_file_creates_parent() {
        let dir = std::env::temp_dir().join(format!("modgate-log-{}", uuid::Uuid::new_v4()));
        let path = dir.join("gateway.log");
        open_log_file(path.to_str().unwrap()).await.unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}

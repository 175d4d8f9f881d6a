use bytes::Bytes;
use chrono::Utc;
use ev07b_protocol::Message;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, OnceCell};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
};
use tracing::warn;

const HEADER: &str = "ts,direction,device_id,command_id,seq,bytes\n";

type CsvFile = Mutex<BufWriter<fs::File>>;

/// frames.csv: ts,direction,device_id,command_id,seq,bytes
pub struct FrameAudit {
    path: PathBuf,
    file: OnceCell<CsvFile>,
}

impl FrameAudit {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), file: OnceCell::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn get_file(&self) -> std::io::Result<&CsvFile> {
        self.file
            .get_or_try_init(|| async {
                if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    fs::create_dir_all(dir).await?;
                }
                let fresh = !fs::try_exists(&self.path).await.unwrap_or(false);
                let f = OpenOptions::new().create(true).append(true).open(&self.path).await?;
                let mut writer = BufWriter::new(f);
                if fresh {
                    writer.write_all(HEADER.as_bytes()).await?;
                    writer.flush().await?;
                }
                Ok::<_, std::io::Error>(Mutex::new(writer))
            })
            .await
    }

    pub async fn inbound(&self, msg: &Message) {
        self.write_row("in", &msg.device_id, msg.command_id, msg.sequence_id, msg.body.len()).await;
    }

    /// Logs an encoded frame; sequence and command come from the frame itself.
    pub async fn outbound(&self, device_id: &str, frame: &Bytes) {
        let seq = frame.get(6..8).map(|s| u16::from_le_bytes([s[0], s[1]])).unwrap_or(0);
        let command_id = frame.get(8).copied().unwrap_or(0);
        let body_len = frame.len().saturating_sub(8);
        self.write_row("out", device_id, command_id, seq, body_len).await;
    }

    async fn write_row(&self, direction: &str, device_id: &str, command_id: u8, seq: u16, bytes: usize) {
        let ts = Utc::now().to_rfc3339();
        let line = format!("{ts},{direction},{device_id},0x{command_id:02X},{seq},{bytes}\n");
        let file = match self.get_file().await {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "audit log unavailable");
                return;
            }
        };
        let mut f = file.lock().await;
        if let Err(e) = f.write_all(line.as_bytes()).await {
            warn!(?e, "audit write failed");
        }
        let _ = f.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ev07b_protocol::encode_frame;

    #[tokio::test]
    async fn writes_header_once_and_one_row_per_frame() {
        let path = std::env::temp_dir()
            .join(format!("ev07b-audit-{}", uuid::Uuid::new_v4()))
            .join("frames.csv");
        let audit = FrameAudit::new(&path);

        let msg = Message::from_body(0x10, 0x0101, Bytes::from_static(&[0x10, 0x01, 0x00]));
        audit.inbound(&msg).await;
        audit.outbound("861234567890123", &encode_frame(0, 0x0101, &[0x7F, 0x01, 0x00]).unwrap()).await;

        let text = std::fs::read_to_string(audit.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER.trim_end());
        assert!(lines[1].ends_with(",in,UNKNOWN,0x10,257,3"));
        assert!(lines[2].ends_with(",out,861234567890123,0x7F,257,3"));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}

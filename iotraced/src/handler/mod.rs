use std::sync::Arc;

use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::ring::DecodedEvent;

/// A destination for drained trace events, correlated and framed as one
/// JSON value per record. Sinks must not block the ring-drain loop for
/// long; slow sinks should buffer internally.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn on_event(&self, cpu: usize, event: &DecodedEvent);
}

/// Fan-out list of sinks, mirroring how the daemon's other event-consuming
/// layers (metrics, control-plane broadcast) are composed.
#[derive(Default)]
pub struct SinkList {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkList {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn register<S: Sink + 'static>(&mut self, sink: S) {
        self.sinks.push(Arc::new(sink));
    }

    pub async fn on_event(&self, cpu: usize, event: &DecodedEvent) {
        for sink in &self.sinks {
            sink.on_event(cpu, event).await;
        }
    }
}

#[derive(Serialize)]
struct FramedEvent<'a> {
    cpu: usize,
    #[serde(flatten)]
    event: &'a DecodedEvent,
}

impl serde::Serialize for DecodedEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        match self {
            DecodedEvent::DeviceDesc(body) => {
                map.serialize_entry("type", "device_desc")?;
                map.serialize_entry("body", body)?;
            }
            DecodedEvent::Io(body) => {
                map.serialize_entry("type", "io")?;
                map.serialize_entry("body", body)?;
            }
            DecodedEvent::IoCmpl(body) => {
                map.serialize_entry("type", "io_cmpl")?;
                map.serialize_entry("body", body)?;
            }
            DecodedEvent::FsMeta(body) => {
                map.serialize_entry("type", "fs_meta")?;
                map.serialize_entry("body", body)?;
            }
            DecodedEvent::FsFileName(_) => {
                map.serialize_entry("type", "fs_file_name")?;
            }
            DecodedEvent::FsFileEvent(body) => {
                map.serialize_entry("type", "fs_file_event")?;
                map.serialize_entry("body", body)?;
            }
        }
        map.end()
    }
}

/// Append-only newline-delimited JSON sink, the daemon's default.
pub struct JsonlSink {
    file: Arc<Mutex<tokio::fs::File>>,
}

impl JsonlSink {
    pub async fn new(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }
}

#[async_trait::async_trait]
impl Sink for JsonlSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn on_event(&self, cpu: usize, event: &DecodedEvent) {
        let framed = FramedEvent { cpu, event };
        if let Ok(json) = serde_json::to_string(&framed) {
            let mut f = self.file.lock().await;
            let _ = f.write_all(json.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotrace_common::event::{IoOperation, RecordHeader};

    #[tokio::test]
    async fn jsonl_writes_one_line_per_event() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let sink = JsonlSink::new(file.path().to_str().unwrap()).await.unwrap();

        let io_body = iotrace_common::event::IoBody {
            id: 1,
            lba: 0,
            len_sectors: 8,
            _pad0: 0,
            dev_id: 1,
            operation: IoOperation::Write as u8,
            _pad1: 0,
            flags: 0,
            write_hint: 0,
            _pad2: 0,
            io_class: 11,
        };
        let _ = RecordHeader::zeroed();
        sink.on_event(0, &DecodedEvent::Io(io_body)).await;
        sink.on_event(1, &DecodedEvent::Io(io_body)).await;

        let content = tokio::fs::read_to_string(file.path()).await.unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"type\":\"io\""));
    }

    #[tokio::test]
    async fn sink_list_fans_out_to_all_registered_sinks() {
        let mut list = SinkList::new();
        let f1 = tempfile::NamedTempFile::new().unwrap();
        let f2 = tempfile::NamedTempFile::new().unwrap();
        list.register(JsonlSink::new(f1.path().to_str().unwrap()).await.unwrap());
        list.register(JsonlSink::new(f2.path().to_str().unwrap()).await.unwrap());

        let body = iotrace_common::event::IoCmplBody {
            ref_id: 1,
            lba: 0,
            len_sectors: 8,
            _pad0: 0,
            dev_id: 1,
            error: 0,
            _pad1: 0,
        };
        list.on_event(0, &DecodedEvent::IoCmpl(body)).await;

        let c1 = tokio::fs::read_to_string(f1.path()).await.unwrap();
        let c2 = tokio::fs::read_to_string(f2.path()).await.unwrap();
        assert_eq!(c1.lines().count(), 1);
        assert_eq!(c2.lines().count(), 1);
    }
}

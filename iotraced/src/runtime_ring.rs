//! Per-CPU polling loop draining one `RingConsumer`, fanning decoded events
//! out to the sink list and the control surface's live event feed. Aya's
//! `PerfEventArrayBuffer` gives userspace an `AsyncFd` to block on; this
//! ring has no such wakeup (the kernel producer never signals userspace),
//! so the loop here polls at a fixed interval instead, the same tradeoff
//! the ring's design doc (`ring.rs`'s module comment) accepts in exchange
//! for a lock-free SPSC fast path on the producer side.

use std::sync::Arc;
use std::time::Duration;

use iotrace_common::RecordType;
use iotraced::api::AppState;
use iotraced::handler::SinkList;
use iotraced::metrics::Metrics;
use iotraced::ring::{DecodedEvent, RingConsumer};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn record_type_of(event: &DecodedEvent) -> RecordType {
    match event {
        DecodedEvent::DeviceDesc(_) => RecordType::DeviceDesc,
        DecodedEvent::Io(_) => RecordType::Io,
        DecodedEvent::IoCmpl(_) => RecordType::IoCmpl,
        DecodedEvent::FsMeta(_) => RecordType::FsMeta,
        DecodedEvent::FsFileName(_) => RecordType::FsFileName,
        DecodedEvent::FsFileEvent(_) => RecordType::FsFileEvent,
    }
}

pub async fn drain_loop(
    consumer: RingConsumer,
    sinks: Arc<SinkList>,
    metrics: Arc<Metrics>,
    app_state: Arc<AppState>,
) {
    let cpu = consumer.cpu;
    let mut batch = Vec::new();
    loop {
        if consumer.is_closed() {
            log::info!("ring for cpu {cpu} closed, stopping drain loop");
            return;
        }

        let lost = consumer.drain(&mut batch);
        if lost > 0 {
            metrics.record_loss(lost);
        }

        for event in batch.drain(..) {
            metrics.record_record_type(record_type_of(&event));
            sinks.on_event(cpu, &event).await;
            if let Ok(json) = serde_json::to_string(&serde_json::json!({"cpu": cpu, "event": event})) {
                app_state.publish_event(json);
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

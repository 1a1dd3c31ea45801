use std::io;

use events::{Event, EventBus};
use opexec_core::StreamTag;
use uuid::Uuid;

use crate::capture::OutputCallback;

/// Republishes captured lines on an [`EventBus`].
#[derive(Debug, Clone)]
pub struct LinePublisher {
    bus: EventBus,
    run_id: Uuid,
}

impl LinePublisher {
    pub fn new(bus: EventBus, run_id: Uuid) -> Self {
        Self { bus, run_id }
    }
}

impl OutputCallback for LinePublisher {
    fn write(&mut self, stream: StreamTag, line: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(line);
        self.bus.emit(Event::OutputLine {
            run_id: self.run_id,
            stream,
            line: text.trim_end_matches(['\n', '\r']).to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publishes_trimmed_lines() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let run_id = Uuid::new_v4();
        let mut publisher = LinePublisher::new(bus, run_id);

        publisher.write(StreamTag::Stderr, b"loss=0.3\r\n").unwrap();

        match rx.recv().await.unwrap().event {
            Event::OutputLine {
                run_id: id,
                stream,
                line,
            } => {
                assert_eq!(id, run_id);
                assert_eq!(stream, StreamTag::Stderr);
                assert_eq!(line, "loss=0.3");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

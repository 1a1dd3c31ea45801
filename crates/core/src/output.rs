use serde::{Deserialize, Serialize};

/// Size of one encoded [`OutputRecord`].
pub const RECORD_LEN: usize = 9;

/// Which child stream produced a line of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTag {
    Stdout,
    Stderr,
}

impl StreamTag {
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Stdout => 0,
            Self::Stderr => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Stdout),
            1 => Some(Self::Stderr),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Index entry for one completed output line: a big-endian millisecond
/// timestamp followed by the stream tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRecord {
    pub time_ms: u64,
    pub stream: StreamTag,
}

impl OutputRecord {
    pub fn new(time_ms: u64, stream: StreamTag) -> Self {
        Self { time_ms, stream }
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[..8].copy_from_slice(&self.time_ms.to_be_bytes());
        buf[8] = self.stream.as_byte();
        buf
    }

    /// Returns `None` for an unknown stream tag.
    pub fn decode(buf: &[u8; RECORD_LEN]) -> Option<Self> {
        let mut time = [0u8; 8];
        time.copy_from_slice(&buf[..8]);
        Some(Self {
            time_ms: u64::from_be_bytes(time),
            stream: StreamTag::from_byte(buf[8])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = OutputRecord::new(0x0102_0304_0506_0708, StreamTag::Stderr);
        assert_eq!(record.encode(), [1, 2, 3, 4, 5, 6, 7, 8, 1]);
        assert_eq!(OutputRecord::decode(&record.encode()), Some(record));
    }

    #[test]
    fn test_unknown_tag() {
        let mut buf = OutputRecord::new(5, StreamTag::Stdout).encode();
        buf[8] = 7;
        assert_eq!(OutputRecord::decode(&buf), None);
    }
}

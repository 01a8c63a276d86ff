//! File-backed partitioned log.
//!
//! A topic is a directory under the log root; each partition is one
//! append-only frame file:
//!
//! ```text
//! [u32 LE frame length][u64 LE enqueued-at micros][payload bytes]
//! [u32 LE frame length][u64 LE enqueued-at micros][payload bytes]
//! ...
//! ```
//!
//! Offsets are record indexes within the partition file. Readers tail the
//! file and poll with a short sleep once caught up; a torn frame at the
//! tail (reader racing the writer mid-append) is re-read on the next poll.
//!
//! One appender per partition at a time: frames are written with a single
//! `write_all` on a file opened in append mode, and the cached next-offset
//! counter assumes no concurrent appender on the same partition file.

use super::{PartitionStream, PartitionedLog, RawRecord, SubscribeFrom};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the file-backed log.
#[derive(Debug, Clone)]
pub struct FileLogConfig {
    /// Root directory; topics are subdirectories.
    pub root: PathBuf,

    /// Partitions per topic.
    pub partitions: u32,

    /// How long a caught-up reader sleeps before re-checking the file.
    pub poll_interval: Duration,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./transport"),
            partitions: 4,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// File-backed partitioned log rooted at a directory.
pub struct FileLog {
    config: FileLogConfig,
    appenders: Mutex<HashMap<(String, u32), Appender>>,
}

struct Appender {
    file: File,
    next_offset: u64,
}

impl FileLog {
    /// Create a log over the given root directory.
    pub fn new(config: FileLogConfig) -> Self {
        Self {
            config,
            appenders: Mutex::new(HashMap::new()),
        }
    }

    /// Open with defaults at the given root.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self::new(FileLogConfig {
            root: root.into(),
            ..Default::default()
        })
    }

    fn partition_path(&self, topic: &str, partition: u32) -> PathBuf {
        self.config
            .root
            .join(topic)
            .join(format!("partition-{partition:03}.log"))
    }

    fn ensure_topic(&self, topic: &str) -> Result<()> {
        let dir = self.config.root.join(topic);
        fs::create_dir_all(&dir)?;
        for partition in 0..self.config.partitions {
            let path = self.partition_path(topic, partition);
            if !path.exists() {
                File::create(&path)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PartitionedLog for FileLog {
    async fn partitions(&self, topic: &str) -> Result<Vec<u32>> {
        self.ensure_topic(topic)?;
        Ok((0..self.config.partitions).collect())
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        from: SubscribeFrom,
    ) -> Result<Box<dyn PartitionStream>> {
        self.ensure_topic(topic)?;
        let path = self.partition_path(topic, partition);
        let mut file = File::open(&path)?;

        // Walk existing frames up to the subscription point.
        let skip = match from {
            SubscribeFrom::Offset(offset) => offset,
            SubscribeFrom::End => u64::MAX,
        };
        let mut next_offset = 0u64;
        while next_offset < skip {
            match read_frame(&mut file)? {
                Some(_) => next_offset += 1,
                None => break,
            }
        }

        Ok(Box::new(FileStream {
            file,
            partition,
            next_offset,
            poll_interval: self.config.poll_interval,
        }))
    }

    async fn append(&self, topic: &str, partition: u32, payload: &[u8]) -> Result<u64> {
        if partition >= self.config.partitions {
            return Err(Error::Log(format!(
                "partition {partition} out of range for topic '{topic}'"
            )));
        }
        self.ensure_topic(topic)?;

        let mut appenders = self.appenders.lock();
        let key = (topic.to_string(), partition);
        if !appenders.contains_key(&key) {
            let path = self.partition_path(topic, partition);
            let next_offset = count_frames(&path)?;
            let file = OpenOptions::new().append(true).open(&path)?;
            appenders.insert(key.clone(), Appender { file, next_offset });
        }
        let appender = appenders.get_mut(&key).expect("appender just inserted");

        let enqueued_at = Utc::now().timestamp_micros() as u64;
        let frame_len = (8 + payload.len()) as u32;
        let mut frame = Vec::with_capacity(12 + payload.len());
        frame.extend_from_slice(&frame_len.to_le_bytes());
        frame.extend_from_slice(&enqueued_at.to_le_bytes());
        frame.extend_from_slice(payload);

        appender.file.write_all(&frame)?;
        appender.file.flush()?;

        let offset = appender.next_offset;
        appender.next_offset += 1;
        Ok(offset)
    }
}

struct FileStream {
    file: File,
    partition: u32,
    next_offset: u64,
    poll_interval: Duration,
}

#[async_trait]
impl PartitionStream for FileStream {
    async fn next(&mut self) -> Result<Option<RawRecord>> {
        loop {
            if let Some((enqueued_micros, payload)) = read_frame(&mut self.file)? {
                let offset = self.next_offset;
                self.next_offset += 1;
                let enqueued_at = DateTime::<Utc>::from_timestamp_micros(enqueued_micros as i64)
                    .unwrap_or_else(Utc::now);
                return Ok(Some(RawRecord {
                    partition: self.partition,
                    offset,
                    payload,
                    enqueued_at,
                }));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Read one frame, or `None` at (possibly torn) end of file.
///
/// The file position is restored on a short read so the frame can be
/// re-read once the writer finishes it.
fn read_frame(file: &mut File) -> Result<Option<(u64, Vec<u8>)>> {
    let start = file.stream_position()?;

    let mut len_buf = [0u8; 4];
    if !read_fully(file, &mut len_buf, start)? {
        return Ok(None);
    }
    let frame_len = u32::from_le_bytes(len_buf) as usize;
    if frame_len < 8 {
        return Err(Error::Log(format!(
            "corrupt frame of length {frame_len} at byte {start}"
        )));
    }

    let mut body = vec![0u8; frame_len];
    if !read_fully(file, &mut body, start)? {
        return Ok(None);
    }

    let enqueued_micros = u64::from_le_bytes(body[0..8].try_into().expect("8-byte slice"));
    let payload = body.split_off(8);
    Ok(Some((enqueued_micros, payload)))
}

/// Read the buffer exactly, or rewind to `start` and report `false` on EOF.
fn read_fully(file: &mut File, buf: &mut [u8], start: u64) -> Result<bool> {
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            file.seek(SeekFrom::Start(start))?;
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn count_frames(path: &PathBuf) -> Result<u64> {
    let mut file = File::open(path)?;
    let mut count = 0u64;
    while read_frame(&mut file)?.is_some() {
        count += 1;
    }
    Ok(count)
}

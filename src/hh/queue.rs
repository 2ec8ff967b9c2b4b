//! Bounded on-disk byte queue backed by numbered segment files.
//!
//! Frames are `[u32 len][u32 crc32c][body]`, appended to the newest segment
//! and consumed from the oldest. The head position (segment sequence + byte
//! offset) is persisted on advance so a reopened queue resumes where it
//! stopped.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use crc32c::crc32c;
use thiserror::Error;

const SEGMENT_EXT: &str = "seg";
const HEAD_FILE: &str = "head";
const FRAME_HEADER_LEN: u64 = 8;
const HEAD_FILE_LEN: usize = 20;
const DEFAULT_SEGMENT_BYTES: u64 = 16 * 1024 * 1024;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,
    #[error("queue is full: max {max_size} bytes")]
    Full { max_size: u64 },
    #[error("corrupt frame in segment {segment} at offset {offset}: {reason}")]
    CorruptFrame {
        segment: u64,
        offset: u64,
        reason: String,
    },
    #[error("head position invalid: {reason}")]
    InvalidHead { reason: String },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Head and tail of a queue, as `segment:offset` descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePosition {
    pub head: String,
    pub tail: String,
}

/// Abstract append-only byte queue with a persistent read head.
pub trait Queue: Send {
    fn append(&mut self, frame: &[u8]) -> QueueResult<()>;
    /// The frame at the head, without consuming it. `Empty` when drained.
    fn current(&mut self) -> QueueResult<Bytes>;
    /// Moves the head past the current frame. After a corrupt frame this
    /// skips the remainder of the damaged segment.
    fn advance(&mut self) -> QueueResult<()>;
    fn last_modified(&self) -> QueueResult<SystemTime>;
    fn purge_older_than(&mut self, cutoff: SystemTime) -> QueueResult<()>;
    fn position(&self) -> QueuePosition;
    fn total_bytes(&self) -> u64;
    fn close(&mut self) -> QueueResult<()>;
}

#[derive(Debug, Clone)]
struct Segment {
    seq: u64,
    path: PathBuf,
    len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadPos {
    seq: u64,
    offset: u64,
}

pub struct DiskQueue {
    dir: PathBuf,
    max_size: u64,
    max_segment_bytes: u64,
    segments: Vec<Segment>,
    head: HeadPos,
    next_seq: u64,
    /// Length of the frame last returned by `current`, if still at the head.
    current_len: Option<u64>,
}

impl DiskQueue {
    pub fn open(dir: &Path, max_size: u64) -> QueueResult<Self> {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let mut segments = Vec::new();
        let entries = fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            let len = fs::metadata(&path).map_err(|e| io_err(&path, e))?.len();
            segments.push(Segment { seq, path, len });
        }
        segments.sort_by_key(|s| s.seq);

        let next_seq = segments.last().map(|s| s.seq + 1).unwrap_or(1);
        let head = read_head_file(dir)?.unwrap_or(HeadPos {
            seq: segments.first().map(|s| s.seq).unwrap_or(next_seq),
            offset: 0,
        });

        let mut queue = Self {
            dir: dir.to_path_buf(),
            max_size,
            max_segment_bytes: DEFAULT_SEGMENT_BYTES,
            segments,
            head,
            next_seq,
            current_len: None,
        };
        queue.clamp_head()?;
        Ok(queue)
    }

    /// Lowers the rotation threshold; only meaningful before heavy appends.
    pub fn set_max_segment_bytes(&mut self, bytes: u64) {
        self.max_segment_bytes = bytes.max(1);
    }

    fn segment_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:016}.{SEGMENT_EXT}"))
    }

    fn segment_index(&self, seq: u64) -> Option<usize> {
        self.segments.iter().position(|s| s.seq == seq)
    }

    /// Keeps the head inside the live segment range after open or purge.
    fn clamp_head(&mut self) -> QueueResult<()> {
        if let Some(idx) = self.segment_index(self.head.seq) {
            if self.head.offset > self.segments[idx].len {
                return Err(QueueError::InvalidHead {
                    reason: format!(
                        "offset {} beyond segment {} length {}",
                        self.head.offset, self.head.seq, self.segments[idx].len
                    ),
                });
            }
            return Ok(());
        }
        match self.segments.iter().find(|s| s.seq > self.head.seq) {
            Some(seg) => {
                self.head = HeadPos {
                    seq: seg.seq,
                    offset: 0,
                };
            }
            None => {
                self.head = HeadPos {
                    seq: self.next_seq,
                    offset: 0,
                };
            }
        }
        self.current_len = None;
        Ok(())
    }

    fn persist_head(&self) -> QueueResult<()> {
        let mut buf = Vec::with_capacity(HEAD_FILE_LEN);
        buf.extend_from_slice(&self.head.seq.to_le_bytes());
        buf.extend_from_slice(&self.head.offset.to_le_bytes());
        let crc = crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        let tmp = self.dir.join(format!("{HEAD_FILE}.tmp"));
        let target = self.dir.join(HEAD_FILE);
        fs::write(&tmp, &buf).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &target).map_err(|e| io_err(&target, e))?;
        Ok(())
    }

    /// Reads the frame header at the head. `Ok(None)` means the head segment
    /// is exhausted.
    fn frame_len_at_head(&self) -> QueueResult<Option<u64>> {
        let Some(idx) = self.segment_index(self.head.seq) else {
            return Ok(None);
        };
        let seg = &self.segments[idx];
        if self.head.offset >= seg.len {
            return Ok(None);
        }
        if seg.len - self.head.offset < FRAME_HEADER_LEN {
            return Err(QueueError::CorruptFrame {
                segment: seg.seq,
                offset: self.head.offset,
                reason: "truncated frame header".to_string(),
            });
        }
        let mut file = File::open(&seg.path).map_err(|e| io_err(&seg.path, e))?;
        file.seek(SeekFrom::Start(self.head.offset))
            .map_err(|e| io_err(&seg.path, e))?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)
            .map_err(|e| io_err(&seg.path, e))?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        if len == 0 || self.head.offset + FRAME_HEADER_LEN + len > seg.len {
            return Err(QueueError::CorruptFrame {
                segment: seg.seq,
                offset: self.head.offset,
                reason: format!("frame length {len} out of bounds"),
            });
        }
        Ok(Some(len))
    }

    /// Moves the head to the next segment, deleting the exhausted one unless
    /// it is the append target.
    fn roll_head_segment(&mut self) -> QueueResult<()> {
        let Some(idx) = self.segment_index(self.head.seq) else {
            self.head = HeadPos {
                seq: self.next_seq,
                offset: 0,
            };
            return self.persist_head();
        };
        let is_tail = idx == self.segments.len() - 1;
        if is_tail {
            return Ok(());
        }
        let seg = self.segments.remove(idx);
        fs::remove_file(&seg.path).map_err(|e| io_err(&seg.path, e))?;
        self.head = HeadPos {
            seq: self.segments[idx].seq,
            offset: 0,
        };
        self.current_len = None;
        self.persist_head()
    }
}

fn read_head_file(dir: &Path) -> QueueResult<Option<HeadPos>> {
    let path = dir.join(HEAD_FILE);
    let buf = match fs::read(&path) {
        Ok(buf) => buf,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(&path, err)),
    };
    if buf.len() != HEAD_FILE_LEN {
        return Err(QueueError::InvalidHead {
            reason: format!("head file has {} bytes, want {HEAD_FILE_LEN}", buf.len()),
        });
    }
    let expected = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
    let actual = crc32c(&buf[..16]);
    if expected != actual {
        return Err(QueueError::InvalidHead {
            reason: "head file checksum mismatch".to_string(),
        });
    }
    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&buf[..8]);
    let mut offset_bytes = [0u8; 8];
    offset_bytes.copy_from_slice(&buf[8..16]);
    Ok(Some(HeadPos {
        seq: u64::from_le_bytes(seq_bytes),
        offset: u64::from_le_bytes(offset_bytes),
    }))
}

impl Queue for DiskQueue {
    fn append(&mut self, frame: &[u8]) -> QueueResult<()> {
        let frame_bytes = FRAME_HEADER_LEN + frame.len() as u64;
        if self.total_bytes() + frame_bytes > self.max_size {
            return Err(QueueError::Full {
                max_size: self.max_size,
            });
        }

        let needs_new = match self.segments.last() {
            Some(seg) => seg.len >= self.max_segment_bytes,
            None => true,
        };
        if needs_new {
            let seq = self.next_seq;
            self.next_seq += 1;
            let path = self.segment_path(seq);
            File::create(&path).map_err(|e| io_err(&path, e))?;
            self.segments.push(Segment { seq, path, len: 0 });
        }

        let seg = self.segments.last_mut().expect("tail segment exists");
        let mut file = OpenOptions::new()
            .append(true)
            .open(&seg.path)
            .map_err(|e| io_err(&seg.path, e))?;
        let len = frame.len() as u32;
        let crc = crc32c(frame);
        let mut buf = Vec::with_capacity(frame.len() + FRAME_HEADER_LEN as usize);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(frame);
        file.write_all(&buf).map_err(|e| io_err(&seg.path, e))?;
        file.sync_data().map_err(|e| io_err(&seg.path, e))?;
        seg.len += frame_bytes;
        Ok(())
    }

    fn current(&mut self) -> QueueResult<Bytes> {
        loop {
            match self.frame_len_at_head()? {
                Some(len) => {
                    let idx = self.segment_index(self.head.seq).expect("head segment exists");
                    let seg = &self.segments[idx];
                    let mut file = File::open(&seg.path).map_err(|e| io_err(&seg.path, e))?;
                    file.seek(SeekFrom::Start(self.head.offset))
                        .map_err(|e| io_err(&seg.path, e))?;
                    let mut header = [0u8; 8];
                    file.read_exact(&mut header)
                        .map_err(|e| io_err(&seg.path, e))?;
                    let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
                    let mut body = vec![0u8; len as usize];
                    file.read_exact(&mut body)
                        .map_err(|e| io_err(&seg.path, e))?;
                    let actual = crc32c(&body);
                    if expected != actual {
                        return Err(QueueError::CorruptFrame {
                            segment: seg.seq,
                            offset: self.head.offset,
                            reason: format!("crc mismatch: expected {expected:#x}, got {actual:#x}"),
                        });
                    }
                    self.current_len = Some(len);
                    return Ok(Bytes::from(body));
                }
                None => {
                    let Some(idx) = self.segment_index(self.head.seq) else {
                        return Err(QueueError::Empty);
                    };
                    if idx == self.segments.len() - 1 {
                        return Err(QueueError::Empty);
                    }
                    self.roll_head_segment()?;
                }
            }
        }
    }

    fn advance(&mut self) -> QueueResult<()> {
        let len = match self.current_len.take() {
            Some(len) => Some(len),
            None => match self.frame_len_at_head() {
                Ok(len) => len,
                // The frame is unreadable; distrust the rest of the segment.
                Err(QueueError::CorruptFrame { .. }) => {
                    if let Some(idx) = self.segment_index(self.head.seq) {
                        self.head.offset = self.segments[idx].len;
                    }
                    self.roll_head_segment()?;
                    return self.persist_head();
                }
                Err(err) => return Err(err),
            },
        };
        let Some(len) = len else {
            return Err(QueueError::Empty);
        };
        self.head.offset += FRAME_HEADER_LEN + len;
        if let Some(idx) = self.segment_index(self.head.seq) {
            if self.head.offset >= self.segments[idx].len && idx < self.segments.len() - 1 {
                return self.roll_head_segment();
            }
        }
        self.persist_head()
    }

    fn last_modified(&self) -> QueueResult<SystemTime> {
        let mut latest = SystemTime::UNIX_EPOCH;
        for seg in &self.segments {
            let modified = fs::metadata(&seg.path)
                .and_then(|m| m.modified())
                .map_err(|e| io_err(&seg.path, e))?;
            if modified > latest {
                latest = modified;
            }
        }
        Ok(latest)
    }

    fn purge_older_than(&mut self, cutoff: SystemTime) -> QueueResult<()> {
        let mut kept = Vec::with_capacity(self.segments.len());
        for seg in std::mem::take(&mut self.segments) {
            let modified = fs::metadata(&seg.path)
                .and_then(|m| m.modified())
                .map_err(|e| io_err(&seg.path, e))?;
            if modified < cutoff {
                fs::remove_file(&seg.path).map_err(|e| io_err(&seg.path, e))?;
            } else {
                kept.push(seg);
            }
        }
        self.segments = kept;
        self.clamp_head()?;
        self.current_len = None;
        self.persist_head()
    }

    fn position(&self) -> QueuePosition {
        let head = format!("{:016}.{SEGMENT_EXT}:{}", self.head.seq, self.head.offset);
        let tail = match self.segments.last() {
            Some(seg) => format!("{:016}.{SEGMENT_EXT}:{}", seg.seq, seg.len),
            None => String::new(),
        };
        QueuePosition { head, tail }
    }

    fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }

    fn close(&mut self) -> QueueResult<()> {
        self.current_len = None;
        Ok(())
    }
}

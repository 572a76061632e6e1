//! Write-ahead log.
//!
//! Layout: a u64 seed header, then records framed as `{len u32, tuple,
//! marker u32}`. Markers are successive values of a xorshift64*
//! sequence seeded from the header; writer and replayer advance it in
//! lockstep. A torn tail write cannot produce the next marker by
//! accident, so replay simply stops at the first record whose marker
//! does not match and keeps the clean prefix.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::tuple::Tuple;

const XORSHIFT_MULTIPLIER: u64 = 0x2545_F491_4F6C_DD1D;

/// xorshift64* stream; the marker is the low half of each step.
struct MarkerSeq {
    state: u64,
}

impl MarkerSeq {
    fn new(seed: u64) -> MarkerSeq {
        // xorshift64* has a fixed point at zero.
        MarkerSeq {
            state: if seed == 0 { XORSHIFT_MULTIPLIER } else { seed },
        }
    }

    fn next(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        self.state.wrapping_mul(XORSHIFT_MULTIPLIER) as u32
    }
}

struct WalWriter {
    buf: BufWriter<File>,
    markers: MarkerSeq,
}

/// Append-only log for one memtable lineage.
pub struct Wal {
    path: PathBuf,
    file: File,
    writer: Mutex<WalWriter>,
}

impl Wal {
    /// Create a fresh log with a random marker seed.
    pub fn create(path: &Path) -> Result<Wal> {
        let seed: u64 = rand::random();
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        let mut buf = BufWriter::new(file.try_clone()?);
        buf.write_u64::<BigEndian>(seed)?;
        Ok(Wal {
            path: path.to_path_buf(),
            file,
            writer: Mutex::new(WalWriter {
                buf,
                markers: MarkerSeq::new(seed),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one tuple. With `fsync` the record is durable on return;
    /// without it the record sits in the writer buffer until the next
    /// fsync'd append or [`Wal::flush`].
    pub fn append(&self, tuple: &Tuple, fsync: bool) -> Result<()> {
        let payload = tuple.encode();
        let mut writer = self.writer.lock().unwrap();
        writer.buf.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.buf.write_all(&payload)?;
        let marker = writer.markers.next();
        writer.buf.write_u32::<BigEndian>(marker)?;
        if fsync {
            writer.buf.flush()?;
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Flush buffered records and sync the file.
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.buf.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Replay a log file. Yields the clean prefix of records; a torn or
    /// corrupt tail ends iteration silently.
    pub fn replay(path: &Path) -> Result<ReplayIterator> {
        let mut reader = BufReader::new(File::open(path)?);
        match reader.read_u64::<BigEndian>() {
            Ok(seed) => Ok(ReplayIterator {
                path: path.to_path_buf(),
                reader,
                markers: MarkerSeq::new(seed),
                done: false,
            }),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!(path = %path.display(), "wal header truncated, replaying nothing");
                Ok(ReplayIterator {
                    path: path.to_path_buf(),
                    reader,
                    markers: MarkerSeq::new(0),
                    done: true,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub struct ReplayIterator {
    path: PathBuf,
    reader: BufReader<File>,
    markers: MarkerSeq,
    done: bool,
}

impl ReplayIterator {
    /// Read the next record, or `None` at the end of the clean prefix.
    fn read_record(&mut self) -> Result<Option<Tuple>> {
        let len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut payload) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                tracing::warn!(path = %self.path.display(), "wal record torn, keeping prefix");
                return Ok(None);
            }
            return Err(e.into());
        }

        let marker = match self.reader.read_u32::<BigEndian>() {
            Ok(marker) => marker,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!(path = %self.path.display(), "wal marker torn, keeping prefix");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if marker != self.markers.next() {
            tracing::warn!(path = %self.path.display(), "wal marker mismatch, keeping prefix");
            return Ok(None);
        }

        // The marker vouches for the frame, so a decode failure here is
        // a real error rather than a torn tail.
        Ok(Some(Tuple::decode(&mut payload.as_slice())?))
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(tuple)) => Some(Ok(tuple)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

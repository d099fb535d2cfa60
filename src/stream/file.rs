//! File-backed streams: record packets into an append-only log and replay
//! them later with the original timing.
//!
//! The log is the wire format verbatim: a fixed header followed by framed
//! notify records, so a capture can be replayed into the same decode path a
//! socket feeds. A truncated tail (writer killed mid-append) is treated as
//! ordinary end of file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use crate::errors::Error;
use crate::handle::Handle;
use crate::protocol::wire::{decode_packet_body, encode_message, encode_packet_body};
use crate::protocol::{ChannelSet, DataPacket, FrameCodec, NetMessage, StreamPacket, WireError};

use super::{
    ErrorCallback, PacketCallback, PacketEvent, PropertyValue, Stream, StreamCore, StreamError,
    StreamProperty,
};

const FILE_MAGIC: [u8; 8] = *b"FTLMAG\0\0";
const FILE_VERSION: u32 = 1;
/// Magic, format version and creation time in milliseconds.
const FILE_HEADER_SIZE: usize = 8 + 4 + 8;

const PAUSE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Read,
}

pub struct FileStream {
    core: StreamCore,
    self_ref: Weak<FileStream>,
    path: PathBuf,
    uri: String,
    mode: Mode,
    writer: tokio::sync::Mutex<Option<tokio::fs::File>>,
    replay: parking_lot::Mutex<Option<JoinHandle<()>>>,
    exit_tx: watch::Sender<bool>,
    /// Replay skips records with an earlier timestamp. The format has no
    /// index, so this is a forward scan.
    seek_ts: AtomicI64,
}

impl FileStream {
    fn new(path: PathBuf, mode: Mode) -> Arc<FileStream> {
        let uri = format!("file://{}", path.display());
        Arc::new_cyclic(|weak| FileStream {
            core: StreamCore::new(),
            self_ref: weak.clone(),
            path,
            uri,
            mode,
            writer: tokio::sync::Mutex::new(None),
            replay: parking_lot::Mutex::new(None),
            exit_tx: watch::Sender::new(false),
            seek_ts: AtomicI64::new(i64::MIN),
        })
    }

    /// A stream that records posted packets to `path`.
    pub(crate) fn create(path: PathBuf) -> Arc<FileStream> {
        FileStream::new(path, Mode::Write)
    }

    /// A stream that replays a recording from `path`.
    pub(crate) fn open(path: PathBuf) -> Arc<FileStream> {
        FileStream::new(path, Mode::Read)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start (or resume) replay at the first record with
    /// `timestamp >= ts`. Records before it are scanned past without
    /// delivery; their availability is still noted.
    pub fn seek(&self, ts: i64) {
        self.seek_ts.store(ts, Ordering::Release);
    }

    async fn open_writer(&self) -> Result<(), StreamError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        if file.metadata().await?.len() == 0 {
            let mut header = BytesMut::with_capacity(FILE_HEADER_SIZE);
            header.put_slice(&FILE_MAGIC);
            header.put_u32_le(FILE_VERSION);
            header.put_i64_le(crate::time::get_time());
            file.write_all(&header).await?;
        }
        *self.writer.lock().await = Some(file);
        Ok(())
    }
}

/// Open a recording and validate its header, leaving the file positioned at
/// the first record.
async fn open_reader(path: &Path) -> Result<tokio::fs::File, StreamError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = [0u8; FILE_HEADER_SIZE];
    file.read_exact(&mut header).await?;
    if header[..8] != FILE_MAGIC {
        return Err(StreamError::Wire(WireError::BadMagic));
    }
    // UFCS: Cursor also satisfies AsyncReadExt, which has its own read_u32.
    let mut cursor = std::io::Cursor::new(&header[8..]);
    let version =
        ReadBytesExt::read_u32::<LittleEndian>(&mut cursor).map_err(WireError::Io)?;
    if version != FILE_VERSION {
        return Err(StreamError::Wire(WireError::BadFileVersion(version)));
    }
    let _creation_ms =
        ReadBytesExt::read_i64::<LittleEndian>(&mut cursor).map_err(WireError::Io)?;
    Ok(file)
}

async fn replay_task(stream: Arc<FileStream>, first_file: tokio::fs::File) {
    let mut exit_rx = stream.exit_tx.subscribe();
    let mut file = Some(first_file);

    'passes: loop {
        let pass_file = match file.take() {
            Some(f) => f,
            None => match open_reader(&stream.path).await {
                Ok(f) => f,
                Err(err) => {
                    stream.core.raise_error(&Error::Unknown(err.to_string()));
                    break;
                }
            },
        };

        let mut frames = FramedRead::new(pass_file, FrameCodec);
        let start_wall = tokio::time::Instant::now();
        let mut first_ts: Option<i64> = None;

        loop {
            let record = tokio::select! {
                _ = exit_rx.changed() => break 'passes,
                record = frames.next() => record,
            };
            let record = match record {
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    stream.core.raise_error(&Error::PacketFailure(err.to_string()));
                    continue;
                }
                None => break,
            };

            let (spkt, pkt) = match decode_packet_body(&record.body) {
                Ok(pair) => pair,
                Err(err) => {
                    stream.core.raise_error(&Error::PacketFailure(err.to_string()));
                    continue;
                }
            };

            if spkt.timestamp < stream.seek_ts.load(Ordering::Acquire) {
                stream.core.note_available(spkt.stream_id, spkt.channel);
                continue;
            }

            // Reproduce the recorded cadence, scaled by the speed property.
            let speed = stream
                .core
                .int_property(StreamProperty::Speed, 1)
                .clamp(0, 1000);
            if speed > 0 {
                let first = *first_ts.get_or_insert(spkt.timestamp);
                let offset_ms = ((spkt.timestamp - first).max(0) as u64) / speed as u64;
                let target = start_wall + Duration::from_millis(offset_ms);
                tokio::select! {
                    _ = exit_rx.changed() => break 'passes,
                    _ = tokio::time::sleep_until(target) => {}
                }
            }

            while stream.core.bool_property(StreamProperty::Paused) {
                tokio::select! {
                    _ = exit_rx.changed() => break 'passes,
                    _ = tokio::time::sleep(PAUSE_POLL) => {}
                }
            }

            let selected = stream.core.selected_no_except(spkt.stream_id);
            if !selected.is_empty() && !selected.contains(spkt.channel) {
                stream.core.note_available(spkt.stream_id, spkt.channel);
                continue;
            }

            stream.core.deliver(PacketEvent { spkt, pkt });
        }

        if !stream.core.bool_property(StreamProperty::Looping) {
            break;
        }
    }

    stream.core.set_active(false);
}

#[async_trait]
impl Stream for FileStream {
    fn on_packet(&self, cb: PacketCallback) -> Handle {
        self.core.on_packet(cb)
    }

    fn on_error(&self, cb: ErrorCallback) -> Handle {
        self.core.on_error(cb)
    }

    async fn post(&self, spkt: StreamPacket, pkt: DataPacket) -> bool {
        if self.mode != Mode::Write || !self.core.active() {
            return false;
        }
        let _guard = self.core.pending().guard();

        let mut spkt = spkt;
        if spkt.timestamp == 0 {
            spkt.timestamp = crate::time::get_time();
        }
        self.core.note_available(spkt.stream_id, spkt.channel);

        let body = encode_packet_body(&spkt, &pkt);
        let record = NetMessage::notify(self.uri.clone(), body);
        let mut buf = BytesMut::with_capacity(record.wire_len());
        if let Err(err) = encode_message(&record, &mut buf) {
            self.core.raise_error(&Error::PacketFailure(err.to_string()));
            return false;
        }

        let mut writer = self.writer.lock().await;
        let Some(file) = writer.as_mut() else {
            return false;
        };
        if let Err(err) = file.write_all(&buf).await {
            self.core.raise_error(&Error::socket(&err));
            return false;
        }
        true
    }

    async fn begin(&self) -> bool {
        if !self.core.set_active(true) {
            return true;
        }
        self.exit_tx.send_replace(false);

        match self.mode {
            Mode::Write => {
                if let Err(err) = self.open_writer().await {
                    self.core.raise_error(&Error::Unknown(err.to_string()));
                    self.core.set_active(false);
                    return false;
                }
                true
            }
            Mode::Read => {
                let file = match open_reader(&self.path).await {
                    Ok(file) => file,
                    Err(err) => {
                        self.core.raise_error(&Error::Unknown(err.to_string()));
                        self.core.set_active(false);
                        return false;
                    }
                };
                let Some(strong) = self.self_ref.upgrade() else {
                    self.core.set_active(false);
                    return false;
                };
                let handle = tokio::spawn(replay_task(strong, file));
                *self.replay.lock() = Some(handle);
                true
            }
        }
    }

    async fn end(&self) -> bool {
        let _ = self.exit_tx.send(true);
        let handle = self.replay.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut writer = self.writer.lock().await;
        if let Some(mut file) = writer.take() {
            let _ = file.flush().await;
            let _ = file.sync_all().await;
        }
        drop(writer);

        self.core.end().await
    }

    fn active(&self) -> bool {
        self.core.active()
    }

    fn reset(&self) {
        self.core.reset_state();
    }

    fn set_property(&self, prop: StreamProperty, value: PropertyValue) -> Result<(), StreamError> {
        if self.mode != Mode::Read {
            return Err(StreamError::UnsupportedProperty(prop));
        }
        match prop {
            StreamProperty::Looping | StreamProperty::Paused => {
                if value.as_bool().is_none() {
                    return Err(StreamError::BadPropertyValue(prop));
                }
            }
            StreamProperty::Speed => {
                if value.as_int().is_none() {
                    return Err(StreamError::BadPropertyValue(prop));
                }
            }
            _ => return Err(StreamError::UnsupportedProperty(prop)),
        }
        self.core.set_property(prop, value);
        Ok(())
    }

    fn property(&self, prop: StreamProperty) -> Option<PropertyValue> {
        match prop {
            StreamProperty::Uri => Some(PropertyValue::String(self.uri.clone())),
            _ => self.core.property(prop),
        }
    }

    fn available(&self, fs: u32) -> Result<ChannelSet, StreamError> {
        self.core.available(fs)
    }

    fn selected(&self, fs: u32) -> Result<ChannelSet, StreamError> {
        self.core.selected(fs)
    }

    fn selected_no_except(&self, fs: u32) -> ChannelSet {
        self.core.selected_no_except(fs)
    }

    fn select(&self, fs: u32, channels: ChannelSet) -> Result<(), StreamError> {
        self.core.select(fs, channels)
    }

    fn enabled_framesets(&self) -> Vec<u32> {
        self.core.enabled_framesets()
    }
}

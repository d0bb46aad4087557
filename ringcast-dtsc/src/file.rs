//! Seekable on-disk DTSC files.
//!
//! A file is a concatenation of header frames (possibly several, chained via
//! the `moreheader` byte offset in each header's metadata) and payload
//! frames. v2 payload frames carry the `trackid | timestamp` prefix, which is
//! what per-track seeking scans over.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use crate::define::{MAGIC_HEADER, MAGIC_PACKET, MAGIC_PACKET2};
use crate::errors::{DtscError, DtscErrorValue};
use crate::value::Value;

/// A resolved seek target for one track, ordered by `(seek_time, track_id)`
/// so the earliest pending packet across tracks sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeekPos {
    pub seek_time: i64,
    pub track_id: i64,
    pub seek_pos: u64,
}

pub struct FileStore {
    file: File,
    path: PathBuf,
    created: bool,
    metadata: Value,
    first_metadata: Value,
    metadata_packed: Bytes,
    /// Size of the first header frame's payload; `writeHeader` rewrites this
    /// region.
    header_size: u32,
    packet_raw: Bytes,
    packet_json: Value,
    last_read_pos: u64,
    current_positions: BTreeSet<SeekPos>,
    selected_tracks: BTreeSet<i64>,
    track_mapping: HashMap<i64, String>,
}

impl FileStore {
    /// Opens `path` for DTSC reading and writing. In create mode the file is
    /// truncated and seeded with an empty header frame (`DTSC | 0`). In read
    /// mode the header chain is resolved: the header at byte 0 becomes
    /// `firstMetadata`, `moreheader` offsets are followed until one is zero,
    /// and the final header becomes `metadata` (augmented with `vod = true`).
    pub fn open(path: impl AsRef<Path>, create: bool) -> Result<Self, DtscError> {
        let path = path.as_ref().to_path_buf();
        let file = if create {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?
        } else {
            OpenOptions::new().read(true).write(true).open(&path)?
        };
        let mut store = Self {
            file,
            path,
            created: create,
            metadata: Value::Null,
            first_metadata: Value::Null,
            metadata_packed: Bytes::new(),
            header_size: 0,
            packet_raw: Bytes::new(),
            packet_json: Value::Null,
            last_read_pos: 0,
            current_positions: BTreeSet::new(),
            selected_tracks: BTreeSet::new(),
            track_mapping: HashMap::new(),
        };
        if create {
            store.file.write_all(MAGIC_HEADER)?;
            store.file.write_all(&[0u8; 4])?;
        } else {
            let mut prefix = [0u8; 8];
            store.file.read_exact(&mut prefix)?;
            if &prefix[0..4] != MAGIC_HEADER {
                return Err(DtscErrorValue::InvalidMagic([
                    prefix[0], prefix[1], prefix[2], prefix[3],
                ])
                .into());
            }
            store.header_size = BigEndian::read_u32(&prefix[4..8]);
            store.read_header(0);
            store.track_mapping = store.metadata.track_mapping();
            store
                .file
                .seek(SeekFrom::Start(8 + u64::from(store.header_size)))?;
        }
        Ok(store)
    }

    /// The fully resolved metadata (the last header in the chain).
    #[must_use]
    pub fn get_meta(&self) -> &Value {
        &self.metadata
    }

    /// The metadata of the header frame at byte 0, before chain resolution.
    #[must_use]
    pub fn get_first_meta(&self) -> &Value {
        &self.first_metadata
    }

    /// Rewrites the header region at the start of the file. Refused when the
    /// size differs from the existing header, unless `force` is set.
    pub fn write_header(&mut self, header: &[u8], force: bool) -> Result<(), DtscError> {
        if header.len() != self.header_size as usize && !force {
            return Err(DtscErrorValue::HeaderSizeMismatch {
                existing: self.header_size as usize,
                new: header.len(),
            }
            .into());
        }
        self.header_size = header.len() as u32;
        let mut size = [0u8; 4];
        BigEndian::write_u32(&mut size, self.header_size);
        self.file.seek(SeekFrom::Start(4))?;
        self.file.write_all(&size)?;
        self.file.write_all(header)?;
        Ok(())
    }

    /// Appends a fresh header frame at the end of the file and returns its
    /// byte offset, suitable for storing as `moreheader` in an earlier
    /// header.
    pub fn add_header(&mut self, header: &[u8]) -> Result<u64, DtscError> {
        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut size = [0u8; 4];
        BigEndian::write_u32(&mut size, header.len() as u32);
        self.file.write_all(MAGIC_HEADER)?;
        self.file.write_all(&size)?;
        self.file.write_all(header)?;
        Ok(pos)
    }

    /// Appends a packed frame at the end of the file.
    pub fn write_packet_bytes(&mut self, packet: &[u8]) -> Result<(), DtscError> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(packet)?;
        Ok(())
    }

    /// Packs `packet` and appends it at the end of the file.
    pub fn write_packet(&mut self, packet: &Value) -> Result<(), DtscError> {
        let packed = packet.net_packed();
        self.write_packet_bytes(&packed)
    }

    /// Replaces the selected track set; pending seek positions are dropped.
    pub fn select_tracks(&mut self, tracks: BTreeSet<i64>) {
        self.current_positions.clear();
        self.selected_tracks = tracks;
    }

    /// Seeds seek positions for every selected track at media time `ms`.
    /// Returns true when at least one track produced a position.
    pub fn seek_time(&mut self, ms: i64) -> bool {
        self.current_positions.clear();
        let tracks: Vec<i64> = self.selected_tracks.iter().copied().collect();
        let mut any = false;
        for track_id in tracks {
            any |= self.seek_time_track(ms, track_id);
        }
        any
    }

    /// Seeds a seek position for one track: starts at the last indexed
    /// keyframe with `keytime <= ms` and scans packet prefixes forward until
    /// the first packet of this track with `timestamp >= ms`. When no such
    /// packet exists before end of file, returns false and leaves the pending
    /// positions untouched.
    pub fn seek_time_track(&mut self, ms: i64, track_id: i64) -> bool {
        let (keytimes, keybpos) = match self.track_seek_index(track_id) {
            Some(index) => index,
            None => return false,
        };
        if keytimes.is_empty() || keybpos.is_empty() {
            return false;
        }
        let mut start = keybpos[0];
        for (time, bpos) in keytimes.iter().zip(keybpos.iter()) {
            if *time > ms {
                break;
            }
            start = *bpos;
        }
        let eof = self.get_byte_pos_eof();
        let mut pos = start.max(0) as u64;
        loop {
            if pos >= eof {
                return false;
            }
            let mut header = [0u8; 20];
            if self.file.seek(SeekFrom::Start(pos)).is_err()
                || self.file.read_exact(&mut header).is_err()
            {
                tracing::error!("could not read packet prefix at byte {pos}");
                return false;
            }
            let size = u64::from(BigEndian::read_u32(&header[4..8]));
            let packet_track = i64::from(BigEndian::read_u32(&header[8..12]));
            let time = BigEndian::read_u64(&header[12..20]) as i64;
            if packet_track == track_id && time >= ms {
                self.current_positions.insert(SeekPos {
                    seek_time: time,
                    track_id,
                    seek_pos: pos,
                });
                return true;
            }
            pos += 8 + size;
        }
    }

    /// Reads the packet at the earliest pending position across the selected
    /// tracks, then seeds the next position for that track. With no pending
    /// positions the current packet is nulled.
    pub fn seek_next(&mut self) {
        let Some(first) = self.current_positions.iter().next().copied() else {
            self.packet_raw = Bytes::new();
            self.packet_json = Value::Null;
            return;
        };
        self.current_positions.remove(&first);
        self.seek_time_track(first.seek_time + 1, first.track_id);
        self.read_packet_at(first.seek_pos);
    }

    /// Reads the frame starting at `pos`: header frames re-enter the header
    /// chain, payload frames decode into the current packet. Failures null
    /// the current packet and log.
    pub fn read_packet_at(&mut self, pos: u64) {
        self.last_read_pos = pos;
        if let Err(err) = self.try_read_packet(pos) {
            tracing::error!("could not read packet at byte {pos}: {err}");
            self.packet_raw = Bytes::new();
            self.packet_json = Value::Null;
        }
    }

    /// Byte offset of the start of the last read packet.
    #[must_use]
    pub fn get_last_read_pos(&self) -> u64 {
        self.last_read_pos
    }

    /// Raw payload bytes of the last read packet.
    #[must_use]
    pub fn get_packet(&self) -> &Bytes {
        &self.packet_raw
    }

    /// Decoded form of the last read packet.
    #[must_use]
    pub fn get_json(&self) -> &Value {
        &self.packet_json
    }

    /// True when the last read packet is a keyframe: it either decodes with a
    /// `keyframe` member, or the current byte position appears in some
    /// track's `keybpos` index.
    pub fn at_keyframe(&mut self) -> bool {
        if self.packet_json.is_member("keyframe") {
            return true;
        }
        let pos = self.get_byte_pos() as i64;
        if let Some(tracks) = self.metadata.get("tracks") {
            for (_, track) in tracks.entries() {
                if let Some(keybpos) = track.get("keybpos") {
                    if keybpos.values().any(|v| v.as_int() == pos) {
                        return true;
                    }
                }
            }
        }
        false
    }

    pub fn seek_bpos(&mut self, pos: u64) -> bool {
        self.file.seek(SeekFrom::Start(pos)).is_ok()
    }

    #[must_use]
    pub fn get_byte_pos(&mut self) -> u64 {
        self.file.stream_position().unwrap_or(0)
    }

    #[must_use]
    pub fn get_byte_pos_eof(&mut self) -> u64 {
        let current = self.get_byte_pos();
        let end = self.file.seek(SeekFrom::End(0)).unwrap_or(current);
        let _ = self.file.seek(SeekFrom::Start(current));
        end
    }

    #[must_use]
    pub fn reached_eof(&mut self) -> bool {
        self.get_byte_pos() >= self.get_byte_pos_eof()
    }

    /// Opens an independent handle on the same file, positioned identically.
    pub fn try_clone(&mut self) -> Result<Self, DtscError> {
        let pos = self.file.stream_position()?;
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(Self {
            file,
            path: self.path.clone(),
            created: self.created,
            metadata: self.metadata.clone(),
            first_metadata: self.first_metadata.clone(),
            metadata_packed: self.metadata_packed.clone(),
            header_size: self.header_size,
            packet_raw: self.packet_raw.clone(),
            packet_json: self.packet_json.clone(),
            last_read_pos: self.last_read_pos,
            current_positions: self.current_positions.clone(),
            selected_tracks: self.selected_tracks.clone(),
            track_mapping: self.track_mapping.clone(),
        })
    }

    /// The packed header frame for the resolved metadata.
    #[must_use]
    pub fn out_header(&self) -> Bytes {
        self.metadata_packed.clone()
    }

    fn read_header(&mut self, pos: u64) {
        if let Err(err) = self.try_read_header(pos) {
            tracing::error!("could not read header at byte {pos}: {err}");
            self.packet_raw = Bytes::new();
            self.metadata = Value::Null;
        }
    }

    fn try_read_header(&mut self, pos: u64) -> Result<(), DtscError> {
        self.file.seek(SeekFrom::Start(pos))?;
        let mut prefix = [0u8; 8];
        self.file.read_exact(&mut prefix)?;
        if &prefix[0..4] != MAGIC_HEADER {
            return Err(DtscErrorValue::InvalidMagic([
                prefix[0], prefix[1], prefix[2], prefix[3],
            ])
            .into());
        }
        let size = BigEndian::read_u32(&prefix[4..8]) as usize;
        let mut payload = vec![0u8; size];
        self.file.read_exact(&mut payload)?;
        if size > 0 {
            self.metadata = Value::from_dtmi(&payload)?;
        }
        self.packet_raw = Bytes::from(payload);
        if pos == 0 {
            self.first_metadata = self.metadata.clone();
        }
        let more = self.metadata.get("moreheader").map_or(0, Value::as_int);
        if more > 0 && more as u64 != pos {
            return self.try_read_header(more as u64);
        }
        self.metadata.set("vod", Value::Bool(true));
        self.net_prepare();
        Ok(())
    }

    fn try_read_packet(&mut self, pos: u64) -> Result<(), DtscError> {
        self.file.seek(SeekFrom::Start(pos))?;
        let mut prefix = [0u8; 8];
        self.file.read_exact(&mut prefix)?;
        let magic = [prefix[0], prefix[1], prefix[2], prefix[3]];
        if &magic == MAGIC_HEADER {
            self.read_header(pos);
            self.packet_json = self.metadata.clone();
            return Ok(());
        }
        let version = if &magic == MAGIC_PACKET {
            1
        } else if &magic == MAGIC_PACKET2 {
            2
        } else {
            return Err(DtscErrorValue::InvalidMagic(magic).into());
        };
        let size = BigEndian::read_u32(&prefix[4..8]) as usize;
        let mut payload = vec![0u8; size];
        self.file.read_exact(&mut payload)?;
        let mut packet = if version == 1 {
            Value::from_dtmi(&payload)?
        } else {
            Value::from_dtmi2(&payload)?
        };
        if version == 2 && !packet.is_member("datatype") {
            let trackid = packet.get("trackid").map_or(0, Value::as_int);
            if let Some(datatype) = self.track_datatype(trackid) {
                packet.set("datatype", datatype);
            }
        }
        self.packet_raw = Bytes::from(payload);
        self.packet_json = packet;
        Ok(())
    }

    fn track_datatype(&self, trackid: i64) -> Option<Value> {
        let name = self.track_mapping.get(&trackid)?;
        self.metadata
            .get("tracks")
            .and_then(|tracks| tracks.get(name))
            .and_then(|track| track.get("type"))
            .cloned()
    }

    /// `(keytime, keybpos)` arrays for one track, cloned out of the metadata.
    fn track_seek_index(&self, track_id: i64) -> Option<(Vec<i64>, Vec<i64>)> {
        let name = self.track_mapping.get(&track_id)?;
        let track = self.metadata.get("tracks")?.get(name)?;
        let keytimes: Vec<i64> = track.get("keytime")?.values().map(Value::as_int).collect();
        let keybpos: Vec<i64> = track.get("keybpos")?.values().map(Value::as_int).collect();
        Some((keytimes, keybpos))
    }

    fn net_prepare(&mut self) {
        self.metadata_packed = self.metadata.packed_header();
    }
}

//! Live DTSC stream: parses wire frames into a sliding window of packets,
//! maintains a keyframe index plus a fragment manifest in the stream
//! metadata, and hands out durable cursors ([`Ring`]) that survive eviction.

use std::collections::{BTreeMap, HashMap, VecDeque};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};

use crate::define::{
    DataKind, FRAGMENT_DURATION_MS, FRAME_PREFIX, MAGIC_HEADER, MAGIC_PACKET, MAGIC_PACKET2,
};
use crate::value::Value;

/// Handle to a cursor owned by a [`LiveStream`].
pub type RingId = u64;

/// A durable cursor into the sliding window.
///
/// `seq` is an absolute packet sequence number; the stream resolves it to a
/// window index on demand and flags the cursor `starved` once the packet it
/// pointed at has been evicted. `waiting` asks the stream to re-point the
/// cursor at the newest packet on the next enqueue; `updated` is set whenever
/// the stream metadata changed.
#[derive(Debug, Clone, Default)]
pub struct Ring {
    pub seq: u64,
    pub waiting: bool,
    pub starved: bool,
    pub updated: bool,
    pub play_count: u32,
}

pub struct LiveStream {
    metadata: Value,
    metadata_packed: Bytes,
    /// Newest packet at the front.
    buffers: VecDeque<Value>,
    /// Sequence number of `buffers[0]`; 0 while the window is empty.
    seq_head: u64,
    /// Sequence numbers of the buffered keyframes, newest first.
    keyframes: VecDeque<u64>,
    rings: BTreeMap<RingId, Ring>,
    next_ring_id: RingId,
    track_mapping: HashMap<i64, String>,
    buffer_count: usize,
    buffer_time_ms: u64,
    last_kind: DataKind,
    last_data: Option<Bytes>,
    frag_num: i64,
    /// `time / 2000` of the last synthesised keyframe; drives the audio-only
    /// keyframe surrogate (a 2-second quantisation heuristic, not an exact
    /// emulation target).
    last_key_window: Option<i64>,
    syncing: bool,
}

impl Default for LiveStream {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveStream {
    /// A stream holding a single packet.
    #[must_use]
    pub fn new() -> Self {
        Self::with_buffers(1, 0)
    }

    /// A stream with at least `buffers` packet slots that grows until it
    /// spans `buffer_time_ms` of media time between keyframes.
    #[must_use]
    pub fn with_buffers(buffers: usize, buffer_time_ms: u64) -> Self {
        Self {
            metadata: Value::Null,
            metadata_packed: Bytes::new(),
            buffers: VecDeque::new(),
            seq_head: 0,
            keyframes: VecDeque::new(),
            rings: BTreeMap::new(),
            next_ring_id: 0,
            track_mapping: HashMap::new(),
            buffer_count: buffers.max(1),
            buffer_time_ms,
            last_kind: DataKind::Invalid,
            last_data: None,
            frag_num: 1,
            last_key_window: None,
            syncing: false,
        }
    }

    /// Attempts to parse one packet from the front of `buffer`, consuming the
    /// parsed bytes. Returns `false` when the buffer does not yet hold a
    /// complete frame (idempotent: partial input is left untouched).
    ///
    /// A `DTSC` frame replaces the current metadata and the call continues to
    /// the payload behind it, if already buffered. Unrecognised bytes start a
    /// resync: everything before the earliest `DTPD`/`DTP2` magic is
    /// discarded, reported once per episode.
    pub fn parse_packet(&mut self, buffer: &mut BytesMut) -> bool {
        if buffer.len() < FRAME_PREFIX {
            return false;
        }
        if &buffer[0..4] == MAGIC_HEADER {
            let len = BigEndian::read_u32(&buffer[4..8]) as usize;
            if buffer.len() < len + FRAME_PREFIX {
                return false;
            }
            let frame = buffer.split_to(len + FRAME_PREFIX);
            match Value::from_dtmi(&frame[FRAME_PREFIX..]) {
                Ok(mut meta) => {
                    meta.remove_member("moreheader");
                    self.track_mapping = meta.track_mapping();
                    self.metadata = meta;
                    self.net_prepare();
                }
                Err(err) => {
                    tracing::error!("discarding undecodable stream header: {err}");
                }
            }
            if buffer.len() < FRAME_PREFIX {
                return false;
            }
        }
        let version = match &buffer[0..4] {
            m if m == MAGIC_PACKET => 1,
            m if m == MAGIC_PACKET2 => 2,
            _ => 0,
        };
        if version != 0 {
            let len = BigEndian::read_u32(&buffer[4..8]) as usize;
            if buffer.len() < len + FRAME_PREFIX {
                return false;
            }
            let frame = buffer.split_to(len + FRAME_PREFIX);
            let decoded = if version == 1 {
                Value::from_dtmi(&frame[FRAME_PREFIX..])
            } else {
                Value::from_dtmi2(&frame[FRAME_PREFIX..])
            };
            let mut packet = match decoded {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::error!("discarding undecodable payload frame: {err}");
                    return false;
                }
            };
            if version == 2 && !packet.is_member("datatype") {
                if let Some(datatype) = self.track_datatype(packet.get("trackid").map_or(0, Value::as_int)) {
                    packet.set("datatype", datatype);
                }
            }
            self.last_kind = packet
                .get("datatype")
                .map_or(DataKind::Invalid, |d| DataKind::from_datatype(d.as_bytes()));
            self.last_data = match packet.get("data") {
                Some(Value::Str(data)) => Some(data.clone()),
                _ => None,
            };
            self.seq_head += 1;
            self.buffers.push_front(packet);
            while self.buffers.len() > self.buffer_count {
                self.buffers.pop_back();
            }
            self.advance_rings();
            self.syncing = false;
            return true;
        }
        if !self.syncing {
            tracing::error!("invalid DTSC data on input, resyncing");
            self.syncing = true;
        }
        match find_resync_point(buffer) {
            Some(pos) => {
                let _ = buffer.split_to(pos);
            }
            None => buffer.clear(),
        }
        false
    }

    /// Media time of the newest packet.
    #[must_use]
    pub fn get_time(&self) -> i64 {
        self.buffers.front().map_or(0, |p| p.get("time").map_or(0, Value::as_int))
    }

    #[must_use]
    pub fn last_type(&self) -> DataKind {
        self.last_kind
    }

    /// Raw `data` member of the last parsed packet, if it had one.
    #[must_use]
    pub fn last_data(&self) -> Option<&Bytes> {
        self.last_data.as_ref()
    }

    #[must_use]
    pub fn get_packet(&self, num: usize) -> Option<&Value> {
        self.buffers.get(num)
    }

    #[must_use]
    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    #[must_use]
    pub fn has_video(&self) -> bool {
        self.metadata.is_member("video") || self.has_track_of_type(b"video")
    }

    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.metadata.is_member("audio") || self.has_track_of_type(b"audio")
    }

    pub fn set_buffer_time(&mut self, ms: u64) {
        self.buffer_time_ms = ms;
    }

    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    #[must_use]
    pub fn buffered_packets(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn keyframe_count(&self) -> usize {
        self.keyframes.len()
    }

    /// A packed DTSC payload frame for the packet at window index `num`;
    /// empty when out of range.
    #[must_use]
    pub fn out_packet(&self, num: usize) -> Bytes {
        match self.buffers.get(num) {
            Some(packet) if packet.is_object() => packet.net_packed(),
            _ => Bytes::new(),
        }
    }

    /// The packed DTSC header frame for the current metadata.
    #[must_use]
    pub fn out_header(&self) -> Bytes {
        self.metadata_packed.clone()
    }

    /// Issues a durable cursor pointing at the newest keyframe (or the newest
    /// packet if no keyframe is buffered yet). Call [`Self::drop_ring`] when
    /// done with it.
    pub fn get_ring(&mut self) -> RingId {
        let seq = self.keyframes.front().copied().unwrap_or(self.seq_head);
        let id = self.next_ring_id;
        self.next_ring_id += 1;
        self.rings.insert(
            id,
            Ring {
                seq,
                ..Ring::default()
            },
        );
        id
    }

    pub fn drop_ring(&mut self, id: RingId) {
        self.rings.remove(&id);
    }

    #[must_use]
    pub fn ring(&self, id: RingId) -> Option<&Ring> {
        self.rings.get(&id)
    }

    pub fn ring_mut(&mut self, id: RingId) -> Option<&mut Ring> {
        self.rings.get_mut(&id)
    }

    /// Resolves a cursor to its current window index, if still buffered.
    #[must_use]
    pub fn ring_index(&self, id: RingId) -> Option<usize> {
        let ring = self.rings.get(&id)?;
        self.resolve(ring.seq)
    }

    /// Returns 0 if seeking to `ms` is possible, -1 if it is older than the
    /// window, 1 if it is newer.
    #[must_use]
    pub fn can_seek_ms(&self, ms: i64) -> i32 {
        let count = self.metadata.get("keytime").map_or(0, Value::len);
        if count == 0 {
            return 1;
        }
        if ms > arr_int(&self.metadata, "keytime", count - 1) {
            return 1;
        }
        if ms < arr_int(&self.metadata, "keytime", 0) {
            return -1;
        }
        0
    }

    /// Returns 0 if seeking to key number `frameno` is possible, -1 if it is
    /// older than the window, 1 if it is newer.
    #[must_use]
    pub fn can_seek_frame(&self, frameno: i64) -> i32 {
        let count = self.metadata.get("keynum").map_or(0, Value::len);
        if count == 0 {
            return 1;
        }
        if frameno > arr_int(&self.metadata, "keynum", count - 1) {
            return 1;
        }
        if frameno < arr_int(&self.metadata, "keynum", 0) {
            return -1;
        }
        0
    }

    /// Window index of the newest keyframe with `time <= ms`; out-of-range
    /// requests clamp to the newest/oldest keyframe with a warning. `None`
    /// only when no keyframe is buffered.
    #[must_use]
    pub fn ms_seek(&self, ms: i64) -> Option<usize> {
        let newest = *self.keyframes.front()?;
        if ms > self.key_time(newest) {
            tracing::warn!(
                "seeking past ingest ({ms}ms > {}ms)",
                self.key_time(newest)
            );
            return self.resolve(newest);
        }
        for &seq in &self.keyframes {
            if self.key_time(seq) <= ms {
                return self.resolve(seq);
            }
        }
        let oldest = *self.keyframes.back()?;
        tracing::warn!(
            "seeking past buffer window ({ms}ms < {}ms)",
            self.key_time(oldest)
        );
        self.resolve(oldest)
    }

    /// Window index of the keyframe with key number `frameno`; clamps like
    /// [`Self::ms_seek`].
    #[must_use]
    pub fn frame_seek(&self, frameno: i64) -> Option<usize> {
        let newest = *self.keyframes.front()?;
        if frameno > self.key_fragnum(newest) {
            tracing::warn!(
                "seeking past ingest (F{frameno} > F{})",
                self.key_fragnum(newest)
            );
            return self.resolve(newest);
        }
        for &seq in &self.keyframes {
            if self.key_fragnum(seq) == frameno {
                return self.resolve(seq);
            }
        }
        let oldest = *self.keyframes.back()?;
        tracing::warn!(
            "seeking past buffer window (F{frameno} < F{})",
            self.key_fragnum(oldest)
        );
        self.resolve(oldest)
    }

    fn resolve(&self, seq: u64) -> Option<usize> {
        if seq == 0 || seq > self.seq_head {
            return None;
        }
        let index = (self.seq_head - seq) as usize;
        if index < self.buffers.len() {
            Some(index)
        } else {
            None
        }
    }

    fn key_time(&self, seq: u64) -> i64 {
        self.resolve(seq)
            .and_then(|i| self.buffers.get(i))
            .map_or(0, |p| p.get("time").map_or(0, Value::as_int))
    }

    fn key_fragnum(&self, seq: u64) -> i64 {
        self.resolve(seq)
            .and_then(|i| self.buffers.get(i))
            .map_or(0, |p| p.get("fragnum").map_or(0, Value::as_int))
    }

    fn has_track_of_type(&self, kind: &[u8]) -> bool {
        match self.metadata.get("tracks") {
            Some(tracks) => tracks
                .entries()
                .any(|(_, t)| t.get("type").map_or(false, |ty| ty.as_bytes() == kind)),
            None => false,
        }
    }

    fn track_datatype(&self, trackid: i64) -> Option<Value> {
        let name = self.track_mapping.get(&trackid)?;
        self.metadata
            .get("tracks")
            .and_then(|tracks| tracks.get(name))
            .and_then(|track| track.get("type"))
            .cloned()
    }

    fn net_prepare(&mut self) {
        self.metadata_packed = self.metadata.packed_header();
    }

    /// Enqueue aftermath: advance every cursor, maintain the keyframe index,
    /// grow the window until it spans enough media time, and refresh the
    /// derived metadata after each new keyframe.
    fn advance_rings(&mut self) {
        let oldest_seq = self.seq_head + 1 - self.buffers.len() as u64;
        for ring in self.rings.values_mut() {
            if ring.waiting {
                ring.waiting = false;
                ring.seq = self.seq_head;
            }
            if ring.starved || ring.seq < oldest_seq || ring.seq > self.seq_head {
                ring.starved = true;
                ring.seq = self.seq_head;
            }
        }
        self.keyframes.retain(|&seq| seq >= oldest_seq);

        let front_time = self.get_time();
        let is_keyframe = (self.last_kind == DataKind::Video
            && self.buffers.front().map_or(false, |p| p.is_member("keyframe")))
            || (!self.has_video() && Some(front_time / 2000) != self.last_key_window);
        if is_keyframe {
            self.keyframes.push_front(self.seq_head);
            if let Some(front) = self.buffers.front_mut() {
                if !front.is_member("fragnum") {
                    front.set("fragnum", Value::Int(self.frag_num));
                    self.frag_num += 1;
                }
            }
            self.last_key_window = Some(front_time / 2000);
        }

        if self.buffer_count > 1 {
            let time_buffered = if self.keyframes.len() > 1 {
                self.key_time(self.keyframes[0]) - self.key_time(*self.keyframes.back().unwrap())
            } else {
                0
            };
            if self.keyframes.len() < 2 || time_buffered < self.buffer_time_ms as i64 {
                self.buffer_count += 1;
            }
        }

        if is_keyframe {
            self.update_headers();
        }
    }

    /// Refreshes `keytime`/`keynum`/`keylen` and the fragment manifest. Must
    /// only run right after a new keyframe was enqueued.
    fn update_headers(&mut self) {
        if self.keyframes.len() <= 2 {
            return;
        }
        let newest_time = self.key_time(self.keyframes[0]);
        let oldest_time = self.key_time(*self.keyframes.back().unwrap());
        if newest_time < oldest_time {
            // timestamps went backwards: the source restarted
            tracing::error!("new video detected, resetting all buffers and metadata");
            self.keyframes.clear();
            self.buffers.clear();
            for ring in self.rings.values_mut() {
                ring.updated = true;
                ring.starved = true;
                ring.seq = self.seq_head;
            }
            for member in ["keytime", "keynum", "keylen", "frags", "lastms", "missed_frags"] {
                self.metadata.remove_member(member);
            }
            self.net_prepare();
            return;
        }

        let keep = self.keyframes.len() - 2;
        let second_time = self.key_time(self.keyframes[1]);
        let second_num = self.key_fragnum(self.keyframes[1]);
        self.metadata.member("keytime").shrink(keep);
        self.metadata.member("keynum").shrink(keep);
        self.metadata.member("keylen").shrink(keep);
        self.metadata.member("keytime").append(Value::Int(second_time));
        self.metadata.member("keynum").append(Value::Int(second_num));
        self.metadata
            .member("keylen")
            .append(Value::Int(newest_time - second_time));

        self.synthesize_fragments();

        self.metadata.set("lastms", Value::Int(newest_time));
        self.metadata
            .set("buffer_window", Value::Int(self.buffer_time_ms as i64));
        self.metadata.set("live", Value::Bool(true));
        self.net_prepare();
        for ring in self.rings.values_mut() {
            ring.updated = true;
        }
    }

    /// Groups consecutive keyframes into fragments of at least
    /// [`FRAGMENT_DURATION_MS`], dropping fragments whose first key has
    /// scrolled out of the window (counted in `missed_frags`).
    fn synthesize_fragments(&mut self) {
        let meta = &mut self.metadata;
        let mut frag_start = 0usize;
        if meta.get("frags").map_or(true, Value::is_empty) {
            if !meta.is_member("missed_frags") {
                meta.set("missed_frags", Value::Int(0));
            }
        } else {
            let oldest_key = arr_int(meta, "keynum", 0);
            while meta.get("frags").map_or(0, Value::len) > 0
                && meta
                    .get("frags")
                    .and_then(|f| f.get_index(0))
                    .and_then(|f| f.get("num"))
                    .map_or(0, Value::as_int)
                    < oldest_key
            {
                let remaining = meta.get("frags").map_or(0, Value::len);
                meta.member("frags").shrink(remaining - 1);
                let missed = meta.get("missed_frags").map_or(0, Value::as_int);
                meta.set("missed_frags", Value::Int(missed + 1));
            }
            let frag_count = meta.get("frags").map_or(0, Value::len);
            if frag_count > 0 {
                let last = meta.get("frags").and_then(|f| f.get_index(frag_count - 1));
                let oldest_unfragmented = last.and_then(|f| f.get("num")).map_or(0, Value::as_int)
                    + last.and_then(|f| f.get("len")).map_or(0, Value::as_int);
                let key_count = meta.get("keynum").map_or(0, Value::len);
                while frag_start < key_count
                    && arr_int(meta, "keynum", frag_start) < oldest_unfragmented
                {
                    frag_start += 1;
                }
            }
        }

        let key_count = meta.get("keytime").map_or(0, Value::len);
        let mut i = frag_start;
        while i < key_count {
            let mut frag_len = 1i64;
            let mut frag_dur = arr_int(meta, "keylen", i);
            let mut emitted = false;
            let mut j = i + 1;
            while j < key_count {
                if frag_dur >= FRAGMENT_DURATION_MS {
                    let mut frag = Value::object();
                    frag.set("num", Value::Int(arr_int(meta, "keynum", i)));
                    frag.set("len", Value::Int(frag_len));
                    frag.set("dur", Value::Int(frag_dur));
                    meta.member("frags").append(frag);
                    i += frag_len as usize;
                    emitted = true;
                    break;
                }
                frag_len += 1;
                frag_dur += arr_int(meta, "keylen", j);
                j += 1;
            }
            if !emitted {
                break;
            }
        }
    }
}

fn arr_int(value: &Value, name: &str, index: usize) -> i64 {
    value
        .get(name)
        .and_then(|a| a.get_index(index))
        .map_or(0, Value::as_int)
}

fn find_resync_point(buffer: &[u8]) -> Option<usize> {
    let v1 = find_magic(buffer, MAGIC_PACKET);
    let v2 = find_magic(buffer, MAGIC_PACKET2);
    match (v1, v2) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn find_magic(haystack: &[u8], magic: &[u8; 4]) -> Option<usize> {
    haystack.windows(4).position(|w| w == magic)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_metadata() -> Bytes {
        let mut meta = Value::object();
        meta.set("video", Value::object());
        let mut tracks = Value::object();
        tracks.member("video_h264").set("trackid", Value::Int(1));
        tracks.member("video_h264").set("type", Value::string("video"));
        meta.set("tracks", tracks);
        meta.set("moreheader", Value::Int(0));
        meta.packed_header()
    }

    fn video_packet(time: i64, keyframe: bool) -> Value {
        let mut v = Value::object();
        v.set("trackid", Value::Int(1));
        v.set("time", Value::Int(time));
        v.set("datatype", Value::string("video"));
        if keyframe {
            v.set("keyframe", Value::Int(1));
        }
        v.set("data", Value::Str(Bytes::from_static(b"frame")));
        v
    }

    fn feed(stream: &mut LiveStream, bytes: &[u8]) -> bool {
        let mut buf = BytesMut::from(bytes);
        let mut parsed = false;
        while stream.parse_packet(&mut buf) {
            parsed = true;
        }
        parsed
    }

    #[test]
    fn test_header_frame_replaces_metadata() {
        let mut stream = LiveStream::new();
        feed(&mut stream, &video_metadata());
        assert!(stream.metadata().is_member("tracks"));
        // moreheader is stripped on ingest
        assert!(!stream.metadata().is_member("moreheader"));
        assert!(stream.has_video());
        assert!(!stream.has_audio());
    }

    #[test]
    fn test_partial_input_is_left_untouched() {
        let mut stream = LiveStream::new();
        let packed = video_packet(0, true).net_packed();
        let mut buf = BytesMut::from(&packed[..packed.len() - 3]);
        assert!(!stream.parse_packet(&mut buf));
        assert_eq!(buf.len(), packed.len() - 3);
        // completing the frame parses it
        buf.extend_from_slice(&packed[packed.len() - 3..]);
        assert!(stream.parse_packet(&mut buf));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_packet_round_trip() {
        let mut stream = LiveStream::new();
        feed(&mut stream, &video_metadata());
        let original = video_packet(1000, true);
        feed(&mut stream, &original.net_packed());
        // fragnum is assigned on ingest; strip it for the comparison
        let mut got = stream.get_packet(0).unwrap().clone();
        got.remove_member("fragnum");
        assert_eq!(got, original);
        assert_eq!(stream.last_type(), DataKind::Video);
        assert_eq!(stream.last_data().unwrap().as_ref(), b"frame");
        assert_eq!(stream.get_time(), 1000);
    }

    #[test]
    fn test_datatype_backfill_from_track_metadata() {
        let mut stream = LiveStream::new();
        feed(&mut stream, &video_metadata());
        let mut packet = video_packet(0, true);
        packet.remove_member("datatype");
        feed(&mut stream, &packet.net_packed());
        assert_eq!(
            stream.get_packet(0).unwrap().get("datatype").unwrap().as_bytes(),
            b"video"
        );
        assert_eq!(stream.last_type(), DataKind::Video);
    }

    #[test]
    fn test_resync_skips_garbage() {
        let mut stream = LiveStream::new();
        feed(&mut stream, &video_metadata());
        let packed = video_packet(0, true).net_packed();
        let mut wire = BytesMut::from(&b"garbage bytes here"[..]);
        wire.extend_from_slice(&packed);
        assert!(!stream.parse_packet(&mut wire));
        // garbage was discarded up to the magic; the next call succeeds
        assert!(stream.parse_packet(&mut wire));
        assert_eq!(stream.buffered_packets(), 1);
    }

    #[test]
    fn test_ring_waiting_and_starvation() {
        let mut stream = LiveStream::with_buffers(2, 0);
        feed(&mut stream, &video_metadata());
        let ring = stream.get_ring();
        // no packets yet: unresolvable
        assert!(stream.ring_index(ring).is_none());

        feed(&mut stream, &video_packet(0, true).net_packed());
        // the pre-data cursor starved and snapped to the newest packet
        assert!(stream.ring(ring).unwrap().starved);
        assert_eq!(stream.ring_index(ring), Some(0));

        stream.ring_mut(ring).unwrap().starved = false;
        stream.ring_mut(ring).unwrap().waiting = true;
        feed(&mut stream, &video_packet(1000, false).net_packed());
        let r = stream.ring(ring).unwrap();
        assert!(!r.waiting);
        assert!(!r.starved);
        assert_eq!(stream.ring_index(ring), Some(0));
    }

    #[test]
    fn test_window_grows_until_buffer_time_spanned() {
        let mut stream = LiveStream::with_buffers(2, 5000);
        feed(&mut stream, &video_metadata());
        for i in 0..12 {
            feed(&mut stream, &video_packet(i * 1000, true).net_packed());
        }
        assert!(stream.keyframe_count() >= 6);
        let spanned = {
            let newest = stream.get_packet(0).unwrap().get("time").unwrap().as_int();
            let oldest_idx = stream.buffered_packets() - 1;
            let oldest = stream
                .get_packet(oldest_idx)
                .unwrap()
                .get("time")
                .unwrap()
                .as_int();
            newest - oldest
        };
        assert!(spanned >= 5000, "window spans {spanned}ms");
    }

    #[test]
    fn test_fragment_boundary() {
        let mut stream = LiveStream::with_buffers(64, 60_000);
        feed(&mut stream, &video_metadata());
        for t in [0, 0, 3000, 6000, 9000, 12_000, 15_000, 18_000] {
            feed(&mut stream, &video_packet(t, true).net_packed());
        }
        let meta = stream.metadata();
        // keytime lags two keyframes behind ingest
        let keytimes: Vec<i64> = (0..meta.get("keytime").unwrap().len())
            .map(|i| arr_int(meta, "keytime", i))
            .collect();
        assert_eq!(keytimes, vec![0, 3000, 6000, 9000, 12_000, 15_000]);

        let frags = meta.get("frags").unwrap();
        assert_eq!(frags.len(), 1);
        let frag = frags.get_index(0).unwrap();
        // the first fragment covers the four keys starting at the 0ms key
        assert_eq!(frag.get("num").unwrap().as_int(), 2);
        assert_eq!(frag.get("len").unwrap().as_int(), 4);
        assert_eq!(frag.get("dur").unwrap().as_int(), 12_000);
        assert_eq!(meta.get("missed_frags").unwrap().as_int(), 0);
        assert_eq!(meta.get("lastms").unwrap().as_int(), 18_000);
        assert_eq!(meta.get("live").unwrap().as_int(), 1);
    }

    #[test]
    fn test_can_seek_bounds() {
        let mut stream = LiveStream::with_buffers(64, 60_000);
        feed(&mut stream, &video_metadata());
        assert_eq!(stream.can_seek_ms(0), 1); // nothing indexed yet
        for t in [0, 3000, 6000, 9000, 12_000] {
            feed(&mut stream, &video_packet(t, true).net_packed());
        }
        // indexed keytimes are 3000..=9000 (the index lags two keys behind)
        assert_eq!(stream.can_seek_ms(-1), -1);
        assert_eq!(stream.can_seek_ms(3000), 0);
        assert_eq!(stream.can_seek_ms(100_000), 1);
        assert_eq!(stream.can_seek_frame(0), -1);
        assert_eq!(stream.can_seek_frame(2), 0);
        assert_eq!(stream.can_seek_frame(99), 1);
    }

    #[test]
    fn test_ms_seek_finds_newest_key_at_or_before() {
        let mut stream = LiveStream::with_buffers(64, 60_000);
        feed(&mut stream, &video_metadata());
        for t in [0, 3000, 6000, 9000] {
            feed(&mut stream, &video_packet(t, true).net_packed());
        }
        // newest packet (9000) is index 0, oldest (0) is index 3
        assert_eq!(stream.ms_seek(9000), Some(0));
        assert_eq!(stream.ms_seek(7000), Some(1));
        assert_eq!(stream.ms_seek(3000), Some(2));
        // clamps on both ends
        assert_eq!(stream.ms_seek(50_000), Some(0));
        assert_eq!(stream.ms_seek(-5), Some(3));
        assert_eq!(stream.frame_seek(2), Some(2));
    }

    #[test]
    fn test_time_regression_resets_stream() {
        let mut stream = LiveStream::with_buffers(64, 60_000);
        feed(&mut stream, &video_metadata());
        for t in [10_000, 13_000, 16_000] {
            feed(&mut stream, &video_packet(t, true).net_packed());
        }
        let ring = stream.get_ring();
        assert!(stream.metadata().is_member("keytime"));
        // the source restarted from zero
        feed(&mut stream, &video_packet(0, true).net_packed());
        assert_eq!(stream.buffered_packets(), 0);
        assert_eq!(stream.keyframe_count(), 0);
        assert!(!stream.metadata().is_member("keytime"));
        assert!(!stream.metadata().is_member("frags"));
        let r = stream.ring(ring).unwrap();
        assert!(r.starved);
        assert!(r.updated);
    }

    #[test]
    fn test_audio_only_uses_time_quantisation() {
        let mut stream = LiveStream::with_buffers(64, 60_000);
        // no metadata at all: no video track, so the 2s window rule applies
        let mut audio = Value::object();
        audio.set("trackid", Value::Int(2));
        audio.set("time", Value::Int(100));
        audio.set("datatype", Value::string("audio"));
        audio.set("data", Value::Str(Bytes::from_static(b"a")));
        feed(&mut stream, &audio.net_packed());
        assert_eq!(stream.keyframe_count(), 1);

        // same 2s window: not a new surrogate keyframe
        audio.set("time", Value::Int(1900));
        feed(&mut stream, &audio.net_packed());
        assert_eq!(stream.keyframe_count(), 1);

        // next window
        audio.set("time", Value::Int(2100));
        feed(&mut stream, &audio.net_packed());
        assert_eq!(stream.keyframe_count(), 2);
    }

    #[test]
    fn test_out_header_round_trips_into_another_stream() {
        let mut stream = LiveStream::with_buffers(64, 60_000);
        feed(&mut stream, &video_metadata());
        for t in [0, 3000, 6000] {
            feed(&mut stream, &video_packet(t, true).net_packed());
        }
        let mut other = LiveStream::new();
        feed(&mut other, &stream.out_header());
        // booleans travel as integers, so compare member-wise
        let (a, b) = (other.metadata(), stream.metadata());
        assert_eq!(a.get("keytime"), b.get("keytime"));
        assert_eq!(a.get("keynum"), b.get("keynum"));
        assert_eq!(a.get("lastms"), b.get("lastms"));
        assert_eq!(a.get("tracks"), b.get("tracks"));
        assert_eq!(a.get("live").unwrap().as_int(), 1);
        assert!(other.has_video());
    }

    #[test]
    fn test_out_packet_frames_buffered_payload() {
        let mut stream = LiveStream::new();
        feed(&mut stream, &video_metadata());
        feed(&mut stream, &video_packet(0, true).net_packed());
        let out = stream.out_packet(0);
        assert_eq!(&out[0..4], b"DTP2");
        assert!(stream.out_packet(5).is_empty());
    }
}

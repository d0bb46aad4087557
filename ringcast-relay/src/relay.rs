//! The ring fan-out server: a single-threaded cooperative loop that ingests
//! one FLV tag per tick into a fixed ring and pushes every viewer forward
//! with non-blocking sends.
//!
//! All sockets are non-blocking; a would-block result is normal and retried
//! on the next tick. Nothing is shared across threads.

use std::fs;
use std::io::{self, ErrorKind, Read};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::errors::{RelayError, RelayResult};
use crate::flv::{tag_type, Tag, TagOutcome, TagReader, FLV_FILE_HEADER};
use crate::ring::{new_ring, RingSlot};
use crate::viewer::{Stats, Viewer};

pub struct Relay {
    listener: UnixListener,
    socket_path: PathBuf,
    ring: Vec<RingSlot>,
    /// Slot currently being refilled.
    cursor: usize,
    /// Most recent slot known to contain a keyframe; the join point for new
    /// viewers.
    lastproper: usize,
    /// Sequence counter; assigned to slots on successful ingest.
    loopcount: i64,
    viewers: Vec<Viewer>,
    next_user: u64,
    metadata: Option<Tag>,
    audio_init: Option<Tag>,
    video_init: Option<Tag>,
    got_video_info: bool,
    got_audio_info: bool,
    got_data: bool,
    /// stdin, or the promoted push socket. None while a push source is still
    /// awaited.
    ingest: Option<Box<dyn Read>>,
    reader: TagReader,
    push_ip: Option<String>,
    parse_error: bool,
    eof: bool,
    last_stat_secs: u64,
}

impl Relay {
    /// Binds the local-domain listener at `/tmp/shared_socket_<streamName>`
    /// (erasing a stale socket first). When `push_ip` is set, ingest waits
    /// for a peer to register with a matching `P` line; otherwise the caller
    /// attaches stdin via [`Self::set_ingest`].
    pub fn new(
        buffer_count: usize,
        stream_name: &str,
        push_ip: Option<String>,
    ) -> RelayResult<Self> {
        if buffer_count == 0 {
            return Err(RelayError::InvalidBufferCount(buffer_count));
        }
        let socket_path = PathBuf::from(format!("/tmp/shared_socket_{stream_name}"));
        let _ = fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            socket_path,
            ring: new_ring(buffer_count),
            cursor: 0,
            lastproper: 0,
            loopcount: 0,
            viewers: Vec::new(),
            next_user: 0,
            metadata: None,
            audio_init: None,
            video_init: None,
            got_video_info: false,
            got_audio_info: false,
            got_data: false,
            ingest: None,
            reader: TagReader::new(),
            push_ip,
            parse_error: false,
            eof: false,
            last_stat_secs: 0,
        })
    }

    pub fn set_ingest(&mut self, source: Box<dyn Read>) {
        self.ingest = Some(source);
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[must_use]
    pub fn parse_error(&self) -> bool {
        self.parse_error
    }

    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    #[must_use]
    pub fn got_data(&self) -> bool {
        self.got_data
    }

    /// Number of tags ingested so far.
    #[must_use]
    pub fn ingested_tags(&self) -> i64 {
        self.loopcount
    }

    /// Runs the loop until ingest EOF or a fatal parse error, then drains all
    /// viewers. Returns false when the stream ended on a parse error.
    pub fn run(&mut self) -> bool {
        loop {
            // 1ms pause per iteration keeps an idle loop off the CPU
            thread::sleep(Duration::from_millis(1));
            if !self.tick() {
                break;
            }
        }
        self.shutdown();
        !self.parse_error
    }

    /// One loop iteration: per-second stats, ingest, accept, viewer service.
    /// Returns false once the relay should shut down.
    pub fn tick(&mut self) -> bool {
        self.log_aggregate_stats();

        // the slot being refilled is invalid until the tag completes
        self.ring[self.cursor].number = -1;
        if let Some(source) = self.ingest.as_mut() {
            match self.reader.load_from(source.as_mut()) {
                Ok(TagOutcome::Tag(tag)) => self.store_tag(tag),
                Ok(TagOutcome::Pending) => {}
                Ok(TagOutcome::Eof) => self.eof = true,
                Err(err) => {
                    tracing::error!("FLV ingest failed: {err}");
                    self.parse_error = true;
                }
            }
        }

        match self.listener.accept() {
            Ok((stream, _)) => self.admit(stream),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!("accept failed: {e}"),
        }

        self.process_viewers();

        !(self.eof || self.parse_error)
    }

    /// Stops the relay: logs how the stream ended, disconnects every viewer
    /// and removes the listener socket.
    pub fn shutdown(&mut self) {
        if self.parse_error {
            println!("FLV parse error");
        } else {
            println!("Reached EOF of input");
        }
        for viewer in &mut self.viewers {
            viewer.disconnect("Shutting down...");
        }
        self.viewers.clear();
        let _ = fs::remove_file(&self.socket_path);
    }

    /// Classifies and stores one ingested tag into the current ring slot.
    fn store_tag(&mut self, tag: Tag) {
        self.loopcount += 1;
        let mut tag = tag;
        let packtype = tag.packtype();

        if packtype == tag_type::SCRIPT {
            println!("Received metadata!");
            if self.got_video_info && self.got_audio_info {
                // a re-announce mid-stream means the source reset
                self.parse_error = true;
                println!("... after proper video and audio? Cancelling broadcast!");
            }
            self.metadata = Some(tag.clone());
            self.got_video_info = false;
            self.got_audio_info = false;
        }

        if !self.got_video_info && tag.is_keyframe() {
            if tag.codec_tag() & 0x0f == 7 {
                // AVC decoder configuration precedes any frame data
                if tag.payload().get(1) == Some(&0) {
                    tag = tag.with_time(0);
                    self.video_init = Some(tag.clone());
                    self.got_video_info = true;
                    println!("Received video configuration!");
                }
            } else {
                // non-AVC video carries no separate config
                self.got_video_info = true;
            }
        }

        if !self.got_audio_info && packtype == tag_type::AUDIO {
            if tag.codec_tag() >> 4 == 10 {
                tag = tag.with_time(0);
                self.audio_init = Some(tag.clone());
                self.got_audio_info = true;
                println!("Received audio configuration!");
            } else {
                // non-AAC audio carries no separate config
                self.got_audio_info = true;
            }
        }

        if tag.is_keyframe() {
            self.lastproper = self.cursor;
        }
        if self.loopcount >= 5 {
            self.got_data = true;
        }

        self.ring[self.cursor] = RingSlot {
            number: self.loopcount,
            tag: Some(tag),
        };
        self.cursor = (self.cursor + 1) % self.ring.len();
    }

    /// Join protocol: new viewers start at the last keyframe slot and, once
    /// the stream is live, receive the FLV file header and the cached init
    /// tags up front. Any short write disconnects with a specific reason.
    fn admit(&mut self, stream: UnixStream) {
        let id = self.next_user;
        self.next_user += 1;
        let mut viewer = match Viewer::new(id, stream, self.lastproper) {
            Ok(viewer) => viewer,
            Err(err) => {
                tracing::warn!("could not set up viewer {id}: {err}");
                return;
            }
        };
        if self.got_data {
            let mut init: Vec<(&[u8], &str)> =
                vec![(&FLV_FILE_HEADER, "failed to receive the header!")];
            if let Some(tag) = &self.metadata {
                init.push((&tag.data, "failed to receive metadata!"));
            }
            if let Some(tag) = &self.audio_init {
                init.push((&tag.data, "failed to receive audio init!"));
            }
            if let Some(tag) = &self.video_init {
                init.push((&tag.data, "failed to receive video init!"));
            }
            for (bytes, reason) in init {
                if !viewer.write_all_now(bytes, reason) {
                    break;
                }
            }
        }
        self.viewers.push(viewer);
    }

    fn process_viewers(&mut self) {
        let mut i = 0;
        while i < self.viewers.len() {
            if !self.viewers[i].is_connected() {
                let mut viewer = self.viewers.remove(i);
                viewer.disconnect("Closed");
                continue;
            }
            let lines = self.viewers[i].poll_control();
            let mut promoted = false;
            for line in lines {
                match line.chars().next() {
                    Some('P') => {
                        if self.handle_push(i, &line) {
                            promoted = true;
                            break;
                        }
                    }
                    Some('S') => {
                        let stats = Stats::parse(line.get(2..).unwrap_or(""));
                        self.viewers[i].apply_stats(stats);
                    }
                    _ => {}
                }
            }
            if promoted {
                continue;
            }
            self.viewers[i].send(&self.ring);
            i += 1;
        }
    }

    /// Push registration. The offered IP is compared to the configured one as
    /// an exact string, no normalisation; a relay without a push IP matches
    /// nothing. Returns true when the viewer at `index` was promoted to the
    /// ingest source (and removed from the viewer set).
    fn handle_push(&mut self, index: usize, line: &str) -> bool {
        let offered = line.get(2..).unwrap_or("");
        println!("Push attempt from IP {offered}");
        if self.push_ip.as_deref() == Some(offered) {
            if self.ingest.is_none() {
                println!("Push accepted!");
                let viewer = self.viewers.remove(index);
                self.ingest = Some(Box::new(viewer.into_stream()));
                true
            } else {
                self.viewers[index].disconnect("Push denied - push already in progress!");
                false
            }
        } else {
            self.viewers[index].disconnect("Push denied - invalid IP address!");
            false
        }
    }

    fn log_aggregate_stats(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        if now == self.last_stat_secs {
            return;
        }
        self.last_stat_secs = now;
        if self.viewers.is_empty() {
            return;
        }
        let up: u64 = self.viewers.iter().map(|v| v.up_rate).sum();
        let down: u64 = self.viewers.iter().map(|v| v.down_rate).sum();
        println!("Stats: {} viewers, {up} up, {down} down", self.viewers.len());
    }
}

/// stdin as a non-blocking ingest source.
pub fn stdin_ingest() -> io::Result<Box<dyn Read>> {
    // SAFETY: fcntl on fd 0 with valid flag arguments
    let flags = unsafe { libc::fcntl(0, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(0, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Box::new(StdinSource))
}

/// Disconnects must surface as write errors, not kill the process.
pub fn ignore_sigpipe() {
    // SAFETY: SIG_IGN is a valid disposition for SIGPIPE
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

struct StdinSource;

impl Read for StdinSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: reads into a valid, exclusively borrowed buffer
        let n = unsafe { libc::read(0, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

//! Tick-driven relay scenarios over real unix sockets.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ringcast_relay::flv::{encode_tag, tag_type, FLV_FILE_HEADER};
use ringcast_relay::Relay;

static STREAM_SEQ: AtomicU64 = AtomicU64::new(0);

fn unique_stream_name(label: &str) -> String {
    format!(
        "test_{label}_{}_{}",
        std::process::id(),
        STREAM_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Hooks a socketpair up as the relay's ingest source; bytes written to the
/// returned stream arrive as stdin would.
fn attach_ingest(relay: &mut Relay) -> UnixStream {
    let (relay_side, feed_side) = UnixStream::pair().unwrap();
    relay_side.set_nonblocking(true).unwrap();
    relay.set_ingest(Box::new(relay_side));
    feed_side
}

/// Drives `n` ticks (or fewer if the relay asks to stop); returns whether the
/// relay is still running.
fn ticks(relay: &mut Relay, n: usize) -> bool {
    for _ in 0..n {
        if !relay.tick() {
            return false;
        }
    }
    true
}

fn connect_viewer(relay: &Relay) -> UnixStream {
    let stream = UnixStream::connect(relay.socket_path()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    stream
}

fn read_available(stream: &mut UnixStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => break,
            Err(e) => panic!("viewer read failed: {e}"),
        }
    }
    out
}

/// True when the peer closed the connection (reads drain to EOF).
fn reached_eof(stream: &mut UnixStream) -> bool {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return false
            }
            Err(_) => return true,
        }
    }
}

fn metadata_tag() -> Vec<u8> {
    encode_tag(tag_type::SCRIPT, 0, b"onMetaDataPayload").to_vec()
}

fn avc_config(ts: u32) -> Vec<u8> {
    encode_tag(tag_type::VIDEO, ts, &[0x17, 0x00, 0x01, 0x64, 0x00, 0x1f]).to_vec()
}

fn aac_config(ts: u32) -> Vec<u8> {
    encode_tag(tag_type::AUDIO, ts, &[0xaf, 0x00, 0x12, 0x10]).to_vec()
}

fn keyframe(ts: u32) -> Vec<u8> {
    encode_tag(tag_type::VIDEO, ts, &[0x17, 0x01, 0x00, 0x00, 0x00, 0xaa]).to_vec()
}

fn interframe(ts: u32) -> Vec<u8> {
    encode_tag(tag_type::VIDEO, ts, &[0x27, 0x01, 0x00, 0x00, 0x00, 0xbb]).to_vec()
}

fn zeroed_time(mut tag: Vec<u8>) -> Vec<u8> {
    tag[4] = 0;
    tag[5] = 0;
    tag[6] = 0;
    tag[7] = 0;
    tag
}

#[test]
fn test_viewer_join_gets_inits_then_stream_from_last_keyframe() {
    let name = unique_stream_name("join");
    let mut relay = Relay::new(64, &name, None).unwrap();
    let mut feed = attach_ingest(&mut relay);

    feed.write_all(&FLV_FILE_HEADER).unwrap();
    feed.write_all(&metadata_tag()).unwrap();
    feed.write_all(&avc_config(99)).unwrap();
    feed.write_all(&aac_config(77)).unwrap();
    feed.write_all(&keyframe(0)).unwrap();
    feed.write_all(&interframe(40)).unwrap();
    feed.write_all(&keyframe(80)).unwrap();
    feed.write_all(&interframe(120)).unwrap();
    assert!(ticks(&mut relay, 20));
    assert!(relay.got_data());
    assert_eq!(relay.ingested_tags(), 7);

    let mut viewer = connect_viewer(&relay);
    assert!(ticks(&mut relay, 10));
    assert_eq!(relay.viewer_count(), 1);

    let got = read_available(&mut viewer);
    // join protocol: file header, metadata, audio init, video init (the
    // cached inits carry zeroed timestamps), then tags from the newest
    // keyframe at join time
    let mut expected = FLV_FILE_HEADER.to_vec();
    expected.extend_from_slice(&metadata_tag());
    expected.extend_from_slice(&zeroed_time(aac_config(77)));
    expected.extend_from_slice(&zeroed_time(avc_config(99)));
    expected.extend_from_slice(&keyframe(80));
    expected.extend_from_slice(&interframe(120));
    assert_eq!(got, expected);

    // the viewer keeps following the live edge
    feed.write_all(&keyframe(160)).unwrap();
    assert!(ticks(&mut relay, 10));
    assert_eq!(read_available(&mut viewer), keyframe(160));
}

#[test]
fn test_second_viewer_joins_at_newer_keyframe() {
    let name = unique_stream_name("midgop");
    let mut relay = Relay::new(64, &name, None).unwrap();
    let mut feed = attach_ingest(&mut relay);

    feed.write_all(&FLV_FILE_HEADER).unwrap();
    feed.write_all(&metadata_tag()).unwrap();
    feed.write_all(&keyframe(0)).unwrap();
    feed.write_all(&interframe(40)).unwrap();
    feed.write_all(&interframe(80)).unwrap();
    feed.write_all(&keyframe(120)).unwrap();
    feed.write_all(&interframe(160)).unwrap();
    assert!(ticks(&mut relay, 20));

    let mut viewer = connect_viewer(&relay);
    assert!(ticks(&mut relay, 10));
    let got = read_available(&mut viewer);
    // no audio/video init was ever cached; stream starts at keyframe(120)
    let mut expected = FLV_FILE_HEADER.to_vec();
    expected.extend_from_slice(&metadata_tag());
    expected.extend_from_slice(&keyframe(120));
    expected.extend_from_slice(&interframe(160));
    assert_eq!(got, expected);
}

#[test]
fn test_push_negotiation() {
    let name = unique_stream_name("push");
    let mut relay = Relay::new(4, &name, Some("10.0.0.5".to_string())).unwrap();

    // wrong IP: denied and disconnected
    let mut wrong = connect_viewer(&relay);
    assert!(ticks(&mut relay, 5));
    wrong.write_all(b"P 10.0.0.2\n").unwrap();
    assert!(ticks(&mut relay, 5));
    assert!(reached_eof(&mut wrong));
    assert_eq!(relay.viewer_count(), 0);

    // matching IP: promoted out of the viewer set and into the ingest role
    let mut pusher = connect_viewer(&relay);
    assert!(ticks(&mut relay, 5));
    pusher.write_all(b"P 10.0.0.5\n").unwrap();
    assert!(ticks(&mut relay, 5));
    assert_eq!(relay.viewer_count(), 0);

    pusher.write_all(&FLV_FILE_HEADER).unwrap();
    pusher.write_all(&metadata_tag()).unwrap();
    assert!(ticks(&mut relay, 5));
    assert_eq!(relay.ingested_tags(), 1);

    // a second pusher is rejected while the first is live
    let mut late = connect_viewer(&relay);
    assert!(ticks(&mut relay, 5));
    late.write_all(b"P 10.0.0.5\n").unwrap();
    assert!(ticks(&mut relay, 5));
    assert!(reached_eof(&mut late));
    assert_eq!(relay.viewer_count(), 0);
}

#[test]
fn test_push_rejected_when_no_push_ip_configured() {
    let name = unique_stream_name("nopush");
    let mut relay = Relay::new(4, &name, None).unwrap();
    let _feed = attach_ingest(&mut relay);

    let mut peer = connect_viewer(&relay);
    assert!(ticks(&mut relay, 5));
    peer.write_all(b"P 10.0.0.5\n").unwrap();
    assert!(ticks(&mut relay, 5));
    assert!(reached_eof(&mut peer));
}

#[test]
fn test_duplicate_metadata_cancels_broadcast() {
    let name = unique_stream_name("dupmeta");
    let mut relay = Relay::new(8, &name, None).unwrap();
    let mut feed = attach_ingest(&mut relay);

    feed.write_all(&FLV_FILE_HEADER).unwrap();
    feed.write_all(&metadata_tag()).unwrap();
    feed.write_all(&avc_config(0)).unwrap();
    feed.write_all(&aac_config(0)).unwrap();
    assert!(ticks(&mut relay, 10));
    assert!(!relay.parse_error());

    feed.write_all(&metadata_tag()).unwrap();
    assert!(!ticks(&mut relay, 10));
    assert!(relay.parse_error());
    relay.shutdown();
}

#[test]
fn test_eof_drains_viewers_and_removes_socket() {
    let name = unique_stream_name("eof");
    let mut relay = Relay::new(8, &name, None).unwrap();
    let feed = attach_ingest(&mut relay);

    let mut viewer = connect_viewer(&relay);
    assert!(ticks(&mut relay, 5));
    assert_eq!(relay.viewer_count(), 1);

    drop(feed);
    assert!(!ticks(&mut relay, 5));
    assert!(!relay.parse_error());
    relay.shutdown();
    assert_eq!(relay.viewer_count(), 0);
    assert!(reached_eof(&mut viewer));
    assert!(!relay.socket_path().exists());
}

#[test]
fn test_stats_line_updates_without_disturbing_stream() {
    let name = unique_stream_name("stats");
    let mut relay = Relay::new(8, &name, None).unwrap();
    let mut feed = attach_ingest(&mut relay);
    feed.write_all(&FLV_FILE_HEADER).unwrap();
    for i in 0..6 {
        feed.write_all(&keyframe(i * 40)).unwrap();
    }
    assert!(ticks(&mut relay, 10));

    let mut viewer = connect_viewer(&relay);
    assert!(ticks(&mut relay, 5));
    viewer.write_all(b"S edge1 rtmp 10 100000 50000\n").unwrap();
    assert!(ticks(&mut relay, 5));
    viewer.write_all(b"S edge1 rtmp 15 150000 75000\n").unwrap();
    assert!(ticks(&mut relay, 5));
    // still connected and still streaming
    assert_eq!(relay.viewer_count(), 1);
    assert!(!read_available(&mut viewer).is_empty());
}

#[test]
fn test_single_slot_ring_disconnects_wedged_viewer() {
    let name = unique_stream_name("wedge");
    let mut relay = Relay::new(1, &name, None).unwrap();
    let mut feed = attach_ingest(&mut relay);
    feed.write_all(&FLV_FILE_HEADER).unwrap();

    let mut payload = vec![0u8; 16 * 1024];
    payload[0] = 0x17;
    payload[1] = 0x01;
    for i in 0..6u32 {
        feed.write_all(&encode_tag(tag_type::VIDEO, i * 40, &payload)).unwrap();
        assert!(ticks(&mut relay, 3));
    }

    let viewer = connect_viewer(&relay);
    assert!(ticks(&mut relay, 2));
    assert_eq!(relay.viewer_count(), 1);

    // the viewer never reads: its socket wedges mid-tag and the single-slot
    // ring rewrites the tag under the in-flight send
    for i in 6..80u32 {
        feed.write_all(&encode_tag(tag_type::VIDEO, i * 40, &payload)).unwrap();
        assert!(ticks(&mut relay, 3));
        if relay.viewer_count() == 0 {
            break;
        }
    }
    assert_eq!(relay.viewer_count(), 0);
    drop(viewer);
}

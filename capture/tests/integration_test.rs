//! End-to-end capture over a real TCP socket: handshake, record stream,
//! query resolution, terminate drain, then a save/load round trip.

use std::fs::File;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use capture::block::BlockWriter;
use capture::capfile::{load_capture, write_capture};
use capture::interner::StringRef;
use capture::transport::{read_exact, Transport};
use capture::{Connect, Session, SessionConfig, SessionOutcome};
use protocol::{
    HandshakeStatus, Query, QueryKind, Record, Welcome, HANDSHAKE_SHIBBOLETH, PROTOCOL_VERSION,
    QUERY_PACKET_SIZE,
};
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(5);

fn client_read(stream: &mut TcpStream, buf: &mut [u8]) {
    let cancel = AtomicBool::new(false);
    read_exact(stream, buf, TIMEOUT, &cancel).unwrap();
}

fn encode_block(records: &[Record]) -> Vec<u8> {
    let mut buf = Vec::new();
    for r in records {
        r.encode(&mut buf);
    }
    buf
}

/// Plays the instrumented-client side of the protocol on the accepted
/// connection: handshake, one block of events, then query resolutions
/// until the engine disconnects.
fn spawn_client(listener: TcpListener) -> JoinHandle<()> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();

        let mut hello = [0u8; 12];
        client_read(&mut stream, &mut hello);
        assert_eq!(&hello[..8], HANDSHAKE_SHIBBOLETH);
        assert_eq!(
            u32::from_le_bytes(hello[8..12].try_into().unwrap()),
            PROTOCOL_VERSION
        );
        stream
            .write_all(&[HandshakeStatus::Welcome.to_u8()])
            .unwrap();
        let welcome = Welcome {
            timer_mul: 1.0,
            init_begin: 0,
            init_end: 1000,
            epoch: 1_700_000_000,
            on_demand: false,
            program_name: "renderer".into(),
            host_info: "integration host".into(),
        };
        let mut payload = Vec::new();
        welcome.write(&mut payload);
        stream
            .write_all(&(payload.len() as u32).to_le_bytes())
            .unwrap();
        stream.write_all(&payload).unwrap();

        let mut blocks = BlockWriter::new();
        blocks
            .write_block(
                &mut stream,
                &encode_block(&[
                    Record::CustomStringData { ptr: 0x11, text: "level loaded".into() },
                    Record::ZoneBegin { thread: 1, time: 1100, src_loc: 0x40, cpu: 0 },
                    Record::Message { thread: 1, time: 1120, text: 0x11 },
                    Record::PlotData { name: 0x50, time: 1150, value: 42.0 },
                    Record::ZoneEnd { thread: 1, time: 1300, cpu: 0 },
                    Record::FrameMark { name: 0, time: 1400 },
                    Record::Terminate,
                ]),
            )
            .unwrap();

        loop {
            let mut packet = [0u8; QUERY_PACKET_SIZE];
            client_read(&mut stream, &mut packet);
            let query = Query::decode(&packet).unwrap();
            let reply = match query.kind {
                QueryKind::ThreadName => Record::ThreadName {
                    thread: query.token,
                    name: "render".into(),
                },
                QueryKind::SourceLocation => Record::SourceLocation {
                    ptr: query.token,
                    name: 0,
                    function: 0x20,
                    file: 0x21,
                    line: 33,
                    color: 0,
                },
                QueryKind::String => Record::StringData {
                    ptr: query.token,
                    text: if query.token == 0x20 { "draw" } else { "render.cpp" }.into(),
                },
                QueryKind::PlotName => Record::PlotName {
                    name: query.token,
                    text: "fps".into(),
                },
                QueryKind::Disconnect => return,
                other => panic!("unexpected query {other:?}"),
            };
            blocks.write_block(&mut stream, &encode_block(&[reply])).unwrap();
        }
    })
}

#[test]
fn tcp_session_reconstructs_and_round_trips_through_a_file() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = spawn_client(listener);

    let stream = TcpStream::connect(addr).unwrap();
    let config = SessionConfig {
        capture_name: "integration".into(),
        ..SessionConfig::default()
    };
    let cancel = Arc::new(AtomicBool::new(false));
    let session = match Session::connect(stream, config, cancel).unwrap() {
        Connect::Accepted(s) => s,
        Connect::Rejected(status) => panic!("rejected: {status:?}"),
    };
    let handle = session.handle();
    let outcome = session.run().unwrap();
    client.join().unwrap();
    assert_eq!(outcome, SessionOutcome::Terminated);

    let dir = tempdir().unwrap();
    let path = dir.path().join("session.trcap");
    {
        let ingest = handle.read();
        let model = &ingest.model;
        assert!(ingest.quiescent());
        assert_eq!(model.program_name, "renderer");
        assert_eq!(model.threads.len(), 1);
        assert_eq!(model.strings.resolve(model.threads[0].name), Some("render"));

        let zone = &model.zones[model.threads[0].timeline[0].0 as usize];
        assert_eq!((zone.start, zone.end), (1100, Some(1300)));
        let loc = model.strings.src_loc(zone.src_loc);
        assert_eq!(model.strings.resolve(loc.function), Some("draw"));
        assert_eq!(model.strings.resolve(loc.file), Some("render.cpp"));
        assert_eq!(loc.line, 33);

        assert_eq!(model.messages.len(), 1);
        assert_eq!(model.messages[0].time, 1120);
        assert_eq!(
            model.strings.resolve(model.messages[0].text),
            Some("level loaded")
        );

        assert_eq!(model.plots.len(), 1);
        assert_eq!(
            model.strings.resolve(StringRef::Ptr(model.plots[0].name)),
            Some("fps")
        );
        assert_eq!(model.plots[0].data.len(), 1);
        assert_eq!(model.plots[0].data[0].value, 42.0);

        // Init frame plus the one opened by the mark.
        assert_eq!(model.frame_sets[0].frames.len(), 2);
        assert_eq!(model.last_time, 1400);

        let mut file = File::create(&path).unwrap();
        write_capture(model, &mut file).unwrap();
    }

    let mut file = File::open(&path).unwrap();
    let loaded = load_capture(&mut file).unwrap();
    assert_eq!(loaded.capture_name, "integration");
    assert_eq!(loaded.program_name, "renderer");
    assert_eq!(loaded.threads.len(), 1);
    assert_eq!(loaded.strings.resolve(loaded.threads[0].name), Some("render"));
    let zone = &loaded.zones[loaded.threads[0].timeline[0].0 as usize];
    assert_eq!((zone.start, zone.end), (1100, Some(1300)));
    assert_eq!(loaded.messages.len(), 1);
    assert_eq!(
        loaded.strings.resolve(loaded.messages[0].text),
        Some("level loaded")
    );
    assert_eq!(loaded.plots[0].data[0].value, 42.0);
    assert_eq!(loaded.last_time, 1400);
}

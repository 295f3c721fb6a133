//! End-to-end scenarios driven through the full engine: static packet
//! source in, collected records out.

use std::sync::atomic::AtomicBool;

use chrono::{TimeZone, Utc};
use etherparse::PacketBuilder;

use apptap::config::Config;
use apptap::core::LinkType;
use apptap::engine::{self, RawFrame, StaticSource};
use apptap::publish::{CollectorSink, Record, Status};

const CLIENT: [u8; 4] = [192, 168, 1, 5];
const SERVER: [u8; 4] = [10, 0, 0, 1];

fn tcp_frame(
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    seq: u32,
    payload: &[u8],
    ms: i64,
) -> RawFrame {
    let builder = PacketBuilder::ethernet2([0; 6], [1; 6])
        .ipv4(src, dst, 64)
        .tcp(sport, dport, seq, 65535);
    let mut data = Vec::new();
    builder.write(&mut data, payload).unwrap();
    RawFrame {
        ts: Utc.timestamp_millis_opt(ms).unwrap(),
        link: LinkType::Ethernet,
        data,
    }
}

fn tcp_fin(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, seq: u32, ms: i64) -> RawFrame {
    let builder = PacketBuilder::ethernet2([0; 6], [1; 6])
        .ipv4(src, dst, 64)
        .tcp(sport, dport, seq, 65535)
        .fin()
        .ack(1);
    let mut data = Vec::new();
    builder.write(&mut data, &[]).unwrap();
    RawFrame {
        ts: Utc.timestamp_millis_opt(ms).unwrap(),
        link: LinkType::Ethernet,
        data,
    }
}

fn udp_frame(
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    payload: &[u8],
    ms: i64,
) -> RawFrame {
    let builder = PacketBuilder::ethernet2([0; 6], [1; 6])
        .ipv4(src, dst, 64)
        .udp(sport, dport);
    let mut data = Vec::new();
    builder.write(&mut data, payload).unwrap();
    RawFrame {
        ts: Utc.timestamp_millis_opt(ms).unwrap(),
        link: LinkType::Ethernet,
        data,
    }
}

fn run_engine(config: Config, frames: Vec<RawFrame>) -> Vec<Record> {
    let sink = CollectorSink::new();
    let collected = sink.clone();
    let shutdown = AtomicBool::new(false);
    engine::run(
        &config,
        Box::new(StaticSource::new(frames)),
        Box::new(sink),
        &shutdown,
    )
    .unwrap();
    collected.records()
}

fn quiet_config() -> Config {
    let mut config = Config::default();
    config.engine.workers = 2;
    config.logging.stats_interval_secs = 0;
    config
}

#[test]
fn http_split_across_packets() {
    let frames = vec![
        tcp_frame(CLIENT, 40000, SERVER, 80, 100, b"GET /users/1 HTTP/1.1\r\nHost: ", 0),
        tcp_frame(CLIENT, 40000, SERVER, 80, 129, b"a\r\n\r\n", 3),
        tcp_frame(
            SERVER,
            80,
            CLIENT,
            40000,
            900,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
            21,
        ),
    ];

    let records = run_engine(quiet_config(), frames);
    assert_eq!(records.len(), 1);
    let rec = &records[0];
    assert_eq!(rec.type_, "http");
    assert_eq!(rec.method.as_deref(), Some("GET"));
    assert_eq!(rec.path, "/users/1");
    assert_eq!(rec.resource.as_deref(), Some("/users"));
    assert_eq!(rec.status, Status::Ok);
    assert_eq!(rec.fields["code"], 200);
    assert!(rec.bytes_in.unwrap() > 0);
    assert!(rec.bytes_out.unwrap() > rec.bytes_in.unwrap());
    assert!(rec.responsetime.unwrap() >= 0);
    // Endpoint objects present
    assert_eq!(rec.src.as_ref().unwrap().port, 40000);
    assert_eq!(rec.dst.as_ref().unwrap().port, 80);
}

#[test]
fn http_gap_in_until_close_body() {
    // HTTP/1.0 response without Content-Length: body runs until FIN; a
    // 10-byte capture gap mid-body must not lose the transaction
    let head_and_body = b"HTTP/1.0 200 OK\r\n\r\n01234567890123456789";
    let frames = vec![
        tcp_frame(CLIENT, 40001, SERVER, 80, 100, b"GET / HTTP/1.0\r\n\r\n", 0),
        tcp_frame(SERVER, 80, CLIENT, 40001, 500, head_and_body, 10),
        // Gap: next server segment skips 10 bytes
        tcp_frame(
            SERVER,
            80,
            CLIENT,
            40001,
            500 + head_and_body.len() as u32 + 10,
            b"tail",
            20,
        ),
        tcp_fin(SERVER, 80, CLIENT, 40001, 600, 30),
        tcp_fin(CLIENT, 40001, SERVER, 80, 200, 31),
    ];

    let records = run_engine(quiet_config(), frames);
    assert_eq!(records.len(), 1);
    let rec = &records[0];
    assert_eq!(rec.status, Status::Ok);
    assert!(rec
        .notes
        .contains(&"Packet loss while capturing the response".to_string()));
}

#[test]
fn dns_query_response() {
    let query = encode_dns_query(0x1234, "www.google.com");
    let response = encode_dns_a_response(0x1234, "www.google.com", [1, 2, 3, 4]);
    let frames = vec![
        udp_frame(CLIENT, 40002, [8, 8, 8, 8], 53, &query, 0),
        udp_frame([8, 8, 8, 8], 53, CLIENT, 40002, &response, 12),
    ];

    let records = run_engine(quiet_config(), frames);
    assert_eq!(records.len(), 1);
    let rec = &records[0];
    assert_eq!(rec.type_, "dns");
    assert_eq!(rec.status, Status::Ok);
    assert_eq!(rec.fields["id"], 4660);
    assert_eq!(rec.fields["question"]["name"], "www.google.com");
    assert_eq!(rec.fields["answers_count"], 1);
    assert_eq!(rec.fields["answers"][0]["data"], "1.2.3.4");
}

#[test]
fn dns_orphan_request_times_out() {
    let query = encode_dns_query(0x4242, "orphan.example");
    let frames = vec![
        udp_frame(CLIENT, 40003, [8, 8, 8, 8], 53, &query, 0),
        // An unrelated packet 11s later advances the packet clock past
        // the transaction timeout
        udp_frame(CLIENT, 40004, [8, 8, 8, 8], 53, &encode_dns_query(1, "x.example"), 11_000),
    ];

    let mut config = quiet_config();
    // One worker so both flows share a clock
    config.engine.workers = 1;
    let records = run_engine(config, frames);

    let orphan: Vec<&Record> = records
        .iter()
        .filter(|r| r.fields["id"] == 0x4242)
        .collect();
    assert_eq!(orphan.len(), 1);
    assert_eq!(orphan[0].status, Status::Error);
    assert!(orphan[0].notes.iter().any(|n| n.contains("no response")));
}

#[test]
fn memcache_binary_quiet_pipeline() {
    use apptap::protos::memcache::binary::{MAGIC_REQUEST, MAGIC_RESPONSE};

    let mut request = Vec::new();
    request.extend_from_slice(&mc_packet(MAGIC_REQUEST, 0x09, 0, 1, "key1", &[]));
    request.extend_from_slice(&mc_packet(MAGIC_REQUEST, 0x09, 0, 2, "key2", &[]));
    request.extend_from_slice(&mc_packet(MAGIC_REQUEST, 0x00, 0, 3, "key3", &[]));

    let mut response = Vec::new();
    response.extend_from_slice(&mc_packet(MAGIC_RESPONSE, 0x09, 0, 1, "", b"v1"));
    response.extend_from_slice(&mc_packet(MAGIC_RESPONSE, 0x09, 0, 2, "", b"v2"));
    response.extend_from_slice(&mc_packet(MAGIC_RESPONSE, 0x00, 0, 3, "", b"v3"));

    let frames = vec![
        tcp_frame(CLIENT, 40005, SERVER, 11211, 100, &request, 0),
        tcp_frame(SERVER, 11211, CLIENT, 40005, 900, &response, 5),
    ];

    let records = run_engine(quiet_config(), frames);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].path, "key1");
    assert_eq!(records[0].fields["request"]["quiet"], true);
    assert_eq!(records[1].path, "key2");
    assert_eq!(records[1].fields["request"]["quiet"], true);
    assert_eq!(records[2].path, "key3");
    assert_eq!(records[2].fields["request"]["quiet"], false);
    for rec in &records {
        assert_eq!(rec.type_, "memcache");
    }
}

#[test]
fn mysql_error_transaction() {
    // COM_QUERY "SELECT * FROM bad" answered by ERR 1146
    let mut query_frame = Vec::new();
    let payload = {
        let mut p = vec![0x03];
        p.extend_from_slice(b"SELECT * FROM bad");
        p
    };
    query_frame.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
    query_frame.push(0);
    query_frame.extend_from_slice(&payload);

    let mut err_payload = vec![0xff, 0x7a, 0x04, b'#'];
    err_payload.extend_from_slice(b"42S02");
    err_payload.extend_from_slice(b"Table 'test.bad' doesn't exist");
    let mut err_frame = Vec::new();
    err_frame.extend_from_slice(&(err_payload.len() as u32).to_le_bytes()[..3]);
    err_frame.push(1);
    err_frame.extend_from_slice(&err_payload);

    let frames = vec![
        tcp_frame(CLIENT, 40006, SERVER, 3306, 100, &query_frame, 0),
        tcp_frame(SERVER, 3306, CLIENT, 40006, 900, &err_frame, 2),
    ];

    let records = run_engine(quiet_config(), frames);
    assert_eq!(records.len(), 1);
    let rec = &records[0];
    assert_eq!(rec.type_, "mysql");
    assert_eq!(rec.status, Status::Error);
    assert_eq!(rec.method.as_deref(), Some("SELECT"));
    assert_eq!(rec.fields["iserror"], true);
    assert_eq!(rec.fields["error_code"], 1146);
}

#[test]
fn replay_idempotence() {
    let make = || {
        vec![
            tcp_frame(CLIENT, 40007, SERVER, 80, 1, b"GET /a HTTP/1.1\r\n\r\n", 0),
            tcp_frame(
                SERVER,
                80,
                CLIENT,
                40007,
                1,
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
                4,
            ),
            udp_frame(CLIENT, 40008, [8, 8, 8, 8], 53, &encode_dns_query(9, "r.example"), 6),
            udp_frame(
                [8, 8, 8, 8],
                53,
                CLIENT,
                40008,
                &encode_dns_a_response(9, "r.example", [9, 9, 9, 9]),
                8,
            ),
        ]
    };

    // One worker: replay idempotence is a per-producer guarantee, and a
    // single worker is a single producer
    let mut config = quiet_config();
    config.engine.workers = 1;

    let first = run_engine(config.clone(), make());
    let second = run_engine(config, make());
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn required_fields_always_present() {
    let frames = vec![
        tcp_frame(CLIENT, 40009, SERVER, 6379, 1, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", 0),
        tcp_frame(SERVER, 6379, CLIENT, 40009, 1, b"$1\r\nv\r\n", 1),
    ];
    let records = run_engine(quiet_config(), frames);
    assert_eq!(records.len(), 1);

    let json = serde_json::to_value(&records[0]).unwrap();
    for key in ["@timestamp", "type", "count", "status", "path", "direction"] {
        assert!(json.get(key).is_some(), "missing {}", key);
    }
    assert!(json["count"].as_u64().unwrap() >= 1);
    assert!(records[0].responsetime.unwrap() >= 0);
}

// ---------------------------------------------------------------------------
// Wire fixtures
// ---------------------------------------------------------------------------

fn mc_packet(magic: u8, opcode: u8, status: u16, opaque: u32, key: &str, value: &[u8]) -> Vec<u8> {
    let body_len = key.len() + value.len();
    let mut buf = Vec::with_capacity(24 + body_len);
    buf.push(magic);
    buf.push(opcode);
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.push(0); // extras length
    buf.push(0); // data type
    buf.extend_from_slice(&status.to_be_bytes());
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.extend_from_slice(&opaque.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(value);
    buf
}

fn encode_dns_name(buf: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

fn encode_dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    encode_dns_name(&mut buf, name);
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf
}

fn encode_dns_a_response(id: u16, name: &str, addr: [u8; 4]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x8180u16.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, 0]);
    encode_dns_name(&mut buf, name);
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&[0xc0, 0x0c]);
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&300u32.to_be_bytes());
    buf.extend_from_slice(&4u16.to_be_bytes());
    buf.extend_from_slice(&addr);
    buf
}

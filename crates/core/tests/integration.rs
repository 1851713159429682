//! End-to-end scenarios from §8: real loopback TCP/UDP sockets driving a
//! [`Server`] through the full RTSP handshake, exercising the dispatcher,
//! listeners, and client sessions together rather than any one in
//! isolation.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use rtsp::config::{Config, PathConf, Protocol, WILDCARD_PATH};
use rtsp::Server;

fn base_config(rtsp_port: u16, rtp_port: u16, rtcp_port: u16) -> Config {
    let mut paths = HashMap::new();
    paths.insert(WILDCARD_PATH.to_string(), PathConf::default());
    Config {
        protocols: vec![Protocol::Udp, Protocol::Tcp],
        rtsp_port,
        rtp_port,
        rtcp_port,
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        pre_script: None,
        post_script: None,
        pprof: false,
        paths,
    }
}

fn connect(rtsp_port: u16) -> TcpStream {
    let addr = ("127.0.0.1", rtsp_port)
        .to_socket_addrs()
        .unwrap()
        .next()
        .unwrap();
    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.set_write_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
}

/// Send one RTSP request and read back the response head (and body, if
/// `Content-Length` names one).
fn rtsp_roundtrip(stream: &mut TcpStream, request: &str) -> String {
    stream.write_all(request.as_bytes()).expect("write request");
    stream.flush().unwrap();

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut response = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).expect("read response") == 0 {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    if let Some(len) = response
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&len| len > 0)
    {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).expect("read body");
        response.push_str(&String::from_utf8_lossy(&body));
    }

    response
}

fn status_code(response: &str) -> u16 {
    response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

fn header(response: &str, name: &str) -> Option<String> {
    let lower = format!("{}:", name.to_lowercase());
    response
        .lines()
        .find(|l| l.to_lowercase().starts_with(&lower))
        .map(|l| l.splitn(2, ':').nth(1).unwrap_or("").trim().to_string())
}

fn session_id(response: &str) -> String {
    header(response, "Session")
        .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
        .unwrap_or_default()
}

const SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 0 RTP/AVP 96\r\n";

#[test]
fn happy_record_and_play_over_udp() {
    let server = Server::start(base_config(19554, 19000, 19001)).expect("server start");

    let mut publisher = connect(19554);
    let announce = format!(
        "ANNOUNCE rtsp://127.0.0.1:19554/cam RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
        SDP.len(),
        SDP
    );
    assert_eq!(status_code(&rtsp_roundtrip(&mut publisher, &announce)), 200);

    let setup_pub = "SETUP rtsp://127.0.0.1:19554/cam RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP;unicast;client_port=14000-14001\r\n\r\n";
    let setup_pub_resp = rtsp_roundtrip(&mut publisher, setup_pub);
    assert_eq!(status_code(&setup_pub_resp), 200);

    let record = format!(
        "RECORD rtsp://127.0.0.1:19554/cam RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
        session_id(&setup_pub_resp)
    );
    assert_eq!(status_code(&rtsp_roundtrip(&mut publisher, &record)), 200);

    let mut reader = connect(19554);
    let describe = "DESCRIBE rtsp://127.0.0.1:19554/cam RTSP/1.0\r\nCSeq: 1\r\nAccept: application/sdp\r\n\r\n";
    let describe_resp = rtsp_roundtrip(&mut reader, describe);
    assert_eq!(status_code(&describe_resp), 200);
    assert!(describe_resp.contains("m=video"));

    let setup_read = "SETUP rtsp://127.0.0.1:19554/cam RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP;unicast;client_port=24000-24001\r\n\r\n";
    let setup_read_resp = rtsp_roundtrip(&mut reader, setup_read);
    assert_eq!(status_code(&setup_read_resp), 200);

    let play = format!(
        "PLAY rtsp://127.0.0.1:19554/cam RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
        session_id(&setup_read_resp)
    );
    assert_eq!(status_code(&rtsp_roundtrip(&mut reader, &play)), 200);

    // publisher sends an RTP datagram from the source IP it announced with
    let publisher_rtp = UdpSocket::bind("127.0.0.1:14000").expect("bind publisher rtp port");
    let reader_rtp = UdpSocket::bind("127.0.0.1:24000").expect("bind reader rtp port");
    reader_rtp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    publisher_rtp
        .send_to(b"hello-rtp", ("127.0.0.1", 19000))
        .expect("send rtp datagram");

    let mut buf = [0u8; 64];
    let (n, _) = reader_rtp.recv_from(&mut buf).expect("reader receives rtp");
    assert_eq!(&buf[..n], b"hello-rtp");

    server.stop().expect("server stop");
}

#[test]
fn happy_record_and_play_over_tcp_interleaved() {
    let server = Server::start(base_config(19555, 19010, 19011)).expect("server start");

    let mut publisher = connect(19555);
    let announce = format!(
        "ANNOUNCE rtsp://127.0.0.1:19555/cam RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
        SDP.len(),
        SDP
    );
    assert_eq!(status_code(&rtsp_roundtrip(&mut publisher, &announce)), 200);

    let setup_pub = "SETUP rtsp://127.0.0.1:19555/cam RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP/TCP;interleaved=0-1\r\n\r\n";
    let setup_pub_resp = rtsp_roundtrip(&mut publisher, setup_pub);
    assert_eq!(status_code(&setup_pub_resp), 200);

    let record = format!(
        "RECORD rtsp://127.0.0.1:19555/cam RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
        session_id(&setup_pub_resp)
    );
    assert_eq!(status_code(&rtsp_roundtrip(&mut publisher, &record)), 200);

    let mut reader = connect(19555);
    let describe = "DESCRIBE rtsp://127.0.0.1:19555/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n";
    assert_eq!(status_code(&rtsp_roundtrip(&mut reader, describe)), 200);

    let setup_read = "SETUP rtsp://127.0.0.1:19555/cam RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP/TCP;interleaved=0-1\r\n\r\n";
    let setup_read_resp = rtsp_roundtrip(&mut reader, setup_read);
    assert_eq!(status_code(&setup_read_resp), 200);

    let play = format!(
        "PLAY rtsp://127.0.0.1:19555/cam RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
        session_id(&setup_read_resp)
    );
    assert_eq!(status_code(&rtsp_roundtrip(&mut reader, &play)), 200);

    // publisher writes interleaved channel 0 directly on its own control
    // connection; the reader should receive the same frame on channel 0.
    let frame = [b'$', 0u8, 0, 1, b'X'];
    publisher.write_all(&frame).expect("write interleaved frame");
    publisher.flush().unwrap();

    let mut header = [0u8; 4];
    reader.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    reader.read_exact(&mut header).expect("read interleaved header");
    assert_eq!(header[0], b'$');
    assert_eq!(header[1], 0);
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).expect("read interleaved payload");
    assert_eq!(payload, b"X");

    server.stop().expect("server stop");
}

#[test]
fn publisher_conflict_is_rejected_over_the_wire() {
    let server = Server::start(base_config(19556, 19020, 19021)).expect("server start");

    let mut a = connect(19556);
    let announce = format!(
        "ANNOUNCE rtsp://127.0.0.1:19556/cam RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
        SDP.len(),
        SDP
    );
    assert_eq!(status_code(&rtsp_roundtrip(&mut a, &announce)), 200);

    let mut b = connect(19556);
    let resp_b = rtsp_roundtrip(&mut b, &announce);
    assert_ne!(status_code(&resp_b), 200);

    server.stop().expect("server stop");
}

#[test]
fn publisher_close_cascades_to_reader() {
    let server = Server::start(base_config(19557, 19030, 19031)).expect("server start");

    let mut publisher = connect(19557);
    let announce = format!(
        "ANNOUNCE rtsp://127.0.0.1:19557/cam RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
        SDP.len(),
        SDP
    );
    assert_eq!(status_code(&rtsp_roundtrip(&mut publisher, &announce)), 200);

    let setup_pub = "SETUP rtsp://127.0.0.1:19557/cam RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP;unicast;client_port=15000-15001\r\n\r\n";
    let setup_pub_resp = rtsp_roundtrip(&mut publisher, setup_pub);
    let record = format!(
        "RECORD rtsp://127.0.0.1:19557/cam RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
        session_id(&setup_pub_resp)
    );
    assert_eq!(status_code(&rtsp_roundtrip(&mut publisher, &record)), 200);

    let mut reader = connect(19557);
    let setup_read = "SETUP rtsp://127.0.0.1:19557/cam RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port=25000-25001\r\n\r\n";
    let setup_read_resp = rtsp_roundtrip(&mut reader, setup_read);
    let play = format!(
        "PLAY rtsp://127.0.0.1:19557/cam RTSP/1.0\r\nCSeq: 2\r\nSession: {}\r\n\r\n",
        session_id(&setup_read_resp)
    );
    assert_eq!(status_code(&rtsp_roundtrip(&mut reader, &play)), 200);

    drop(publisher);

    // the dispatcher's ClientClose cascade should force-close the reader's
    // connection; a subsequent read observes EOF.
    reader.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 1];
    let n = reader.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "reader connection should be closed by the dispatcher");

    server.stop().expect("server stop");
}

#[test]
fn announce_to_unconfigured_path_is_not_found() {
    // only "cam" is configured, no "all" wildcard — a path the operator never
    // named must not fall back to an open, credential-free policy.
    let mut paths = HashMap::new();
    paths.insert("cam".to_string(), PathConf::default());
    let config = Config {
        protocols: vec![Protocol::Udp, Protocol::Tcp],
        rtsp_port: 19559,
        rtp_port: 19050,
        rtcp_port: 19051,
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        pre_script: None,
        post_script: None,
        pprof: false,
        paths,
    };
    let server = Server::start(config).expect("server start");

    let mut publisher = connect(19559);
    let announce = format!(
        "ANNOUNCE rtsp://127.0.0.1:19559/literally-anything RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
        SDP.len(),
        SDP
    );
    assert_eq!(status_code(&rtsp_roundtrip(&mut publisher, &announce)), 404);

    server.stop().expect("server stop");
}

#[test]
fn server_rejects_connections_after_stop() {
    let server = Server::start(base_config(19558, 19040, 19041)).expect("server start");
    server.stop().expect("server stop");

    let addr = ("127.0.0.1", 19558u16).to_socket_addrs().unwrap().next().unwrap();
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_err());
}

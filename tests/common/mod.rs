//! A scripted mock IIOD daemon for end-to-end tests.
//!
//! Each test hands the daemon a closure that plays the server side of one
//! connection, byte for byte. Assertion failures in the script surface as
//! panics on join.
#![allow(dead_code)]

use std::io::prelude::*;
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

pub const SAMPLE_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?><context name="network" version-major="0" version-minor="25" version-git="v0.25" description="mock pluto"><device id="iio:device0" name="ad9361-phy"><channel id="voltage0" type="input"><attribute name="hardwaregain" /></channel></device><device id="iio:device1" name="cf-ad9361-lpc"><channel id="voltage0" type="input"><scan-element index="0" format="le:S12/16&gt;&gt;0" /></channel><channel id="voltage1" type="input"><scan-element index="1" format="le:S12/16&gt;&gt;0" /></channel></device></context>"#;

pub struct MockDaemon {
    pub addr: String,
    handle: JoinHandle<()>,
}

impl MockDaemon {
    /// Bind an ephemeral port and serve one connection with `script`.
    pub fn spawn<F>(script: F) -> MockDaemon
    where
        F: FnOnce(&mut TcpStream) + Send + 'static,
    {
        Self::spawn_on(0, script)
    }

    /// Bind a fixed port (or 0 for ephemeral) and serve one connection.
    pub fn spawn_on<F>(port: u16, script: F) -> MockDaemon
    where
        F: FnOnce(&mut TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", port)).expect("bind mock daemon");
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            stream.set_nodelay(true).unwrap();
            script(&mut stream);
        });
        MockDaemon { addr, handle }
    }

    pub fn join(self) {
        self.handle.join().expect("mock daemon script failed");
    }
}

/// Read one `\n`-terminated line, newline included.
pub fn read_line_from(stream: &mut TcpStream) -> Vec<u8> {
    let mut line = vec![];
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).expect("mock daemon read");
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return line;
        }
    }
}

pub fn expect_line(stream: &mut TcpStream, expected: &[u8]) {
    let line = read_line_from(stream);
    assert_eq!(
        line,
        expected,
        "expected {:?}, got {:?}",
        String::from_utf8_lossy(expected),
        String::from_utf8_lossy(&line)
    );
}

/// Read exactly `len` bytes.
pub fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("mock daemon read");
    buf
}

/// Serve `TIMEOUT` + `PRINT` + a successful `BINARY` upgrade.
pub fn serve_bootstrap(stream: &mut TcpStream, timeout_ms: u32) {
    expect_line(stream, format!("TIMEOUT {timeout_ms}\r\n").as_bytes());
    stream.write_all(b"0\n").unwrap();
    expect_line(stream, b"PRINT\r\n");
    stream
        .write_all(format!("{}\n{}\n", SAMPLE_XML.len(), SAMPLE_XML).as_bytes())
        .unwrap();
    expect_line(stream, b"BINARY\r\n");
    stream.write_all(b"0\n").unwrap();
}

/// Read a binary command: returns (client_id, opcode, device, code).
pub fn read_binary_header(stream: &mut TcpStream) -> (u16, u8, u8, i32) {
    let raw = read_exactly(stream, 8);
    (
        u16::from_be_bytes([raw[0], raw[1]]),
        raw[2],
        raw[3],
        i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
    )
}

/// Write a RESPONSE header with `status`, then `tail`.
pub fn write_binary_reply(stream: &mut TcpStream, client_id: u16, status: i32, tail: &[u8]) {
    let mut frame = Vec::with_capacity(8 + tail.len());
    frame.extend_from_slice(&client_id.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&status.to_be_bytes());
    frame.extend_from_slice(tail);
    stream.write_all(&frame).unwrap();
}

/// Tail for a `StatusAndU32` reply.
pub fn u32_tail(value: u32) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Tail for a `StatusAndLPBytes` reply.
pub fn lp_tail(data: &[u8]) -> Vec<u8> {
    let mut tail = (data.len() as u32).to_be_bytes().to_vec();
    tail.extend_from_slice(data);
    tail
}

//! Transport behaviour against the scripted mock instrument.

use hv_core::mock_serial;
use hv_core::transport::{FramingConfig, Transport};
use std::time::Duration;

fn fast_framing() -> FramingConfig {
    FramingConfig {
        read_timeout: Duration::from_secs(2),
        ..FramingConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn late_reply_is_flushed_before_next_query() {
    let (port, mut instrument) = mock_serial::new();
    let mut transport = Transport::from_port("k2410", Box::new(port), fast_framing());

    // First query goes unanswered and times out.
    let reply = transport.query(":OUTP?", 1).await.unwrap();
    assert_eq!(reply, "");
    instrument.expect_write(b":OUTP?\r\n").await;

    // The instrument answers late; the stale reply must not be taken as the
    // answer to the next query.
    instrument.send_response(b"1\r\n").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let discarded = transport.clear_buffer().await.unwrap();
    assert_eq!(discarded, 3);

    instrument.send_response(b"+1.50000E+02\r\n").unwrap();
    let reply = transport.query(":SOUR:VOLT?", 1).await.unwrap();
    assert_eq!(reply, "+1.50000E+02");
    instrument.expect_write(b":SOUR:VOLT?\r\n").await;
}

#[tokio::test(start_paused = true)]
async fn queries_pair_in_order() {
    let (port, mut instrument) = mock_serial::new();
    let mut transport = Transport::from_port("k2410", Box::new(port), fast_framing());

    instrument.send_response(b"KEITHLEY INSTRUMENTS INC.,MODEL 2410,1234,C30\r\n").unwrap();
    let identity = transport.query("*IDN?", 1).await.unwrap();
    assert_eq!(identity, "KEITHLEY INSTRUMENTS INC. MODEL 2410 1234 C30");

    instrument.send_response(b"0\r\n").unwrap();
    assert_eq!(transport.query(":OUTP?", 1).await.unwrap(), "0");

    assert_eq!(instrument.written_frames(), vec!["*IDN?", ":OUTP?"]);
}

#[tokio::test(start_paused = true)]
async fn fragmented_reply_after_silence_is_reassembled() {
    let port = tokio_test::io::Builder::new()
        .write(b"*IDN?\r\n")
        .wait(Duration::from_millis(450))
        .read(b"KEITHLEY INSTRUMENTS INC.,MODEL 6517B")
        .wait(Duration::from_millis(250))
        .read(b",4096123,A13/700x \r\n")
        .build();
    let mut transport = Transport::from_port("k6517b", Box::new(port), fast_framing());

    let identity = transport.query("*IDN?", 0).await.unwrap();
    assert_eq!(identity, "KEITHLEY INSTRUMENTS INC. MODEL 6517B 4096123 A13/700x");
}

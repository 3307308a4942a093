//! Worker pool offload: parallelism and close-during-in-flight-work.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{EchoService, TestServer, connect, read_frame, send_frame, wait_until};
use kiln_server::Config;

#[test]
fn slow_requests_process_in_parallel() {
    let service = EchoService::with_delay(Duration::from_millis(50));
    let config = Config {
        io_threads: 1,
        worker_threads: 4,
        ..Config::default()
    };
    let server = TestServer::start(config, service.clone());

    // Eight concurrent one-frame clients against four workers: two
    // batches of four, far under the 400ms a serial run would take.
    let start = Instant::now();
    let mut clients = Vec::new();
    for i in 0..8 {
        let addr = server.addr;
        clients.push(thread::spawn(move || {
            let mut client = connect(addr);
            let payload = format!("slow-{i}");
            send_frame(&mut client, payload.as_bytes());
            assert_eq!(read_frame(&mut client).unwrap(), payload.as_bytes());
        }));
    }
    for client in clients {
        client.join().unwrap();
    }
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_millis(300),
        "8 x 50ms requests took {elapsed:?}, workers are not running in parallel"
    );
    assert!(
        service.distinct_process_threads().len() >= 2,
        "expected processing spread over multiple workers"
    );
}

#[test]
fn reset_during_inflight_work_is_harmless() {
    let service = EchoService::with_delay(Duration::from_millis(150));
    let config = Config {
        io_threads: 1,
        worker_threads: 2,
        ..Config::default()
    };
    let server = TestServer::start(config, service.clone());

    // Send a frame, then RST the socket while `process` is still asleep
    // in a worker. The returned message finds the connection closed.
    let mut client = connect(server.addr);
    send_frame(&mut client, b"doomed");
    thread::sleep(Duration::from_millis(30));

    let socket = socket2::Socket::from(client);
    socket.set_linger(Some(Duration::ZERO)).unwrap();
    drop(socket);

    assert!(wait_until(Duration::from_secs(2), || service.disconnects() == 1));

    // Wait out the in-flight work, then prove the server still serves.
    thread::sleep(Duration::from_millis(300));
    let mut client = connect(server.addr);
    send_frame(&mut client, b"alive");
    assert_eq!(read_frame(&mut client).unwrap(), b"alive");
    assert_eq!(service.disconnects(), 1);
}

#[test]
fn pipelined_frames_all_complete_with_workers() {
    let service = EchoService::new();
    let config = Config {
        io_threads: 2,
        worker_threads: 2,
        ..Config::default()
    };
    let server = TestServer::start(config, service.clone());

    // Worker completion order is unspecified across a pipeline, so
    // collect all responses and compare as a set.
    let mut client = connect(server.addr);
    for i in 0..10u32 {
        send_frame(&mut client, format!("msg-{i}").as_bytes());
    }

    let mut got = Vec::new();
    for _ in 0..10 {
        got.push(read_frame(&mut client).unwrap());
    }
    got.sort();

    let mut want: Vec<Vec<u8>> = (0..10u32)
        .map(|i| format!("msg-{i}").into_bytes())
        .collect();
    want.sort();
    assert_eq!(got, want);
}

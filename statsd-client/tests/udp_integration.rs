use std::{collections::HashMap, net::UdpSocket, sync::Arc, thread, time::Duration};

use statsd_client::{Error, StatsdClient};

fn listener() -> (UdpSocket, String) {
    let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
    listener.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

fn recv_datagram(listener: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 65536];
    let len = listener.recv(&mut buf).unwrap_or_else(|e| panic!("no datagram received: {e}"));
    buf.truncate(len);
    buf
}

/// Receives datagrams until at least `expected` lines have arrived, returning each datagram's lines.
fn recv_lines(listener: &UdpSocket, expected: usize) -> Vec<Vec<String>> {
    let mut datagrams = Vec::new();
    let mut received = 0;
    while received < expected {
        let datagram = String::from_utf8(recv_datagram(listener)).unwrap();
        let lines = datagram.split('\n').map(str::to_string).collect::<Vec<_>>();
        received += lines.len();
        datagrams.push(lines);
    }
    datagrams
}

fn sorted_lines(listener: &UdpSocket, expected: usize) -> Vec<String> {
    let mut lines = recv_lines(listener, expected).into_iter().flatten().collect::<Vec<_>>();
    lines.sort_unstable();
    lines
}

/// Builds a buffered client that only flushes when asked to, or when closed.
fn buffered(addr: &str, prefix: &str, sample_mode: &str, buffer_size: usize) -> StatsdClient {
    StatsdClient::builder()
        .with_remote_address(addr)
        .unwrap()
        .with_prefix(prefix)
        .with_sample_mode(sample_mode)
        .unwrap()
        .with_buffer_size(buffer_size)
        .with_flush_interval(Duration::from_secs(3600))
        .build()
        .unwrap()
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    assert_eq!(rc, 0);
    let len = buf.iter().position(|&b| b == 0).unwrap();
    String::from_utf8(buf[..len].to_vec()).unwrap()
}

#[test]
fn unbuffered_prefix() {
    let (listener, addr) = listener();
    let client = StatsdClient::new(&addr, "myproject.", "none").unwrap();
    client.create_socket().unwrap();

    let cases = [("a:b:c", 5), ("d:e:f", 2)];
    for (key, value) in cases {
        client.total(key, value).unwrap();
    }

    // Unbuffered sends are one datagram per call, in call order.
    assert_eq!(recv_datagram(&listener), b"myproject.a:b:c:5|c");
    assert_eq!(recv_datagram(&listener), b"myproject.d:e:f:2|c");

    client.close().unwrap();
}

#[cfg(unix)]
#[test]
fn host_token_is_substituted() {
    let (listener, addr) = listener();
    let client = StatsdClient::new(&addr, "myproject.", "none").unwrap();
    client.create_socket().unwrap();

    client.total("%HOST%.requests", 1).unwrap();
    let expected = format!("myproject.{}.requests:1|c", hostname());
    assert_eq!(String::from_utf8(recv_datagram(&listener)).unwrap(), expected);

    client.close().unwrap();
}

#[test]
fn buffered_small_capacity() {
    const CAPACITY: usize = 20;

    let (listener, addr) = listener();
    let client = buffered(&addr, "", "none", CAPACITY);
    client.create_socket().unwrap();

    for i in 0..10 {
        client.incr(&format!("key{i}"), 1).unwrap();
    }
    client.flush().unwrap();

    let datagrams = recv_lines(&listener, 10);
    assert!(datagrams.len() > 1);
    for datagram in &datagrams {
        assert!(datagram.join("\n").len() <= CAPACITY, "datagram over capacity: {datagram:?}");
    }

    let mut lines = datagrams.into_iter().flatten().collect::<Vec<_>>();
    lines.sort_unstable();
    let expected = (0..10).map(|i| format!("key{i}:1|c")).collect::<Vec<_>>();
    assert_eq!(lines, expected);

    client.close().unwrap();
}

#[test]
fn oversized_line_is_sent_alone() {
    let (listener, addr) = listener();
    let client = StatsdClient::buffered(&addr, "", "none", 10).unwrap();
    client.create_socket().unwrap();

    client.incr("a", 1).unwrap();
    client.incr("a.very.long.metric.key", 1).unwrap();
    client.close().unwrap();

    let mut datagrams = recv_lines(&listener, 2).into_iter().map(|lines| lines.join("\n")).collect::<Vec<_>>();
    datagrams.sort_unstable();
    assert_eq!(datagrams, vec!["a.very.long.metric.key:1|c", "a:1|c"]);
}

#[test]
fn concurrent_producers_lose_nothing() {
    const THREADS: usize = 8;
    const KEYS: usize = 16;
    const INCREMENTS: i64 = 250;

    let (listener, addr) = listener();
    let client = StatsdClient::builder()
        .with_remote_address(&addr)
        .unwrap()
        .with_buffer_size(512)
        .with_flush_interval(Duration::from_millis(10))
        .build()
        .unwrap();
    client.create_socket().unwrap();
    let client = Arc::new(client);

    let handles = (0..THREADS)
        .map(|_| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    for key in 0..KEYS {
                        client.incr(&format!("key{key}"), 1).unwrap();
                    }
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }
    client.close().unwrap();

    let expected_per_key = THREADS as i64 * INCREMENTS;
    let expected_total = expected_per_key * KEYS as i64;

    let mut tally = HashMap::new();
    let mut total = 0;
    while total < expected_total {
        let datagram = String::from_utf8(recv_datagram(&listener)).unwrap();
        assert!(datagram.len() <= 512);
        for line in datagram.split('\n') {
            let (key, rest) = line.split_once(':').unwrap();
            let value = rest.strip_suffix("|c").unwrap().parse::<i64>().unwrap();
            *tally.entry(key.to_string()).or_insert(0) += value;
            total += value;
        }
    }

    assert_eq!(total, expected_total);
    assert_eq!(tally.len(), KEYS);
    for (key, value) in tally {
        assert_eq!(value, expected_per_key, "key: {key}");
    }
}

#[test]
fn variant_wire_lines() {
    let (listener, addr) = listener();
    let client = buffered(&addr, "app.", "none", 1432);
    client.create_socket().unwrap();

    client.gauge("depth", 3.0).unwrap();
    client.gauge_delta("depth", 2.0).unwrap();
    client.gauge_delta("drift", -1.5).unwrap();
    client.set("users", "alice").unwrap();
    client.set("users", "bob").unwrap();
    client.set("users", "alice").unwrap();
    client.precise_timing("latency", 1.5).unwrap();
    client.timing("latency", Duration::from_millis(2)).unwrap();
    client.absolute("bytes", 1.25).unwrap();
    client.absolute("bytes", 1.25).unwrap();
    client.decr("credits", 4).unwrap();
    client.close().unwrap();

    let lines = sorted_lines(&listener, 8);
    assert_eq!(
        lines,
        vec![
            "app.bytes:1.25|c",
            "app.bytes:1.25|c",
            "app.credits:-4|c",
            "app.depth:5|g",
            "app.drift:-1.5|g",
            "app.latency:1.5|ms",
            "app.latency:2|ms",
            "app.users:2|s",
        ]
    );
}

#[test]
fn negative_gauge_is_zeroed_first() {
    let (listener, addr) = listener();
    let client = StatsdClient::new(&addr, "app.", "none").unwrap();
    client.create_socket().unwrap();

    // Both lines travel in the same datagram, so the collector can't apply them out of order.
    client.gauge("depth", -3.0).unwrap();
    assert_eq!(recv_datagram(&listener), b"app.depth:0|g\napp.depth:-3|g");

    client.gauge_delta("depth", -3.0).unwrap();
    assert_eq!(recv_datagram(&listener), b"app.depth:-3|g");

    client.close().unwrap();

    let client = buffered(&addr, "", "none", 1432);
    client.create_socket().unwrap();
    client.gauge("depth", 2.0).unwrap();
    client.gauge_delta("depth", -2.5).unwrap();
    client.close().unwrap();
    assert_eq!(recv_datagram(&listener), b"depth:0|g\ndepth:-0.5|g");
}

#[test]
fn sampled_lines_carry_rate() {
    let (listener, addr) = listener();
    let client = buffered(&addr, "", "0.5", 1432);
    client.create_socket().unwrap();

    for _ in 0..200 {
        client.incr("hits", 1).unwrap();
    }
    client.gauge("depth", 1.0).unwrap();
    client.close().unwrap();

    let lines = sorted_lines(&listener, 2);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "depth:1|g");

    let kept = lines[1].strip_prefix("hits:").and_then(|l| l.strip_suffix("|c|@0.5")).unwrap();
    let kept = kept.parse::<u32>().unwrap();
    assert!(kept > 0 && kept < 200, "kept: {kept}");
}

#[test]
fn type_conflict_is_reported() {
    let (_listener, addr) = listener();
    let client = StatsdClient::buffered(&addr, "", "none", 1432).unwrap();
    client.create_socket().unwrap();

    client.incr("requests", 1).unwrap();
    let result = client.gauge("requests", 1.0);
    assert!(matches!(result, Err(Error::TypeConflict { ref key, .. }) if key == "requests"));

    client.close().unwrap();
}

#[test]
fn lifecycle() {
    let (_listener, addr) = listener();
    let client = StatsdClient::new(&addr, "", "none").unwrap();

    // Closing a never-opened client is a no-op.
    client.close().unwrap();
    client.close().unwrap();

    client.create_socket().unwrap();
    client.close().unwrap();
    assert!(matches!(client.incr("hits", 1), Err(Error::NotConnected)));
}

#[test]
fn unresolvable_address() {
    let client = StatsdClient::new("statsd.invalid:8125", "", "none").unwrap();
    assert!(matches!(client.create_socket(), Err(Error::Resolution { .. })));
}

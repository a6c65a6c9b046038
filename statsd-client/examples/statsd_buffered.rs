use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use statsd_client::StatsdClient;

fn main() {
    tracing_subscriber::fmt::init();

    let client = StatsdClient::builder()
        .with_remote_address("localhost:8125")
        .expect("failed to parse remote address")
        .with_prefix("demo.%HOST%.")
        .with_sample_mode("0.5")
        .expect("failed to parse sample mode")
        .with_buffer_size(1432)
        .with_idle_eviction(Some(30))
        .with_telemetry(true)
        .build()
        .expect("failed to build statsd client");
    client.create_socket().expect("failed to open socket");

    let client = Arc::new(client);

    // Spread the work over a few threads, all recording into the same keys.
    let workers = (0..4)
        .map(|worker| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let started = Instant::now();
                while started.elapsed() < Duration::from_secs(30) {
                    let loop_start = Instant::now();

                    client.incr("server_loops", 1).expect("failed to record");
                    client.set("active_workers", &worker.to_string()).expect("failed to record");

                    let lucky = rand::random_bool(0.75);
                    client.gauge_delta("lucky_iterations", if lucky { 1.0 } else { -1.0 }).expect("failed to record");

                    thread::sleep(Duration::from_millis(rand::random_range(1..50)));
                    client.timing("server_loop_delta", loop_start.elapsed()).expect("failed to record");
                }
            })
        })
        .collect::<Vec<_>>();

    for worker in workers {
        worker.join().expect("worker panicked");
    }

    client.close().expect("failed to close client");
}

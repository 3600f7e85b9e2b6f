//! End-to-end fan-out benchmark for Huddle.
//!
//! Connects a room of WebSocket clients to a running server. Every client
//! keeps sending `typing` signals and counts the `user-typing` events the
//! relay delivers from the others.
//!
//! ```bash
//! cargo run --release -p huddle-bench --bin e2e_fanout -- 16 ws://127.0.0.1:8080/ws
//! ```

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{codec, ClientEvent, ServerEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const ROOM: &str = "e2e-fanout";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("Huddle end-to-end fan-out benchmark");
    println!("  server:  {url}");
    println!("  clients: {num_clients}");
    println!("  warmup:  {WARMUP_SECS}s, measurement: {BENCH_SECS}s");
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let handles: Vec<_> = (0..num_clients)
        .map(|client_id| {
            let received = Arc::clone(&received);
            let barrier = Arc::clone(&barrier);
            let url = format!("{url}?format=msgpack");
            tokio::spawn(async move {
                if let Err(e) = run_client(client_id, &url, received, barrier).await {
                    eprintln!("client {client_id} error: {e}");
                }
            })
        })
        .collect();

    barrier.wait().await;
    println!("All {num_clients} clients joined {ROOM}");

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    received.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = received.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results");
    println!("  duration:        {:>10.2}s", elapsed.as_secs_f64());
    println!("  events received: {total:>10}");
    println!("  throughput:      {per_sec:>10.0} events/s");
    println!(
        "  per client:      {:>10.0} events/s",
        per_sec / num_clients as f64
    );

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();
    let participant = format!("bench-{client_id}");

    // Connected event
    receiver.next().await;

    let join = codec::encode(&ClientEvent::join_room(ROOM, &participant))?;
    sender.send(Message::Binary(join.to_vec())).await?;

    barrier.wait().await;

    let typing = Message::Binary(codec::encode(&ClientEvent::typing(ROOM, &participant))?.to_vec());

    let recv_task = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(65536);
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Binary(data) = message {
                buf.extend_from_slice(&data);
                while let Ok(Some(event)) = codec::decode_from::<ServerEvent>(&mut buf) {
                    if matches!(event, ServerEvent::UserTyping { .. }) {
                        received.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    while sender.send(typing.clone()).await.is_ok() {
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}

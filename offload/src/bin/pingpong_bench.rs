//! Loopback offload benchmark: a context on the main thread, an emulated
//! remote peer on a second thread, both on one shared segment.
//!
//! Run with:
//! ```bash
//! cargo run --release -p offload --bin pingpong_bench --features bench-bin -- \
//!     -i 100000 -w 10000 -d 64
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;

use offload::{CallArgs, Context, RequestStatus};
use urpc::codec::{self, Value};
use urpc::{Peer, PeerConfig, CMD_CALL, CMD_RESULT};

#[derive(Parser, Debug)]
#[command(name = "pingpong_bench")]
#[command(about = "Loopback latency/throughput benchmark for the offload engine")]
struct Args {
    /// Number of measured round trips
    #[arg(short, long, default_value = "100000")]
    iterations: u64,

    /// Warmup round trips before measuring
    #[arg(short, long, default_value = "10000")]
    warmup: u64,

    /// Argument buffer size in bytes
    #[arg(short = 'd', long, default_value = "64")]
    data_size: usize,

    /// Pin the remote thread to this core
    #[arg(short, long)]
    core: Option<usize>,
}

const FN_ECHO_LEN: u64 = 0x1000;

fn main() {
    let args = Args::parse();

    let mut host = Peer::create(PeerConfig::default()).expect("create segment");
    let name = host.segment_name().to_string();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_remote = Arc::clone(&stop);
    let remote_core = args.core;

    let remote = thread::spawn(move || {
        if let Some(id) = remote_core {
            core_affinity::set_for_current(core_affinity::CoreId { id });
        }
        let mut peer = Peer::attach(&name, PeerConfig::default()).expect("attach");
        peer.register(
            CMD_CALL,
            Box::new(|send, _m, _req, payload| {
                let fields = match codec::unpack(payload, "LP") {
                    Ok(f) => f,
                    Err(_) => return -1,
                };
                let image = fields[1].as_bytes().unwrap();
                match send.send_generic(CMD_RESULT, "L", &[Value::U64(image.len() as u64)]) {
                    Ok(_) => 0,
                    Err(_) => -1,
                }
            }),
        )
        .expect("register");

        while !stop_remote.load(Ordering::Relaxed) {
            peer.recv_progress(64).expect("recv progress");
        }
    });

    host.wait_peer_attach().expect("peer attach");
    let ctx = Context::new(host);
    let buf = vec![0xA5u8; args.data_size];

    let round_trip = |ctx: &Context| {
        let mut call_args = CallArgs::new();
        call_args.push_buf(&buf);
        let id = ctx.call_async(FN_ECHO_LEN, call_args);
        let (status, retval) = ctx.wait_result(id);
        assert_eq!(status, RequestStatus::Ok);
        assert_eq!(retval, 8 + ((buf.len() as u64 + 7) & !7));
    };

    for _ in 0..args.warmup {
        round_trip(&ctx);
    }

    let start = Instant::now();
    for _ in 0..args.iterations {
        round_trip(&ctx);
    }
    let elapsed = start.elapsed();

    stop.store(true, Ordering::Relaxed);
    remote.join().expect("remote thread");

    let us = elapsed.as_secs_f64() * 1e6;
    println!(
        "{} round trips of {} bytes in {:.1} ms",
        args.iterations,
        args.data_size,
        us / 1000.0
    );
    println!("  {:.3} us/call", us / args.iterations as f64);
    println!(
        "  {:.0} calls/s",
        args.iterations as f64 / elapsed.as_secs_f64()
    );
}

//! Round-trip latency of the shared-memory transport, both peers driven
//! from the benchmark thread.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use urpc::codec::{self, Value};
use urpc::{Peer, PeerConfig};

const CMD_ECHO: u8 = 7;
const CMD_ECHO_REPLY: u8 = 8;

fn loopback_pair() -> (Peer, Peer) {
    let host = Peer::create(PeerConfig::default()).unwrap();
    let mut remote = Peer::attach(host.segment_name(), PeerConfig::default()).unwrap();
    remote
        .register(
            CMD_ECHO,
            Box::new(|send, _m, _req, payload| {
                let fields = match codec::unpack(payload, "P") {
                    Ok(f) => f,
                    Err(_) => return -1,
                };
                let bytes = fields[0].as_bytes().unwrap();
                match send.send_generic(CMD_ECHO_REPLY, "P", &[Value::Bytes(bytes)]) {
                    Ok(_) => 0,
                    Err(_) => -1,
                }
            }),
        )
        .unwrap();
    (host, remote)
}

fn bench_pingpong(c: &mut Criterion) {
    let mut group = c.benchmark_group("pingpong");

    for size in [8usize, 64, 1024, 16 * 1024] {
        let (mut host, mut remote) = loopback_pair();
        let data = vec![0xA5u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                host.send_generic(CMD_ECHO, "P", &[Value::Bytes(&data)])
                    .unwrap();
                remote.recv_progress(1).unwrap();
                loop {
                    if let Some((req, m)) = host.recv_next().unwrap() {
                        host.recv_done(req, m);
                        break;
                    }
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pingpong);
criterion_main!(benches);

//! Dispatch hot-path benchmarks: command round trip and event fan-out

use criterion::{Criterion, criterion_group, criterion_main};
use serde::{Deserialize, Serialize};
use switchyard::bus::MessageBus;
use switchyard::config::BusConfig;
use switchyard::message::{Command, Event};

#[derive(Serialize, Deserialize)]
struct Ping {
    n: u64,
}

#[derive(Serialize, Deserialize)]
struct Pong {
    n: u64,
}

impl Command for Ping {
    type Response = Pong;
    const TYPE: &'static str = "bench.ping";
}

#[derive(Serialize, Deserialize, Clone)]
struct Ticked {
    n: u64,
}

impl Event for Ticked {
    const TYPE: &'static str = "bench.ticked";
}

fn command_dispatch(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let bus = runtime.block_on(async {
        let bus = MessageBus::builder(BusConfig::default()).build().await.unwrap();
        bus.subscribe_command(|cmd: Ping| async move { Ok(Pong { n: cmd.n }) })
            .unwrap()
            .detach();
        bus
    });

    c.bench_function("command_round_trip", |b| {
        b.iter(|| {
            let response = runtime.block_on(bus.send(&Ping { n: 7 })).unwrap();
            assert_eq!(response.n, 7);
        });
    });
}

fn event_fan_out(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let bus = runtime.block_on(async {
        let bus = MessageBus::builder(BusConfig::default()).build().await.unwrap();
        for _ in 0..8 {
            bus.subscribe_event(|_evt: Ticked| async move { Ok(()) })
                .unwrap()
                .detach();
        }
        bus
    });

    c.bench_function("event_fan_out_8_handlers", |b| {
        b.iter(|| {
            let report = runtime.block_on(bus.publish(&Ticked { n: 1 })).unwrap();
            assert_eq!(report.handler_count, 8);
        });
    });
}

criterion_group!(benches, command_dispatch, event_fan_out);
criterion_main!(benches);

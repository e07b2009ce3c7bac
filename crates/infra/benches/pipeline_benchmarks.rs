use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;

use catalog_core::ProductId;
use catalog_events::{
    CommandEnvelope, CommandPublisher, InMemoryCommandLog, InMemoryDeadLetters, Payload, Projection,
};
use catalog_infra::read_model::InMemoryProjectionStore;
use catalog_infra::workers::{CommandConsumer, ConsumerSettings, Step};
use catalog_products::ProductCatalog;

fn fields(price: u32) -> Payload {
    match json!({ "name": "Laptop", "price": price, "category": "Electronics" }) {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// create + N updates + delete spread over `products` ids.
fn command_stream(products: usize, updates_per_product: u32) -> Vec<CommandEnvelope> {
    let mut envelopes = Vec::new();
    for p in 0..products {
        let id = ProductId::new(format!("prod_{p}")).unwrap();
        envelopes.push(CommandEnvelope::create(id.clone(), fields(0)));
        for price in 1..=updates_per_product {
            envelopes.push(CommandEnvelope::update(id.clone(), fields(price)));
        }
        envelopes.push(CommandEnvelope::delete(id));
    }
    envelopes
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_codec");
    let envelope = CommandEnvelope::update(ProductId::new("prod_1").unwrap(), fields(899));
    let bytes = envelope.encode().unwrap();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(&envelope).encode().unwrap());
    });
    group.bench_function("decode", |b| {
        b.iter(|| CommandEnvelope::decode(black_box(&bytes)).unwrap());
    });

    group.finish();
}

fn bench_consumer_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("consumer_throughput");
    group.sample_size(20);
    let runtime = runtime();

    for size in [100usize, 1_000] {
        let envelopes = command_stream(size / 10, 8);
        group.throughput(Throughput::Elements(envelopes.len() as u64));

        group.bench_with_input(BenchmarkId::new("in_memory_pipeline", size), &envelopes, |b, envelopes| {
            b.iter(|| {
                runtime.block_on(async {
                    let log = InMemoryCommandLog::new("products");
                    for envelope in envelopes {
                        log.publish(envelope).unwrap();
                    }

                    let mut consumer = CommandConsumer::new(
                        log.subscribe(),
                        Arc::new(InMemoryProjectionStore::new()),
                        Arc::new(InMemoryDeadLetters::new()),
                        ConsumerSettings {
                            poll_timeout: Duration::from_millis(1),
                            max_decode_attempts: 3,
                            retry_backoff: Duration::ZERO,
                        },
                    );
                    while !matches!(consumer.poll_once().await, Step::Idle) {}
                    consumer.stats().committed
                })
            });
        });

        group.bench_with_input(BenchmarkId::new("pure_fold", size), &envelopes, |b, envelopes| {
            b.iter(|| {
                let mut catalog = ProductCatalog::new();
                catalog.apply_all(black_box(envelopes));
                catalog.len()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_envelope_codec, bench_consumer_throughput);
criterion_main!(benches);

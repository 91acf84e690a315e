// Route search benchmarks
//
// Run with: cargo bench --bench router_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use crossover_core::domain::*;

/// `domains` domains joined in a line by one gateway each, with a second
/// parallel gateway per link when `parallel` is set
fn chained_topology(domains: u16, parallel: bool) -> MemoryTopology {
    use ConnectionFormat::{Analog, Stereo};

    let mut store = MemoryTopology::new();
    for d in 1..=domains {
        store
            .add_domain(Domain::new(DomainId::new(d), format!("domain{d}"), "bench"))
            .unwrap();
    }
    store
        .add_source(Source::new(
            SourceId::new(1),
            DomainId::new(1),
            "origin",
            vec![Stereo, Analog],
        ))
        .unwrap();
    store
        .add_sink(Sink::new(
            SinkId::new(1),
            DomainId::new(domains),
            "target",
            vec![Stereo, Analog],
        ))
        .unwrap();

    let lanes: u16 = if parallel { 2 } else { 1 };
    let mut gateway = 1u16;
    for d in 1..domains {
        for _ in 0..lanes {
            let endpoint = 100 + gateway;
            store
                .add_sink(Sink::new(
                    SinkId::new(endpoint),
                    DomainId::new(d),
                    "gw_in",
                    vec![Stereo, Analog],
                ))
                .unwrap();
            store
                .add_source(Source::new(
                    SourceId::new(endpoint),
                    DomainId::new(d + 1),
                    "gw_out",
                    vec![Stereo, Analog],
                ))
                .unwrap();
            store
                .add_gateway(Gateway {
                    id: GatewayId::new(gateway),
                    name: format!("gw{gateway}"),
                    sink_id: SinkId::new(endpoint),
                    source_id: SourceId::new(endpoint),
                    domain_sink_id: DomainId::new(d),
                    domain_source_id: DomainId::new(d + 1),
                    control_domain_id: DomainId::new(d),
                    sink_formats: vec![Stereo, Analog],
                    source_formats: vec![Stereo, Analog],
                    conversion_matrix: vec![true, false, false, true],
                })
                .unwrap();
            gateway += 1;
        }
    }
    store
}

fn bench_chain_length(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_routes_chain");
    let router = Router::new();

    for domains in [2u16, 4, 8, 16].iter() {
        let store = chained_topology(*domains, false);
        group.bench_with_input(BenchmarkId::from_parameter(domains), domains, |b, _| {
            b.iter(|| {
                black_box(router.find_routes(&store, false, SourceId::new(1), SinkId::new(1)))
            });
        });
    }

    group.finish();
}

fn bench_parallel_gateways(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_routes_parallel");
    let router = Router::new();

    // Path count doubles with every link
    for domains in [2u16, 4, 6, 8].iter() {
        let store = chained_topology(*domains, true);
        group.bench_with_input(BenchmarkId::from_parameter(domains), domains, |b, _| {
            b.iter(|| {
                black_box(router.find_routes(&store, false, SourceId::new(1), SinkId::new(1)))
            });
        });
    }

    group.finish();
}

fn bench_same_domain(c: &mut Criterion) {
    let store = chained_topology(1, false);
    let router = Router::new();

    c.bench_function("find_routes_same_domain", |b| {
        b.iter(|| black_box(router.find_routes(&store, true, SourceId::new(1), SinkId::new(1))));
    });
}

criterion_group!(
    benches,
    bench_chain_length,
    bench_parallel_gateways,
    bench_same_domain
);
criterion_main!(benches);

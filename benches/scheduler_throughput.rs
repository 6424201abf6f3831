use blocksim::{Cluster, Config};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

fn benchmark_put_files(c: &mut Criterion) {
    c.bench_function("put_files 10x1MiB, 11 datanodes", |b| {
        b.iter_batched(
            || {
                Cluster::new(Config {
                    number_of_datanodes: 11,
                    ..Config::default()
                })
            },
            |cluster| {
                cluster.put_files(10, 1024 * 1024).unwrap();
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("regenerate_blocks 40 datanodes", |b| {
        b.iter_batched(
            || {
                Cluster::new(Config {
                    number_of_datanodes: 40,
                    enable_heartbeats: false,
                    enable_block_report: false,
                    ..Config::default()
                })
            },
            |cluster| {
                cluster.regenerate_blocks(20).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

fn benchmark_bare_scheduler(c: &mut Criterion) {
    use blocksim::sim::{Scheduler, Until};

    c.bench_function("1000 sequential timeouts", |b| {
        b.iter_batched(
            || Scheduler::new(42),
            |sched| {
                let handle = sched.spawn(|ctx| async move {
                    for _ in 0..1000 {
                        let _ = ctx.timeout(0.001).await;
                    }
                });
                sched.run(Until::Sentinel(handle.id())).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, benchmark_put_files, benchmark_bare_scheduler);
criterion_main!(benches);

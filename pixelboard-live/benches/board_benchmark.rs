use criterion::{criterion_group, criterion_main, Criterion};
use pixelboard_live::board::{Board, PixelChange};
use pixelboard_live::broadcast::BroadcastHub;
use pixelboard_live::palette::Palette;
use pixelboard_live::protocol::ServerMessage;
use pixelboard_live::storage::{PixelStore, StoreConfig, VolatileGateway};
use std::hint::black_box;
use std::sync::Arc;

fn volatile_board(width: u32, height: u32) -> Board {
    Board::new(width, height, Arc::new(Palette::default()), Arc::new(VolatileGateway))
}

fn sample_changes(n: u32) -> Vec<PixelChange> {
    (0..n)
        .map(|i| PixelChange { x: i % 1000, y: i / 1000, color_index: i % 16 })
        .collect()
}

fn bench_mutate(c: &mut Criterion) {
    let board = volatile_board(1000, 1000);

    c.bench_function("board_mutate_1000", |b| {
        b.iter(|| {
            for i in 0..1000u32 {
                board.mutate(black_box(i), black_box(i % 1000), black_box(i % 16)).unwrap();
            }
            black_box(board.drain_changes());
        })
    });
}

fn bench_read_range(c: &mut Criterion) {
    let board = volatile_board(1000, 1000);

    c.bench_function("board_read_range_100x100", |b| {
        b.iter(|| {
            black_box(board.read_pixels(black_box(450), black_box(450), 550, 550).unwrap());
        })
    });
}

fn bench_encode_changes(c: &mut Criterion) {
    let changes = sample_changes(1000);

    c.bench_function("changes_encode_1000", |b| {
        b.iter(|| {
            black_box(ServerMessage::Changes(black_box(changes.clone())).encode().unwrap());
        })
    });
}

fn bench_broadcast_100_subscribers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let changes = sample_changes(500);

    c.bench_function("broadcast_500_changes_100_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let hub = BroadcastHub::new(4);

                let mut handles = Vec::new();
                for _ in 0..100 {
                    handles.push(hub.subscribe().await);
                }

                let delivered = hub.broadcast(black_box(&changes)).await.unwrap();
                black_box(delivered);
            });
        })
    });
}

fn bench_put_pixel(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = PixelStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

    c.bench_function("store_put_pixel", |b| {
        let mut i = 0u32;
        b.iter(|| {
            let change = PixelChange { x: i % 1000, y: (i / 1000) % 1000, color_index: i % 16 };
            store.put_pixel(black_box(&change)).unwrap();
            i = i.wrapping_add(1);
        })
    });
}

fn bench_snapshot_10k(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StoreConfig::for_testing(dir.path().join("db"));
    config.max_snapshots = 2;
    let store = PixelStore::open(config).unwrap();
    for change in sample_changes(10_000) {
        store.put_pixel(&change).unwrap();
    }

    c.bench_function("store_snapshot_10k_pixels", |b| {
        b.iter(|| {
            black_box(store.create_snapshot(black_box("bench")).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_mutate,
    bench_read_range,
    bench_encode_changes,
    bench_broadcast_100_subscribers,
    bench_put_pixel,
    bench_snapshot_10k,
);
criterion_main!(benches);

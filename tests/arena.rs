#![cfg(unix)]

use heapfrag::{
    alloc::{arena::ArenaHeap, arena::CHUNK_OVERHEAD, HeapBackend, HeapService},
    inspect, simulation,
    sink::{CsvSink, ResultSink, CSV_HEADER},
    workload::{LiveBlock, LiveSet},
    SimulationConfig,
};

fn config() -> SimulationConfig {
    SimulationConfig {
        seed: Some(0x5eed),
        ..Default::default()
    }
}

#[test]
fn arena_run_fragments_and_recovers() {
    let config = config();
    let mut heap = ArenaHeap::open(&config).unwrap();
    let report = simulation::run(&mut heap, &config).unwrap();

    assert_eq!(report.series.len(), config.step_count);
    for stats in &report.series {
        assert!(stats.total_heap_committed >= stats.total_user_requested);
        assert!(stats.biggest_free_block <= stats.total_free_on_heap);
        assert!(stats.total_free_on_heap > 0);
        assert!((0.0..1.0).contains(&stats.external_fragmentation_ratio));
    }
    assert!(report
        .series
        .iter()
        .any(|stats| stats.external_fragmentation_ratio > 0.0));
    assert_eq!(report.summary().allocation_failures, 0);

    // Everything was released at the end and merged back into one chunk
    let summary = heap.free_chunk_summary().unwrap();
    assert_eq!(summary.sizes(), &[heap.capacity() - CHUNK_OVERHEAD]);
}

#[test]
fn arena_runs_are_reproducible() {
    let config = config();
    let run = || {
        let mut heap = ArenaHeap::open(&config).unwrap();
        simulation::run(&mut heap, &config).unwrap().series
    };
    assert_eq!(run(), run());
}

#[test]
fn small_arena_runs_out_without_aborting() {
    let config = SimulationConfig {
        arena_capacity: 16 * 1024,
        ..config()
    };
    let mut heap = ArenaHeap::open(&config).unwrap();
    let report = simulation::run(&mut heap, &config).unwrap();
    assert_eq!(report.series.len(), config.step_count);
    assert!(report.summary().allocation_failures > 0);
}

#[test]
fn arena_series_exports_as_csv() {
    let config = config();
    let mut heap = ArenaHeap::open(&config).unwrap();
    let report = simulation::run(&mut heap, &config).unwrap();

    let path = std::env::temp_dir().join(format!("heapfrag-{}.csv", std::process::id()));
    CsvSink::create(&path)
        .unwrap()
        .write_series(&report.series)
        .unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let mut lines = text.lines();
    assert_eq!(lines.next(), Some(CSV_HEADER));
    assert_eq!(lines.count(), config.step_count);
}

#[test]
fn measuring_the_arena_leaves_it_unchanged() {
    let config = config();
    let mut heap = ArenaHeap::open(&config).unwrap();
    heap.tune(&config.tuning);

    let mut live = LiveSet::with_capacity(60);
    for i in 0..60 {
        let size = 512 + 17 * i;
        let block = heap.allocate(size).unwrap();
        live.push(LiveBlock::new(block, size));
    }
    for i in 0..20 {
        let block = live.swap_remove(i * 2);
        heap.release(block.into_handle());
    }
    let chunks = heap.chunk_count();

    let first = inspect::measure(&heap, &live, 0);
    assert!(first.introspection_error.is_none());
    assert!(first.stats.external_fragmentation_ratio > 0.0);
    for _ in 0..15 {
        assert_eq!(inspect::measure(&heap, &live, 0).stats, first.stats);
    }
    assert_eq!(heap.chunk_count(), chunks);

    live.release_all(&mut heap);
}

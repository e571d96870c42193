//! Benchmarks for core fgmarkdup functions.
//!
//! Run with: `cargo bench`
//! View reports in: `target/criterion/report/index.html`

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;

use bstr::BString;
use fgmarkdup_lib::optical::{
    CoordinateWidth, DelimitedFieldsParser, DistanceMetric, LocationParser,
    OpticalDuplicateFinder, PhysicalLocation,
};
use fgmarkdup_lib::read_ends::{Orientation, ReadEnds};
use fgmarkdup_lib::sort::{GroupBy, SortingCollection};

/// Random locations on a handful of tiles, dense enough to form clusters.
fn random_locations(n: usize, seed: u64) -> Vec<Option<PhysicalLocation>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Some(PhysicalLocation::new(
                1101 + rng.random_range(0..4),
                rng.random_range(0..5_000),
                rng.random_range(0..5_000),
            ))
        })
        .collect()
}

fn random_ends(n: usize, seed: u64) -> Vec<ReadEnds> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n as u64)
        .map(|i| ReadEnds {
            library: 1,
            read1_reference: rng.random_range(0..3),
            read1_coordinate: rng.random_range(0..200_000),
            orientation: Orientation::FR,
            read2_reference: 0,
            read2_coordinate: rng.random_range(0..200_000),
            read1_index: i * 2,
            read2_index: i * 2 + 1,
            score: rng.random_range(0..6_000),
            optical_orientation: Orientation::FR,
            read_group: 1,
            location: None,
            read_name: BString::from(format!("q{i}")),
            barcode: 0,
            read1_barcode: 0,
            read2_barcode: 0,
        })
        .collect()
}

/// Benchmark optical clustering across set sizes
fn bench_optical_finder(c: &mut Criterion) {
    let mut group = c.benchmark_group("optical_finder");

    for size in [10, 100, 1_000, 10_000] {
        let locations = random_locations(size, 42);
        let scores: Vec<u32> = (0..size as u32).collect();
        group.throughput(Throughput::Elements(size as u64));

        for metric in [DistanceMetric::Euclidean, DistanceMetric::Chebyshev] {
            let finder = OpticalDuplicateFinder::new(100, metric, 300_000);
            group.bench_with_input(
                BenchmarkId::new(format!("{metric:?}"), size),
                &locations,
                |b, locations| {
                    b.iter(|| black_box(finder.find_optical_duplicates(locations, &scores, Some(0))));
                },
            );
        }
    }

    group.finish();
}

/// Benchmark read-name location parsing
fn bench_location_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("location_parsing");
    let parser = DelimitedFieldsParser::new(b':', vec![5, 7], CoordinateWidth::Wide);
    let names: Vec<Vec<u8>> = (0..1_000)
        .map(|i| format!("M00123:42:000000000-ABCDE:1:{}:{}:{}", 1101 + i % 20, i * 7, i * 13))
        .map(String::into_bytes)
        .collect();
    group.throughput(Throughput::Elements(names.len() as u64));

    group.bench_function("delimited_fields", |b| {
        b.iter(|| {
            for name in &names {
                black_box(parser.parse(name));
            }
        });
    });

    group.finish();
}

/// Benchmark sorting keys in memory against spilling them to disk
fn bench_sorting_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("sorting_collection");
    group.sample_size(10);

    let n = 100_000;
    let ends = random_ends(n, 7);
    group.throughput(Throughput::Elements(n as u64));

    for (label, budget, threads) in
        [("in_memory", n, 1), ("spill", n / 10, 1), ("spill_threaded", n / 10, 4)]
    {
        group.bench_function(label, |b| {
            b.iter(|| {
                let mut collection = SortingCollection::builder("bench")
                    .max_records_in_ram(budget)
                    .threads(threads)
                    .build();
                for end in &ends {
                    collection.add(end.clone()).unwrap();
                }
                let groups = GroupBy::new(
                    collection.into_sorted_iter().unwrap(),
                    ReadEnds::same_pair_key,
                );
                black_box(groups.map(|g| g.unwrap().len()).sum::<usize>())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_optical_finder, bench_location_parsing, bench_sorting_collection);
criterion_main!(benches);

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use image::{ImageBuffer, Rgb, RgbImage};
use sight_match::search::dedup::{DEFAULT_DEDUP_THRESHOLD, deduplicate};
use sight_match::search::embedder::{ImageEmbedder, l2_normalize};
use sight_match::search::histogram_embedder::HistogramEmbedder;
use sight_match::search::vector_index::{
    VectorIndex, dot_product_scalar_bench, dot_product_simd_bench,
};
use std::hint::black_box;

/// CLIP ViT-B/32 output width.
const DIMENSION: usize = 512;

// =============================================================================
// Encoder Benchmarks
// =============================================================================

/// Histogram encoding of a 224x224 image (CLIP input size).
fn bench_histogram_embed_224(c: &mut Criterion) {
    let embedder = HistogramEmbedder::default_dimension();
    let image: RgbImage = ImageBuffer::from_fn(224, 224, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });

    c.bench_function("histogram_embed_224", |b| {
        b.iter(|| black_box(embedder.embed_image(black_box(&image))))
    });
}

// =============================================================================
// Dot Product Benchmarks
// =============================================================================

fn bench_dot_product(c: &mut Criterion) {
    let a = build_query(DIMENSION);
    let b_vec = build_vector(7, DIMENSION);
    let mut group = c.benchmark_group("dot_product_512");
    group.bench_function("scalar", |b| {
        b.iter(|| black_box(dot_product_scalar_bench(black_box(&a), black_box(&b_vec))))
    });
    group.bench_function("simd", |b| {
        b.iter(|| black_box(dot_product_simd_bench(black_box(&a), black_box(&b_vec))))
    });
    group.finish();
}

// =============================================================================
// Vector Index Benchmarks
// =============================================================================

/// Target: <5ms
fn bench_vector_index_search_10k(c: &mut Criterion) {
    let index = build_index(10_000, DIMENSION);
    let query = build_query(DIMENSION);

    c.bench_function("vector_index_search_10k", |b| {
        b.iter(|| {
            let results = index.search(black_box(&query), 9).unwrap_or_default();
            black_box(results);
        });
    });
}

/// Parameterized benchmark for different catalog sizes.
fn bench_vector_search_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_search_scaling");

    for size in [1_000, 5_000, 10_000, 25_000, 50_000] {
        let index = build_index(size, DIMENSION);
        let query = build_query(DIMENSION);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let results = index.search(black_box(&query), 9).unwrap_or_default();
                black_box(results);
            });
        });
    }
    group.finish();
}

/// Search over an index loaded back from disk.
fn bench_vector_index_search_50k_loaded(c: &mut Criterion) {
    use tempfile::TempDir;

    let index = build_index(50_000, DIMENSION);
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bench.smvi");
    index.save(&path).unwrap();
    let loaded = VectorIndex::load(&path).unwrap();
    let query = build_query(DIMENSION);

    c.bench_function("vector_index_search_50k_loaded", |b| {
        b.iter(|| {
            let results = loaded.search(black_box(&query), 9).unwrap_or_default();
            black_box(results);
        });
    });
}

// =============================================================================
// Dedup Benchmarks
// =============================================================================

fn bench_dedup_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_scaling");
    group.sample_size(10);

    for size in [1_000, 5_000] {
        let index = build_index(size, DIMENSION);
        let identifiers: Vec<String> = (0..size).map(|i| format!("dataset/{i}.jpg")).collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let out = deduplicate(&index, &identifiers, DEFAULT_DEDUP_THRESHOLD).unwrap();
                black_box(out.removed);
            });
        });
    }
    group.finish();
}

fn build_vector(idx: usize, dimension: usize) -> Vec<f32> {
    let mut vector: Vec<f32> = (0..dimension)
        .map(|d| ((idx + d * 31) % 997) as f32 / 997.0)
        .collect();
    l2_normalize(&mut vector);
    vector
}

fn build_index(count: usize, dimension: usize) -> VectorIndex {
    VectorIndex::build(
        "bench-embedder",
        dimension,
        (0..count).map(|idx| build_vector(idx, dimension)),
    )
    .unwrap()
}

fn build_query(dimension: usize) -> Vec<f32> {
    let mut query: Vec<f32> = (0..dimension).map(|d| (d % 17) as f32 / 17.0).collect();
    l2_normalize(&mut query);
    query
}

criterion_group!(
    benches,
    bench_histogram_embed_224,
    bench_dot_product,
    bench_vector_index_search_10k,
    bench_vector_index_search_50k_loaded,
    bench_vector_search_scaling,
    bench_dedup_scaling,
);
criterion_main!(benches);

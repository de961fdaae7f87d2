use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use kaal_heap::{Heap, NoRelocator};

fn bench_alloc_free(c: &mut Criterion) {
    c.bench_function("alloc_free_64", |b| {
        let mut heap: Heap<u32> = Heap::new(64 * 1024).unwrap();
        b.iter(|| {
            let block = heap.alloc(black_box(64), &mut NoRelocator).unwrap();
            heap.free(block).unwrap();
        });
    });
}

fn bench_alloc_with_relocation(c: &mut Criterion) {
    c.bench_function("alloc_compacting", |b| {
        b.iter(|| {
            // Alternate live and freed blocks so the final request must compact.
            let mut heap: Heap<u32> = Heap::new(8 * 1024).unwrap();
            let mut blocks = Vec::new();
            while let Ok(block) = heap.alloc(48, &mut NoRelocator) {
                heap.unpin(block).unwrap();
                blocks.push(block);
            }
            for block in blocks.iter().step_by(2) {
                heap.free(*block).unwrap();
            }
            black_box(heap.alloc(black_box(1024), &mut NoRelocator).unwrap());
        });
    });
}

criterion_group!(benches, bench_alloc_free, bench_alloc_with_relocation);
criterion_main!(benches);

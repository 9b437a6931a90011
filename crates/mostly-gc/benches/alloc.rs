use criterion::{criterion_group, criterion_main, Criterion};
use mostly_gc::{alloc_object, GcPtr, Traverse};

#[derive(Traverse)]
struct Node {
    next: GcPtr<Node>,
    value: u64,
}

fn alloc_small(c: &mut Criterion) {
    mostly_gc::init();
    c.bench_function("alloc_small", |b| {
        b.iter(|| {
            let node = alloc_object(Node {
                next: GcPtr::null(),
                value: 1,
            });
            std::hint::black_box(node);
        });
    });
}

fn alloc_chain_and_collect(c: &mut Criterion) {
    mostly_gc::init();
    c.bench_function("chain_1000_collect", |b| {
        b.iter(|| {
            let head = alloc_object(Node {
                next: GcPtr::null(),
                value: 0,
            });
            let mut cur = head;
            for i in 1..1000 {
                let next = alloc_object(Node {
                    next: GcPtr::null(),
                    value: i,
                });
                cur.next = next;
                cur = next;
            }
            mostly_gc::collect();
            std::hint::black_box(head);
        });
    });
}

criterion_group!(benches, alloc_small, alloc_chain_and_collect);
criterion_main!(benches);

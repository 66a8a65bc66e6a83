use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use duet_core::selection::{Point, Range};
use duet_core::{Binding, Document, Editor};
use std::hint::black_box;

fn seeded_pair() -> (Editor, Binding) {
    let mut editor = Editor::new(Document::initial());
    editor.take_outbox();
    let binding = Binding::new();
    binding.seed(editor.document()).unwrap();
    (editor, binding)
}

fn bench_local_typing(c: &mut Criterion) {
    let mut group = c.benchmark_group("binding");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert_char_local", |b| {
        let (mut editor, mut binding) = seeded_pair();
        editor.select(Range::collapsed(Point::new(vec![2, 0], 0)));
        b.iter(|| {
            editor.insert_text(black_box("a"));
            black_box(editor.flush_to(&mut binding).unwrap());
        })
    });

    group.finish();
}

fn bench_remote_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("binding");
    group.throughput(Throughput::Elements(1));

    let (mut source, mut source_binding) = seeded_pair();
    let seed = source_binding.encode_state().unwrap();
    source.select(Range::collapsed(Point::new(vec![0, 0], 4)));
    source.insert_text("!");
    let delta = source.flush_to(&mut source_binding).unwrap().flatten().unwrap();

    group.bench_function("apply_remote_delta", |b| {
        b.iter_batched(
            || {
                let binding = Binding::new();
                let mut editor = Editor::new(Document::default());
                editor.take_outbox();
                let ops = binding.apply_remote(&seed, editor.document()).unwrap();
                editor.apply_remote(&ops).unwrap();
                (editor, binding)
            },
            |(mut editor, binding)| {
                let ops = binding.apply_remote(black_box(&delta), editor.document()).unwrap();
                editor.apply_remote(&ops).unwrap();
                black_box(editor);
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_full_diff(c: &mut Criterion) {
    let old = Document::initial();
    let mut new = old.clone();
    new.children.reverse();

    c.bench_function("reconcile_diff_initial", |b| {
        b.iter(|| black_box(duet_core::collab::reconcile::diff(black_box(&old), black_box(&new))))
    });
}

criterion_group!(benches, bench_local_typing, bench_remote_reconcile, bench_full_diff);
criterion_main!(benches);

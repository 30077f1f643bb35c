//! Benchmarks for the update and reconcile pipeline.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strata_core::{Editor, MemoryTarget, NodeKey, UpdateOptions};

/// Creates a mounted editor holding `paragraphs` one-line paragraphs.
fn mounted_editor(paragraphs: usize) -> (Editor, Vec<NodeKey>) {
    let mut editor = Editor::new();
    let dom = MemoryTarget::new();
    let root = dom.create_container("div");
    editor.attach(Box::new(dom), root).unwrap();

    let mut texts = Vec::with_capacity(paragraphs);
    editor
        .update(
            |txn| {
                for i in 0..paragraphs {
                    let para = txn.create_paragraph()?;
                    txn.append(NodeKey::ROOT, para)?;
                    let text = txn.create_text(format!("Paragraph {i}: sample text for benchmarking."))?;
                    txn.append(para, text)?;
                    texts.push(text);
                }
                Ok(())
            },
            UpdateOptions::default().discrete(),
        )
        .unwrap();
    (editor, texts)
}

/// Benchmarks the first render of a document.
fn bench_initial_mount(c: &mut Criterion) {
    let mut group = c.benchmark_group("initial_mount");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("paragraphs", size), size, |b, &size| {
            b.iter(|| black_box(mounted_editor(size)))
        });
    }

    group.finish();
}

/// Benchmarks a one-character edit in documents of growing size.
fn bench_text_edit(c: &mut Criterion) {
    let mut group = c.benchmark_group("text_edit");

    for size in [10, 100, 1000, 10000].iter() {
        let (mut editor, texts) = mounted_editor(*size);
        let middle = texts[texts.len() / 2];
        let mut flip = false;

        group.bench_with_input(BenchmarkId::new("paragraphs", size), size, |b, _| {
            b.iter(|| {
                flip = !flip;
                let text = if flip { "edited" } else { "edited!" };
                editor
                    .update(
                        |txn| Ok(txn.set_text(middle, black_box(text))?),
                        UpdateOptions::default().discrete(),
                    )
                    .unwrap();
            })
        });
    }

    group.finish();
}

/// Benchmarks moving a paragraph, which should move one render node.
fn bench_reorder(c: &mut Criterion) {
    let mut group = c.benchmark_group("reorder");

    let (mut editor, _) = mounted_editor(1000);
    group.bench_function("last_to_first", |b| {
        b.iter(|| {
            editor
                .update(
                    |txn| {
                        let children = txn.children(NodeKey::ROOT)?;
                        if let (Some(first), Some(last)) = (children.first(), children.last()) {
                            txn.insert_before(*first, *last)?;
                        }
                        Ok(())
                    },
                    UpdateOptions::default().discrete(),
                )
                .unwrap();
        })
    });

    group.finish();
}

/// Benchmarks coalescing of deferred updates into one commit.
fn bench_deferred_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("deferred_batch");

    let (mut editor, texts) = mounted_editor(100);
    let mut round = 0usize;
    group.bench_function("ten_updates_one_flush", |b| {
        b.iter(|| {
            round += 1;
            for key in texts.iter().take(10) {
                let text = format!("round {round}");
                editor
                    .update(|txn| Ok(txn.set_text(*key, text)?), UpdateOptions::default())
                    .unwrap();
            }
            editor.flush().unwrap();
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_initial_mount,
    bench_text_edit,
    bench_reorder,
    bench_deferred_batch,
);
criterion_main!(benches);

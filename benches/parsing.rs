/// Benchmarks for lexing, document opening and page evaluation
///
/// Run with: cargo bench
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use pdf_engine::core::{LoadOptions, PdfManager, RenderingIntent};
use pdf_engine::{Lexer, PDFDocument, Stream, Token};

#[path = "../tests/common/mod.rs"]
mod common;

use common::simple_document;

const PAGE_CONTENT: &str = "q 1 0 0 1 72 72 cm 0 0 m 100 100 l S Q BT /F1 12 Tf 72 700 Td (Benchmark text) Tj ET\n";

fn content_stream(repeat: usize) -> Vec<u8> {
    PAGE_CONTENT.repeat(repeat).into_bytes()
}

fn document(pages: usize) -> Vec<u8> {
    let content = PAGE_CONTENT.repeat(20);
    let contents = vec![content.as_str(); pages];
    simple_document(&contents).build("/Root 1 0 R")
}

/// Benchmark raw tokenization of content streams
fn benchmark_lexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexing");

    for repeat in [100, 1000] {
        let data = content_stream(repeat);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(data.len()), &data, |b, data| {
            b.iter(|| {
                let mut lexer = Lexer::new(Box::new(Stream::from_bytes(black_box(data.clone())))).unwrap();
                let mut tokens = 0usize;
                while !matches!(lexer.get_object(), Ok(Token::EOF) | Err(_)) {
                    tokens += 1;
                }
                tokens
            });
        });
    }

    group.finish();
}

/// Benchmark PDF document opening, with a valid table and through recovery
fn benchmark_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("document_opening");

    for pages in [10, 100] {
        let data = document(pages);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("xref_table", pages), &data, |b, data| {
            b.iter(|| PDFDocument::open(black_box(data.clone())));
        });

        let contents = vec!["q Q"; pages];
        let broken = simple_document(&contents).build_with_broken_startxref("/Root 1 0 R");
        group.bench_with_input(BenchmarkId::new("recovery", pages), &broken, |b, data| {
            b.iter(|| PDFDocument::open(black_box(data.clone())));
        });
    }

    group.finish();
}

/// Benchmark page access patterns
fn benchmark_page_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_access");

    if let Ok(doc) = PDFDocument::open(document(50)) {
        group.bench_function("sequential_page_access", |b| {
            b.iter(|| {
                for i in 0..50 {
                    let _ = doc.get_page(black_box(i));
                }
            });
        });

        group.bench_function("random_page_access", |b| {
            b.iter(|| {
                for i in [0, 49, 17, 3, 31] {
                    let _ = doc.get_page(black_box(i));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark operator list and text content construction
fn benchmark_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluation");

    let Ok(runtime) = tokio::runtime::Runtime::new() else {
        return;
    };
    let manager = PdfManager::local(1, document(1), LoadOptions::default());
    if runtime.block_on(manager.load_document(None)).is_err() {
        return;
    }

    let task = manager.create_task("bench");
    group.bench_function("operator_list_page_0", |b| {
        b.iter(|| {
            runtime.block_on(manager.get_operator_list(black_box(0), RenderingIntent::Display, &task, None))
        });
    });

    group.bench_function("text_content_page_0", |b| {
        b.iter(|| {
            runtime.block_on(manager.get_text_content(black_box(0), &task))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_lexing,
    benchmark_open,
    benchmark_page_access,
    benchmark_evaluation
);
criterion_main!(benches);

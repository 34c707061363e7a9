use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use toolbridge::mcp::parser::find_tool_call_json;

fn transcript(n_paragraphs: usize, with_call: bool) -> String {
    let mut text = String::new();
    for i in 0..n_paragraphs {
        text.push_str(&format!(
            "Paragraph {i} mentions code like `if x {{ y() }}` and stray }} braces \
             while explaining what the assistant intends to do next.\n"
        ));
    }
    if with_call {
        text.push_str("{\"tool\":\"search\",\"arguments\":{\"q\":\"needle in a long reply\"}}\n");
        text.push_str("I'll report back once the search finishes.\n");
    }
    text
}

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_tool_call_json");
    for paragraphs in [8usize, 64, 256] {
        let with_call = transcript(paragraphs, true);
        group.throughput(Throughput::Bytes(with_call.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("embedded_call", paragraphs),
            &with_call,
            |b, text| b.iter(|| find_tool_call_json(text)),
        );

        let without_call = transcript(paragraphs, false);
        group.throughput(Throughput::Bytes(without_call.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("no_call", paragraphs),
            &without_call,
            |b, text| b.iter(|| find_tool_call_json(text)),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_extract);
criterion_main!(benches);

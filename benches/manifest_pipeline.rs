//! Benchmarks for the manifest mutation pipeline
//!
//! Tests the hot path: parse → decode SCTE-35 → skip plan → splice → serialize.
//!
//! This is the critical path executed for every manifest request in live SSAI.
//! Each concurrent viewer triggers it every segment duration (~6 seconds),
//! meaning 10,000 viewers = ~1,667 pipeline executions/sec.

use adedge::hls::{self, AdMediaSegment};
use adedge::scte35;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Generate a live window with aligned PDTs and one SCTE-35 DATERANGE.
fn generate_playlist(segment_count: usize, cue_at: usize, cue_duration: f64) -> String {
    let base_ms: i64 = 1_772_000_000_000;
    let mut lines = vec![
        "#EXTM3U".to_string(),
        "#EXT-X-VERSION:3".to_string(),
        "#EXT-X-TARGETDURATION:6".to_string(),
        "#EXT-X-MEDIA-SEQUENCE:1000".to_string(),
    ];

    for i in 0..segment_count {
        let pdt = chrono::DateTime::from_timestamp_millis(base_ms + i as i64 * 6_000)
            .unwrap()
            .to_rfc3339();
        lines.push(format!("#EXT-X-PROGRAM-DATE-TIME:{}", pdt));
        if i == cue_at {
            lines.push(format!(
                "#EXT-X-DATERANGE:ID=\"e1\",CLASS=\"scte35:oatcls\",START-DATE=\"{}\",DURATION={}",
                pdt, cue_duration
            ));
        }
        lines.push("#EXTINF:6.000,".to_string());
        lines.push(format!("https://cdn.example.com/stream/segment_{}.ts", i));
    }

    lines.join("\n") + "\n"
}

fn ad_pod(count: usize) -> Vec<AdMediaSegment> {
    (0..count)
        .map(|i| AdMediaSegment {
            uri: format!("https://ads.example.com/pod/ad-{}.ts", i),
            duration_sec: 6.0,
            slate: false,
        })
        .collect()
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for size in [20usize, 60, 180] {
        let content = generate_playlist(size, 2, 30.0);
        group.bench_with_input(BenchmarkId::from_parameter(size), &content, |b, content| {
            b.iter(|| hls::parse_media_playlist(black_box(content)).unwrap());
        });
    }
    group.finish();
}

fn bench_signal_decode(c: &mut Criterion) {
    let content = generate_playlist(60, 2, 30.0);
    let playlist = hls::parse_media_playlist(&content).unwrap();
    c.bench_function("scte35_decode", |b| {
        b.iter(|| scte35::signals_from_playlist(black_box(&playlist)));
    });
}

fn bench_full_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("ssai_rewrite");
    for size in [20usize, 60, 180] {
        let content = generate_playlist(size, 2, 30.0);
        group.bench_with_input(BenchmarkId::from_parameter(size), &content, |b, content| {
            b.iter(|| {
                let playlist = hls::parse_media_playlist(black_box(content)).unwrap();
                let signals = scte35::signals_from_playlist(&playlist);
                let start_ms = signals[0].start_ms;
                let outcome = hls::replace_segments_with_ads(
                    &playlist,
                    start_ms,
                    &ad_pod(5),
                    30.0,
                    Some(5),
                )
                .unwrap();
                hls::serialize_media_playlist(outcome.playlist).unwrap()
            });
        });
    }
    group.finish();
}

fn bench_strip(c: &mut Criterion) {
    let content = generate_playlist(60, 2, 30.0);
    c.bench_function("strip_origin_scte35", |b| {
        b.iter(|| {
            let mut playlist = hls::parse_media_playlist(black_box(&content)).unwrap();
            hls::strip_origin_scte35(&mut playlist);
            hls::serialize_media_playlist(playlist).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_parse,
    bench_signal_decode,
    bench_full_rewrite,
    bench_strip
);
criterion_main!(benches);

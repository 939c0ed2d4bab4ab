//! Throughput of the HTML/CSS rewrite pass and the helpers around it

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flate2::{write::GzEncoder, Compression};
use preview_bridge::forwarding::build_target_url;
use preview_bridge::identity::RouteTemplate;
use preview_bridge::rewrite::{decode_body, ContentClass, RewriteRules};
use std::io::Write;

const PREFIX: &str = "/api/proxy/preview/5b0c2a1e-sandbox/3000";

fn sample_html(scripts: usize) -> String {
    let mut html = String::from("<!DOCTYPE html><html><head>");
    for i in 0..scripts {
        html.push_str(&format!(
            "<link rel=\"preload\" href=\"/_next/static/chunks/{i}.js\" as=\"script\">\
             <script src=\"/_next/static/chunks/{i}.js\" async></script>"
        ));
    }
    html.push_str("</head><body><div id=\"__next\"><p>Hello</p></div></body></html>");
    html
}

fn sample_css(rules: usize) -> String {
    (0..rules)
        .map(|i| {
            format!(
                ".c{i}{{background:url(/static/img/{i}.png)}}\
                 @font-face{{src:url('/_next/static/media/{i}.woff2')}}\n"
            )
        })
        .collect()
}

fn bench_rewrite(c: &mut Criterion) {
    let rules = RewriteRules::default();
    let mut group = c.benchmark_group("rewrite");

    let html = sample_html(200);
    group.throughput(Throughput::Bytes(html.len() as u64));
    group.bench_function("html_200_scripts", |b| {
        b.iter(|| black_box(rules.apply(ContentClass::Html, black_box(&html), PREFIX)));
    });

    let css = sample_css(200);
    group.throughput(Throughput::Bytes(css.len() as u64));
    group.bench_function("css_200_rules", |b| {
        b.iter(|| black_box(rules.apply(ContentClass::Css, black_box(&css), PREFIX)));
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let html = sample_html(200);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(html.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    c.bench_function("decode_gzip_html", |b| {
        b.iter(|| black_box(decode_body(black_box(&compressed), Some("gzip")).unwrap()));
    });
}

fn bench_routing(c: &mut Criterion) {
    let template = RouteTemplate::default();
    let path = "/api/proxy/preview/5b0c2a1e-sandbox/3000/_next/static/chunks/app/page.js";

    c.bench_function("resolve_identity", |b| {
        b.iter(|| black_box(template.resolve(black_box(path)).unwrap()));
    });

    c.bench_function("build_target_url", |b| {
        b.iter(|| {
            black_box(build_target_url(
                black_box("https://3000-sandbox.proxy.daytona.works/"),
                black_box("_next/static/chunks/app/page.js"),
                Some("v=3"),
            ))
        });
    });
}

criterion_group!(benches, bench_rewrite, bench_decode, bench_routing);
criterion_main!(benches);

//! Benchmarks for strata core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strata::core::context::RunContext;
use strata::core::graph::StackGraph;
use strata::core::parser;
use strata::core::template::render_template;
use strata::core::types::StackDef;
use strata::lookups::Field;

fn bench_template_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("template_digest");
    for size in [256, 4096, 65536] {
        let body: String = "Resources: x\n".repeat(size / 13);
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| black_box(strata::provider::digest(black_box(body))));
        });
    }
    group.finish();
}

fn bench_lookup_parse(c: &mut Criterion) {
    let cases = [
        ("literal", "plain text with no lookups"),
        ("single", "${env HOME}"),
        ("args", "${file json:cfg.json::get=a.b, default=x, transform=str}"),
        ("nested", "${output ${var Stack}.${var Output}::default=${env FALLBACK}}"),
        ("mixed", "arn:${var Partition}:s3:::${output bucket.Name}/${env PREFIX}/*"),
    ];
    let mut group = c.benchmark_group("lookup_parse");
    for (name, input) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), input, |b, input| {
            b.iter(|| black_box(Field::parse(black_box(input), 10).unwrap()));
        });
    }
    group.finish();
}

fn bench_yaml_parse(c: &mut Criterion) {
    let yaml = r#"
namespace: bench
environment: dev
region: us-east-1
variables:
  VpcCidr: 10.0.0.0/16
stacks:
  - name: vpc
    template_path: templates/vpc.yaml
    variables: { Cidr: "${var VpcCidr}" }
  - name: db
    template_path: templates/db.yaml
    variables: { Vpc: "${output vpc.VpcId}" }
  - name: app
    template_path: templates/app.yaml
    requires: [db]
    variables:
      Vpc: "${output vpc.VpcId}"
      Db: "${output db.Endpoint}"
    tags: { team: web }
"#;
    c.bench_function("yaml_parse", |b| {
        b.iter(|| black_box(parser::parse_config(black_box(yaml)).unwrap()));
    });
}

fn bench_render_template(c: &mut Criterion) {
    let ctx = RunContext::new("bench", "dev", "us-east-1");
    let mut vars = indexmap::IndexMap::new();
    for i in 0..20 {
        vars.insert(format!("Var{i}"), serde_json::json!(format!("value-{i}")));
    }
    let template: String = (0..20)
        .map(|i| format!("key{i}: {{{{ var.Var{i} }}}} in {{{{ region }}}}\n"))
        .collect();
    c.bench_function("render_template", |b| {
        b.iter(|| black_box(render_template(black_box(&template), &vars, &ctx, "app").unwrap()));
    });
}

fn bench_graph_order(c: &mut Criterion) {
    let ctx = RunContext::new("bench", "dev", "");
    let mut group = c.benchmark_group("graph_order");
    for n in [10, 50, 100] {
        // Layered graph: every node depends on up to three nodes of the previous layer
        let stacks: Vec<StackDef> = (0..n)
            .map(|i| {
                let mut s = StackDef::new(&format!("node-{i:04}"), "outputs: {}");
                let layer = i / 5;
                if layer > 0 {
                    s.requires = (0..3)
                        .map(|k| format!("node-{:04}", (layer - 1) * 5 + (i + k) % 5))
                        .collect();
                }
                s
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &stacks, |b, stacks| {
            b.iter(|| {
                let graph = StackGraph::from_explicit(black_box(stacks), &ctx).unwrap();
                black_box(graph.topological_order().unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_template_digest,
    bench_lookup_parse,
    bench_yaml_parse,
    bench_render_template,
    bench_graph_order
);
criterion_main!(benches);

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxigraph::model::vocab::xsd;
use oxigraph::model::*;
use rsp_approx::approach::DEFAULT_COMBINED_QUERY;
use rsp_approx::orchestrator::decompose;
use rsp_approx::{DecompositionPolicy, RSPEngine};
use std::time::Instant;

const AXES: [(&str, &str); 3] = [("accX", "x"), ("accY", "y"), ("accZ", "z")];

fn reading(axis: &str, property: &str, i: u64) -> Vec<Quad> {
    let subject = NamedNode::new(format!("https://example.org/{axis}/{i}")).unwrap();
    vec![
        Quad::new(
            subject.clone(),
            NamedNode::new("https://saref.etsi.org/core/hasValue").unwrap(),
            Literal::new_typed_literal(format!("{}", i % 17), xsd::DOUBLE),
            GraphName::DefaultGraph,
        ),
        Quad::new(
            subject,
            NamedNode::new("https://saref.etsi.org/core/relatesToProperty").unwrap(),
            NamedNode::new(format!(
                "https://dahcc.idlab.ugent.be/Homelab/SensorsAndActuators/{property}"
            ))
            .unwrap(),
            GraphName::DefaultGraph,
        ),
    ]
}

fn engine_for(queries: &[String]) -> (RSPEngine, Vec<rsp_approx::engine::Registration>) {
    let engine = RSPEngine::new();
    let registrations = queries
        .iter()
        .map(|q| engine.register_query(q).unwrap())
        .collect();
    (engine, registrations)
}

/// Per-event ingestion cost of the combined query against its decomposition,
/// with events spaced so that a window closes every `events_per_step` events.
fn benchmark_decomposition_cost(c: &mut Criterion) {
    let mut group = c.benchmark_group("decomposition_cost");
    group.sample_size(10);

    let combined = vec![DEFAULT_COMBINED_QUERY.to_string()];
    let decomposed: Vec<String> = decompose(DEFAULT_COMBINED_QUERY, &DecompositionPolicy::preserve())
        .unwrap()
        .into_iter()
        .map(|q| q.text)
        .collect();

    for events_per_step in [10u64, 30, 100] {
        let interval = 30_000 / events_per_step as i64;
        for (label, queries) in [("combined", &combined), ("decomposed", &decomposed)] {
            group.bench_with_input(
                BenchmarkId::new(label, events_per_step),
                &events_per_step,
                |b, _| {
                    b.iter_custom(|iters| {
                        let (engine, mut registrations) = engine_for(queries);
                        let streams: Vec<_> = AXES
                            .iter()
                            .map(|(axis, _)| {
                                engine
                                    .get_stream(&format!("mqtt://localhost:1883/{axis}"))
                                    .unwrap()
                            })
                            .collect();

                        let start = Instant::now();
                        for i in 0..iters {
                            let timestamp = i as i64 * interval;
                            for (stream, (axis, property)) in streams.iter().zip(AXES) {
                                stream
                                    .add_quads(black_box(reading(axis, property, i)), timestamp)
                                    .unwrap();
                            }
                        }
                        let elapsed = start.elapsed();

                        for registration in &mut registrations {
                            while registration.results.try_recv().is_ok() {}
                        }
                        elapsed
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, benchmark_decomposition_cost);
criterion_main!(benches);

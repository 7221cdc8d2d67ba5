use rsp_approx::approach::DEFAULT_COMBINED_QUERY;
use rsp_approx::orchestrator::decompose;
use rsp_approx::parsed_query::Projection;
use rsp_approx::{DecompositionPolicy, Orchestrator, RSPEngine, RSPQLParser};

#[test]
fn test_get_sub_queries_preserves_order() {
    let mut orchestrator = Orchestrator::new();
    orchestrator.add_sub_query("q1");
    orchestrator.add_sub_query("q2");
    orchestrator.add_sub_query("q3");

    let texts: Vec<String> = orchestrator
        .get_sub_queries()
        .into_iter()
        .map(|q| q.text)
        .collect();
    assert_eq!(texts, vec!["q1", "q2", "q3"]);
}

#[test]
fn test_registry_accepts_invalid_text() {
    // Syntax is only checked when a query reaches the engine
    let mut orchestrator = Orchestrator::new();
    orchestrator.add_sub_query("SELECT nonsense {");
    assert_eq!(orchestrator.len(), 1);

    let engine = RSPEngine::new();
    let text = &orchestrator.get_sub_queries()[0].text;
    assert!(engine.register_query(text).is_err());
}

#[test]
fn test_decompose_combined_query_per_window() {
    let sub_queries = decompose(DEFAULT_COMBINED_QUERY, &DecompositionPolicy::default()).unwrap();
    assert_eq!(sub_queries.len(), 3);

    let expected = [
        ("https://rsp.jsw1", "mqtt://localhost:1883/accX", "avgX", "o"),
        ("https://rsp.jsw2", "mqtt://localhost:1883/accY", "avgY", "o2"),
        ("https://rsp.jsw3", "mqtt://localhost:1883/accZ", "avgZ", "o3"),
    ];
    for (sub_query, (window, stream, alias, inner)) in sub_queries.iter().zip(expected) {
        let parsed = RSPQLParser::new(sub_query.text.as_str()).parse().unwrap();

        assert_eq!(parsed.s2r.len(), 1);
        assert_eq!(parsed.s2r[0].window_name, window);
        assert_eq!(parsed.s2r[0].stream_name, stream);
        assert_eq!((parsed.s2r[0].width, parsed.s2r[0].slide), (60_000, 60_000));
        assert_eq!(sub_query.windows, parsed.s2r);

        assert_eq!(parsed.projections.len(), 1);
        match &parsed.projections[0] {
            Projection::Aggregate {
                function,
                inner: i,
                alias: a,
                ..
            } => {
                assert_eq!(function, "AVG");
                assert_eq!(i, inner);
                assert_eq!(a, alias);
            }
            other => panic!("unexpected projection {other:?}"),
        }

        assert_eq!(parsed.r2s.name, "output");
        assert!(sub_query.text.contains("PREFIX saref: <https://saref.etsi.org/core/>"));
    }
}

#[test]
fn test_decompose_preserving_window_parameters() {
    let sub_queries = decompose(DEFAULT_COMBINED_QUERY, &DecompositionPolicy::preserve()).unwrap();
    for sub_query in &sub_queries {
        assert_eq!(sub_query.windows[0].width, 120_000);
        assert_eq!(sub_query.windows[0].slide, 30_000);
    }
}

#[test]
fn test_decomposed_queries_register() {
    let orchestrator =
        Orchestrator::from_combined(DEFAULT_COMBINED_QUERY, &DecompositionPolicy::default()).unwrap();
    let engine = RSPEngine::new();
    for sub_query in orchestrator.get_sub_queries() {
        engine.register_query(&sub_query.text).unwrap();
    }
    let mut streams = engine.get_all_streams();
    streams.sort();
    assert_eq!(
        streams,
        vec![
            "mqtt://localhost:1883/accX",
            "mqtt://localhost:1883/accY",
            "mqtt://localhost:1883/accZ",
        ]
    );
}

#[test]
fn test_decompose_rejects_bad_combined_query() {
    let query = "PREFIX ex: <http://example.org/>\nSELECT ?s WHERE { WINDOW ex:w {";
    assert!(decompose(query, &DecompositionPolicy::default()).is_err());
}

#[test]
fn test_window_without_projected_variable_is_skipped() {
    let query = r#"
        PREFIX ex: <http://example.org/>
        REGISTER RStream <out> AS
        SELECT (AVG(?v) AS ?avg)
        FROM NAMED WINDOW ex:w1 ON STREAM ex:s1 [RANGE 1000 STEP 500]
        FROM NAMED WINDOW ex:w2 ON STREAM ex:s2 [RANGE 1000 STEP 500]
        WHERE {
            { WINDOW ex:w1 { ?s ex:value ?v . } }
            UNION
            { WINDOW ex:w2 { ?s ex:label ?label . } }
        }
    "#;
    let sub_queries = decompose(query, &DecompositionPolicy::preserve()).unwrap();
    assert_eq!(sub_queries.len(), 1);
    assert_eq!(sub_queries[0].windows[0].stream_name, "http://example.org/s1");
}

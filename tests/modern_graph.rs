mod common;

use common::{modern_cluster, result_values, sorted};

#[test]
fn scan_counts_vertices_and_edges() {
    let cluster = modern_cluster(1);
    let reply = cluster.submit("g.V().count()").unwrap();
    assert!(!reply.aborted, "{:?}", reply.results);
    assert_eq!(result_values(&reply.results), vec!["6"]);

    let reply = cluster.submit("g.E().count()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["6"]);
}

#[test]
fn scan_counts_across_two_workers() {
    let cluster = modern_cluster(2);
    let reply = cluster.submit("g.V().count()").unwrap();
    assert!(!reply.aborted, "{:?}", reply.results);
    assert_eq!(result_values(&reply.results), vec!["6"]);

    let reply = cluster.submit("g.E().count()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["6"]);
}

#[test]
fn marko_knows_vadas_and_josh() {
    // end-to-end scenario 1
    for workers in [1, 2] {
        let cluster = modern_cluster(workers);
        let reply = cluster
            .submit("g.V().has(\"name\", \"marko\").out(\"knows\").values(\"name\")")
            .unwrap();
        assert!(!reply.aborted, "{:?}", reply.results);
        assert_eq!(
            sorted(result_values(&reply.results)),
            vec!["josh", "vadas"]
        );
    }
}

#[test]
fn out_dedup_count_is_four() {
    // end-to-end scenario 5: distinct destinations over all out-edges
    for workers in [1, 2] {
        let cluster = modern_cluster(workers);
        let reply = cluster.submit("g.V().out().dedup().count()").unwrap();
        assert!(!reply.aborted, "{:?}", reply.results);
        assert_eq!(result_values(&reply.results), vec!["4"]);
    }
}

#[test]
fn has_label_and_predicates() {
    let cluster = modern_cluster(2);
    let reply = cluster.submit("g.V().hasLabel(\"person\").count()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["4"]);

    let reply = cluster
        .submit("g.V().has(\"age\", gt(30)).values(\"name\")")
        .unwrap();
    assert_eq!(
        sorted(result_values(&reply.results)),
        vec!["josh", "peter"]
    );

    let reply = cluster
        .submit("g.V().has(\"age\", inside(27, 35)).values(\"name\")")
        .unwrap();
    assert_eq!(
        sorted(result_values(&reply.results)),
        vec!["josh", "marko"]
    );

    let reply = cluster.submit("g.V().hasNot(\"age\").count()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["2"]);

    let reply = cluster.submit("g.V().hasKey(\"lang\").count()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["2"]);
}

#[test]
fn values_and_is_filter() {
    let cluster = modern_cluster(1);
    let reply = cluster
        .submit("g.V().values(\"age\").is(gte(30))")
        .unwrap();
    assert_eq!(sorted(result_values(&reply.results)), vec!["32", "35"]);
}

#[test]
fn order_ascending_and_descending() {
    let cluster = modern_cluster(2);
    let reply = cluster.submit("g.V().values(\"age\").order()").unwrap();
    assert_eq!(
        result_values(&reply.results),
        vec!["27", "29", "32", "35"]
    );

    let reply = cluster
        .submit("g.V().values(\"age\").order(decr)")
        .unwrap();
    assert_eq!(
        result_values(&reply.results),
        vec!["35", "32", "29", "27"]
    );

    // keyed ordering mid-chain: single worker so the downstream hop keeps
    // the emitted order
    let cluster = modern_cluster(1);
    let reply = cluster
        .submit("g.V().hasLabel(\"person\").order(\"age\").values(\"name\")")
        .unwrap();
    assert_eq!(
        result_values(&reply.results),
        vec!["vadas", "marko", "josh", "peter"]
    );
}

#[test]
fn range_boundaries() {
    let cluster = modern_cluster(1);
    // range(0, -1) returns all
    let reply = cluster
        .submit("g.V().values(\"age\").order().range(0, -1)")
        .unwrap();
    assert_eq!(result_values(&reply.results).len(), 4);

    // n > m returns empty
    let reply = cluster
        .submit("g.V().values(\"age\").order().range(3, 1)")
        .unwrap();
    assert!(result_values(&reply.results).is_empty());

    let reply = cluster
        .submit("g.V().values(\"age\").order().limit(2)")
        .unwrap();
    assert_eq!(result_values(&reply.results), vec!["27", "29"]);

    let reply = cluster
        .submit("g.V().values(\"age\").order().skip(3)")
        .unwrap();
    assert_eq!(result_values(&reply.results), vec!["35"]);
}

#[test]
fn coin_boundaries() {
    let cluster = modern_cluster(1);
    let reply = cluster.submit("g.V().coin(1.0).count()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["6"]);
    let reply = cluster.submit("g.V().coin(0.0).count()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["0"]);
}

#[test]
fn math_aggregations() {
    let cluster = modern_cluster(2);
    let reply = cluster.submit("g.V().values(\"age\").sum()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["123"]);
    let reply = cluster.submit("g.V().values(\"age\").max()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["35"]);
    let reply = cluster.submit("g.V().values(\"age\").min()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["27"]);
    let reply = cluster.submit("g.V().values(\"age\").mean()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["30.75"]);
}

#[test]
fn group_and_group_count() {
    let cluster = modern_cluster(1);
    let reply = cluster.submit("g.V().groupCount(\"label\")").unwrap();
    let values = sorted(result_values(&reply.results));
    assert_eq!(values, vec!["1:4", "2:2"]);

    let reply = cluster.submit("g.V().group(\"lang\", \"name\")").unwrap();
    let values = result_values(&reply.results);
    assert_eq!(values.len(), 1);
    assert!(values[0].starts_with("java:["), "{values:?}");
    assert!(values[0].contains("lop") && values[0].contains("ripple"));
}

#[test]
fn union_merges_subtraversals() {
    for workers in [1, 2] {
        let cluster = modern_cluster(workers);
        let reply = cluster
            .submit(
                "g.V().has(\"name\", \"marko\").union(out(\"knows\"), out(\"created\")).values(\"name\")",
            )
            .unwrap();
        assert!(!reply.aborted, "{:?}", reply.results);
        assert_eq!(
            sorted(result_values(&reply.results)),
            vec!["josh", "lop", "vadas"]
        );
    }
}

#[test]
fn repeat_acts_as_single_round_union() {
    let cluster = modern_cluster(1);
    let reply = cluster
        .submit("g.V().has(\"name\", \"marko\").repeat(out(\"knows\")).values(\"name\")")
        .unwrap();
    assert_eq!(
        sorted(result_values(&reply.results)),
        vec!["josh", "vadas"]
    );
}

#[test]
fn where_subquery_filters_inputs() {
    for workers in [1, 2] {
        let cluster = modern_cluster(workers);
        // people who know someone
        let reply = cluster
            .submit("g.V().where(out(\"knows\")).values(\"name\")")
            .unwrap();
        assert_eq!(sorted(result_values(&reply.results)), vec!["marko"]);

        // not(): vertices without outgoing edges at all
        let reply = cluster
            .submit("g.V().not(out()).values(\"name\")")
            .unwrap();
        assert_eq!(
            sorted(result_values(&reply.results)),
            vec!["lop", "ripple", "vadas"]
        );
    }
}

#[test]
fn and_or_branch_filters() {
    let cluster = modern_cluster(1);
    let reply = cluster
        .submit("g.V().and(out(\"knows\"), out(\"created\")).values(\"name\")")
        .unwrap();
    assert_eq!(sorted(result_values(&reply.results)), vec!["marko"]);

    let reply = cluster
        .submit("g.V().or(out(\"knows\"), out(\"created\")).values(\"name\")")
        .unwrap();
    assert_eq!(
        sorted(result_values(&reply.results)),
        vec!["josh", "marko", "peter"]
    );
}

#[test]
fn as_and_where_history_predicate() {
    let cluster = modern_cluster(1);
    // neighbors of marko other than marko itself
    let reply = cluster
        .submit("g.V().as(\"a\").out(\"knows\").where(neq(\"a\")).values(\"name\")")
        .unwrap();
    assert_eq!(
        sorted(result_values(&reply.results)),
        vec!["josh", "vadas"]
    );
}

#[test]
fn as_select_restores_step() {
    let cluster = modern_cluster(1);
    let reply = cluster
        .submit("g.V().has(\"name\", \"marko\").as(\"a\").out(\"knows\").select(\"a\").dedup().count()")
        .unwrap();
    assert_eq!(result_values(&reply.results), vec!["1"]);
}

#[test]
fn aggregate_cap_round_trip() {
    let cluster = modern_cluster(1);
    let reply = cluster
        .submit("g.V().hasLabel(\"software\").values(\"name\").aggregate(\"x\").cap(\"x\")")
        .unwrap();
    let values = result_values(&reply.results);
    assert_eq!(values.len(), 1);
    assert!(values[0].starts_with("x:["), "{values:?}");
    assert!(values[0].contains("lop") && values[0].contains("ripple"));
}

#[test]
fn traversal_edge_hops() {
    let cluster = modern_cluster(2);
    let reply = cluster
        .submit("g.V().has(\"name\", \"marko\").outE(\"knows\").inV().values(\"name\")")
        .unwrap();
    assert_eq!(
        sorted(result_values(&reply.results)),
        vec!["josh", "vadas"]
    );

    let reply = cluster
        .submit("g.V().has(\"name\", \"lop\").in(\"created\").values(\"name\")")
        .unwrap();
    assert_eq!(
        sorted(result_values(&reply.results)),
        vec!["josh", "marko", "peter"]
    );

    let reply = cluster
        .submit("g.V().has(\"name\", \"vadas\").both().values(\"name\")")
        .unwrap();
    assert_eq!(sorted(result_values(&reply.results)), vec!["marko"]);
}

#[test]
fn edge_scan_and_properties() {
    let cluster = modern_cluster(1);
    let reply = cluster
        .submit("g.E().has(\"weight\", eq(1.0)).count()")
        .unwrap();
    assert_eq!(result_values(&reply.results), vec!["2"]);

    let reply = cluster.submit("g.E().hasLabel(\"knows\").count()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["2"]);

    let reply = cluster
        .submit("g.V().has(\"name\", \"marko\").properties(\"name\")")
        .unwrap();
    let values = result_values(&reply.results);
    assert_eq!(values.len(), 1);
    assert!(values[0].contains("name:marko"), "{values:?}");
}

#[test]
fn label_and_key_projections() {
    let cluster = modern_cluster(1);
    let reply = cluster
        .submit("g.V().has(\"name\", \"lop\").label()")
        .unwrap();
    assert_eq!(result_values(&reply.results), vec!["software"]);

    let reply = cluster
        .submit("g.V().has(\"name\", \"vadas\").key()")
        .unwrap();
    assert_eq!(
        sorted(result_values(&reply.results)),
        vec!["age", "name"]
    );
}

#[test]
fn parse_errors_reach_the_client() {
    let cluster = modern_cluster(1);
    let reply = cluster.submit("g.V().has(\"nickname\", \"x\")").unwrap();
    assert!(reply.aborted);
    assert!(reply.results[0].contains("unexpected key"), "{:?}", reply.results);

    let reply = cluster.submit("g.X().count()").unwrap();
    assert!(reply.aborted);
}

#[test]
fn build_index_then_query() {
    let cluster = modern_cluster(2);
    let reply = cluster.submit("BuildIndex(V, \"name\")").unwrap();
    assert!(!reply.aborted, "{:?}", reply.results);

    // push-down happens on the worker that built its local index; results
    // must match the scan either way
    let reply = cluster
        .submit("g.V().has(\"name\", \"marko\").out(\"knows\").values(\"name\")")
        .unwrap();
    assert_eq!(
        sorted(result_values(&reply.results)),
        vec!["josh", "vadas"]
    );
}

#[test]
fn set_config_toggles_flags() {
    let cluster = modern_cluster(1);
    let reply = cluster.submit("SetConfig(\"step_reorder\", \"false\")").unwrap();
    assert!(!reply.aborted, "{:?}", reply.results);
    let reply = cluster.submit("g.V().order().hasLabel(\"person\").count()").unwrap();
    assert_eq!(result_values(&reply.results), vec!["4"]);
}

#[test]
fn multi_line_transaction_with_placeholder() {
    let cluster = modern_cluster(2);
    let reply = cluster
        .submit("x = g.V().has(\"name\", \"marko\").out(\"knows\"); g.V(x).values(\"name\")")
        .unwrap();
    assert!(!reply.aborted, "{:?}", reply.results);
    let values = result_values(&reply.results);
    // both the defining line's and the consuming line's values appear
    assert_eq!(values.iter().filter(|v| *v == "josh").count(), 1);
    assert_eq!(values.iter().filter(|v| *v == "vadas").count(), 1);
}

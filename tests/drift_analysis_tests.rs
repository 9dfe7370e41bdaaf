// Static analysis end to end through the library API: call-site extraction,
// graph construction over revision history and signature drift verdicts.

use chrono::{DateTime, TimeZone, Utc};
use fansy_tracer::analyzer::{analyze, definitions_from_rows};
use fansy_tracer::config::AnalysisConfig;
use fansy_tracer::dependency_graph::{DependencyGraph, Direction};
use fansy_tracer::drift::{Confidence, DriftKind};
use fansy_tracer::error_log::{correlate, parse_log, ErrorKind};
use fansy_tracer::extractor::{extract, Arity};
use fansy_tracer::function_def::{FunctionDefinition, FunctionId, Parameter, StoredFunctionRow};
use fansy_tracer::signature::SignatureHistory;

fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn def(module: &str, name: &str, params: usize, body: &str, at: DateTime<Utc>) -> FunctionDefinition {
    FunctionDefinition::new(
        FunctionId::new(module, name),
        (0..params).map(|i| Parameter::required(format!("p{}", i))).collect(),
        body,
        at,
    )
}

fn args(n: usize) -> String {
    (0..n).map(|i| format!("a{}", i)).collect::<Vec<_>>().join(", ")
}

// ============================================================================
// Extraction
// ============================================================================

#[test]
fn test_nested_calls_counted_at_their_own_level() {
    let sites: Vec<_> = extract("x := Foo(a, b, Bar(c, d), e);").collect();
    assert_eq!(sites.len(), 2);
    assert_eq!((sites[0].callee.as_str(), sites[0].arity), ("Foo", Arity::Resolved(4)));
    assert_eq!((sites[1].callee.as_str(), sites[1].arity), ("Bar", Arity::Resolved(2)));
    assert_eq!(sites[0].ordinal, 0);
    assert_eq!(sites[1].ordinal, 1);
}

#[test]
fn test_strings_and_comments_hide_calls() {
    let body = "\
// Old_Call(1, 2)
msg := 'Fake(1, 2, 3)';
/* Gone(
   x) */
Real(\"a, b\", c);";
    let sites: Vec<_> = extract(body).collect();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].callee, "Real");
    assert_eq!(sites[0].arity, Arity::Resolved(2));
    assert_eq!(sites[0].line, 5);
}

#[test]
fn test_unbalanced_call_is_unresolved_not_guessed() {
    let sites: Vec<_> = extract("Foo(a, b").collect();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].arity, Arity::Unresolved);
    assert!(!sites[0].is_resolved());
}

#[test]
fn test_qualified_call_and_cyrillic_name() {
    let sites: Vec<_> = extract("_F_BUX->Get_Rate(%d); Расчет_НДФЛ(x, y);").collect();
    assert_eq!(sites[0].target(), "_F_BUX->Get_Rate");
    assert_eq!(sites[1].callee, "Расчет_НДФЛ");
    assert_eq!(sites[1].arity, Arity::Resolved(2));
}

// ============================================================================
// Drift verdicts
// ============================================================================

#[test]
fn test_nine_declared_eight_passed_without_history_is_definite() {
    let at = day(2025, 11, 1);
    let defs = vec![
        def("_F_NDFL", "Get_NDFL_Nach", 9, "", day(2025, 10, 1)),
        def("_F_DOC", "Post_Doc", 0, &format!("Get_NDFL_Nach({});", args(8)), at),
    ];
    let report = analyze(&defs, &AnalysisConfig::default(), at);

    assert_eq!(report.findings.len(), 1);
    let finding = &report.findings[0];
    assert_eq!(finding.confidence, Confidence::Definite);
    assert_eq!(finding.kind, DriftKind::MissingRequired);
    assert_eq!(finding.found, Some(8));
    assert_eq!(finding.required, Some(9));
    assert!(report.has_definite());
}

#[test]
fn test_signature_change_with_stale_caller_is_heuristic() {
    let at = day(2025, 11, 1);
    let defs = vec![
        def("_F_NDFL", "Get_NDFL_Nach", 8, "", day(2020, 1, 1)),
        def("_F_NDFL", "Get_NDFL_Nach", 9, "", day(2025, 10, 1)),
        def("_F_DOC", "Post_Doc", 0, &format!("Get_NDFL_Nach({});", args(8)), day(2024, 1, 1)),
    ];
    let report = analyze(&defs, &AnalysisConfig::default(), at);

    assert_eq!(report.findings.len(), 1);
    let finding = &report.findings[0];
    assert_eq!(finding.confidence, Confidence::Heuristic);
    assert_eq!(finding.kind, DriftKind::StaleSignature);
    assert_eq!(finding.previous, Some(8));
    assert_eq!(finding.declared, Some(9));

    // Before the change the same call was fine
    let earlier = analyze(&defs, &AnalysisConfig::default(), day(2025, 9, 30));
    assert!(earlier.findings.is_empty());
}

#[test]
fn test_optional_parameters_widen_accepted_range() {
    let at = day(2025, 1, 1);
    let rate = FunctionDefinition::new(
        FunctionId::new("_F_BUX", "Get_Rate"),
        vec![Parameter::required("date"), Parameter::optional("currency")],
        "",
        at,
    );
    let caller = def("_F_DOC", "Doc", 0, "Get_Rate(d); Get_Rate(d, c); Get_Rate(d, c, x);", at);
    let report = analyze(&[rate, caller], &AnalysisConfig::default(), at);

    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].kind, DriftKind::ExcessArguments);
    assert_eq!(report.findings[0].ordinal, 2);
}

#[test]
fn test_unbalanced_site_to_known_callee_is_indeterminate() {
    let at = day(2025, 1, 1);
    let defs = vec![
        def("M", "Target", 2, "", at),
        def("M", "Broken", 0, "Target(a, Other(b", at),
    ];
    let report = analyze(&defs, &AnalysisConfig::default(), at);

    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].confidence, Confidence::Indeterminate);
    assert_eq!(report.findings[0].found, None);
    assert_eq!(report.needs_review, vec![FunctionId::new("M", "Broken")]);
    assert_eq!(report.graph.external_calls().get("Other"), Some(&1));
}

#[test]
fn test_unqualified_external_callees_never_produce_findings() {
    let at = day(2025, 1, 1);
    let defs = vec![def("M", "Doc", 0, "ROUND(x, 2); Trim(s);", at)];
    let report = analyze(&defs, &AnalysisConfig::default(), at);

    assert!(report.findings.is_empty());
    assert_eq!(report.graph.edge_count(), 0);
    assert_eq!(report.graph.external_calls().len(), 2);
}

#[test]
fn test_qualified_missing_callee_is_reported() {
    let at = day(2025, 1, 1);
    let defs = vec![def("M", "Doc", 0, "ROUND(x, 2); _F_MISSING->Foo(1);", at)];
    let report = analyze(&defs, &AnalysisConfig::default(), at);

    assert_eq!(report.findings.len(), 1);
    let finding = &report.findings[0];
    assert_eq!(finding.kind, DriftKind::UnknownCallee);
    assert_eq!(finding.confidence, Confidence::Indeterminate);
    assert_eq!(finding.callee, FunctionId::new("_F_MISSING", "Foo"));
    assert_eq!(finding.ordinal, 1);
    // still counted as an external target, never an edge
    assert_eq!(report.graph.edge_count(), 0);
    assert_eq!(report.graph.external_calls().get("_F_MISSING->Foo"), Some(&1));
}

#[test]
fn test_trailing_comma_does_not_count_as_argument() {
    let at = day(2025, 1, 1);
    let defs = vec![
        def("M", "Target", 2, "", at),
        def("M", "Caller", 0, "Target(a, b,);", at),
    ];
    let report = analyze(&defs, &AnalysisConfig::default(), at);
    assert!(report.findings.is_empty());
}

// ============================================================================
// Graph
// ============================================================================

#[test]
fn test_mutual_recursion_is_one_cycle() {
    let at = day(2025, 1, 1);
    let defs = vec![
        def("M", "A", 1, "B(x);", at),
        def("M", "B", 1, "A(x); C(x);", at),
        def("M", "C", 1, "", at),
    ];
    let report = analyze(&defs, &AnalysisConfig::default(), at);
    assert_eq!(
        report.cycles,
        vec![vec![FunctionId::new("M", "A"), FunctionId::new("M", "B")]]
    );

    let capped = analyze(
        &defs,
        &AnalysisConfig {
            max_cycle_len: 1,
            ..AnalysisConfig::default()
        },
        at,
    );
    assert!(capped.cycles.is_empty());
}

#[test]
fn test_rebuild_is_identical() {
    let at = day(2025, 1, 1);
    let defs = vec![
        def("M", "A", 0, "B(); C(); B();", at),
        def("M", "B", 0, "C();", at),
        def("N", "C", 0, "Ext(1);", at),
    ];
    let first = DependencyGraph::build(&defs, at);
    let second = DependencyGraph::build(defs.iter().rev(), at);

    let edges = |g: &DependencyGraph| -> Vec<(String, String, usize)> {
        g.edges()
            .map(|e| (e.caller.to_string(), e.callee.to_string(), e.count))
            .collect()
    };
    assert_eq!(edges(&first), edges(&second));
    assert_eq!(first.stats(), second.stats());
    assert_eq!(first.edge(&FunctionId::new("M", "A"), &FunctionId::new("M", "B")).unwrap().count, 2);
}

#[test]
fn test_focus_neighbourhood_and_call_path() {
    let at = day(2025, 1, 1);
    let defs = vec![
        def("M", "Top", 0, "Mid();", at),
        def("M", "Mid", 0, "Leaf();", at),
        def("M", "Leaf", 0, "", at),
        def("M", "Lonely", 0, "", at),
    ];
    let graph = DependencyGraph::build(&defs, at);
    let mid = FunctionId::new("M", "Mid");

    let info = graph.function_info(&mid).unwrap();
    assert_eq!((info.in_degree, info.out_degree), (1, 1));

    let path = graph
        .call_path(&FunctionId::new("M", "Top"), &FunctionId::new("M", "Leaf"))
        .unwrap();
    assert_eq!(path.len(), 3);
    assert!(graph
        .call_path(&FunctionId::new("M", "Leaf"), &FunctionId::new("M", "Top"))
        .is_none());

    let down = graph.subgraph(&mid, 1, Direction::Forward);
    assert_eq!(down.node_count(), 2);
    assert_eq!(graph.isolated(), vec![&FunctionId::new("M", "Lonely")]);
}

#[test]
fn test_signature_history_collapses_body_only_revisions() {
    let defs = vec![
        def("M", "F", 2, "v1", day(2020, 1, 1)),
        def("M", "F", 2, "v2", day(2021, 1, 1)),
        def("M", "F", 3, "v3", day(2022, 1, 1)),
    ];
    let history = SignatureHistory::from_definitions(&defs);
    let f = FunctionId::new("M", "F");
    assert_eq!(history.versions(&f).len(), 2);
    assert_eq!(history.current(&f, day(2023, 1, 1)).unwrap().param_count, 3);
    assert_eq!(history.previous(&f, day(2023, 1, 1)).unwrap().param_count, 2);
    assert!(history.current(&f, day(2019, 1, 1)).is_none());
}

// ============================================================================
// Raw rows and error log
// ============================================================================

#[test]
fn test_rows_with_malformed_heads_are_skipped() {
    let at = day(2025, 1, 1);
    let rows = vec![
        StoredFunctionRow {
            module: "_F_BUX".to_string(),
            head: "// Get_Rate(%date:DATE, %currency:STRING)".to_string(),
            body: String::new(),
            revised_at: at,
            editor: None,
        },
        StoredFunctionRow {
            module: "_F_BUX".to_string(),
            head: "no header here".to_string(),
            body: String::new(),
            revised_at: at,
            editor: None,
        },
    ];
    let (defs, errors) = definitions_from_rows(&rows);
    assert_eq!(defs.len(), 1);
    assert_eq!(errors.len(), 1);
    assert_eq!(defs[0].param_count(), 2);
}

#[test]
fn test_row_with_call_default_drives_drift() {
    let at = day(2025, 1, 1);
    let rows = vec![StoredFunctionRow {
        module: "_F_BUX".to_string(),
        head: "// Get_Rate(%date:DATE=Today(), %currency:STRING='RUB, EUR')".to_string(),
        body: String::new(),
        revised_at: at,
        editor: None,
    }];
    let (mut defs, errors) = definitions_from_rows(&rows);
    assert!(errors.is_empty());
    assert_eq!(defs[0].param_count(), 2);
    assert_eq!(defs[0].required_count(), 0);

    defs.push(def("_F_DOC", "Post_Doc", 0, "_F_BUX->Get_Rate(); _F_BUX->Get_Rate(d, c, x);", at));
    let report = analyze(&defs, &AnalysisConfig::default(), at);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].kind, DriftKind::ExcessArguments);
    assert_eq!(report.findings[0].ordinal, 1);
}

#[test]
fn test_error_log_points_at_drifted_callee() {
    let at = day(2025, 11, 1);
    let defs = vec![
        def("_F_NDFL", "Get_NDFL_Nach", 8, "", day(2020, 1, 1)),
        def("_F_NDFL", "Get_NDFL_Nach", 9, "", day(2025, 10, 1)),
        def("_F_DOC", "Post_Doc", 0, &format!("Get_NDFL_Nach({});", args(8)), day(2024, 1, 1)),
    ];
    let report = analyze(&defs, &AnalysisConfig::default(), at);

    let log = "Ошибка: Не все входные параметры означены при вызове функции GET_NDFL_NACH строка 12\n";
    let entries = parse_log(log);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, ErrorKind::ParamNotDefined);

    let correlations = correlate(&entries, &report.findings);
    assert_eq!(correlations.len(), 1);
    assert_eq!(correlations[0].findings.len(), 1);
    assert_eq!(correlations[0].findings[0].kind, DriftKind::StaleSignature);
}

use super::{compile_template, RouteError};

#[test]
fn test_root_path() {
    let p = compile_template("/").unwrap();
    assert!(p.is_match("/"));
    assert!(p.param_names().is_empty());
}

#[test]
fn test_parameterized_path() {
    let p = compile_template("/items/:id").unwrap();
    assert!(p.is_match("/items/123"));
    assert!(!p.is_match("/items/123/456"));
    assert_eq!(p.param_names().len(), 1);
    assert_eq!(p.param_names()[0].as_ref(), "id");
}

#[test]
fn test_nested_path() {
    let p = compile_template("/a/:b/c").unwrap();
    let params = p.matches("/a/1/c").unwrap();
    assert_eq!(params[0].1, "1");
    assert!(!p.is_match("/a/1/d"));
}

#[test]
fn test_trailing_separator_tolerated() {
    let p = compile_template("/api/instances").unwrap();
    assert!(p.is_match("/api/instances"));
    assert!(p.is_match("/api/instances/"));
    assert!(!p.is_match("/api/instances//"));
}

#[test]
fn test_literal_segment_count_must_match() {
    let p = compile_template("/a/b/c").unwrap();
    assert!(p.is_match("/a/b/c"));
    assert!(!p.is_match("/a/b"));
    assert!(!p.is_match("/a/b/c/d"));
    assert!(!p.is_match("/a/x/c"));
}

#[test]
fn test_greedy_spans_separators() {
    let p = compile_template("/a/:x*").unwrap();
    let params = p.matches("/a/b/c/d").unwrap();
    assert_eq!(params[0].0.as_ref(), "x");
    assert_eq!(params[0].1, "b/c/d");
    assert!(!p.is_match("/a"));
}

#[test]
fn test_greedy_excludes_trailing_separator() {
    let p = compile_template("/buckets/:name/objects/:object*").unwrap();
    let params = p.matches("/buckets/b1/objects/dir/file.txt/").unwrap();
    assert_eq!(params[1].1, "dir/file.txt");
}

#[test]
fn test_optional_parameter_absent_and_present() {
    let p = compile_template("/a/:x?/b").unwrap();
    let absent = p.matches("/a/b").unwrap();
    assert!(absent.is_empty());
    let present = p.matches("/a/foo/b").unwrap();
    assert_eq!(present[0].1, "foo");
}

#[test]
fn test_optional_greedy() {
    let p = compile_template("/mdb/:instance/parameters/:name*?").unwrap();
    assert_eq!(p.matches("/mdb/simulator/parameters").unwrap().len(), 1);
    let params = p.matches("/mdb/simulator/parameters/YSS/SIMULATOR/BatteryVoltage1").unwrap();
    assert_eq!(params[1].1, "YSS/SIMULATOR/BatteryVoltage1");
}

#[test]
fn test_captures_are_percent_decoded() {
    let p = compile_template("/objects/:name").unwrap();
    let params = p.matches("/objects/my%20file").unwrap();
    assert_eq!(params[0].1, "my file");
}

#[test]
fn test_literals_are_escaped() {
    let p = compile_template("/files/report.csv").unwrap();
    assert!(p.is_match("/files/report.csv"));
    assert!(!p.is_match("/files/reportXcsv"));
}

#[test]
fn test_non_final_greedy_is_rejected() {
    let err = compile_template("/a/:rest*/b").unwrap_err();
    assert!(matches!(err, RouteError::NonFinalGreedy { ref name, .. } if name == "rest"));
}

#[test]
fn test_duplicate_parameter_is_rejected() {
    let err = compile_template("/a/:id/b/:id").unwrap_err();
    assert!(matches!(err, RouteError::DuplicateParameter { .. }));
}

#[test]
fn test_malformed_templates() {
    for t in ["api/no/leading", "/a//b", "/a/:", "/a/:9bad"] {
        let err = compile_template(t).unwrap_err();
        assert!(matches!(err, RouteError::Malformed { .. }), "{t}: {err:?}");
    }
}

#[test]
fn test_literal_len_orders_specificity() {
    let generic = compile_template("/things/:id").unwrap();
    let special = compile_template("/things/special").unwrap();
    assert!(special.literal_len() > generic.literal_len());
}

#[test]
fn test_shape_ignores_parameter_names() {
    let by_id = compile_template("/things/:id/parts/:rest*").unwrap();
    let by_name = compile_template("/things/:name/parts/:path*").unwrap();
    assert_ne!(by_id.as_str(), by_name.as_str());
    assert_eq!(by_id.shape(), by_name.shape());
    assert_eq!(by_id.shape(), "/things/:/parts/:*");

    let optional = compile_template("/things/:id?").unwrap();
    assert_ne!(optional.shape(), compile_template("/things/:id").unwrap().shape());
}

use std::fs;
use std::thread;

use pgtmpl::{
    Error, EvalErrorKind, FuncError, FuncMap, MemFs, Query, QueryView, Template, Value, must,
    parse_files, parse_fs, parse_glob,
};
use serde::Serialize;
use serde_json::json;

// ── Helpers ─────────────────────────────────────────────────────────────

const ZEROTIME: &str = "COALESCE({{ . }}::timestamp, '0001-01-01 00:00:00'::timestamp)";
const NULLTIME: &str = "NULLIF({{ . }}, '0001-01-01 00:00:00'::timestamp)";
const ZEROUUID: &str = "COALESCE({{ . }}::uuid, '00000000-0000-0000-0000-000000000000'::uuid)";
const NULLUUID: &str = "NULLIF({{ . }}, '00000000-0000-0000-0000-000000000000'::uuid)";
const UPSERT: &str = r#"INSERT INTO author(id, created) VALUES({{template "nulluuid" (bind .ID)}}, {{template "nulltime" (bind .Created)}}) RETURNING {{template "zerouuid" "id"}}, {{template "zerotime" "created"}}"#;

const UPSERT_SQL: &str = "INSERT INTO author(id, created) VALUES(\
    NULLIF($1, '00000000-0000-0000-0000-000000000000'::uuid), \
    NULLIF($2, '0001-01-01 00:00:00'::timestamp)) \
    RETURNING COALESCE(id::uuid, '00000000-0000-0000-0000-000000000000'::uuid), \
    COALESCE(created::timestamp, '0001-01-01 00:00:00'::timestamp)";

const AUTHOR_ID: &str = "553d6085-0b28-4f2c-a018-d0f34b03b9e7";
const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

fn upsert_data() -> serde_json::Value {
    json!({"ID": AUTHOR_ID, "Created": ZERO_TIME})
}

fn assert_upsert(q: &Query) {
    assert_eq!(q.as_str(), UPSERT_SQL);
    assert_eq!(q.args(), &[Value::from(AUTHOR_ID), Value::from(ZERO_TIME)]);
}

fn upsert_files() -> [(&'static str, &'static str); 5] {
    [
        ("zerotime", ZEROTIME),
        ("nulltime", NULLTIME),
        ("zerouuid", ZEROUUID),
        ("nulluuid", NULLUUID),
        ("0_upsert", UPSERT),
    ]
}

// ── Binding ─────────────────────────────────────────────────────────────

#[test]
fn test_in_list_with_trimmed_range() {
    let tpl = must(Template::new("author_by_id").parse(
        "SELECT * FROM author WHERE id IN(
                {{- range $i, $v := . }}
                    {{- if $i}},{{end}}
                    {{- bind $v}}
                {{- end -}}
            )",
    ));

    let mut q = Query::new();
    tpl.execute(&mut q, &[100, 12, 334]).unwrap();
    assert_eq!(q.as_str(), "SELECT * FROM author WHERE id IN($1,$2,$3)");
    assert_eq!(q.args(), &[Value::Int(100), Value::Int(12), Value::Int(334)]);
    assert_eq!(q.name(), "author_by_id");
}

#[test]
fn test_placeholder_count_matches_arguments() {
    let tpl = Template::new("many")
        .parse("{{range .}}{{bind .}} {{end}}")
        .unwrap();
    let data: Vec<i64> = (0..5000).collect();

    let mut q = Query::new();
    tpl.execute(&mut q, &data).unwrap();
    let tokens: Vec<&str> = q.as_str().split_whitespace().collect();
    assert_eq!(tokens.len(), q.args().len());
    for (i, token) in tokens.iter().enumerate() {
        assert_eq!(*token, format!("${}", i + 1));
    }
    assert_eq!(tokens[4999], "$5000");
}

#[test]
fn test_chained_executions() {
    let root = Template::new("root");
    let q1 = root.new_template("Q1").parse("SELECT 1, {{bind .}}").unwrap();
    let q2 = root.new_template("Q2").parse("SELECT 2, {{bind .}}").unwrap();

    let mut q = Query::new();
    q1.execute(&mut q, &1).unwrap();
    q2.execute(&mut q, &2).unwrap();
    assert_eq!(q.as_str(), "SELECT 1, $1;SELECT 2, $2");
    assert_eq!(q.args(), &[Value::Int(1), Value::Int(2)]);
    assert_eq!(q.name(), "Q2");
}

#[test]
fn test_reset_between_executions() {
    let root = Template::new("root");
    let q1 = root.new_template("Q1").parse("SELECT 1, {{bind .}}").unwrap();
    let q2 = root.new_template("Q2").parse("SELECT 2, {{bind .}}").unwrap();

    let mut q = Query::new();
    q1.execute(&mut q, &1).unwrap();
    q.reset();
    assert!(q.is_empty());
    assert!(q.args().is_empty());
    assert_eq!(q.name(), "");

    q2.execute(&mut q, &2).unwrap();
    assert_eq!(q.as_str(), "SELECT 2, $1");
    assert_eq!(q.args(), &[Value::Int(2)]);
}

#[test]
fn test_execute_template_by_name() {
    let root = Template::new("root");
    root.new_template("Q1").parse("SELECT 1, {{bind .}}").unwrap();

    let mut q = Query::new();
    root.execute_template(&mut q, "Q1", &7).unwrap();
    assert_eq!(q.as_str(), "SELECT 1, $1");
    assert_eq!(q.name(), "Q1");
}

#[test]
fn test_unknown_template_leaves_query_unchanged() {
    let root = Template::new("root").parse("SELECT {{bind .}}").unwrap();
    let mut q = Query::new();
    root.execute(&mut q, &1).unwrap();

    let err = root.execute_template(&mut q, "missing", &2).unwrap_err();
    assert!(matches!(err, Error::UnknownTemplate { ref name, ref root } if name == "missing" && root == "root"));
    assert_eq!(q.as_str(), "SELECT $1");
    assert_eq!(q.args(), &[Value::Int(1)]);
}

#[test]
fn test_struct_data() {
    #[derive(Serialize)]
    struct Filter<'a> {
        name: &'a str,
        tags: Vec<&'a str>,
    }

    let tpl = Template::new("filter")
        .parse(
            "SELECT id FROM post WHERE author = {{bind .name}}\
             {{with .tags}} AND tag IN({{range $i, $t := .}}{{if $i}}, {{end}}{{bind $t}}{{end}}){{end}}",
        )
        .unwrap();

    let mut q = Query::new();
    tpl.execute(&mut q, &Filter { name: "ann", tags: vec!["a", "b"] }).unwrap();
    assert_eq!(q.as_str(), "SELECT id FROM post WHERE author = $1 AND tag IN($2, $3)");

    q.reset();
    tpl.execute(&mut q, &Filter { name: "ann", tags: vec![] }).unwrap();
    assert_eq!(q.as_str(), "SELECT id FROM post WHERE author = $1");
    assert_eq!(q.args().len(), 1);
}

#[test]
fn test_bound_numbers_are_not_coerced() {
    let tpl = Template::new("q").parse("SELECT {{bind .}}").unwrap();

    let mut q = Query::new();
    tpl.execute(&mut q, &18_446_744_073_709_551_557u64).unwrap();
    assert_eq!(q.args(), &[Value::UInt(18_446_744_073_709_551_557)]);

    q.reset();
    tpl.execute(&mut q, &u64::MAX).unwrap();
    assert_eq!(q.args(), &[Value::UInt(u64::MAX)]);

    q.reset();
    tpl.execute(&mut q, &f64::NAN).unwrap();
    assert!(matches!(q.args(), [Value::Float(f)] if f.is_nan()));

    q.reset();
    tpl.execute(&mut q, &f64::NEG_INFINITY).unwrap();
    assert_eq!(q.args(), &[Value::Float(f64::NEG_INFINITY)]);
}

#[test]
fn test_printf_out_of_range_width_is_an_error() {
    let tpl = Template::new("q")
        .parse(r#"SELECT {{printf "%.70000f" 1.5}}"#)
        .unwrap();
    let mut q = Query::new();
    let err = tpl.execute(&mut q, &()).unwrap_err();
    assert_eq!(err.eval_kind(), Some(EvalErrorKind::FuncCall));
    assert!(err.to_string().contains("printf width/precision out of range"));
}

#[test]
fn test_absent_query_reads_as_empty() {
    let none: Option<&Query> = None;
    assert_eq!(none.len(), 0);
    assert!(none.is_empty());
    assert!(none.args().is_empty());
    assert_eq!(none.as_str(), "");
    assert_eq!(none.name(), "");
}

// ── Composition ─────────────────────────────────────────────────────────

#[test]
fn test_template_invocation() {
    let t1 = Template::new("T1").parse(r#"T1 {{template "T2"}}"#).unwrap();
    t1.new_template("T2").parse("T2").unwrap();

    let mut q = Query::new();
    t1.execute(&mut q, &()).unwrap();
    assert_eq!(q.as_str(), "T1 T2");
}

#[test]
fn test_block_can_be_redefined() {
    let base = Template::new("base")
        .parse(r#"SELECT * FROM t{{block "where" .}} WHERE true{{end}}"#)
        .unwrap();

    let mut q = Query::new();
    base.execute(&mut q, &()).unwrap();
    assert_eq!(q.as_str(), "SELECT * FROM t WHERE true");

    let narrowed = base.try_clone().unwrap();
    narrowed
        .new_template("where")
        .parse(" WHERE id = {{bind .}}")
        .unwrap();
    q.reset();
    narrowed.execute(&mut q, &3).unwrap();
    assert_eq!(q.as_str(), "SELECT * FROM t WHERE id = $1");

    q.reset();
    base.execute(&mut q, &3).unwrap();
    assert_eq!(q.as_str(), "SELECT * FROM t WHERE true");
}

#[test]
fn test_else_if_inside_range() {
    let tpl = Template::new("q")
        .parse("SELECT {{range .ids}}{{bind .}}{{else if .all}}*{{end}} FROM t{{end}}")
        .unwrap();

    let mut q = Query::new();
    tpl.execute(&mut q, &json!({"ids": [], "all": true})).unwrap();
    assert_eq!(q.as_str(), "SELECT * FROM t");

    q.reset();
    tpl.execute(&mut q, &json!({"ids": [], "all": false})).unwrap();
    assert_eq!(q.as_str(), "SELECT  FROM t");

    q.reset();
    tpl.execute(&mut q, &json!({"ids": [4], "all": true})).unwrap();
    assert_eq!(q.as_str(), "SELECT $1");
}

#[test]
fn test_nested_binds_keep_order() {
    let tpl = Template::new("q")
        .parse(r#"{{define "pair"}}({{bind .a}}, {{bind .b}}){{end}}VALUES {{range $i, $r := .}}{{if $i}}, {{end}}{{template "pair" $r}}{{end}}"#)
        .unwrap();

    let mut q = Query::new();
    tpl.execute(&mut q, &json!([{"a": 1, "b": 2}, {"a": 3, "b": 4}]))
        .unwrap();
    assert_eq!(q.as_str(), "VALUES ($1, $2), ($3, $4)");
    assert_eq!(
        q.args(),
        &[Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]
    );
}

// ── Registry ────────────────────────────────────────────────────────────

#[test]
fn test_custom_bind_transform() {
    let tpl = Template::new("q")
        .funcs(FuncMap::new().func("bind", |args| match args.as_slice() {
            [Value::String(s)] => Ok(Value::from(s.to_lowercase())),
            [other] => Ok(other.clone()),
            _ => Err(FuncError::arity(1, args.len())),
        }))
        .parse("SELECT {{bind .}}")
        .unwrap();

    let mut q = Query::new();
    tpl.execute(&mut q, "MiXeD").unwrap();
    assert_eq!(q.as_str(), "SELECT $1");
    assert_eq!(q.args(), &[Value::from("mixed")]);
}

#[test]
fn test_bind_transform_failure() {
    let tpl = Template::new("q")
        .funcs(FuncMap::new().func("bind", |_| Err(FuncError::failed("unsupported value"))))
        .parse("SELECT {{bind .}}")
        .unwrap();

    let mut q = Query::new();
    let err = tpl.execute(&mut q, &1).unwrap_err();
    assert!(matches!(err, Error::BindFunction { ref name, .. } if name == "q"));
    assert_eq!(err.eval_kind(), Some(EvalErrorKind::BindFunction));
    assert!(err.to_string().contains("unsupported value"));
    assert!(q.args().is_empty());
}

#[test]
fn test_wrong_arity_is_execution_error() {
    let tpl = Template::new("q").parse("SELECT {{bind 1 2}}").unwrap();
    let mut q = Query::new();
    let err = tpl.execute(&mut q, &()).unwrap_err();
    assert!(matches!(err, Error::Execution { .. }));
    assert_eq!(err.eval_kind(), Some(EvalErrorKind::WrongArgCount));
}

#[test]
fn test_registry_shared_with_clones_and_siblings() {
    let root = Template::new("root").parse("{{upper .}}").err();
    assert!(root.is_some());

    let root = Template::new("root");
    let sibling = root.new_template("sibling");
    let clone_source = root.new_template("base").parse("base").unwrap();
    let clone = clone_source.try_clone().unwrap();

    sibling.add_funcs(FuncMap::new().func("upper", |args| {
        Ok(Value::from(args[0].to_string().to_uppercase()))
    }));

    let tpl = clone.new_template("shout").parse("{{upper .}}").unwrap();
    let mut q = Query::new();
    tpl.execute(&mut q, "hi").unwrap();
    assert_eq!(q.as_str(), "HI");
    assert!(root.registry().contains("upper"));
}

// ── Concurrency ─────────────────────────────────────────────────────────

#[test]
fn test_concurrent_executions_do_not_mix() {
    let tpl = Template::new("q")
        .parse("SELECT {{bind .}}, {{bind .}}")
        .unwrap();

    thread::scope(|s| {
        for worker in 0..8i64 {
            let tpl = &tpl;
            s.spawn(move || {
                for round in 0..50i64 {
                    let value = worker * 1000 + round;
                    let mut q = Query::new();
                    tpl.execute(&mut q, &value).unwrap();
                    assert_eq!(q.as_str(), "SELECT $1, $2");
                    assert_eq!(q.args(), &[Value::Int(value), Value::Int(value)]);
                }
            });
        }
    });
}

#[test]
fn test_add_funcs_during_executions() {
    let tpl = Template::new("q").parse("SELECT {{bind .}}").unwrap();

    thread::scope(|s| {
        let writer = tpl.clone();
        s.spawn(move || {
            for i in 0..100 {
                writer.add_funcs(FuncMap::new().func(format!("f{i}"), |_| Ok(Value::Null)));
            }
        });
        for _ in 0..4 {
            let tpl = &tpl;
            s.spawn(move || {
                for n in 0..100 {
                    let mut q = Query::new();
                    tpl.execute(&mut q, &n).unwrap();
                    assert_eq!(q.args(), &[Value::Int(n)]);
                }
            });
        }
    });

    assert!(tpl.registry().contains("f99"));
}

// ── Loading ─────────────────────────────────────────────────────────────

#[test]
fn test_parse_files_single_file_with_definitions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("allinone");
    let source = format!(
        "{{{{define \"zerotime\"}}}}{ZEROTIME}{{{{end -}}}}\n\
         \t{{{{define \"nulltime\"}}}}{NULLTIME}{{{{end -}}}}\n\
         \t{{{{define \"zerouuid\"}}}}{ZEROUUID}{{{{end -}}}}\n\
         \t{{{{define \"nulluuid\"}}}}{NULLUUID}{{{{end -}}}}\n\
         \t{UPSERT}"
    );
    fs::write(&path, source).unwrap();

    let tpl = must(parse_files(&[&path]));
    assert_eq!(tpl.name(), "allinone");

    let mut q = Query::new();
    tpl.execute(&mut q, &upsert_data()).unwrap();
    assert_upsert(&q);
}

#[test]
fn test_parse_glob_directory() {
    let dir = tempfile::tempdir().unwrap();
    for (name, source) in upsert_files() {
        fs::write(dir.path().join(name), source).unwrap();
    }

    let pattern = dir.path().join("*");
    let tpl = must(parse_glob(&pattern.to_string_lossy()));
    assert_eq!(tpl.name(), "0_upsert");
    assert_eq!(tpl.templates().len(), 5);

    let mut q = Query::new();
    tpl.execute(&mut q, &upsert_data()).unwrap();
    assert_upsert(&q);
}

#[test]
fn test_parse_fs_in_memory() {
    let mut files = MemFs::new();
    for (name, source) in upsert_files() {
        files.insert(format!("sql/{name}"), source);
    }

    let tpl = must(parse_fs(&files, &["sql/*"]));
    assert_eq!(tpl.name(), "0_upsert");

    let mut q = Query::new();
    tpl.execute(&mut q, &upsert_data()).unwrap();
    assert_upsert(&q);
}

#[test]
fn test_load_into_existing_namespace() {
    let files = MemFs::new()
        .with("list.sql", "SELECT * FROM author LIMIT {{bind .}}")
        .with("count.sql", "SELECT count(*) FROM author");

    let root = Template::new("list.sql").parse_fs(&files, &["*.sql"]).unwrap();
    let mut q = Query::new();
    root.execute(&mut q, &10).unwrap();
    root.execute_template(&mut q, "count.sql", &()).unwrap();
    assert_eq!(q.as_str(), "SELECT * FROM author LIMIT $1;SELECT count(*) FROM author");
}

#[test]
fn test_loader_errors() {
    let empty: [&str; 0] = [];
    assert!(matches!(parse_files(&empty), Err(Error::NoFiles(_))));
    assert!(matches!(parse_fs(&MemFs::new(), &[]), Err(Error::NoPatterns)));
    assert!(matches!(parse_fs(&MemFs::new(), &["*.sql"]), Err(Error::NoFiles(_))));

    let dir = tempfile::tempdir().unwrap();
    let pattern = dir.path().join("*.sql");
    let err = parse_glob(&pattern.to_string_lossy()).unwrap_err();
    assert!(err.to_string().contains("pattern matches no files"));

    assert!(matches!(parse_glob("[").unwrap_err(), Error::Glob { .. }));
    assert!(matches!(
        parse_files(&[dir.path().join("absent.sql")]),
        Err(Error::Io { .. })
    ));
}

#[test]
fn test_failed_load_registers_nothing() {
    let files = MemFs::new()
        .with("a.sql", "SELECT 1")
        .with("b.sql", "SELECT {{if}}");

    let root = Template::new("a.sql");
    let err = root.clone().parse_fs(&files, &["*.sql"]).unwrap_err();
    assert!(matches!(err, Error::Parse { ref name, .. } if name == "b.sql"));
    assert!(root.lookup("a.sql").is_none());
}

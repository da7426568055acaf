use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use pretty_assertions::assert_eq;

fn run_extract(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_govner-extract"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("run CLI")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn cli_writes_one_artifact_per_chunk() {
    let out = tempfile::tempdir().unwrap();
    let output = run_extract(&[
        "-p",
        "title",
        "-m",
        "tests/fixtures/patterns.jsonl",
        "--source",
        "tests/fixtures/title.tsv",
        "-c",
        "2",
        "-b",
        "1",
        "-n",
        "2",
        "-d",
        "200722",
        "--output-dir",
        out.path().to_str().unwrap(),
    ]);
    assert!(
        output.status.success(),
        "cli exited with {}: {}",
        output.status,
        stderr(&output)
    );

    for index in 0..3 {
        let name = format!("entities_200722_title_{index}.jsonl");
        let actual = fs::read_to_string(out.path().join(&name)).unwrap();
        let expected = fs::read_to_string(Path::new("tests/fixtures/expected").join(&name)).unwrap();
        assert_eq!(actual, expected, "artifact mismatch: {name}");
    }
    assert!(!out.path().join("entities_200722_title_3.jsonl").exists());
}

#[test]
fn cli_exits_with_two_when_a_chunk_fails() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("title.jsonl");
    fs::write(
        &source,
        "{\"page_id\": \"/a\", \"title\": \"UK\"}\n{\"page_id\": \"/b\", \"title\": 42}\n{\"page_id\": \"/c\", \"title\": \"Spain\"}\n",
    )
    .unwrap();
    let out = dir.path().join("out");

    let output = run_extract(&[
        "-p",
        "title",
        "-m",
        "tests/fixtures/patterns.jsonl",
        "--source",
        source.to_str().unwrap(),
        "-c",
        "1",
        "-d",
        "010224",
        "--output-dir",
        out.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));
    assert!(stderr(&output).contains("[1]"));
    assert_eq!(
        fs::read_to_string(out.join("entities_010224_title_2.jsonl")).unwrap(),
        "{\"page_id\": \"/c\", \"entities\": [{\"name\": \"Spain\", \"type\": \"GPE\", \"start\": 0, \"end\": 5}]}\n"
    );
    assert!(out.join("entities_010224_title_0.jsonl").exists());
    assert!(!out.join("entities_010224_title_1.jsonl").exists());
}

#[test]
fn cli_exits_with_one_on_unknown_page_part() {
    let output = run_extract(&[
        "-p",
        "body",
        "-m",
        "tests/fixtures/patterns.jsonl",
        "--source",
        "tests/fixtures/title.tsv",
    ]);
    assert_eq!(output.status.code(), Some(1), "{}", stderr(&output));
    assert!(stderr(&output).contains("body"));
}

#[test]
fn cli_exits_with_one_on_non_numeric_batch_size() {
    let output = run_extract(&[
        "-p",
        "title",
        "-m",
        "tests/fixtures/patterns.jsonl",
        "--source",
        "tests/fixtures/title.tsv",
        "-b",
        "thirty",
    ]);
    assert_eq!(output.status.code(), Some(1), "{}", stderr(&output));
}

#[test]
fn cli_help_still_exits_cleanly() {
    let output = run_extract(&["--help"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("--only-chunk"));
}

#[test]
fn cli_exits_with_one_when_the_source_is_missing() {
    let out = tempfile::tempdir().unwrap();
    let output = run_extract(&[
        "-p",
        "text",
        "-m",
        "tests/fixtures/patterns.jsonl",
        "--source",
        "tests/fixtures/does-not-exist.tsv",
        "--output-dir",
        out.path().to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("row source unavailable"));
}

#[test]
fn cli_rejects_zero_chunk_size() {
    let output = run_extract(&[
        "-p",
        "title",
        "-m",
        "tests/fixtures/patterns.jsonl",
        "--source",
        "tests/fixtures/title.tsv",
        "-c",
        "0",
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("chunk size"));
}

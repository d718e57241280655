use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;

fn simulate_json(args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("folio")
        .arg("simulate")
        .args(args)
        .env_remove("FOLIO_MAX_CACHE_ENTRIES")
        .env_remove("FOLIO_MAX_CACHE_BYTES")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    serde_json::from_slice(&output).expect("stdout should contain valid json")
}

fn pages(value: &Value) -> Vec<u64> {
    value
        .as_array()
        .expect("expected an array")
        .iter()
        .map(|page| page.as_u64().expect("expected a page number"))
        .collect()
}

#[test]
fn simulate_emits_stats_json() {
    let value = simulate_json(&["--pages", "50", "--from", "1", "--to", "10", "--interval-ms", "30"]);

    assert_eq!(value["document"], "synthetic.pdf");
    assert_eq!(value["page_count"], 50);
    assert_eq!(value["final_page"], 10);
    assert!(pages(&value["cached_pages"]).contains(&10));
    assert!(value["stats"]["cache"]["entries"].as_u64().unwrap() > 0);
    assert_eq!(value["stats"]["cache"]["bound_kind"], "entries");
    assert_eq!(value["stats"]["scroll"]["classification"], "idle");
    assert!(value["events"]["render_ready"].as_u64().unwrap() >= 1);
}

#[test]
fn simulate_replays_trace_file() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let trace = temp.path().join("trace.txt");
    fs::write(
        &trace,
        "jump 20\nwait 100\nzoom 2.0\nrequest 30\nwait 100\nrotate 90\n",
    )
    .unwrap();

    let value = simulate_json(&["--trace", trace.to_str().unwrap(), "--pages", "40"]);

    assert_eq!(value["steps"], 6);
    assert_eq!(value["final_page"], 20);
    let cached = pages(&value["cached_pages"]);
    assert!(cached.contains(&20));
    assert!(cached.contains(&30));
    assert!(value["stats"]["render"]["invalidations"].as_u64().unwrap() >= 2);
}

#[test]
fn simulate_surfaces_failed_pages() {
    let value = simulate_json(&[
        "--pages",
        "10",
        "--from",
        "1",
        "--to",
        "1",
        "--fail-page",
        "2",
        "--settle-ms",
        "2000",
    ]);

    assert_eq!(pages(&value["failed_pages"]), vec![2]);
    assert_eq!(value["events"]["page_failed"], 1);
    assert_eq!(pages(&value["stats"]["failed_pages"]), vec![2]);
}

#[test]
fn simulate_honours_config_file() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let config = temp.path().join("viewer.toml");
    fs::write(&config, "max_cache_entries = 3\nkeep_window_radius = 1\n").unwrap();

    let value = simulate_json(&[
        "--config",
        config.to_str().unwrap(),
        "--pages",
        "60",
        "--from",
        "1",
        "--to",
        "30",
        "--interval-ms",
        "40",
    ]);

    assert_eq!(value["stats"]["cache"]["bound"], 3);
    assert!(pages(&value["cached_pages"]).len() <= 3);
}

#[test]
fn simulate_fails_for_missing_trace() {
    cargo_bin_cmd!("folio")
        .arg("simulate")
        .arg("--trace")
        .arg("missing-trace.txt")
        .assert()
        .failure()
        .stderr(predicate::str::contains("file does not exist"));
}

#[test]
fn simulate_rejects_out_of_range_steps() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let trace = temp.path().join("trace.txt");
    fs::write(&trace, "jump 3\njump 99\n").unwrap();

    cargo_bin_cmd!("folio")
        .arg("simulate")
        .arg("--trace")
        .arg(&trace)
        .arg("--pages")
        .arg("10")
        .assert()
        .failure()
        .stderr(predicate::str::contains("step 2").and(predicate::str::contains("out of range")));
}

#[test]
fn simulate_rejects_malformed_trace() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let trace = temp.path().join("trace.txt");
    fs::write(&trace, "scroll 1\nspin 4\n").unwrap();

    cargo_bin_cmd!("folio")
        .arg("simulate")
        .arg("--trace")
        .arg(&trace)
        .assert()
        .failure()
        .stderr(predicate::str::contains("trace line 2"));
}

#[test]
fn config_prints_effective_toml() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let config = temp.path().join("viewer.toml");
    fs::write(&config, "max_concurrent_fetches = 8\n").unwrap();

    cargo_bin_cmd!("folio")
        .arg("config")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("max_concurrent_fetches = 8"))
        .stdout(predicate::str::contains("max_cache_entries = 64"));
}

#[test]
fn config_rejects_unknown_keys() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let config = temp.path().join("viewer.toml");
    fs::write(&config, "max_cache_pages = 8\n").unwrap();

    cargo_bin_cmd!("folio")
        .arg("config")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn version_prints_package_version() {
    cargo_bin_cmd!("folio")
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

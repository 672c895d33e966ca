use std::fs::File;
use std::path::Path;

use kestrel_gameobject::config::{RuntimeConfig, VmConfig};
use kestrel_gameobject::script_harness::{load_fixture, run_fixture, run_fixture_with_config, HarnessOutput};

#[test]
fn lifecycle_fixture_matches_golden() {
    assert_fixture_matches(
        "tests/fixtures/script_harness/lifecycle.json",
        "tests/fixtures/script_harness/lifecycle.golden.json",
    );
}

#[test]
fn lifecycle_fixture_is_stable_across_runs() {
    let fixture = load_fixture("tests/fixtures/script_harness/lifecycle.json").expect("load fixture");
    let first = run_fixture(&fixture).expect("run fixture first time");
    let second = run_fixture(&fixture).expect("run fixture second time");
    assert_eq!(first, second, "fixture should produce identical output across runs");
}

#[test]
fn rejected_reload_keeps_previous_behaviour() {
    let fixture = load_fixture("tests/fixtures/script_harness/reload.json").expect("load fixture");
    let output = run_fixture(&fixture).expect("run fixture");

    let outcomes: Vec<Option<&str>> = output.results.iter().map(|r| r.outcome.as_deref()).collect();
    assert_eq!(outcomes, vec![None, Some("rejected"), None, Some("reloaded"), None]);

    let greetings: Vec<&[String]> = [0, 2, 4].iter().map(|&step| output.results[step].logs.as_slice()).collect();
    assert_eq!(greetings[0], ["greeter: hello".to_string()]);
    assert_eq!(greetings[1], ["greeter: hello".to_string()], "broken reload must not change behaviour");
    assert_eq!(greetings[2], ["greeter: howdy".to_string()]);
}

#[test]
fn failing_instance_is_reported_every_pass_without_stopping_others() {
    let fixture = load_fixture("tests/fixtures/script_harness/reload.json").expect("load fixture");
    let output = run_fixture(&fixture).expect("run fixture");

    for step in [0, 2, 4] {
        let result = &output.results[step];
        assert_eq!(result.failures.len(), 1, "step {step} should report the faulty instance");
        let failure = &result.failures[0];
        assert_eq!(failure.instance, "faulty");
        assert_eq!(failure.entry, "update");
        assert_eq!(failure.filename, "faulty.rhai");
        assert!(failure.message.contains("boom"), "message was {}", failure.message);
        assert_eq!(result.logs.len(), 1, "greeter still runs after the failure");
    }
    assert!(output.final_instances.iter().all(|i| i.phase == "running"));
}

#[test]
fn reference_budget_from_config_stops_script_creation() {
    let fixture = load_fixture("tests/fixtures/script_harness/lifecycle.json").expect("load fixture");
    // Three scripts link six entry points; three instances need six more references.
    let config = RuntimeConfig { vm: VmConfig { max_references: 12, ..VmConfig::default() }, ..Default::default() };
    let output = run_fixture_with_config(&fixture, &config).expect("run fixture");

    let first = &output.results[0];
    let report = first.report.expect("update report");
    assert_eq!(report.created, 0);
    assert_eq!(first.failures.len(), 1);
    assert_eq!(first.failures[0].instance, "spawner");
    assert_eq!(first.failures[0].entry, "init");
    assert_eq!(output.final_instances.len(), 3);
}

fn assert_fixture_matches(fixture_path: &str, golden_path: &str) {
    let fixture = load_fixture(fixture_path).expect("load fixture");
    let output = run_fixture(&fixture).expect("run fixture");
    let golden_file = File::open(Path::new(golden_path)).expect("open golden");
    let golden: HarnessOutput = serde_json::from_reader(golden_file).expect("parse golden");
    assert_eq!(output, golden, "fixture {} diverged from golden {}", fixture_path, golden_path);
}

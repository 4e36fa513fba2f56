//! End-to-end tests driving the compiled binary.

mod common;

use common::{run_ie, stderr_of, stdout_of, TestFixture};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Runs that execute scenarios share the state files under /tmp; serialize
/// them so they do not clobber each other.
fn state_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

const MINIMAL_DOC: &str = "# S\n\n## Step\n\nPrint hi.\n\n```bash\necho hi\n```\n";

#[test]
fn minimal_execute_prints_the_command_output() {
    let _guard = state_lock();
    let fixture = TestFixture::new();
    let doc = fixture.write("doc.md", MINIMAL_DOC);

    let output = run_ie(&fixture, &["execute", doc.to_str().unwrap()]);

    assert!(
        output.status.success(),
        "execute failed: {}",
        stderr_of(&output)
    );
    assert!(stdout_of(&output).contains("hi"));
}

#[test]
fn invalid_var_exits_before_any_execution() {
    let fixture = TestFixture::new();
    let doc = fixture.write("doc.md", MINIMAL_DOC);

    let output = run_ie(
        &fixture,
        &["execute", doc.to_str().unwrap(), "--var", "INVALID"],
    );

    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("invalid environment variable format: INVALID"));
}

#[test]
fn invalid_feature_is_rejected() {
    let fixture = TestFixture::new();
    let doc = fixture.write("doc.md", MINIMAL_DOC);

    let output = run_ie(
        &fixture,
        &["execute", doc.to_str().unwrap(), "--feature", "bogus"],
    );

    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("invalid feature: bogus"));
}

#[test]
fn inspect_flags_blocks_without_descriptions() {
    let fixture = TestFixture::new();
    let doc = fixture.write("doc.md", "# S\n\n## Step\n\n```bash\necho hi\n```\n");

    let output = run_ie(&fixture, &["inspect", doc.to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("descriptive text"));
}

#[test]
fn inspect_flags_undefined_references() {
    let fixture = TestFixture::new();
    let doc = fixture.write(
        "doc.md",
        "# S\n\n## Step\n\nShow the value.\n\n```bash\necho $MISSING_VAR\n```\n",
    );

    let output = run_ie(&fixture, &["inspect", doc.to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("is referenced but never exported"));
}

#[test]
fn inspect_accepts_a_clean_document() {
    let fixture = TestFixture::new();
    let doc = fixture.write(
        "doc.md",
        "# Clean Demo\n\n## Step\n\nExport and use a value.\n\n```bash\nexport EV_DEMO=value\naz tag create --name $EV_DEMO\n```\n",
    );

    let output = run_ie(&fixture, &["inspect", doc.to_str().unwrap()]);

    assert!(
        output.status.success(),
        "inspect failed: {}",
        stderr_of(&output)
    );
    assert!(stdout_of(&output).contains("Clean Demo"));
}

#[test]
fn inspect_escalates_missing_prerequisites_to_errors() {
    let fixture = TestFixture::new();
    let doc = fixture.write(
        "doc.md",
        "# S\n\n## Prerequisites\n\nSee [Gone](gone.md).\n\n## Step\n\nGo.\n\n```bash\necho go\n```\n",
    );

    let output = run_ie(&fixture, &["inspect", doc.to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("not found"));
}

#[test]
fn successful_verification_writes_the_marker_and_skips_the_body() {
    let _guard = state_lock();
    let fixture = TestFixture::new();
    let marker = "/tmp/prereq_marker_gate_demo_skip";
    let _ = std::fs::remove_file(marker);
    let body_witness = fixture.path().join("should-not-run");

    fixture.write(
        "prereq.md",
        "# Marker Gate Demo\n\n## Verification\n\nCheck readiness.\n\n```bash\necho ok\n```\n\n<!-- expected_similarity=\"ok\" -->\n\n```text\nok\n```\n\n## Install\n\nInstall things.\n\n```bash\ntouch should-not-run\n```\n",
    );
    let doc = fixture.write(
        "main.md",
        "# Main\n\nIntro.\n\n## Prerequisites\n\nSee [Marker Gate Demo](prereq.md).\n\n## Steps\n\nGo.\n\n```bash\necho go\n```\n",
    );

    let output = run_ie(&fixture, &["execute", doc.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "execute failed: {}",
        stderr_of(&output)
    );

    // Verification passed, so the marker exists and the body never ran.
    assert_eq!(
        std::fs::read_to_string(marker).unwrap(),
        "Marker Gate Demo [prereq.md]"
    );
    assert!(!body_witness.exists());

    // A second run with the marker present behaves the same way.
    let output = run_ie(&fixture, &["execute", doc.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(!body_witness.exists());
    assert!(stdout_of(&output).contains("Validating Prerequisite: Marker Gate Demo"));

    let _ = std::fs::remove_file(marker);
}

#[test]
fn failed_verification_runs_the_body_and_leaves_no_marker() {
    let _guard = state_lock();
    let fixture = TestFixture::new();
    let marker = "/tmp/prereq_body_path_demo_skip";
    let _ = std::fs::remove_file(marker);
    let body_witness = fixture.path().join("body-ran");

    fixture.write(
        "prereq.md",
        "# Body Path Demo\n\n## Verification\n\nCheck readiness.\n\n```bash\necho mismatch\n```\n\n<!-- expected_similarity=\"^never$\" -->\n\n```text\nnever\n```\n\n## Install\n\nInstall things.\n\n```bash\ntouch body-ran\n```\n",
    );
    let doc = fixture.write(
        "main.md",
        "# Main\n\nIntro.\n\n## Prerequisites\n\nSee [Body Path Demo](prereq.md).\n\n## Steps\n\nGo.\n\n```bash\necho go\n```\n",
    );

    let output = run_ie(&fixture, &["execute", doc.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "execute failed: {}",
        stderr_of(&output)
    );

    // Verification failed, so the body executed and no marker was written.
    assert!(body_witness.exists());
    assert!(!Path::new(marker).exists());
}

#[test]
fn env_config_emits_sorted_quoted_exports() {
    let fixture = TestFixture::new();
    let state_file = fixture.write("state", "EV_BETA=\"two words\"\nEV_ALPHA=\"one\"\n");

    let output = run_ie(
        &fixture,
        &["env-config", "--state-file", state_file.to_str().unwrap()],
    );

    assert!(output.status.success());
    assert_eq!(
        stdout_of(&output),
        "export EV_ALPHA=\"one\"\nexport EV_BETA=\"two words\"\n"
    );
}

#[test]
fn env_config_prefix_filter_can_match_nothing() {
    let fixture = TestFixture::new();
    let state_file = fixture.write("state", "EV_ALPHA=\"one\"\n");

    let output = run_ie(
        &fixture,
        &[
            "env-config",
            "--state-file",
            state_file.to_str().unwrap(),
            "--prefix",
            "ZZ_",
        ],
    );

    assert!(output.status.success());
    assert!(stdout_of(&output)
        .contains("# No persisted environment variables matched the requested filters."));
}

#[test]
fn to_bash_emits_exports_then_step_blocks() {
    let fixture = TestFixture::new();
    let doc = fixture.write(
        "doc.md",
        "# S\n\n<!--\n```variables\nexport EV_NAME=demo\n```\n-->\n\n## Step One\n\nSay it.\n\n```bash\necho $EV_NAME\n```\n",
    );

    let output = run_ie(&fixture, &["to-bash", doc.to_str().unwrap()]);

    assert!(output.status.success());
    let script = stdout_of(&output);
    let export_pos = script.find("export EV_NAME=\"demo\"").unwrap();
    let step_pos = script.find("# Step One").unwrap();
    let command_pos = script.find("echo $EV_NAME").unwrap();
    assert!(export_pos < step_pos);
    assert!(step_pos < command_pos);
}

#[test]
fn to_bash_wraps_the_script_for_azure_environments() {
    let fixture = TestFixture::new();
    let doc = fixture.write("doc.md", MINIMAL_DOC);

    let output = run_ie(
        &fixture,
        &["to-bash", doc.to_str().unwrap(), "--environment", "azure"],
    );

    assert!(output.status.success());
    let script = stdout_of(&output);
    assert!(script.starts_with("ie_us{"));
    assert!(script.trim_end().ends_with("ie_ue"));
    assert!(script.contains("\"script\""));
}

#[test]
fn cyclic_prerequisites_emit_each_document_once() {
    let fixture = TestFixture::new();
    fixture.write(
        "a.md",
        "# Cycle A\n\n## Prerequisites\n\n[B](b.md)\n\n## Work A\n\nDo A.\n\n```bash\necho cycle-a\n```\n",
    );
    fixture.write(
        "b.md",
        "# Cycle B\n\n## Prerequisites\n\n[A](a.md)\n\n## Work B\n\nDo B.\n\n```bash\necho cycle-b\n```\n",
    );
    let doc = fixture.path().join("a.md");

    let output = run_ie(&fixture, &["to-bash", doc.to_str().unwrap()]);

    assert!(output.status.success());
    let script = stdout_of(&output);
    assert_eq!(script.matches("echo cycle-a").count(), 1);
    assert_eq!(script.matches("echo cycle-b").count(), 1);
}

#[test]
fn test_command_writes_a_json_report() {
    let _guard = state_lock();
    let fixture = TestFixture::new();
    let doc = fixture.write("doc.md", MINIMAL_DOC);
    let report_path = fixture.path().join("report.json");

    let output = run_ie(
        &fixture,
        &[
            "test",
            doc.to_str().unwrap(),
            "--report",
            report_path.to_str().unwrap(),
        ],
    );

    assert!(
        output.status.success(),
        "test failed: {}",
        stderr_of(&output)
    );

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["scenario"], "S");
    assert_eq!(report["success"], true);
    assert_eq!(report["steps"][0]["name"], "Step");
    assert_eq!(report["steps"][0]["blocks"][0]["command"], "echo hi\n");
}

#[test]
fn clear_env_force_reports_state_cleared() {
    let _guard = state_lock();
    let fixture = TestFixture::new();
    std::fs::write("/tmp/ie-env-vars", "EV_STALE=\"1\"\n").unwrap();

    let output = run_ie(&fixture, &["clear-env", "--force"]);

    assert!(output.status.success());
    assert!(stdout_of(&output).contains("Environment variables cleared successfully."));
    assert!(!Path::new("/tmp/ie-env-vars").exists());
}

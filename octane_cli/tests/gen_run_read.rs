use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn gen_read_run_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let ic = dir.path().join("ic.oct");
    let out = dir.path().join("out.oct");

    Command::cargo_bin("octane")
        .unwrap()
        .args(["gen", ic.to_str().unwrap(), "--nparts", "500"])
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote 500 gas and 500 gravity particles"));

    Command::cargo_bin("octane")
        .unwrap()
        .args(["read", ic.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("parts").and(predicate::str::contains("500")));

    Command::cargo_bin("octane")
        .unwrap()
        .args([
            "run",
            ic.to_str().unwrap(),
            "--steps",
            "2",
            "--top-grid",
            "3",
            "--output",
            out.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("step").and(predicate::str::contains("updated")));

    Command::cargo_bin("octane")
        .unwrap()
        .args(["read", out.to_str().unwrap(), "--cells"])
        .assert()
        .success()
        .stdout(predicate::str::contains("subtree"));
}

#[test]
fn read_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.oct");
    std::fs::write(&path, b"not a snapshot").unwrap();

    Command::cargo_bin("octane")
        .unwrap()
        .args(["read", path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn diff_detects_evolution() {
    let dir = tempfile::tempdir().unwrap();
    let ic = dir.path().join("ic.oct");
    let out = dir.path().join("out.oct");

    Command::cargo_bin("octane")
        .unwrap()
        .args(["gen", ic.to_str().unwrap(), "--nparts", "200", "--vel", "0.5"])
        .assert()
        .success();

    Command::cargo_bin("octane")
        .unwrap()
        .args([
            "run",
            ic.to_str().unwrap(),
            "--steps",
            "3",
            "--top-grid",
            "3",
            "--no-gravity",
            "--output",
            out.to_str().unwrap(),
        ])
        .assert()
        .success();

    // a snapshot equals itself
    Command::cargo_bin("octane")
        .unwrap()
        .args(["diff", ic.to_str().unwrap(), ic.to_str().unwrap()])
        .assert()
        .success();

    // and differs from its evolved state
    Command::cargo_bin("octane")
        .unwrap()
        .args(["diff", ic.to_str().unwrap(), out.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn octant_layout_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.oct");
    let b = dir.path().join("b.oct");

    for path in [&a, &b] {
        Command::cargo_bin("octane")
            .unwrap()
            .args([
                "gen",
                path.to_str().unwrap(),
                "--nparts",
                "64",
                "--layout",
                "octants",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("wrote 64 gas"));
    }

    // identical seeds and layout give identical snapshots
    Command::cargo_bin("octane")
        .unwrap()
        .args(["diff", a.to_str().unwrap(), b.to_str().unwrap()])
        .assert()
        .success();
}

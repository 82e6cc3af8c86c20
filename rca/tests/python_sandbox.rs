//! Integration tests for the persistent Python sandbox.
//!
//! Skipped (with a notice) when no `python3` is on `PATH`.

use std::process::{Command, Stdio};

use rca::io::config::SandboxConfig;
use rca::io::sandbox::{PythonSandbox, Sandbox};

fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn sandbox() -> PythonSandbox {
    PythonSandbox::new(&SandboxConfig {
        cell_timeout_secs: 5,
        setup_code: String::new(),
        ..SandboxConfig::default()
    })
}

#[test]
fn state_persists_across_cells_until_reset() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let mut sandbox = sandbox();
    sandbox.initialize("base = 40").expect("initialize");

    let first = sandbox.run("x = base + 2\nprint('set')").expect("run");
    assert!(first.is_success(), "{first:?}");
    assert_eq!(first.output, "set\n");

    let second = sandbox.run("x").expect("run");
    assert_eq!(second.output.trim(), "42");

    let failed = sandbox.run("undefined_name + 1").expect("run");
    assert!(!failed.is_success());
    assert!(failed.error.as_deref().unwrap_or_default().contains("NameError"));

    sandbox.reset();
    assert!(!sandbox.is_running());
    sandbox.reset();
}

#[test]
fn runaway_cell_times_out_and_restarts() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let mut sandbox = PythonSandbox::new(&SandboxConfig {
        cell_timeout_secs: 1,
        setup_code: String::new(),
        ..SandboxConfig::default()
    });
    sandbox.initialize("").expect("initialize");

    let timed_out = sandbox.run("import time\ntime.sleep(30)").expect("run");
    assert!(!timed_out.is_success());
    assert!(timed_out.error.as_deref().unwrap_or_default().contains("timed out"));
    assert!(!sandbox.is_running());

    let after = sandbox.run("print(1 + 1)").expect("run");
    assert_eq!(after.output, "2\n");
    sandbox.reset();
}

#[test]
fn writes_to_real_stdout_do_not_shift_later_cells() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let mut sandbox = sandbox();
    sandbox.initialize("").expect("initialize");

    let raw = sandbox
        .run("import sys\nsys.__stdout__.write('hello\\n')\nsys.__stdout__.flush()")
        .expect("run");
    assert!(raw.is_success(), "{raw:?}");

    let shell = sandbox.run("import os\nrc = os.system('echo stray')").expect("run");
    assert!(shell.is_success(), "{shell:?}");

    let next = sandbox.run("print('second')").expect("run");
    assert_eq!(next.output, "second\n");

    let after = sandbox.run("rc").expect("run");
    assert_eq!(after.output.trim(), "0");
    sandbox.reset();
}

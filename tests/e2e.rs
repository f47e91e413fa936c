//! End-to-end tests driving the compiled binary on unit files.

mod common;

use std::path::PathBuf;
use std::process::Command;

use common::{Asm, UnitBuilder};
use conch::Op;

fn write_unit(name: &str, builder: &UnitBuilder) -> PathBuf {
    let temp_dir = std::env::temp_dir();
    let path = temp_dir.join(format!(
        "conch_e2e_{}_{}_{:?}.cnu",
        name,
        std::process::id(),
        std::thread::current().id()
    ));
    std::fs::write(&path, builder.image()).unwrap();
    path
}

fn run_conch(path: &PathBuf) -> (String, String, Option<i32>) {
    let output = Command::new(env!("CARGO_BIN_EXE_conch"))
        .args(["run", path.to_str().unwrap()])
        .output()
        .expect("failed to execute conch");

    std::fs::remove_file(path).ok();

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code(),
    )
}

#[test]
fn test_write_to_stdout() {
    let mut builder = UnitBuilder::new();
    let hello_idx = builder.constant("hello world");

    let mut main = Asm::new();
    main.push_int(1)
        .with_u32(Op::PushString, hello_idx)
        .op(Op::Write)
        .op(Op::Return);
    builder.function("demo::<main>", 0, 0, 0, main.code);

    let path = write_unit("stdout", &builder);
    let (stdout, stderr, code) = run_conch(&path);
    assert_eq!(code, Some(0), "stderr:\n{}", stderr);
    assert_eq!(stdout, "hello world");
}

#[test]
fn test_exit_code_propagates() {
    let mut builder = UnitBuilder::new();
    let mut main = Asm::new();
    main.push_byte(42).op(Op::Exit);
    builder.function("demo::<main>", 0, 0, 0, main.code);

    let path = write_unit("exit", &builder);
    let (_, _, code) = run_conch(&path);
    assert_eq!(code, Some(42));
}

#[test]
fn test_panic_reports_and_exits_255() {
    let mut builder = UnitBuilder::new();
    let panic_idx = builder.constant("std::panic");
    let message_idx = builder.constant("boom");

    let mut main = Asm::new();
    main.with_u32(Op::PushString, message_idx)
        .with_u32(Op::Invoke, panic_idx);
    builder.function("demo::<main>", 0, 0, 0, main.code);

    let path = write_unit("panic", &builder);
    let (_, stderr, code) = run_conch(&path);
    assert_eq!(code, Some(255));
    assert!(stderr.contains("panic: boom"), "stderr:\n{}", stderr);
}

#[test]
fn test_missing_main_is_a_structure_diagnostic() {
    let mut builder = UnitBuilder::new();
    builder.function("demo::helper", 0, 0, 0, vec![Op::Return.encode()]);

    let path = write_unit("nomain", &builder);
    let (_, stderr, code) = run_conch(&path);
    assert_eq!(code, Some(1));
    assert!(
        stderr.contains("InvalidBytecodeStructure"),
        "stderr:\n{}",
        stderr
    );
}

#[test]
fn test_runtime_diagnostic_names_error_kind() {
    let mut builder = UnitBuilder::new();
    let mut main = Asm::new();
    main.push_int(1).push_int(0).op(Op::IntDiv);
    builder.function("demo::<main>", 8, 0, 0, main.code);

    let path = write_unit("diverr", &builder);
    let (_, stderr, code) = run_conch(&path);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("ArithmeticError"), "stderr:\n{}", stderr);
}

#[test]
fn test_redirect_scope_over_stdout() {
    // Scenario: pipe; SETUP_REDIRECT stdout onto the write end; a
    // function writes "hi" (to the pipe); POP_REDIRECT; the read-back is
    // compared against "hi" in-program, and a final write lands on the
    // real stdout, which we observe from outside.
    //
    // locals: 0 = read fd, 8 = write fd
    let mut builder = UnitBuilder::new();
    let hi_idx = builder.constant("hi");
    let restored_idx = builder.constant("restored");
    let say_idx = builder.constant("demo::say_hi");
    let eq_idx = builder.constant("lang::String::eq");

    let mut say = Asm::new();
    say.push_int(1)
        .with_u32(Op::PushString, hi_idx)
        .op(Op::Write)
        .op(Op::Return);

    let mut main = Asm::new();
    main.op(Op::Pipe)
        .with_u32(Op::SetQWord, 8)
        .with_u32(Op::SetQWord, 0);
    main.with_u32(Op::GetQWord, 8)
        .push_int(1)
        .op(Op::SetupRedirect)
        .op(Op::PopQWord);
    // Close the original write end; the stdout duplicate is the writer.
    main.with_u32(Op::GetQWord, 8).op(Op::Close);
    main.with_u32(Op::Invoke, say_idx);
    main.op(Op::PopRedirect);
    main.with_u32(Op::GetQWord, 0).op(Op::Read);
    main.with_u32(Op::PushString, hi_idx).with_u32(Op::Invoke, eq_idx);
    // On mismatch, exit 9 without writing.
    let ok_patch = main.with_patch(Op::IfJump);
    main.push_byte(9).op(Op::Exit);
    let ok = main.here();
    main.patch_u32(ok_patch, ok);
    main.push_int(1)
        .with_u32(Op::PushString, restored_idx)
        .op(Op::Write)
        .op(Op::Return);

    builder.function("demo::say_hi", 0, 0, 0, say.code);
    builder.function("demo::<main>", 16, 0, 0, main.code);

    let path = write_unit("redirect", &builder);
    let (stdout, stderr, code) = run_conch(&path);
    assert_eq!(code, Some(0), "stderr:\n{}", stderr);
    assert_eq!(stdout, "restored");
}

#[test]
fn test_fork_wait_through_binary() {
    // FORK P; (child) EXIT 7; P: WAIT; INT comparison drives the exit.
    let mut builder = UnitBuilder::new();

    let mut main = Asm::new();
    let fork_patch = main.with_patch(Op::Fork);
    main.push_byte(7).op(Op::Exit);
    let parent = main.here();
    main.patch_u32(fork_patch, parent);
    // Exit with the child's status so the harness can observe it.
    main.op(Op::Wait).op(Op::Exit);
    builder.function("demo::<main>", 0, 0, 0, main.code);

    let path = write_unit("fork", &builder);
    let (_, _, code) = run_conch(&path);
    assert_eq!(code, Some(7));
}

//! End-to-end tests driving the chibicc binary: file and stdin input,
//! output selection, exit codes and the diagnostic format.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

fn chibicc() -> Command {
    Command::new(env!("CARGO_BIN_EXE_chibicc"))
}

fn write_source(dir: &Path, name: &str, source: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, source).unwrap();
    path
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn compiles_file_to_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(dir.path(), "ret0.c", "int main() { return 0; }\n");

    let output = chibicc().arg(&input).output().unwrap();
    assert!(output.status.success());

    let asm = stdout_of(&output);
    assert!(asm.starts_with(&format!(".file 1 \"{}\"\n", input.display())));
    assert!(asm.contains("  .globl main"));
    assert!(asm.contains("  ret"));
}

#[test]
fn writes_output_file_with_dash_o() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(dir.path(), "sum.c", "int main() { return 3+5*2; }\n");
    let out_path = dir.path().join("sum.s");

    let output = chibicc()
        .arg("-o")
        .arg(&out_path)
        .arg(&input)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).is_empty());

    let asm = fs::read_to_string(&out_path).unwrap();
    assert!(asm.contains("  imul %rdi, %rax"));
}

#[test]
fn accepts_attached_dash_o_form() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(dir.path(), "ret1.c", "int main() { return 1; }\n");
    let out_path = dir.path().join("ret1.s");

    let output = chibicc()
        .arg(format!("-o{}", out_path.display()))
        .arg(&input)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(fs::read_to_string(&out_path).unwrap().contains("main:"));
}

#[test]
fn reads_standard_input_for_dash() {
    let mut child = chibicc()
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"int main() { return 7; }")
        .unwrap();

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    let asm = stdout_of(&output);
    assert!(asm.starts_with(".file 1 \"-\"\n"));
    assert!(asm.contains("  mov $7, %rax"));
}

#[test]
fn appends_missing_final_newline() {
    let dir = tempfile::tempdir().unwrap();
    // No trailing newline; the comment must still end at end of input.
    let input = write_source(dir.path(), "nonl.c", "int main() { return 0; } // done");

    let output = chibicc().arg(&input).output().unwrap();
    assert!(output.status.success());
}

#[test]
fn diagnostic_goes_to_stderr_with_caret() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(dir.path(), "bad.c", "int main() { return x; }\n");

    let output = chibicc().arg(&input).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout_of(&output).is_empty());

    let stderr = stderr_of(&output);
    assert!(stderr.contains(&format!("{}:1: int main() {{ return x; }}", input.display())));
    assert!(stderr.contains("^ undefined variable"));
}

#[test]
fn lexical_error_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(dir.path(), "at.c", "int main() { return @; }\n");

    let output = chibicc().arg(&input).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("^ cannot tokenize"));
}

#[test]
fn missing_input_file_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.c");

    let output = chibicc().arg(&missing).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("cannot open"));
}

#[test]
fn multi_function_program_compiles() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(
        dir.path(),
        "fact.c",
        "int fact(int n){ if (n<2) return 1; return n*fact(n-1);}\nint main(){ return fact(5);}\n",
    );

    let output = chibicc().arg(&input).output().unwrap();
    assert!(output.status.success());

    let asm = stdout_of(&output);
    assert!(asm.contains("fact:"));
    assert!(asm.contains("main:"));
    assert!(asm.contains("  .loc 1 2"));
}

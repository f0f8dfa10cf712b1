//! Tests for dependencies discovered through compiler-style deps files.

use crate::e2e::*;

/// A "compiler" that concatenates its source and header and emits a
/// makefile-format deps file, like `cc -MD` would.
const COMPILE: &str = "command main.o
  tool = clang
  inputs = main.c
  outputs = main.o
  args = cat main.c header.h > main.o && echo 'main.o: main.c header.h' > main.d
  deps = main.d
  description = COMPILE main.o
";

#[test]
fn deps_file_registers_discovered_dependencies() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.llb", &format!("target all: main.o\n\n{}", COMPILE))?;
    space.write("main.c", "int main;\n")?;
    space.write("header.h", "one\n")?;

    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "ran 1 task");

    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "no work to do");

    // header.h is not a declared input, but it was discovered via the deps
    // file, so changing it re-runs the compile.
    space.write("header.h", "two, changed\n")?;
    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert_eq!(space.read("main.o")?, b"int main;\ntwo, changed\n");

    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "no work to do");

    Ok(())
}

#[test]
fn unparseable_deps_file_fails_the_command() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: out

command c1
  tool = clang
  outputs = out
  args = touch out && echo 'garbage text' > out.d
  deps = out.d
",
    )?;

    let out = space.run(&mut llb_command(vec!["all"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "error reading dependency file");

    Ok(())
}

#[test]
fn missing_deps_file_fails_the_command() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: out

command c1
  tool = clang
  outputs = out
  args = touch out
  deps = out.d
",
    )?;

    let out = space.run(&mut llb_command(vec!["all"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "unable to open dependencies file (out.d)");

    Ok(())
}

#[test]
fn failed_compile_skips_deps_processing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: out

command c1
  tool = clang
  outputs = out
  args = exit 3
  deps = out.d
",
    )?;

    let out = space.run(&mut llb_command(vec!["all"]))?;
    assert!(!out.status.success());
    // The failure is the exit code, not a deps-file complaint.
    let stderr = std::str::from_utf8(&out.stderr)?;
    assert!(
        !stderr.contains("dependencies file"),
        "unexpected deps error:\n{}",
        stderr
    );

    Ok(())
}

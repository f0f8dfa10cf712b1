//! Tests for behavior around missing inputs and unbuildable nodes.

use crate::e2e::*;

#[test]
fn missing_input_fails_the_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.llb", "target all: missing.c\n")?;

    let out = space.run(&mut llb_command(vec!["all"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "missing input 'missing.c' and no rule to build it");
    assert_stderr_contains(&out, "cannot build target 'all' due to missing input");

    Ok(())
}

#[test]
fn missing_command_input_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: out

command mkout
  tool = shell
  inputs = nofile
  outputs = out
  args = cat nofile > out
",
    )?;

    let out = space.run(&mut llb_command(vec!["all"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "missing input 'nofile' and no rule to build it");
    // The body never ran.
    assert!(space.read("out").is_err());

    Ok(())
}

#[test]
fn ambiguous_producer_fails_consumers() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: out

command c1
  tool = shell
  outputs = out
  args = touch out

command c2
  tool = shell
  outputs = out
  args = touch out
",
    )?;

    let out = space.run(&mut llb_command(vec!["all"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(
        &out,
        "unable to build node: 'out' (node is produced by multiple commands; \
         e.g., 'c1' and 'c2')",
    );
    assert!(space.read("out").is_err());

    Ok(())
}

#[test]
fn unreadable_manifest_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;

    let out = space.run(&mut llb_command(vec!["all"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "unable to load build file");

    Ok(())
}

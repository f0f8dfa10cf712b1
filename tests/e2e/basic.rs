use crate::e2e::*;

#[test]
fn minimal_build_then_cached() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "client llb 0

target all: out

command mkout
  tool = shell
  inputs = in
  outputs = out
  args = cat in > out
  description = CAT out
",
    )?;
    space.write("in", "hi\n")?;

    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "CAT out");
    assert_output_contains(&out, "ran 1 task");
    assert_eq!(space.read("out")?, b"hi\n");

    // Second build: the cached command result is reused.
    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "no work to do");

    Ok(())
}

#[test]
fn changed_input_reruns_once() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: out

command mkout
  tool = shell
  inputs = in
  outputs = out
  args = cat in > out
",
    )?;
    space.write("in", "one\n")?;
    space.run_expect(&mut llb_command(vec!["all"]))?;

    space.write("in", "two, longer\n")?;
    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert_eq!(space.read("out")?, b"two, longer\n");

    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "no work to do");

    Ok(())
}

#[test]
fn changed_args_rerun_despite_unchanged_inputs() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let manifest = |text: &str| {
        format!(
            "target all: out

command mkout
  tool = shell
  outputs = out
  args = [/bin/sh, -c, echo {} > out]
",
            text
        )
    };
    space.write("build.llb", &manifest("one"))?;
    space.run_expect(&mut llb_command(vec!["all"]))?;

    // Same inputs and outputs; only the argv changed.
    space.write("build.llb", &manifest("two"))?;
    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert_eq!(space.read("out")?, b"two\n");

    Ok(())
}

#[test]
fn phony_synchronizes_quietly() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: <all>

command mkout
  tool = shell
  inputs = in
  outputs = out
  args = cat in > out

command sync
  tool = phony
  inputs = out
  outputs = <all>
",
    )?;
    space.write("in", "x")?;

    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    // The phony command's status is suppressed; only the shell step counts.
    assert_output_contains(&out, "ran 1 task");
    assert_output_not_contains(&out, "sync");

    // Virtual outputs are skipped by the staleness check, so everything
    // stays cached.
    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "no work to do");

    Ok(())
}

#[test]
fn command_that_forgets_its_output_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: out

command liar
  tool = shell
  outputs = out
  args = true
",
    )?;

    let out = space.run(&mut llb_command(vec!["all"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "missing output 'out'");
    assert_stderr_contains(&out, "build failed");

    Ok(())
}

#[test]
fn failing_command_fails_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: out

command boom
  tool = shell
  outputs = out
  args = exit 1
",
    )?;

    let out = space.run(&mut llb_command(vec!["all"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "build failed");

    Ok(())
}

#[test]
fn unknown_target_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.llb", "target all:\n")?;

    let out = space.run(&mut llb_command(vec!["nonesuch"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "unknown target 'nonesuch'");

    Ok(())
}

#[test]
fn verbose_prints_command_lines() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: out

command mkout
  tool = shell
  outputs = out
  args = touch out
  description = TOUCH out
",
    )?;

    let out = space.run_expect(&mut llb_command(vec!["-v", "all"]))?;
    assert_output_contains(&out, "/bin/sh -c \"touch out\"");

    Ok(())
}

use crate::e2e::*;

#[test]
fn dependency_cycle_is_reported_with_full_path() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target a: n1

command c1
  tool = shell
  inputs = n2
  outputs = n1
  args = touch n1

command c2
  tool = shell
  inputs = n1
  outputs = n2
  args = touch n2
",
    )?;

    let out = space.run(&mut llb_command(vec!["a"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(
        &out,
        "cycle detected while building: target 'a' -> node 'n1' -> command 'c1' \
         -> node 'n2' -> command 'c2' -> node 'n1'",
    );

    Ok(())
}

#[test]
fn self_cycle() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target a: out

command c1
  tool = shell
  inputs = out
  outputs = out
  args = touch out
",
    )?;

    let out = space.run(&mut llb_command(vec!["a"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "cycle detected while building");

    Ok(())
}

//! Tests for the mkdir tool.

use crate::e2e::*;

#[test]
fn mkdir_is_idempotent() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: subdir

command makedir
  tool = mkdir
  outputs = subdir
  description = MKDIR subdir
",
    )?;

    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert!(space.metadata("subdir")?.is_dir());

    // Once the directory exists, repeated builds do not re-invoke mkdir.
    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "no work to do");

    // Deleting the directory re-invokes it exactly once.
    space.remove_dir("subdir")?;
    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "ran 1 task");
    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "no work to do");

    Ok(())
}

#[test]
fn writing_into_the_directory_does_not_dirty_it() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.llb",
        "target all: subdir/out

command makedir
  tool = mkdir
  outputs = subdir

command mkout
  tool = shell
  inputs = subdir
  outputs = subdir/out
  args = echo hi > subdir/out
",
    )?;

    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    assert_eq!(space.read("subdir/out")?, b"hi\n");

    // Creating subdir/out changed the directory's mtime, but mkdir validity
    // ignores the FileInfo, so nothing re-runs.
    let out = space.run_expect(&mut llb_command(vec!["all"]))?;
    assert_output_contains(&out, "no work to do");

    Ok(())
}

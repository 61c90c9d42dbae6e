//! Integration tests for marshaling pipelines into definitions.

use strata_op::{
  CUSTOM_NAME_KEY, Definition, Digest, FileActionKind, FileInput, Op, OpKind, Platform, SourceOp,
};
use strata_pipeline::{
  MarshalOptions, MountOptions, OpOptions, RunOptions, Source, State, copy, image, marshal, merge,
  mkdir, scratch,
};

fn op<'a>(def: &'a Definition, digest: &Digest) -> &'a Op {
  def.ops.get(digest).expect("op present")
}

fn source_of(op: &Op) -> &SourceOp {
  match &op.op {
    OpKind::Source(source) => source,
    other => panic!("expected source, got {:?}", other),
  }
}

fn head(def: &Definition) -> &Op {
  op(def, &def.heads[0].digest)
}

fn linux() -> MarshalOptions {
  MarshalOptions::new().platform(Platform::linux_amd64())
}

#[test]
fn test_marshal_is_deterministic() {
  let build = || {
    image("rust:1")
      .dir("/src")
      .add_env("CARGO_HOME", "/cargo")
      .run(RunOptions::shell("cargo build"))
      .root()
      .file(mkdir("target/out", 0o755, true))
      .unwrap()
  };
  let a = build().marshal(&linux()).unwrap();
  let b = build().marshal(&linux()).unwrap();
  assert_eq!(a, b);
  assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
  a.validate().unwrap();
}

#[test]
fn test_identical_pipelines_collapse() {
  let left = image("alpine").run(RunOptions::new(["apk", "add", "git"])).root();
  let right = image("alpine").run(RunOptions::new(["apk", "add", "git"])).root();

  let def = marshal(&[left, right], &linux()).unwrap();
  assert_eq!(def.len(), 2);
  assert_eq!(def.heads.len(), 1);
}

#[test]
fn test_identical_images_deduplicate_as_inputs() {
  let st = image("foo")
    .run(RunOptions::new(["true"]))
    .add_mount("/a", &image("foo"), MountOptions::new().readonly())
    .unwrap()
    .root();
  let def = st.marshal(&linux()).unwrap();

  assert_eq!(def.len(), 2);
  let exec_op = head(&def);
  assert_eq!(exec_op.inputs.len(), 1);
  match &exec_op.op {
    OpKind::Exec(exec) => {
      assert_eq!(exec.mounts[0].input, Some(0));
      assert_eq!(exec.mounts[1].input, Some(0));
    }
    other => panic!("expected exec, got {:?}", other),
  }
}

#[test]
fn test_image_reference_is_normalized() {
  let def = image("foo").marshal(&linux()).unwrap();
  assert_eq!(
    source_of(head(&def)).identifier,
    "docker-image://docker.io/library/foo:latest"
  );
}

#[test]
fn test_platform_defaults_to_marshal_option() {
  let st = image("foo").run(RunOptions::new(["ls"])).root();
  let def = st
    .marshal(&MarshalOptions::new().platform(Platform::windows_amd64()))
    .unwrap();

  assert_eq!(def.len(), 2);
  for op in def.ops.values() {
    assert_eq!(op.platform, Some(Platform::windows_amd64()));
  }
}

#[test]
fn test_explicit_platform_wins_over_default() {
  let st = Source::image("foo")
    .platform(Platform::linux_armhf())
    .state()
    .run(RunOptions::new(["ls"]))
    .root();
  let def = st
    .marshal(&MarshalOptions::new().platform(Platform::windows_amd64()))
    .unwrap();

  for op in def.ops.values() {
    assert_eq!(op.platform, Some(Platform::linux_armhf()));
  }
  assert_eq!(head(&def).platform.as_ref().unwrap().to_string(), "linux/arm/v7");
}

#[test]
fn test_platform_without_any_override_is_host() {
  let def = image("foo").marshal(&MarshalOptions::new()).unwrap();
  assert_eq!(head(&def).platform, Some(Platform::host()));
}

#[test]
fn test_mixed_platform_mount_keeps_own_platform() {
  let tools = Source::image("tools")
    .platform(Platform::linux_amd64())
    .state();
  let st = Source::image("foo")
    .platform(Platform::linux_armhf())
    .state()
    .run(RunOptions::new(["cmd"]))
    .add_mount("/tools", &tools, MountOptions::new().readonly())
    .unwrap()
    .root();
  let def = st
    .marshal(&MarshalOptions::new().platform(Platform::windows_amd64()))
    .unwrap();

  assert_eq!(def.len(), 3);
  let exec_op = head(&def);
  assert_eq!(exec_op.platform, Some(Platform::linux_armhf()));

  let root = op(&def, &exec_op.inputs[0].digest);
  assert_eq!(source_of(root).identifier, "docker-image://docker.io/library/foo:latest");
  assert_eq!(root.platform, Some(Platform::linux_armhf()));

  let mounted = op(&def, &exec_op.inputs[1].digest);
  assert_eq!(source_of(mounted).identifier, "docker-image://docker.io/library/tools:latest");
  assert_eq!(mounted.platform, Some(Platform::linux_amd64()));
}

#[test]
fn test_platform_override_mid_pipeline() {
  let st = image("foo")
    .platform(Platform::linux_arm64())
    .run(RunOptions::new(["ls"]))
    .root();
  let def = st
    .marshal(&MarshalOptions::new().platform(Platform::windows_amd64()))
    .unwrap();

  let exec_op = head(&def);
  assert_eq!(exec_op.platform, Some(Platform::linux_arm64()));
  let source = op(&def, &exec_op.inputs[0].digest);
  assert_eq!(source.platform, Some(Platform::windows_amd64()));
}

#[test]
fn test_file_chain_marshals_into_one_op() {
  let st = image("foo")
    .dir("/tmp")
    .file(
      mkdir("foo/bar/", 0o700, false)
        .rm("abc", false)
        .mkfile("foo/bar/baz", 0o777, "d0"),
    )
    .unwrap()
    .dir("sub")
    .file(strata_pipeline::rm("foo", false).mkfile("/abc", 0o701, "d1"))
    .unwrap();
  let def = st.marshal(&linux()).unwrap();
  assert_eq!(def.len(), 3);

  let second = head(&def);
  let OpKind::File(second_file) = &second.op else {
    panic!("expected file op");
  };
  assert_eq!(second.inputs.len(), 1);
  assert_eq!(second_file.actions.len(), 2);
  assert_eq!(second_file.actions[0].target_path(), Some("/tmp/sub/foo"));
  assert_eq!(second_file.actions[1].input, FileInput::Action(0));
  assert_eq!(second_file.actions[1].output, Some(0));

  let first = op(&def, &second.inputs[0].digest);
  let OpKind::File(first_file) = &first.op else {
    panic!("expected file op");
  };
  let paths: Vec<_> = first_file
    .actions
    .iter()
    .filter_map(|a| a.target_path())
    .collect();
  assert_eq!(paths, vec!["/tmp/foo/bar", "/tmp/abc", "/tmp/foo/bar/baz"]);

  let base = op(&def, &first.inputs[0].digest);
  assert_eq!(source_of(base).identifier, "docker-image://docker.io/library/foo:latest");
}

#[test]
fn test_copy_between_states() {
  let st = image("foo")
    .dir("/tmp")
    .file(copy(&image("bar").dir("/etc"), "foo", "bar", Default::default()))
    .unwrap();
  let def = st.marshal(&linux()).unwrap();
  assert_eq!(def.len(), 3);

  let file_op = head(&def);
  assert_eq!(file_op.inputs.len(), 2);
  assert_eq!(
    source_of(op(&def, &file_op.inputs[0].digest)).identifier,
    "docker-image://docker.io/library/foo:latest"
  );
  assert_eq!(
    source_of(op(&def, &file_op.inputs[1].digest)).identifier,
    "docker-image://docker.io/library/bar:latest"
  );
}

#[test]
fn test_merge_records_capability() {
  let st = merge(&[image("a"), image("b")], OpOptions::new());
  let def = st.marshal(&linux()).unwrap();
  let OpKind::File(file) = &head(&def).op else {
    panic!("expected file op");
  };
  assert!(matches!(file.actions[0].action, FileActionKind::Merge { .. }));
  let required = def.required_caps();
  assert!(required.contains("file.merge"));
  assert!(required.contains("source.image"));
}

#[test]
fn test_exec_output_of_extra_mount() {
  let exec = image("golang")
    .run(RunOptions::shell("go build -o /out/app"))
    .add_mount("/out", &scratch(), MountOptions::new())
    .unwrap();
  let out = exec.mount("/out").unwrap();
  let def = out.marshal(&linux()).unwrap();
  assert_eq!(def.heads[0].index, 1);
  assert_eq!(head(&def).num_outputs(), 2);
}

#[test]
fn test_custom_name_in_metadata() {
  let st = image("foo")
    .run(RunOptions::new(["make"]).options(OpOptions::new().custom_name("compile")))
    .root();
  let def = st.marshal(&linux()).unwrap();
  let meta = def.metadata(&def.heads[0].digest).unwrap();
  assert_eq!(
    meta.description.get(CUSTOM_NAME_KEY).map(String::as_str),
    Some("compile")
  );
}

#[test]
fn test_states_build_concurrently() {
  let base = image("alpine").dir("/work");
  let handles: Vec<_> = (0..4)
    .map(|i| {
      let base = base.clone();
      std::thread::spawn(move || -> State {
        base
          .run(RunOptions::new(["echo".to_string(), i.to_string()]))
          .root()
      })
    })
    .collect();
  let states: Vec<State> = handles.into_iter().map(|h| h.join().unwrap()).collect();
  let def = marshal(&states, &linux()).unwrap();
  assert_eq!(def.len(), 5);
  assert_eq!(def.heads.len(), 4);
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One step along a path into the state tree: an object key or an array
/// index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

/// One structural operation against a state tree.
///
/// Operations inside a `state_patch` frame apply strictly in order; each
/// patch describes the transition between two specific state versions and
/// is meaningless against any other base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    Add {
        path: Vec<PathSegment>,
        value: Value,
    },
    Replace {
        path: Vec<PathSegment>,
        value: Value,
    },
    Remove {
        path: Vec<PathSegment>,
    },
}

impl PatchOp {
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("path '{0}' does not exist")]
    MissingPath(String),
    #[error("path '{0}' does not traverse an object or array")]
    NotAContainer(String),
    #[error("cannot add at '{0}': already present")]
    AlreadyPresent(String),
    #[error("array index {index} out of bounds at '{path}'")]
    IndexOutOfBounds { path: String, index: usize },
    #[error("cannot remove the state root")]
    RemoveRoot,
}

/// Render a path for diagnostics, e.g. `tabs.0.title`.
pub fn format_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "<root>".to_string();
    }
    path.iter()
        .map(|segment| match segment {
            PathSegment::Key(key) => key.clone(),
            PathSegment::Index(index) => index.to_string(),
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Compute the ordered operations that transform `old` into `new`.
///
/// Replaying the returned operations in order against `old` yields `new`
/// exactly; equal subtrees produce no operations. Object diffs emit
/// removals before additions; array growth adds indices in ascending order
/// and shrinkage removes them in descending order so that every index is
/// valid at the moment its operation applies.
pub fn diff(old: &Value, new: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    let mut path = Vec::new();
    diff_at(old, new, &mut path, &mut ops);
    ops
}

fn diff_at(old: &Value, new: &Value, path: &mut Vec<PathSegment>, ops: &mut Vec<PatchOp>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    ops.push(PatchOp::Remove {
                        path: child(path, PathSegment::Key(key.clone())),
                    });
                }
            }
            for (key, new_child) in new_map {
                match old_map.get(key) {
                    Some(old_child) => {
                        path.push(PathSegment::Key(key.clone()));
                        diff_at(old_child, new_child, path, ops);
                        path.pop();
                    }
                    None => ops.push(PatchOp::Add {
                        path: child(path, PathSegment::Key(key.clone())),
                        value: new_child.clone(),
                    }),
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            let shared = old_items.len().min(new_items.len());
            for index in 0..shared {
                path.push(PathSegment::Index(index));
                diff_at(&old_items[index], &new_items[index], path, ops);
                path.pop();
            }
            for (index, item) in new_items.iter().enumerate().skip(shared) {
                ops.push(PatchOp::Add {
                    path: child(path, PathSegment::Index(index)),
                    value: item.clone(),
                });
            }
            for index in (shared..old_items.len()).rev() {
                ops.push(PatchOp::Remove {
                    path: child(path, PathSegment::Index(index)),
                });
            }
        }
        _ => {
            if old != new {
                ops.push(PatchOp::Replace {
                    path: path.clone(),
                    value: new.clone(),
                });
            }
        }
    }
}

fn child(path: &[PathSegment], segment: PathSegment) -> Vec<PathSegment> {
    let mut full = path.to_vec();
    full.push(segment);
    full
}

/// Apply `ops` to `state` strictly in order.
///
/// Any failure is a protocol violation: the patch referenced a state
/// version the local value does not match. `state` is left as of the last
/// successfully applied operation; callers are expected to discard it and
/// recover via a full sync.
pub fn apply_patch(state: &mut Value, ops: &[PatchOp]) -> Result<(), PatchError> {
    for op in ops {
        apply_op(state, op)?;
    }
    Ok(())
}

fn apply_op(state: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    match op {
        PatchOp::Add { path, value } => match path.split_last() {
            None => {
                *state = value.clone();
                Ok(())
            }
            Some((last, parents)) => {
                let parent = resolve_mut(state, parents)?;
                match (parent, last) {
                    (Value::Object(map), PathSegment::Key(key)) => {
                        if map.contains_key(key) {
                            return Err(PatchError::AlreadyPresent(format_path(path)));
                        }
                        map.insert(key.clone(), value.clone());
                        Ok(())
                    }
                    (Value::Array(items), PathSegment::Index(index)) => {
                        if *index > items.len() {
                            return Err(PatchError::IndexOutOfBounds {
                                path: format_path(parents),
                                index: *index,
                            });
                        }
                        items.insert(*index, value.clone());
                        Ok(())
                    }
                    _ => Err(PatchError::NotAContainer(format_path(parents))),
                }
            }
        },
        PatchOp::Replace { path, value } => {
            let target = resolve_mut(state, path)?;
            *target = value.clone();
            Ok(())
        }
        PatchOp::Remove { path } => match path.split_last() {
            None => Err(PatchError::RemoveRoot),
            Some((last, parents)) => {
                let parent = resolve_mut(state, parents)?;
                match (parent, last) {
                    (Value::Object(map), PathSegment::Key(key)) => map
                        .remove(key)
                        .map(|_| ())
                        .ok_or_else(|| PatchError::MissingPath(format_path(path))),
                    (Value::Array(items), PathSegment::Index(index)) => {
                        if *index >= items.len() {
                            return Err(PatchError::IndexOutOfBounds {
                                path: format_path(parents),
                                index: *index,
                            });
                        }
                        items.remove(*index);
                        Ok(())
                    }
                    _ => Err(PatchError::NotAContainer(format_path(parents))),
                }
            }
        },
    }
}

fn resolve_mut<'a>(state: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, PatchError> {
    let mut current = state;
    for (depth, segment) in path.iter().enumerate() {
        current = match segment {
            PathSegment::Key(key) => match current {
                Value::Object(map) => map
                    .get_mut(key)
                    .ok_or_else(|| PatchError::MissingPath(format_path(&path[..=depth])))?,
                _ => return Err(PatchError::NotAContainer(format_path(&path[..depth]))),
            },
            PathSegment::Index(index) => match current {
                Value::Array(items) => items
                    .get_mut(*index)
                    .ok_or_else(|| PatchError::MissingPath(format_path(&path[..=depth])))?,
                _ => return Err(PatchError::NotAContainer(format_path(&path[..depth]))),
            },
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn replay(old: &Value, new: &Value) {
        let ops = diff(old, new);
        let mut replayed = old.clone();
        apply_patch(&mut replayed, &ops).expect("patch applies");
        assert_eq!(&replayed, new, "replaying {ops:?} against {old} must yield {new}");
    }

    #[test]
    fn equal_values_produce_no_ops() {
        let value = json!({"a": [1, 2, {"b": null}], "c": "x"});
        assert!(diff(&value, &value).is_empty());
    }

    #[test]
    fn scalar_change_is_a_single_replace() {
        let ops = diff(&json!({"counter": 0}), &json!({"counter": 5}));
        assert_eq!(
            ops,
            vec![PatchOp::Replace {
                path: vec![PathSegment::Key("counter".into())],
                value: json!(5),
            }]
        );
    }

    #[test]
    fn type_mismatch_replaces_the_subtree() {
        let ops = diff(&json!({"a": [1, 2]}), &json!({"a": {"b": 1}}));
        assert_eq!(
            ops,
            vec![PatchOp::Replace {
                path: vec![PathSegment::Key("a".into())],
                value: json!({"b": 1}),
            }]
        );
    }

    #[test]
    fn object_removals_precede_additions() {
        let ops = diff(&json!({"gone": 1, "kept": 2}), &json!({"kept": 2, "new": 3}));
        assert_eq!(
            ops,
            vec![
                PatchOp::Remove {
                    path: vec![PathSegment::Key("gone".into())],
                },
                PatchOp::Add {
                    path: vec![PathSegment::Key("new".into())],
                    value: json!(3),
                },
            ]
        );
    }

    #[test]
    fn array_shrink_removes_descending() {
        let ops = diff(&json!([1, 2, 3]), &json!([9]));
        assert_eq!(
            ops,
            vec![
                PatchOp::Replace {
                    path: vec![PathSegment::Index(0)],
                    value: json!(9),
                },
                PatchOp::Remove {
                    path: vec![PathSegment::Index(2)],
                },
                PatchOp::Remove {
                    path: vec![PathSegment::Index(1)],
                },
            ]
        );
    }

    #[test]
    fn array_growth_adds_ascending() {
        let ops = diff(&json!([1]), &json!([1, 2, 3]));
        assert_eq!(
            ops,
            vec![
                PatchOp::Add {
                    path: vec![PathSegment::Index(1)],
                    value: json!(2),
                },
                PatchOp::Add {
                    path: vec![PathSegment::Index(2)],
                    value: json!(3),
                },
            ]
        );
    }

    #[test]
    fn replay_converges_on_nested_transitions() {
        let cases = [
            (json!(null), json!({"a": 1})),
            (json!({"a": 1}), json!(null)),
            (
                json!({"workspace": {"tabs": [{"title": "a"}, {"title": "b"}], "active": 0}}),
                json!({"workspace": {"tabs": [{"title": "a", "pinned": true}], "active": 1}}),
            ),
            (
                json!({"chat": [], "files": {"open": ["x.rs"]}}),
                json!({"chat": [{"role": "user", "text": "hi"}], "files": {}}),
            ),
            (json!([[1, 2], [3]]), json!([[1], [3, 4], [5]])),
        ];
        for (old, new) in &cases {
            replay(old, new);
        }
    }

    #[test]
    fn root_replacement_round_trips() {
        replay(&json!({"a": 1}), &json!(42));
        let ops = diff(&json!({"a": 1}), &json!(42));
        assert_eq!(
            ops,
            vec![PatchOp::Replace {
                path: vec![],
                value: json!(42),
            }]
        );
    }

    #[test]
    fn apply_rejects_missing_paths() {
        let mut state = json!({"a": 1});
        let err = apply_patch(
            &mut state,
            &[PatchOp::Replace {
                path: vec![PathSegment::Key("b".into())],
                value: json!(2),
            }],
        )
        .expect_err("missing path");
        assert_eq!(err, PatchError::MissingPath("b".into()));
    }

    #[test]
    fn apply_rejects_duplicate_adds() {
        let mut state = json!({"a": 1});
        let err = apply_patch(
            &mut state,
            &[PatchOp::Add {
                path: vec![PathSegment::Key("a".into())],
                value: json!(2),
            }],
        )
        .expect_err("already present");
        assert_eq!(err, PatchError::AlreadyPresent("a".into()));
    }

    #[test]
    fn apply_rejects_out_of_bounds_indices() {
        let mut state = json!({"items": [1]});
        let err = apply_patch(
            &mut state,
            &[PatchOp::Add {
                path: vec![PathSegment::Key("items".into()), PathSegment::Index(3)],
                value: json!(2),
            }],
        )
        .expect_err("out of bounds");
        assert_eq!(
            err,
            PatchError::IndexOutOfBounds {
                path: "items".into(),
                index: 3,
            }
        );
    }

    #[test]
    fn apply_rejects_root_removal() {
        let mut state = json!({"a": 1});
        let err = apply_patch(&mut state, &[PatchOp::Remove { path: vec![] }])
            .expect_err("remove root");
        assert_eq!(err, PatchError::RemoveRoot);
    }

    #[test]
    fn path_segments_serialize_as_keys_and_indices() {
        let op = PatchOp::Remove {
            path: vec![PathSegment::Key("tabs".into()), PathSegment::Index(2)],
        };
        let raw = serde_json::to_value(&op).expect("serialize");
        assert_eq!(raw["path"], json!(["tabs", 2]));
        let back: PatchOp = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(back, op);
    }
}

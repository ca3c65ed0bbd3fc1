//! Builds RFC 6902 JSON patches that add to an object without touching any
//! field they do not name.

use crate::k8s::labels::Map;
use json_patch::{
    jsonptr::PointerBuf, AddOperation, Patch, PatchOperation, RemoveOperation, ReplaceOperation,
};
use serde::Serialize;

const ANNOTATIONS: [&str; 2] = ["metadata", "annotations"];

#[derive(Clone, Debug, Default)]
pub struct PatchBuilder {
    ops: Vec<PatchOperation>,
}

// === impl PatchBuilder ===

impl PatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `added` to the list at `path`, which currently holds `len`
    /// items.
    ///
    /// An empty (or missing) list is set whole, since JSON patch cannot append
    /// to a list that does not exist.
    pub fn append<T: Serialize>(
        mut self,
        path: &[&str],
        len: usize,
        added: &[T],
    ) -> serde_json::Result<Self> {
        if added.is_empty() {
            return Ok(self);
        }

        if len == 0 {
            self.ops.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(path.iter().copied()),
                value: serde_json::to_value(added)?,
            }));
            return Ok(self);
        }

        for item in added {
            self.ops.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(path.iter().copied().chain(Some("-"))),
                value: serde_json::to_value(item)?,
            }));
        }
        Ok(self)
    }

    /// Sets each of the `desired` annotations. Annotations that already hold
    /// the desired value are left alone.
    pub fn set_annotations(mut self, current: Option<&Map>, desired: &Map) -> Self {
        let mut exists = current.is_some();
        for (key, value) in desired {
            if !exists {
                let mut map = serde_json::Map::new();
                map.insert(key.clone(), value.clone().into());
                self.ops.push(PatchOperation::Add(AddOperation {
                    path: PointerBuf::from_tokens(ANNOTATIONS),
                    value: map.into(),
                }));
                exists = true;
                continue;
            }

            let path = PointerBuf::from_tokens(ANNOTATIONS.into_iter().chain(Some(key.as_str())));
            match current.and_then(|c| c.get(key)) {
                Some(v) if v == value => {}
                Some(_) => self.ops.push(PatchOperation::Replace(ReplaceOperation {
                    path,
                    value: value.clone().into(),
                })),
                None => self.ops.push(PatchOperation::Add(AddOperation {
                    path,
                    value: value.clone().into(),
                })),
            }
        }
        self
    }

    /// Removes each of `keys` that is present in `current`.
    pub fn remove_annotations<'k>(
        mut self,
        current: Option<&Map>,
        keys: impl IntoIterator<Item = &'k str>,
    ) -> Self {
        let Some(current) = current else {
            return self;
        };
        for key in keys {
            if current.contains_key(key) {
                self.ops.push(PatchOperation::Remove(RemoveOperation {
                    path: PointerBuf::from_tokens(ANNOTATIONS.into_iter().chain(Some(key))),
                }));
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn build(self) -> Patch {
        Patch(self.ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{Container, Pod, PodSpec};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(format!("{name}:latest")),
            ..Default::default()
        }
    }

    fn pod(containers: Vec<Container>, annotations: Option<Map>) -> Pod {
        let mut pod = Pod {
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            ..Default::default()
        };
        pod.metadata.name = Some("pod-0".to_string());
        pod.metadata.labels = Some(btreemap! { "app".to_string() => "web".to_string() });
        pod.metadata.annotations = annotations;
        pod
    }

    fn apply(obj: &Pod, patch: &Patch) -> serde_json::Value {
        let mut doc = serde_json::to_value(obj).unwrap();
        json_patch::patch(&mut doc, &patch.0).expect("patch must apply");
        doc
    }

    #[test]
    fn empty_list_is_set_whole() {
        let current = pod(vec![], None);
        let patch = PatchBuilder::new()
            .append(&["spec", "containers"], 0, &[container("a"), container("b")])
            .unwrap()
            .build();

        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            serde_json::json!([{
                "op": "add",
                "path": "/spec/containers",
                "value": [
                    { "name": "a", "image": "a:latest" },
                    { "name": "b", "image": "b:latest" },
                ],
            }])
        );

        let desired = pod(vec![container("a"), container("b")], None);
        assert_eq!(apply(&current, &patch), serde_json::to_value(&desired).unwrap());
    }

    #[test]
    fn non_empty_list_is_appended() {
        let current = pod(vec![container("app")], None);
        let patch = PatchBuilder::new()
            .append(&["spec", "containers"], 1, &[container("a"), container("b")])
            .unwrap()
            .build();

        let paths = patch
            .0
            .iter()
            .map(|op| match op {
                PatchOperation::Add(AddOperation { path, .. }) => path.to_string(),
                op => panic!("unexpected operation: {op:?}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["/spec/containers/-", "/spec/containers/-"]);

        let desired = pod(vec![container("app"), container("a"), container("b")], None);
        assert_eq!(apply(&current, &patch), serde_json::to_value(&desired).unwrap());
    }

    #[test]
    fn nothing_added() {
        let patch = PatchBuilder::new()
            .append::<Container>(&["spec", "containers"], 0, &[])
            .unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn annotations_created() {
        let current = pod(vec![container("app")], None);
        let desired_annotations = btreemap! {
            "a.io/one".to_string() => "1".to_string(),
            "two".to_string() => "2".to_string(),
        };
        let patch = PatchBuilder::new()
            .set_annotations(None, &desired_annotations)
            .build();

        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            serde_json::json!([
                { "op": "add", "path": "/metadata/annotations", "value": { "a.io/one": "1" } },
                { "op": "add", "path": "/metadata/annotations/two", "value": "2" },
            ])
        );

        let desired = pod(vec![container("app")], Some(desired_annotations));
        assert_eq!(apply(&current, &patch), serde_json::to_value(&desired).unwrap());
    }

    #[test]
    fn annotations_merged() {
        let existing = btreemap! {
            "keep".to_string() => "me".to_string(),
            "a.io/one".to_string() => "old".to_string(),
            "same".to_string() => "value".to_string(),
        };
        let current = pod(vec![container("app")], Some(existing.clone()));
        let patch = PatchBuilder::new()
            .set_annotations(
                Some(&existing),
                &btreemap! {
                    "a.io/one".to_string() => "new".to_string(),
                    "added".to_string() => "x".to_string(),
                    "same".to_string() => "value".to_string(),
                },
            )
            .build();

        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            serde_json::json!([
                { "op": "replace", "path": "/metadata/annotations/a.io~1one", "value": "new" },
                { "op": "add", "path": "/metadata/annotations/added", "value": "x" },
            ])
        );

        let desired = pod(
            vec![container("app")],
            Some(btreemap! {
                "keep".to_string() => "me".to_string(),
                "a.io/one".to_string() => "new".to_string(),
                "added".to_string() => "x".to_string(),
                "same".to_string() => "value".to_string(),
            }),
        );
        assert_eq!(apply(&current, &patch), serde_json::to_value(&desired).unwrap());
    }

    #[test]
    fn annotations_removed() {
        let existing = btreemap! {
            "keep".to_string() => "me".to_string(),
            "a.io/one".to_string() => "1".to_string(),
        };
        let current = pod(vec![], Some(existing.clone()));
        let patch = PatchBuilder::new()
            .remove_annotations(Some(&existing), ["a.io/one", "absent"])
            .build();
        assert_eq!(patch.0.len(), 1);

        let desired = pod(
            vec![],
            Some(btreemap! { "keep".to_string() => "me".to_string() }),
        );
        assert_eq!(apply(&current, &patch), serde_json::to_value(&desired).unwrap());

        assert!(PatchBuilder::new()
            .remove_annotations(None, ["a.io/one"])
            .is_empty());
    }
}

//! State replication: the host's authoritative copy and the client-side
//! read-only mirror. The host serializes every mutation into the ordered
//! patch that describes it; mirrors converge by replaying those patches on
//! top of the last full sync.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use tidepool_proto::{apply_patch, diff, PatchError, PatchOp};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state failed to serialize: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("state snapshot failed to deserialize: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// Host-side authoritative state: the typed value plus the JSON image that
/// snapshots and diffs are computed from. Callers serialize access through
/// the host's state lock.
pub(crate) struct HostState<S> {
    value: S,
    image: Value,
}

impl<S: Clone + Serialize> HostState<S> {
    pub(crate) fn new(value: S) -> Result<Self, StateError> {
        let image = serde_json::to_value(&value).map_err(StateError::Serialize)?;
        Ok(Self { value, image })
    }

    pub(crate) fn value(&self) -> S {
        self.value.clone()
    }

    pub(crate) fn image(&self) -> &Value {
        &self.image
    }

    /// Apply one mutation recipe against a copy, swap the authoritative
    /// value, and return the ordered operations describing the transition.
    /// The recipe sees the next state only; the previous one is untouched
    /// until the diff exists.
    pub(crate) fn mutate(
        &mut self,
        recipe: impl FnOnce(&mut S),
    ) -> Result<Vec<PatchOp>, StateError> {
        let mut next = self.value.clone();
        recipe(&mut next);
        let next_image = serde_json::to_value(&next).map_err(StateError::Serialize)?;
        let ops = diff(&self.image, &next_image);
        self.value = next;
        self.image = next_image;
        Ok(ops)
    }
}

/// Client-side mirror: seeded from a fallback value, replaced wholesale by
/// each `state_sync`, advanced in order by each `state_patch`. Read-only
/// for consumers.
pub(crate) struct Mirror<S> {
    inner: RwLock<MirrorInner<S>>,
}

struct MirrorInner<S> {
    value: S,
    image: Value,
    /// False until the first sync arrives, and cleared again when a patch
    /// fails to apply; a frozen mirror ignores patches until the next full
    /// sync unfreezes it.
    synced: bool,
}

/// What applying a patch did to the mirror.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PatchOutcome {
    Applied,
    /// Dropped because the mirror is frozen awaiting a full sync.
    AwaitingSync,
}

impl<S: Clone + Serialize + DeserializeOwned> Mirror<S> {
    pub(crate) fn new(fallback: S) -> Result<Self, StateError> {
        let image = serde_json::to_value(&fallback).map_err(StateError::Serialize)?;
        Ok(Self {
            inner: RwLock::new(MirrorInner {
                value: fallback,
                image,
                synced: false,
            }),
        })
    }

    pub(crate) fn value(&self) -> S {
        self.inner.read().value.clone()
    }

    pub(crate) fn is_synced(&self) -> bool {
        self.inner.read().synced
    }

    pub(crate) fn apply_sync(&self, state: Value) -> Result<(), StateError> {
        let value: S = serde_json::from_value(state.clone()).map_err(StateError::Deserialize)?;
        let mut inner = self.inner.write();
        inner.value = value;
        inner.image = state;
        inner.synced = true;
        Ok(())
    }

    /// Apply one patch in order. An `Err` is a protocol violation and
    /// freezes the mirror; the caller is expected to request a full sync.
    pub(crate) fn apply_patch_ops(&self, ops: &[PatchOp]) -> Result<PatchOutcome, StateError> {
        let mut inner = self.inner.write();
        if !inner.synced {
            return Ok(PatchOutcome::AwaitingSync);
        }
        if let Err(err) = apply_patch(&mut inner.image, ops) {
            inner.synced = false;
            return Err(err.into());
        }
        match serde_json::from_value::<S>(inner.image.clone()) {
            Ok(value) => {
                inner.value = value;
                Ok(PatchOutcome::Applied)
            }
            Err(err) => {
                inner.synced = false;
                Err(StateError::Deserialize(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Workspace {
        counter: i64,
        tabs: Vec<String>,
    }

    fn initial() -> Workspace {
        Workspace {
            counter: 0,
            tabs: vec!["home".into()],
        }
    }

    #[test]
    fn mutations_describe_their_own_transition() {
        let mut state = HostState::new(initial()).expect("host state");
        let before = state.image().clone();
        let ops = state
            .mutate(|workspace| {
                workspace.counter = 5;
                workspace.tabs.push("docs".into());
            })
            .expect("mutate");

        let mut replayed = before;
        apply_patch(&mut replayed, &ops).expect("replay");
        assert_eq!(&replayed, state.image());
        assert_eq!(state.value().counter, 5);
    }

    #[test]
    fn identity_mutations_produce_no_ops() {
        let mut state = HostState::new(initial()).expect("host state");
        let ops = state.mutate(|_workspace| {}).expect("mutate");
        assert!(ops.is_empty());
    }

    #[test]
    fn mirror_holds_the_fallback_until_synced() {
        let mirror = Mirror::new(initial()).expect("mirror");
        assert!(!mirror.is_synced());
        assert_eq!(mirror.value(), initial());

        // patches before the first sync are dropped, not applied
        let outcome = mirror
            .apply_patch_ops(&diff(&json!({"counter": 0}), &json!({"counter": 1})))
            .expect("pre-sync patch");
        assert_eq!(outcome, PatchOutcome::AwaitingSync);
        assert_eq!(mirror.value(), initial());
    }

    #[test]
    fn mirror_tracks_sync_then_patches() {
        let mut host = HostState::new(initial()).expect("host state");
        let mirror = Mirror::<Workspace>::new(initial()).expect("mirror");
        mirror.apply_sync(host.image().clone()).expect("sync");

        let ops = host
            .mutate(|workspace| workspace.counter = 42)
            .expect("mutate");
        let outcome = mirror.apply_patch_ops(&ops).expect("patch");
        assert_eq!(outcome, PatchOutcome::Applied);
        assert_eq!(mirror.value().counter, 42);
        assert_eq!(mirror.value(), host.value());
    }

    #[test]
    fn a_bad_patch_freezes_the_mirror_until_the_next_sync() {
        let mirror = Mirror::<Workspace>::new(initial()).expect("mirror");
        mirror
            .apply_sync(json!({"counter": 0, "tabs": []}))
            .expect("sync");

        let bogus = diff(&json!({"ghost": 1}), &json!({"ghost": 2}));
        mirror.apply_patch_ops(&bogus).expect_err("must fail");
        assert!(!mirror.is_synced());

        // frozen: even a well-formed patch is ignored now
        let fine = diff(
            &json!({"counter": 0, "tabs": []}),
            &json!({"counter": 1, "tabs": []}),
        );
        assert_eq!(
            mirror.apply_patch_ops(&fine).expect("frozen patch"),
            PatchOutcome::AwaitingSync
        );

        // the next full sync unfreezes it
        mirror
            .apply_sync(json!({"counter": 7, "tabs": ["a"]}))
            .expect("resync");
        assert!(mirror.is_synced());
        assert_eq!(mirror.value().counter, 7);
    }
}

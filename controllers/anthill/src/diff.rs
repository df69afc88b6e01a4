//! Diff engine.
//!
//! Compares two effective cluster states slot by slot. Nodes and volumes are
//! aligned by position, not identity: reordering a list is indistinguishable
//! from replacing its elements.

use crds::{Node, NodeVolume};
use k8s_openapi::api::core::v1::PersistentVolumeSpec;

/// One volume slot that needs action.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateVolume {
    pub old: Option<NodeVolume>,
    pub new: Option<NodeVolume>,
    /// Position in the node's device list (0 for the state volume)
    pub index: usize,
    pub is_state_volume: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeAction {
    Create,
    Remove,
    Replace,
}

impl UpdateVolume {
    #[must_use]
    pub fn action(&self) -> VolumeAction {
        match (&self.old, &self.new) {
            (None, _) => VolumeAction::Create,
            (Some(_), None) => VolumeAction::Remove,
            (Some(_), Some(_)) => VolumeAction::Replace,
        }
    }
}

/// The volume source of `spec` with every non-source field cleared.
#[must_use]
pub fn volume_source(spec: &PersistentVolumeSpec) -> PersistentVolumeSpec {
    PersistentVolumeSpec {
        access_modes: None,
        capacity: None,
        claim_ref: None,
        mount_options: None,
        node_affinity: None,
        persistent_volume_reclaim_policy: None,
        storage_class_name: None,
        volume_mode: None,
        ..spec.clone()
    }
}

fn storage_capacity(volume: &NodeVolume) -> Option<&str> {
    volume
        .spec
        .capacity
        .as_ref()?
        .get("storage")
        .map(|quantity| quantity.0.as_str())
}

fn volumes_match(old: &NodeVolume, new: &NodeVolume) -> bool {
    old.name() == new.name()
        && storage_capacity(old) == storage_capacity(new)
        && old.spec.persistent_volume_reclaim_policy == new.spec.persistent_volume_reclaim_policy
        && old.spec.storage_class_name == new.spec.storage_class_name
        && old.spec.access_modes == new.spec.access_modes
        && old.spec.mount_options == new.spec.mount_options
        && old.spec.node_affinity == new.spec.node_affinity
        && volume_source(&old.spec) == volume_source(&new.spec)
}

/// Classify one volume slot; `None` means no action.
#[must_use]
pub fn diff_volume(old: Option<&NodeVolume>, new: Option<&NodeVolume>, index: usize) -> Option<UpdateVolume> {
    match (old, new) {
        (None, None) => None,
        (Some(old), Some(new)) if volumes_match(old, new) => None,
        _ => Some(UpdateVolume {
            old: old.cloned(),
            new: new.cloned(),
            index,
            is_state_volume: false,
        }),
    }
}

/// Volume slots of one node needing action: state volume first, then devices by position.
#[must_use]
pub fn diff_node(old: &Node, new: &Node) -> Vec<UpdateVolume> {
    let mut updates = Vec::new();

    if let Some(mut state) = diff_volume(old.state_volume.as_ref(), new.state_volume.as_ref(), 0) {
        state.is_state_volume = true;
        updates.push(state);
    }

    let slots = old.devices.len().max(new.devices.len());
    updates.extend(
        (0..slots).filter_map(|index| diff_volume(old.devices.get(index), new.devices.get(index), index)),
    );

    updates
}

/// A node slot that differs between two states.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeChange<'a> {
    Changed { index: usize, old: &'a Node, new: &'a Node },
    Added { index: usize, node: &'a Node },
    Removed { index: usize, node: &'a Node },
}

#[must_use]
pub fn diff_nodes<'a>(old: &'a [Node], new: &'a [Node]) -> Vec<NodeChange<'a>> {
    let slots = old.len().max(new.len());
    (0..slots)
        .filter_map(|index| match (old.get(index), new.get(index)) {
            (Some(old), Some(new)) if old == new => None,
            (Some(old), Some(new)) => Some(NodeChange::Changed { index, old, new }),
            (None, Some(node)) => Some(NodeChange::Added { index, node }),
            (Some(node), None) => Some(NodeChange::Removed { index, node }),
            (None, None) => None,
        })
        .collect()
}

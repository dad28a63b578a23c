//! Sound registry and node ownership
//!
//! A sound belongs to at most one node. The owning node's uid is stored on
//! the sound and the sound's uid in the node's set; both sides are updated
//! together by the calls here, which only ever run on the session actor.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use jam_protocol::SoundParams;
use jam_utils::{JamError, Result};

use crate::streaming::is_valid_file_id;
use crate::tree::LoopTree;

const DEFAULT_GAIN: f64 = 1.0;
const AUTO_NAME_CHARS: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sound {
    pub uid: String,
    pub name: String,
    pub gain: f64,
    pub pan: f64,
    /// start-extent, loop-start, loop-end, end-extent (ms)
    pub stops: [u64; 4],
    pub node_uid: Option<String>,
    pub account_id: Option<String>,
}

impl Sound {
    fn new(uid: &str) -> Self {
        let short: String = uid.chars().take(AUTO_NAME_CHARS).collect();
        Self {
            uid: uid.to_string(),
            name: format!("Sound {}", short),
            gain: DEFAULT_GAIN,
            pan: 0.0,
            stops: [0; 4],
            node_uid: None,
            account_id: None,
        }
    }
}

/// A sound moving between nodes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeChange {
    pub sound: String,
    pub old_node: Option<String>,
    pub new_node: String,
}

/// Result of `upsert`
#[derive(Debug, Clone, PartialEq)]
pub struct SoundUpsert {
    pub created: bool,
    pub sound: Sound,
    pub node_change: Option<NodeChange>,
}

#[derive(Debug)]
pub struct SoundRegistry {
    sounds: BTreeMap<String, Sound>,
    files_dir: PathBuf,
}

impl SoundRegistry {
    pub fn new(files_dir: impl Into<PathBuf>) -> Self {
        Self {
            sounds: BTreeMap::new(),
            files_dir: files_dir.into(),
        }
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub fn get(&self, uid: &str) -> Option<&Sound> {
        self.sounds.get(uid)
    }

    pub fn list(&self) -> Vec<&Sound> {
        self.sounds.values().collect()
    }

    pub fn len(&self) -> usize {
        self.sounds.len()
    }

    /// Create or merge a sound, assigning it when `node_uid` is given
    ///
    /// Everything is validated before anything changes, so a rejected upsert
    /// leaves both the registry and the tree untouched.
    pub fn upsert(&mut self, tree: &mut LoopTree, params: SoundParams) -> Result<SoundUpsert> {
        if !is_valid_file_id(&params.uid) {
            return Err(JamError::validation("uid", "must match \\w+"));
        }
        if let Some(stops) = &params.stops {
            if stops.windows(2).any(|w| w[0] > w[1]) {
                return Err(JamError::validation("stops", "must be ascending"));
            }
        }
        if let Some(gain) = params.gain {
            if !gain.is_finite() || gain < 0.0 {
                return Err(JamError::validation("gain", "must be a non-negative number"));
            }
        }
        if let Some(pan) = params.pan {
            if !pan.is_finite() || !(-1.0..=1.0).contains(&pan) {
                return Err(JamError::validation("pan", "must be between -1 and 1"));
            }
        }
        if let Some(node) = params.node_uid.as_deref() {
            if !tree.contains(node) {
                return Err(JamError::NodeNotFound(node.to_string()));
            }
        }

        let created = !self.sounds.contains_key(&params.uid);
        let sound = self
            .sounds
            .entry(params.uid.clone())
            .or_insert_with(|| Sound::new(&params.uid));

        if let Some(name) = params.name.filter(|n| !n.is_empty()) {
            sound.name = name;
        }
        if let Some(gain) = params.gain {
            sound.gain = gain;
        }
        if let Some(pan) = params.pan {
            sound.pan = pan;
        }
        if let Some(stops) = params.stops {
            sound.stops = stops;
        }
        if params.account_id.is_some() {
            sound.account_id = params.account_id;
        }
        let current_node = sound.node_uid.clone();

        let node_change = match params.node_uid {
            Some(node) if current_node.as_deref() != Some(node.as_str()) => {
                Some(self.assign(tree, &params.uid, &node)?)
            }
            _ => None,
        };

        let sound = self
            .sounds
            .get(&params.uid)
            .cloned()
            .ok_or_else(|| JamError::SoundNotFound(params.uid.clone()))?;

        Ok(SoundUpsert {
            created,
            sound,
            node_change,
        })
    }

    /// Move a sound to `node`, leaving its previous owner first
    pub fn assign(&mut self, tree: &mut LoopTree, sound_uid: &str, node: &str) -> Result<NodeChange> {
        let sound = self
            .sounds
            .get_mut(sound_uid)
            .ok_or_else(|| JamError::SoundNotFound(sound_uid.to_string()))?;
        if !tree.contains(node) {
            return Err(JamError::NodeNotFound(node.to_string()));
        }

        let old_node = sound.node_uid.replace(node.to_string());
        if let Some(old) = old_node.as_deref() {
            tree.remove_sound(old, sound_uid);
        }
        tree.insert_sound(node, sound_uid)?;

        Ok(NodeChange {
            sound: sound_uid.to_string(),
            old_node,
            new_node: node.to_string(),
        })
    }

    /// Remove a sound, its node membership and its backing file
    pub fn delete(&mut self, tree: &mut LoopTree, uid: &str) -> Result<Sound> {
        let sound = self
            .sounds
            .remove(uid)
            .ok_or_else(|| JamError::SoundNotFound(uid.to_string()))?;
        if let Some(node) = sound.node_uid.as_deref() {
            tree.remove_sound(node, uid);
        }

        let path = self.files_dir.join(uid);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed sound file {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No sound file to remove for {}", uid)
            }
            Err(e) => warn!("Failed to remove sound file {}: {}", path.display(), e),
        }

        Ok(sound)
    }

    /// Clear ownership of sounds whose node was deleted
    pub fn release(&mut self, uids: &[String]) {
        for uid in uids {
            if let Some(sound) = self.sounds.get_mut(uid) {
                sound.node_uid = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LoopTree, SoundRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = SoundRegistry::new(dir.path());
        (dir, LoopTree::new(4, 4), registry)
    }

    fn params(uid: &str) -> SoundParams {
        SoundParams {
            uid: uid.into(),
            ..Default::default()
        }
    }

    /// Nodes whose set contains `sound`
    fn owners(tree: &LoopTree, sound: &str) -> Vec<String> {
        tree.summaries()
            .into_iter()
            .filter(|n| n.sound_uids.iter().any(|s| s == sound))
            .map(|n| n.uid)
            .collect()
    }

    #[test]
    fn test_upsert_creates_with_auto_name() {
        let (_dir, mut tree, mut sounds) = setup();
        let result = sounds.upsert(&mut tree, params("abcdef123456")).unwrap();
        assert!(result.created);
        assert_eq!(result.sound.name, "Sound abcdef");
        assert_eq!(result.sound.gain, 1.0);
        assert!(result.node_change.is_none());
    }

    #[test]
    fn test_upsert_merges_in_place() {
        let (_dir, mut tree, mut sounds) = setup();
        let mut first = params("kick");
        first.name = Some("Kick".into());
        first.gain = Some(0.5);
        sounds.upsert(&mut tree, first).unwrap();

        let mut second = params("kick");
        second.pan = Some(-0.25);
        let result = sounds.upsert(&mut tree, second).unwrap();
        assert!(!result.created);
        assert_eq!(result.sound.name, "Kick");
        assert_eq!(result.sound.gain, 0.5);
        assert_eq!(result.sound.pan, -0.25);
        assert_eq!(sounds.len(), 1);
    }

    #[test]
    fn test_upsert_with_node_assigns() {
        let (_dir, mut tree, mut sounds) = setup();
        let node = tree.add_node(None).unwrap();
        let mut p = params("snare");
        p.node_uid = Some(node.clone());

        let result = sounds.upsert(&mut tree, p).unwrap();
        let change = result.node_change.unwrap();
        assert_eq!(change.old_node, None);
        assert_eq!(change.new_node, node);
        assert_eq!(owners(&tree, "snare"), vec![node]);
    }

    #[test]
    fn test_upsert_rejects_descending_stops() {
        let (_dir, mut tree, mut sounds) = setup();
        let mut p = params("pad");
        p.stops = Some([0, 500, 400, 1000]);
        assert!(matches!(
            sounds.upsert(&mut tree, p),
            Err(JamError::Validation { .. })
        ));
        assert!(sounds.get("pad").is_none());
    }

    #[test]
    fn test_upsert_unknown_node_changes_nothing() {
        let (_dir, mut tree, mut sounds) = setup();
        let mut p = params("pad");
        p.node_uid = Some("ghost".into());
        assert!(matches!(
            sounds.upsert(&mut tree, p),
            Err(JamError::NodeNotFound(_))
        ));
        assert_eq!(sounds.len(), 0);
    }

    #[test]
    fn test_upsert_rejects_bad_uid() {
        let (_dir, mut tree, mut sounds) = setup();
        assert!(matches!(
            sounds.upsert(&mut tree, params("../etc")),
            Err(JamError::Validation { .. })
        ));
    }

    #[test]
    fn test_assign_has_exactly_one_owner() {
        let (_dir, mut tree, mut sounds) = setup();
        let nodes: Vec<String> = (0..3).map(|_| tree.add_node(None).unwrap()).collect();
        sounds.upsert(&mut tree, params("loop")).unwrap();

        let mut previous = None;
        for node in nodes.iter().chain(nodes.iter().rev()) {
            let change = sounds.assign(&mut tree, "loop", node).unwrap();
            assert_eq!(change.old_node, previous);
            assert_eq!(owners(&tree, "loop"), vec![node.clone()]);
            assert_eq!(sounds.get("loop").unwrap().node_uid.as_ref(), Some(node));
            previous = Some(node.clone());
        }
    }

    #[test]
    fn test_assign_not_found() {
        let (_dir, mut tree, mut sounds) = setup();
        let node = tree.add_node(None).unwrap();
        assert!(matches!(
            sounds.assign(&mut tree, "nope", &node),
            Err(JamError::SoundNotFound(_))
        ));

        sounds.upsert(&mut tree, params("s")).unwrap();
        assert!(matches!(
            sounds.assign(&mut tree, "s", "ghost"),
            Err(JamError::NodeNotFound(_))
        ));
        assert!(sounds.get("s").unwrap().node_uid.is_none());
    }

    #[test]
    fn test_upsert_then_delete_leaves_no_reference() {
        let (dir, mut tree, mut sounds) = setup();
        let node = tree.add_node(None).unwrap();
        let mut p = params("vox");
        p.name = Some("Vox".into());
        p.stops = Some([0, 100, 900, 1000]);
        p.node_uid = Some(node.clone());
        sounds.upsert(&mut tree, p).unwrap();
        std::fs::write(dir.path().join("vox"), b"RIFF").unwrap();

        let removed = sounds.delete(&mut tree, "vox").unwrap();
        assert_eq!(removed.uid, "vox");
        assert!(sounds.get("vox").is_none());
        assert!(owners(&tree, "vox").is_empty());
        assert!(!dir.path().join("vox").exists());
    }

    #[test]
    fn test_delete_without_file_still_succeeds() {
        let (_dir, mut tree, mut sounds) = setup();
        sounds.upsert(&mut tree, params("ghostfile")).unwrap();
        assert!(sounds.delete(&mut tree, "ghostfile").is_ok());
        assert!(matches!(
            sounds.delete(&mut tree, "ghostfile"),
            Err(JamError::SoundNotFound(_))
        ));
    }

    #[test]
    fn test_release_after_node_delete() {
        let (_dir, mut tree, mut sounds) = setup();
        let node = tree.add_node(None).unwrap();
        let mut p = params("bass");
        p.node_uid = Some(node.clone());
        sounds.upsert(&mut tree, p).unwrap();

        let removed = tree.delete_node(&node).unwrap();
        sounds.release(&removed.orphaned_sounds);
        assert!(sounds.get("bass").unwrap().node_uid.is_none());
    }
}

//! The virtual file tree of a user profile.
//!
//! Nodes live in an arena keyed by `NodeId`: folders own the ids of their
//! children, the parent edge is a plain non-owning id resolved on demand.
//! All structural edits go through `FileTree` methods, which keep the tree
//! acyclic, keep names unique per folder and keep both edge directions in
//! sync.

use crate::error::CoreError;
use meshvault_crypto::{ContentDigest, KeyPair};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Arena identifier of an index node. Stable for the lifetime of the tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

/// Access level granted to a sharing participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionType {
    Read,
    Write,
}

/// A sharing participant of a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPermission {
    pub user_id: String,
    pub permission: PermissionType,
}

/// Folder- or file-specific index data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexKind {
    Folder {
        children: Vec<NodeId>,
        /// Sharing participants. Non-empty marks the subtree as shared.
        permissions: Vec<UserPermission>,
        /// Protection keypair for the DHT objects of a shared subtree,
        /// distributed to all participants.
        share_keys: Option<KeyPair>,
    },
    File {
        /// MD5 of the latest plaintext content.
        digest: ContentDigest,
    },
}

/// A node of the profile tree. The node keypair is the stable identity; for
/// files its public half also addresses the meta file in the DHT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub name: String,
    pub keys: KeyPair,
    pub kind: IndexKind,
}

impl IndexNode {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, IndexKind::Folder { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, IndexKind::File { .. })
    }

    pub fn file_digest(&self) -> Option<ContentDigest> {
        match &self.kind {
            IndexKind::File { digest } => Some(*digest),
            IndexKind::Folder { .. } => None,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            IndexKind::Folder { children, .. } => children,
            IndexKind::File { .. } => &[],
        }
    }

    pub fn permissions(&self) -> &[UserPermission] {
        match &self.kind {
            IndexKind::Folder { permissions, .. } => permissions,
            IndexKind::File { .. } => &[],
        }
    }
}

/// The profile's virtual file tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTree {
    nodes: HashMap<NodeId, IndexNode>,
    root: NodeId,
    next_id: u64,
}

impl FileTree {
    /// A tree holding only the root folder.
    pub fn new(root_keys: KeyPair) -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            IndexNode {
                id: root,
                parent: None,
                name: String::new(),
                keys: root_keys,
                kind: IndexKind::Folder {
                    children: Vec::new(),
                    permissions: Vec::new(),
                    share_keys: None,
                },
            },
        );
        Self {
            nodes,
            root,
            next_id: 1,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn node(&self, id: NodeId) -> Option<&IndexNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut IndexNode> {
        self.nodes.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexNode> {
        self.nodes.values()
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn child_by_name(&self, folder: NodeId, name: &str) -> Option<NodeId> {
        let node = self.nodes.get(&folder)?;
        node.children()
            .iter()
            .copied()
            .find(|c| self.nodes.get(c).map(|n| n.name.as_str()) == Some(name))
    }

    fn attach(&mut self, parent: NodeId, node: IndexNode) -> Result<NodeId, CoreError> {
        if node.name.is_empty() || node.name.contains('/') {
            return Err(CoreError::IllegalFileLocation(format!(
                "invalid node name '{}'",
                node.name
            )));
        }
        if self.child_by_name(parent, &node.name).is_some() {
            return Err(CoreError::IllegalFileLocation(format!(
                "'{}' already exists in the target folder",
                node.name
            )));
        }
        let id = node.id;
        match self.nodes.get_mut(&parent).map(|n| &mut n.kind) {
            Some(IndexKind::Folder { children, .. }) => children.push(id),
            _ => {
                return Err(CoreError::IllegalFileLocation(
                    "parent is not a folder".to_string(),
                ))
            }
        }
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Insert a file index under `parent`.
    pub fn add_file(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        keys: KeyPair,
        digest: ContentDigest,
    ) -> Result<NodeId, CoreError> {
        let id = self.fresh_id();
        self.attach(
            parent,
            IndexNode {
                id,
                parent: Some(parent),
                name: name.into(),
                keys,
                kind: IndexKind::File { digest },
            },
        )
    }

    /// Insert a folder index under `parent`.
    pub fn add_folder(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        keys: KeyPair,
    ) -> Result<NodeId, CoreError> {
        let id = self.fresh_id();
        self.attach(
            parent,
            IndexNode {
                id,
                parent: Some(parent),
                name: name.into(),
                keys,
                kind: IndexKind::Folder {
                    children: Vec::new(),
                    permissions: Vec::new(),
                    share_keys: None,
                },
            },
        )
    }

    fn detach(&mut self, id: NodeId) -> Result<(), CoreError> {
        let parent = self
            .nodes
            .get(&id)
            .and_then(|n| n.parent)
            .ok_or_else(|| CoreError::IllegalFileLocation("cannot detach the root".to_string()))?;
        if let Some(IndexKind::Folder { children, .. }) =
            self.nodes.get_mut(&parent).map(|n| &mut n.kind)
        {
            children.retain(|c| *c != id);
        }
        Ok(())
    }

    /// Remove a file, or an empty folder.
    pub fn remove(&mut self, id: NodeId) -> Result<IndexNode, CoreError> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| CoreError::IllegalFileLocation("no such node".to_string()))?;
        if !node.children().is_empty() {
            return Err(CoreError::IllegalFileLocation(
                "folder is not empty".to_string(),
            ));
        }
        self.detach(id)?;
        self.nodes
            .remove(&id)
            .ok_or_else(|| CoreError::IllegalFileLocation("no such node".to_string()))
    }

    /// Remove a whole subtree, returning the removed nodes.
    pub fn remove_subtree(&mut self, id: NodeId) -> Result<Vec<IndexNode>, CoreError> {
        self.detach(id)?;
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children().iter().copied());
                removed.push(node);
            }
        }
        Ok(removed)
    }

    /// Re-parent a node, optionally renaming it. The destination must not lie
    /// inside the moved subtree.
    pub fn move_node(
        &mut self,
        id: NodeId,
        new_parent: NodeId,
        new_name: Option<String>,
    ) -> Result<(), CoreError> {
        if id == self.root {
            return Err(CoreError::IllegalFileLocation(
                "cannot move the root".to_string(),
            ));
        }
        // Walking up from the destination must not reach the moved node.
        let mut cursor = Some(new_parent);
        while let Some(current) = cursor {
            if current == id {
                return Err(CoreError::IllegalFileLocation(
                    "destination lies inside the moved subtree".to_string(),
                ));
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent);
        }

        let name = match (&new_name, self.nodes.get(&id)) {
            (Some(n), _) => n.clone(),
            (None, Some(node)) => node.name.clone(),
            (None, None) => {
                return Err(CoreError::IllegalFileLocation("no such node".to_string()))
            }
        };
        if self.child_by_name(new_parent, &name).is_some() {
            return Err(CoreError::IllegalFileLocation(format!(
                "'{name}' already exists in the target folder"
            )));
        }

        self.detach(id)?;
        match self.nodes.get_mut(&new_parent).map(|n| &mut n.kind) {
            Some(IndexKind::Folder { children, .. }) => children.push(id),
            _ => {
                return Err(CoreError::IllegalFileLocation(
                    "destination is not a folder".to_string(),
                ))
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(new_parent);
            node.name = name;
        }
        Ok(())
    }

    /// Path of a node relative to the root, derived by walking the parent
    /// edges.
    pub fn path_of(&self, id: NodeId) -> Option<PathBuf> {
        let mut segments = Vec::new();
        let mut cursor = self.nodes.get(&id)?;
        while let Some(parent) = cursor.parent {
            segments.push(cursor.name.clone());
            cursor = self.nodes.get(&parent)?;
        }
        let mut path = PathBuf::new();
        for segment in segments.into_iter().rev() {
            path.push(segment);
        }
        Some(path)
    }

    /// Resolve a root-relative path to a node.
    pub fn find_by_path(&self, path: &Path) -> Option<NodeId> {
        let mut current = self.root;
        for component in path.components() {
            match component {
                Component::Normal(name) => {
                    current = self.child_by_name(current, name.to_str()?)?;
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(current)
    }

    /// All file nodes in the subtree rooted at `id` (including `id` itself if
    /// it is a file).
    pub fn files_in_subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut files = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                if node.is_file() {
                    files.push(current);
                }
                stack.extend(node.children().iter().copied());
            }
        }
        files
    }

    /// The nearest ancestor folder (or the node itself) that is shared.
    pub fn shared_folder_of(&self, id: NodeId) -> Option<NodeId> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.nodes.get(&current)?;
            if !node.permissions().is_empty() {
                return Some(current);
            }
            cursor = node.parent;
        }
        None
    }

    /// Clone the subtree rooted at `id` into a standalone tree (ids remapped,
    /// the subtree root becoming the new tree's root).
    pub fn extract_subtree(&self, id: NodeId) -> Result<FileTree, CoreError> {
        let source_root = self
            .nodes
            .get(&id)
            .ok_or_else(|| CoreError::IllegalFileLocation("no such node".to_string()))?;

        // The extracted root keeps its identity keys but becomes a root
        // folder; a file cannot be extracted as a subtree.
        if !source_root.is_folder() {
            return Err(CoreError::IllegalFileLocation(
                "only folders can be extracted".to_string(),
            ));
        }
        let mut tree = FileTree::new(source_root.keys.clone());
        let root_id = tree.root;
        if let (
            Some(IndexKind::Folder {
                permissions: target,
                share_keys: target_keys,
                ..
            }),
            IndexKind::Folder {
                permissions,
                share_keys,
                ..
            },
        ) = (
            tree.nodes.get_mut(&root_id).map(|n| &mut n.kind),
            &source_root.kind,
        ) {
            *target = permissions.clone();
            *target_keys = share_keys.clone();
        }

        let mut stack: Vec<(NodeId, NodeId)> = source_root
            .children()
            .iter()
            .map(|c| (*c, tree.root))
            .collect();
        while let Some((source_id, target_parent)) = stack.pop() {
            let source = self
                .nodes
                .get(&source_id)
                .ok_or_else(|| CoreError::IllegalFileLocation("dangling child id".to_string()))?;
            let new_id = match &source.kind {
                IndexKind::File { digest } => {
                    tree.add_file(target_parent, source.name.clone(), source.keys.clone(), *digest)?
                }
                IndexKind::Folder { .. } => {
                    tree.add_folder(target_parent, source.name.clone(), source.keys.clone())?
                }
            };
            stack.extend(source.children().iter().map(|c| (*c, new_id)));
        }
        Ok(tree)
    }

    /// Graft a standalone tree under `parent` with the given name, remapping
    /// ids. Returns the id of the grafted root.
    pub fn adopt_subtree(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        subtree: &FileTree,
    ) -> Result<NodeId, CoreError> {
        let source_root = subtree
            .node(subtree.root())
            .ok_or_else(|| CoreError::IllegalFileLocation("empty subtree".to_string()))?;

        let grafted = self.add_folder(parent, name, source_root.keys.clone())?;
        if let (
            Some(IndexKind::Folder {
                permissions: target,
                share_keys: target_keys,
                ..
            }),
            IndexKind::Folder {
                permissions,
                share_keys,
                ..
            },
        ) = (
            self.nodes.get_mut(&grafted).map(|n| &mut n.kind),
            &source_root.kind,
        ) {
            *target = permissions.clone();
            *target_keys = share_keys.clone();
        }

        let mut stack: Vec<(NodeId, NodeId)> = source_root
            .children()
            .iter()
            .map(|c| (*c, grafted))
            .collect();
        while let Some((source_id, target_parent)) = stack.pop() {
            let source = subtree
                .node(source_id)
                .ok_or_else(|| CoreError::IllegalFileLocation("dangling child id".to_string()))?;
            let new_id = match &source.kind {
                IndexKind::File { digest } => {
                    self.add_file(target_parent, source.name.clone(), source.keys.clone(), *digest)?
                }
                IndexKind::Folder { .. } => {
                    self.add_folder(target_parent, source.name.clone(), source.keys.clone())?
                }
            };
            stack.extend(source.children().iter().map(|c| (*c, new_id)));
        }
        Ok(grafted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvault_crypto::ContentDigest;

    fn keys() -> KeyPair {
        KeyPair::generate(1024).unwrap()
    }

    fn digest(data: &[u8]) -> ContentDigest {
        ContentDigest::from_data(data)
    }

    #[test]
    fn test_add_and_resolve_paths() {
        let mut tree = FileTree::new(keys());
        let docs = tree.add_folder(tree.root(), "docs", keys()).unwrap();
        let file = tree
            .add_file(docs, "notes.txt", keys(), digest(b"notes"))
            .unwrap();

        assert_eq!(tree.path_of(file).unwrap(), PathBuf::from("docs/notes.txt"));
        assert_eq!(tree.find_by_path(Path::new("docs/notes.txt")), Some(file));
        assert_eq!(tree.find_by_path(Path::new("docs/other.txt")), None);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut tree = FileTree::new(keys());
        tree.add_file(tree.root(), "a.txt", keys(), digest(b"a"))
            .unwrap();
        let result = tree.add_file(tree.root(), "a.txt", keys(), digest(b"a2"));
        assert!(matches!(result, Err(CoreError::IllegalFileLocation(_))));
    }

    #[test]
    fn test_move_re_parents_without_touching_keys() {
        let mut tree = FileTree::new(keys());
        let src = tree.add_folder(tree.root(), "src", keys()).unwrap();
        let dst = tree.add_folder(tree.root(), "dst", keys()).unwrap();
        let file = tree.add_file(src, "f.bin", keys(), digest(b"f")).unwrap();
        let fingerprint = tree.node(file).unwrap().keys.fingerprint().unwrap();

        tree.move_node(file, dst, None).unwrap();

        assert_eq!(tree.path_of(file).unwrap(), PathBuf::from("dst/f.bin"));
        assert_eq!(
            tree.node(file).unwrap().keys.fingerprint().unwrap(),
            fingerprint
        );
        assert!(tree.node(src).unwrap().children().is_empty());
    }

    #[test]
    fn test_move_into_own_subtree_rejected() {
        let mut tree = FileTree::new(keys());
        let a = tree.add_folder(tree.root(), "a", keys()).unwrap();
        let b = tree.add_folder(a, "b", keys()).unwrap();

        assert!(matches!(
            tree.move_node(a, b, None),
            Err(CoreError::IllegalFileLocation(_))
        ));
    }

    #[test]
    fn test_remove_subtree_returns_all_nodes() {
        let mut tree = FileTree::new(keys());
        let a = tree.add_folder(tree.root(), "a", keys()).unwrap();
        tree.add_file(a, "one", keys(), digest(b"1")).unwrap();
        tree.add_file(a, "two", keys(), digest(b"2")).unwrap();

        let removed = tree.remove_subtree(a).unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.find_by_path(Path::new("a")), None);
    }

    #[test]
    fn test_extract_and_adopt_roundtrip() {
        let mut tree = FileTree::new(keys());
        let shared = tree.add_folder(tree.root(), "shared", keys()).unwrap();
        let sub = tree.add_folder(shared, "sub", keys()).unwrap();
        tree.add_file(sub, "deep.txt", keys(), digest(b"deep"))
            .unwrap();
        if let Some(IndexKind::Folder { permissions, .. }) =
            tree.node_mut(shared).map(|n| &mut n.kind)
        {
            permissions.push(UserPermission {
                user_id: "bob".to_string(),
                permission: PermissionType::Write,
            });
        }

        let extracted = tree.extract_subtree(shared).unwrap();
        assert_eq!(extracted.len(), 3);

        let mut other = FileTree::new(keys());
        let grafted = other
            .adopt_subtree(other.root(), "shared", &extracted)
            .unwrap();
        assert_eq!(
            other.find_by_path(Path::new("shared/sub/deep.txt")).is_some(),
            true
        );
        assert_eq!(other.node(grafted).unwrap().permissions().len(), 1);
    }

    #[test]
    fn test_shared_folder_lookup_walks_ancestors() {
        let mut tree = FileTree::new(keys());
        let shared = tree.add_folder(tree.root(), "shared", keys()).unwrap();
        let sub = tree.add_folder(shared, "sub", keys()).unwrap();
        let file = tree.add_file(sub, "f", keys(), digest(b"f")).unwrap();

        assert_eq!(tree.shared_folder_of(file), None);

        if let Some(IndexKind::Folder { permissions, .. }) =
            tree.node_mut(shared).map(|n| &mut n.kind)
        {
            permissions.push(UserPermission {
                user_id: "bob".to_string(),
                permission: PermissionType::Read,
            });
        }
        assert_eq!(tree.shared_folder_of(file), Some(shared));
    }

    #[test]
    fn test_serde_roundtrip_preserves_structure() {
        let mut tree = FileTree::new(keys());
        let docs = tree.add_folder(tree.root(), "docs", keys()).unwrap();
        tree.add_file(docs, "a.txt", keys(), digest(b"a")).unwrap();

        let json = serde_json::to_vec(&tree).unwrap();
        let restored: FileTree = serde_json::from_slice(&json).unwrap();

        assert_eq!(restored.len(), 3);
        assert!(restored.find_by_path(Path::new("docs/a.txt")).is_some());
    }
}

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::RegistryError;

/// The kind of change reported for a child node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// A child node was created, or existed when listening started.
    ChildAdded,
    /// A child node's data changed.
    ChildUpdated,
    /// A child node was deleted.
    ChildRemoved,
}

/// A change to a child of a watched node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedEvent {
    /// Full path of the child that changed.
    pub path: String,
    /// The child's data.
    pub data: String,
    /// What happened to the child.
    pub change: ChangeType,
}

/// A hierarchical coordination service holding small string values at `/`-separated paths.
///
/// Persistent nodes live until deleted. Ephemeral nodes are removed when the session that
/// created them ends.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Returns `true` if a node exists at `path`.
    async fn check_exists(&self, path: &str) -> Result<bool, RegistryError>;

    /// Creates a persistent node, creating missing parents with empty data.
    async fn add_persistent_node(&self, path: &str, value: &str) -> Result<(), RegistryError>;

    /// Creates an ephemeral node bound to this session, creating missing parents as persistent
    /// nodes.
    async fn add_ephemeral_node(&self, path: &str, value: &str) -> Result<(), RegistryError>;

    /// Reports changes to the children of `path` on `listener`.
    ///
    /// Children that already exist are reported as [`ChangeType::ChildAdded`] first.
    async fn listen_children(
        &self,
        path: &str,
        listener: mpsc::UnboundedSender<ChangedEvent>,
    ) -> Result<(), RegistryError>;
}

#[derive(Debug)]
struct Node {
    data: String,
    owner: Option<u64>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    listeners: HashMap<String, Vec<mpsc::UnboundedSender<ChangedEvent>>>,
    closed_sessions: Vec<u64>,
}

impl Tree {
    fn children(&self, parent: &str) -> Vec<(String, String)> {
        let prefix = if parent == "/" {
            "/".to_string()
        } else {
            format!("{parent}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| !path[prefix.len()..].contains('/'))
            .map(|(path, node)| (path.clone(), node.data.clone()))
            .collect()
    }

    fn notify(&mut self, path: &str, data: &str, change: ChangeType) {
        let Some(parent) = parent_of(path) else {
            return;
        };
        if let Some(listeners) = self.listeners.get_mut(parent) {
            listeners.retain(|listener| {
                listener
                    .send(ChangedEvent {
                        path: path.to_string(),
                        data: data.to_string(),
                        change,
                    })
                    .is_ok()
            });
        }
    }

    fn create(
        &mut self,
        path: &str,
        value: &str,
        owner: Option<u64>,
    ) -> Result<(), RegistryError> {
        validate(path)?;
        if self.nodes.contains_key(path) {
            return Err(RegistryError::NodeExists(path.to_string()));
        }
        let mut ancestor = parent_of(path);
        let mut missing = Vec::new();
        while let Some(parent) = ancestor {
            if parent == "/" || self.nodes.contains_key(parent) {
                break;
            }
            missing.push(parent.to_string());
            ancestor = parent_of(parent);
        }
        for parent in missing.into_iter().rev() {
            self.nodes.insert(
                parent.clone(),
                Node {
                    data: String::new(),
                    owner: None,
                },
            );
            self.notify(&parent, "", ChangeType::ChildAdded);
        }
        self.nodes.insert(
            path.to_string(),
            Node {
                data: value.to_string(),
                owner,
            },
        );
        self.notify(path, value, ChangeType::ChildAdded);
        Ok(())
    }
}

/// An in-process [`Coordinator`].
///
/// Handles created with [`session`](MemoryCoordinator::session) share one tree but own their
/// ephemeral nodes separately, which lets tests and single-process deployments model several
/// providers registering and going away.
#[derive(Clone)]
pub struct MemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
    sessions: Arc<AtomicU64>,
    session: u64,
}

impl MemoryCoordinator {
    /// Creates an empty tree with a single session.
    pub fn new() -> Self {
        MemoryCoordinator {
            tree: Arc::default(),
            sessions: Arc::new(AtomicU64::new(1)),
            session: 0,
        }
    }

    /// Opens a new session on the same tree.
    pub fn session(&self) -> Self {
        MemoryCoordinator {
            tree: self.tree.clone(),
            sessions: self.sessions.clone(),
            session: self.sessions.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Ends this session, deleting every ephemeral node it created.
    pub fn close_session(&self) {
        let mut tree = self.lock();
        tree.closed_sessions.push(self.session);
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(self.session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            if let Some(node) = tree.nodes.remove(&path) {
                debug!(%path, session = self.session, "removing ephemeral node");
                tree.notify(&path, &node.data, ChangeType::ChildRemoved);
            }
        }
    }

    /// Replaces the data of an existing node.
    pub fn set_data(&self, path: &str, value: &str) -> Result<(), RegistryError> {
        let mut tree = self.lock();
        match tree.nodes.get_mut(path) {
            Some(node) => node.data = value.to_string(),
            None => return Err(RegistryError::InvalidPath(path.to_string())),
        }
        tree.notify(path, value, ChangeType::ChildUpdated);
        Ok(())
    }

    /// Returns the data stored at `path`.
    pub fn get_data(&self, path: &str) -> Option<String> {
        self.lock().nodes.get(path).map(|node| node.data.clone())
    }

    /// Returns the full paths of the children of `path`.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.lock()
            .children(path)
            .into_iter()
            .map(|(path, _)| path)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_session(&self, tree: &Tree) -> Result<(), RegistryError> {
        if tree.closed_sessions.contains(&self.session) {
            return Err(RegistryError::SessionClosed);
        }
        Ok(())
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        MemoryCoordinator::new()
    }
}

impl fmt::Debug for MemoryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCoordinator")
            .field("session", &self.session)
            .field("nodes", &self.lock().nodes.len())
            .finish()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn check_exists(&self, path: &str) -> Result<bool, RegistryError> {
        validate(path)?;
        let tree = self.lock();
        self.check_session(&tree)?;
        Ok(tree.nodes.contains_key(path))
    }

    async fn add_persistent_node(&self, path: &str, value: &str) -> Result<(), RegistryError> {
        let mut tree = self.lock();
        self.check_session(&tree)?;
        trace!(%path, "creating persistent node");
        tree.create(path, value, None)
    }

    async fn add_ephemeral_node(&self, path: &str, value: &str) -> Result<(), RegistryError> {
        let mut tree = self.lock();
        self.check_session(&tree)?;
        trace!(%path, session = self.session, "creating ephemeral node");
        tree.create(path, value, Some(self.session))
    }

    async fn listen_children(
        &self,
        path: &str,
        listener: mpsc::UnboundedSender<ChangedEvent>,
    ) -> Result<(), RegistryError> {
        validate(path)?;
        let mut tree = self.lock();
        self.check_session(&tree)?;
        for (child, data) in tree.children(path) {
            let _ = listener.send(ChangedEvent {
                path: child,
                data,
                change: ChangeType::ChildAdded,
            });
        }
        tree.listeners
            .entry(path.to_string())
            .or_default()
            .push(listener);
        Ok(())
    }
}

fn validate(path: &str) -> Result<(), RegistryError> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(RegistryError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_paths() {
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_of("/"), None);
    }

    #[tokio::test]
    async fn creates_missing_parents() {
        let coordinator = MemoryCoordinator::new();
        coordinator
            .add_persistent_node("/root/service/providers", "")
            .await
            .unwrap();
        assert!(coordinator.check_exists("/root").await.unwrap());
        assert!(coordinator.check_exists("/root/service").await.unwrap());
        assert!(matches!(
            coordinator.add_persistent_node("/root", "again").await,
            Err(RegistryError::NodeExists(_))
        ));
        assert!(matches!(
            coordinator.check_exists("relative").await,
            Err(RegistryError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn listeners_see_existing_and_new_children() {
        let coordinator = MemoryCoordinator::new();
        coordinator.add_persistent_node("/root/a", "1").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        coordinator.listen_children("/root", tx).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ChangedEvent {
                path: "/root/a".to_string(),
                data: "1".to_string(),
                change: ChangeType::ChildAdded,
            }
        );

        coordinator.add_persistent_node("/root/b", "2").await.unwrap();
        // Grandchildren are not reported.
        coordinator.add_persistent_node("/root/a/x", "3").await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, "/root/b");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closing_a_session_removes_its_ephemeral_nodes() {
        let coordinator = MemoryCoordinator::new();
        let provider = coordinator.session();
        coordinator.add_persistent_node("/root", "").await.unwrap();
        provider
            .add_ephemeral_node("/root/leaf", "data")
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        coordinator.listen_children("/root", tx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().change, ChangeType::ChildAdded);

        provider.close_session();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, "/root/leaf");
        assert_eq!(event.change, ChangeType::ChildRemoved);
        assert!(!coordinator.check_exists("/root/leaf").await.unwrap());
        assert!(matches!(
            provider.add_ephemeral_node("/root/other", "").await,
            Err(RegistryError::SessionClosed)
        ));
    }
}

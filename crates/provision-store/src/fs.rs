//! File lookaside for the boot file servers
//!
//! Lookups first consult dynamically registered paths (rendered
//! templates), then dynamically registered subtrees, then fall through to
//! real files under the root directory.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid path {0}")]
    BadPath(String),

    #[error("failed to render {path}: {message}")]
    Render { path: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Produces the contents of one dynamic path for a requesting address
pub type RenderFn = Arc<dyn Fn(Option<IpAddr>) -> Result<Bytes, String> + Send + Sync>;

/// Resolves paths below a dynamic subtree; `None` means not handled
pub type TreeFn = Arc<dyn Fn(&str, Option<IpAddr>) -> Option<Bytes> + Send + Sync>;

/// Normalize a request path: strip leading slashes, drop `.` and empty
/// segments, reject `..`
pub fn clean_path(p: &str) -> Result<String, FsError> {
    let mut parts = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => return Err(FsError::BadPath(p.to_string())),
            s => parts.push(s),
        }
    }
    Ok(parts.join("/"))
}

pub struct FileSystem {
    lower: PathBuf,
    dynamics: RwLock<HashMap<String, RenderFn>>,
    trees: RwLock<BTreeMap<String, TreeFn>>,
}

impl FileSystem {
    pub fn new(lower: impl Into<PathBuf>) -> Self {
        Self {
            lower: lower.into(),
            dynamics: RwLock::new(HashMap::new()),
            trees: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.lower
    }

    pub fn add_dynamic(&self, path: &str, render: RenderFn) -> Result<(), FsError> {
        let path = clean_path(path)?;
        debug!(%path, "adding dynamic path");
        self.dynamics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, render);
        Ok(())
    }

    pub fn del_dynamic(&self, path: &str) {
        if let Ok(path) = clean_path(path) {
            self.dynamics
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&path);
        }
    }

    pub fn has_dynamic(&self, path: &str) -> bool {
        clean_path(path)
            .map(|p| {
                self.dynamics
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains_key(&p)
            })
            .unwrap_or(false)
    }

    pub fn add_dynamic_tree(&self, prefix: &str, lookup: TreeFn) -> Result<(), FsError> {
        let prefix = clean_path(prefix)?;
        self.trees
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prefix, lookup);
        Ok(())
    }

    pub fn del_dynamic_tree(&self, prefix: &str) {
        if let Ok(prefix) = clean_path(prefix) {
            self.trees
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&prefix);
        }
    }

    /// Contents of `path` as seen by `remote`, or `None` if nothing
    /// serves it
    pub fn open(&self, path: &str, remote: Option<IpAddr>) -> Result<Option<Bytes>, FsError> {
        let path = clean_path(path)?;

        let dynamic = self
            .dynamics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path)
            .cloned();
        if let Some(render) = dynamic {
            return render(remote)
                .map(Some)
                .map_err(|message| FsError::Render { path, message });
        }

        if let Some((rest, lookup)) = self.longest_tree(&path) {
            if let Some(found) = lookup(&rest, remote) {
                return Ok(Some(found));
            }
        }

        let real = self.lower.join(&path);
        if path.is_empty() || !real.is_file() {
            return Ok(None);
        }
        match std::fs::read(real) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn longest_tree(&self, path: &str) -> Option<(String, TreeFn)> {
        let trees = self.trees.read().unwrap_or_else(PoisonError::into_inner);
        trees
            .iter()
            .filter_map(|(prefix, lookup)| {
                let rest = if prefix.is_empty() {
                    path
                } else if path == prefix {
                    ""
                } else {
                    path.strip_prefix(prefix.as_str())?.strip_prefix('/')?
                };
                Some((prefix.len(), rest.to_string(), lookup.clone()))
            })
            .max_by_key(|(len, _, _)| *len)
            .map(|(_, rest, lookup)| (rest, lookup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/pxelinux.cfg//default").unwrap(), "pxelinux.cfg/default");
        assert_eq!(clean_path("./a/./b").unwrap(), "a/b");
        assert!(clean_path("/a/../../etc/passwd").is_err());
    }

    #[test]
    fn test_lookup_order() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("default.ipxe"), b"from disk").unwrap();
        std::fs::create_dir(tmp.path().join("isos")).unwrap();
        std::fs::write(tmp.path().join("isos/a.iso"), b"iso").unwrap();

        let fs = FileSystem::new(tmp.path());
        assert_eq!(fs.open("/default.ipxe", None).unwrap().unwrap(), "from disk");
        assert_eq!(fs.open("isos/a.iso", None).unwrap().unwrap(), "iso");
        assert!(fs.open("missing", None).unwrap().is_none());
        assert!(fs.open("isos", None).unwrap().is_none());

        fs.add_dynamic(
            "default.ipxe",
            Arc::new(|remote: Option<IpAddr>| -> Result<Bytes, String> {
                Ok(Bytes::from(format!("hello {:?}", remote)))
            }),
        )
        .unwrap();
        let remote = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(
            fs.open("/default.ipxe", Some(remote)).unwrap().unwrap(),
            "hello Some(10.0.0.9)"
        );
        assert!(fs.has_dynamic("default.ipxe"));

        fs.del_dynamic("/default.ipxe");
        assert_eq!(fs.open("default.ipxe", None).unwrap().unwrap(), "from disk");
    }

    #[test]
    fn test_longest_tree_wins() {
        let fs = FileSystem::new("/nonexistent");
        fs.add_dynamic_tree("a", Arc::new(|rest: &str, _: Option<IpAddr>| Some(Bytes::from(format!("a:{}", rest)))))
            .unwrap();
        fs.add_dynamic_tree("a/b", Arc::new(|rest: &str, _: Option<IpAddr>| Some(Bytes::from(format!("ab:{}", rest)))))
            .unwrap();
        assert_eq!(fs.open("a/b/c", None).unwrap().unwrap(), "ab:c");
        assert_eq!(fs.open("a/x", None).unwrap().unwrap(), "a:x");
        assert!(fs.open("ab/c", None).unwrap().is_none());

        fs.del_dynamic_tree("a/b");
        assert_eq!(fs.open("a/b/c", None).unwrap().unwrap(), "a:b/c");
    }

    #[test]
    fn test_render_failure() {
        let fs = FileSystem::new("/nonexistent");
        fs.add_dynamic("broken", Arc::new(|_: Option<IpAddr>| -> Result<Bytes, String> { Err("no such param".to_string()) }))
            .unwrap();
        let err = fs.open("broken", None).unwrap_err();
        assert!(matches!(err, FsError::Render { .. }));
        assert!(err.to_string().contains("no such param"));
    }
}

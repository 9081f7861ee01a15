//! Store key layout

/// Builds every key the controller reads or writes
#[derive(Debug, Clone)]
pub struct Keys {
    root: String,
    detect: String,
}

impl Keys {
    /// `root` is the storage prefix, `detect_prefix` the detector's key
    /// prefix appended to it
    pub fn new(root: &str, detect_prefix: &str) -> Self {
        Self {
            root: root.to_string(),
            detect: format!("{}{}", root, detect_prefix),
        }
    }

    pub fn namespaces(&self) -> String {
        format!("{}/namespaces", self.root)
    }

    pub fn namespace(&self, ns: &str) -> String {
        format!("{}/namespaces/{}", self.root, ns)
    }

    pub fn clusters(&self, ns: &str) -> String {
        format!("{}/clusters", self.namespace(ns))
    }

    pub fn cluster(&self, ns: &str, cluster: &str) -> String {
        format!("{}/clusters/{}", self.namespace(ns), cluster)
    }

    pub fn windows(&self, ns: &str, cluster: &str) -> String {
        format!("{}/windows/{}/{}", self.detect, ns, cluster)
    }

    pub fn window(&self, ns: &str, cluster: &str, node_id: &str) -> String {
        format!("{}/{}", self.windows(ns, cluster), node_id)
    }

    pub fn votes(&self, ns: &str, cluster: &str, node_id: &str) -> String {
        format!("{}/votes/{}/{}/{}", self.detect, ns, cluster, node_id)
    }

    pub fn vote(&self, ns: &str, cluster: &str, node_id: &str, observer: &str) -> String {
        format!("{}/{}", self.votes(ns, cluster, node_id), observer)
    }
}

/// Last path segment of a key
pub fn leaf(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use serde_json::{Map, Value};

/// One node in a lazy variable reference chain. The root is only an anchor;
/// the names walked from it form the lookup path into a host's variables.
#[derive(Debug)]
pub struct Ref {
    parent: Option<Arc<Ref>>,
    name: String,
    children: Mutex<HashMap<String, Arc<Ref>>>,
}

impl Ref {
    pub fn root(name: &str) -> Arc<Ref> {
        Arc::new(Ref {
            parent: None,
            name: name.to_string(),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Walk one attribute down. Children are cached per node, so walking the
    /// same names twice hands back the identical reference.
    pub fn get(self: &Arc<Ref>, name: &str) -> Arc<Ref> {
        let mut children = self.children.lock().expect("ref child cache poisoned");
        children
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Ref {
                    parent: Some(self.clone()),
                    name: name.to_string(),
                    children: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    /// The lookup path, root-most name first. The anchor node itself does not
    /// contribute a name.
    pub fn path(&self) -> Vec<String> {
        let mut path = Vec::new();
        let mut node = self;
        while let Some(parent) = node.parent.as_deref() {
            path.push(node.name.clone());
            node = parent;
        }
        path.reverse();
        path
    }
}

/// A module argument value: either a literal JSON value or a lazy reference
/// resolved per host at dispatch time.
#[derive(Clone, Debug)]
pub enum ArgValue {
    Literal(Value),
    Ref(Arc<Ref>),
}

impl ArgValue {
    pub fn is_ref(&self) -> bool {
        matches!(self, ArgValue::Ref(_))
    }
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        ArgValue::Literal(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Literal(Value::String(value.to_string()))
    }
}

impl From<Arc<Ref>> for ArgValue {
    fn from(reference: Arc<Ref>) -> Self {
        ArgValue::Ref(reference)
    }
}

/// Resolve a value against one host's variables. Literals pass through
/// untouched; the scheduler relies on `deref` being identity there.
pub fn deref(host: &Map<String, Value>, value: &ArgValue) -> anyhow::Result<Value> {
    match value {
        ArgValue::Literal(v) => Ok(v.clone()),
        ArgValue::Ref(r) => {
            let path = r.path();
            let mut current: Option<&Value> = None;
            for name in &path {
                let table = match current {
                    None => host,
                    Some(Value::Object(map)) => map,
                    Some(other) => bail!(
                        "cannot look up {} in non-mapping value {} (path {})",
                        name,
                        other,
                        path.join(".")
                    ),
                };
                current = Some(
                    table
                        .get(name)
                        .ok_or_else(|| anyhow!("{} not found (path {})", name, path.join(".")))?,
                );
            }
            Ok(current.cloned().unwrap_or(Value::Null))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn host_vars() -> Map<String, Value> {
        match json!({
            "network": {"interfaces": {"eth0": {"ip": "192.168.1.100"}}},
            "port": 8080
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn walk_builds_path_without_anchor() {
        let root = Ref::root("host");
        let leaf = root.get("network").get("interfaces").get("eth0");
        assert_eq!(leaf.path(), vec!["network", "interfaces", "eth0"]);
        assert_eq!(root.path(), Vec::<String>::new());
    }

    #[test]
    fn repeated_walks_share_identity() {
        let root = Ref::root("host");
        let a = root.get("network").get("interfaces");
        let b = root.get("network").get("interfaces");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn deref_resolves_nested_path() {
        let root = Ref::root("host");
        let ip = root.get("network").get("interfaces").get("eth0").get("ip");
        let value = deref(&host_vars(), &ArgValue::Ref(ip)).unwrap();
        assert_eq!(value, json!("192.168.1.100"));
    }

    #[test]
    fn deref_passes_literals_through() {
        let value = deref(&host_vars(), &ArgValue::from(json!([1, 2, 3]))).unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn deref_fails_on_missing_key() {
        let root = Ref::root("host");
        let missing = root.get("network").get("nope");
        assert!(deref(&host_vars(), &ArgValue::Ref(missing)).is_err());
    }

    #[test]
    fn deref_fails_indexing_a_non_mapping() {
        let root = Ref::root("host");
        let bad = root.get("port").get("nested");
        assert!(deref(&host_vars(), &ArgValue::Ref(bad)).is_err());
    }
}

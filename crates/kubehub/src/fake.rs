//! In-memory [`ClusterApi`] with resource versions and fault injection, for tests.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::Resource;

use crate::{ApiError, ClusterApi, Propagation};

/// Per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub get: usize,
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub list: usize,
}

struct State<K> {
    objects: Vec<K>,
    next_rv: u64,
    calls: Calls,
    deletions: Vec<(String, Propagation)>,
    pending_conflicts: u32,
    vanish_after_get: bool,
    fail_get: Option<ApiError>,
    fail_create: Option<ApiError>,
    fail_update: Option<ApiError>,
    fail_delete: Option<ApiError>,
    fail_list: Option<ApiError>,
}

/// Objects live in insertion order; every write bumps a global resourceVersion.
pub struct FakeCluster<K> {
    state: Mutex<State<K>>,
}

impl<K> Default for FakeCluster<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> FakeCluster<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                objects: Vec::new(),
                next_rv: 1,
                calls: Calls::default(),
                deletions: Vec::new(),
                pending_conflicts: 0,
                vanish_after_get: false,
                fail_get: None,
                fail_create: None,
                fail_update: None,
                fail_delete: None,
                fail_list: None,
            }),
        }
    }

    /// Seed objects as if they had been created by someone else.
    pub fn with_objects(self, objects: impl IntoIterator<Item = K>) -> Self {
        {
            let mut st = self.lock();
            for mut obj in objects {
                let rv = st.bump();
                obj.meta_mut().resource_version = Some(rv);
                st.objects.push(obj);
            }
        }
        self
    }

    /// The next `n` updates fail with a conflict, each one bumping the stored version
    /// the way a concurrent writer would.
    pub fn conflict_next_updates(&self, n: u32) { self.lock().pending_conflicts = n; }
    /// Remove the object right after the next successful get (concurrent external delete).
    pub fn vanish_after_get(&self) { self.lock().vanish_after_get = true; }
    pub fn fail_get(&self, e: ApiError) { self.lock().fail_get = Some(e); }
    pub fn fail_create(&self, e: ApiError) { self.lock().fail_create = Some(e); }
    pub fn fail_update(&self, e: ApiError) { self.lock().fail_update = Some(e); }
    pub fn fail_delete(&self, e: ApiError) { self.lock().fail_delete = Some(e); }
    pub fn fail_list(&self, e: ApiError) { self.lock().fail_list = Some(e); }

    pub fn calls(&self) -> Calls { self.lock().calls }
    pub fn deletions(&self) -> Vec<(String, Propagation)> { self.lock().deletions.clone() }
    pub fn stored(&self, name: &str) -> Option<K> { self.lock().find(name).cloned() }
    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K: Resource<DynamicType = ()>> State<K> {
    fn bump(&mut self) -> String {
        let rv = self.next_rv;
        self.next_rv += 1;
        rv.to_string()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.objects.iter().position(|o| o.meta().name.as_deref() == Some(name))
    }

    fn find(&self, name: &str) -> Option<&K> {
        self.position(name).map(|i| &self.objects[i])
    }

    fn not_found(name: &str) -> ApiError {
        ApiError::NotFound(format!("{} \"{}\" not found", K::kind(&()), name))
    }
}

fn object_name<K: Resource>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

#[async_trait]
impl<K> ClusterApi<K> for FakeCluster<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, ApiError> {
        let mut st = self.lock();
        st.calls.get += 1;
        if let Some(e) = st.fail_get.clone() { return Err(e); }
        let pos = st.position(name).ok_or_else(|| State::<K>::not_found(name))?;
        let obj = st.objects[pos].clone();
        if st.vanish_after_get {
            st.vanish_after_get = false;
            st.objects.remove(pos);
        }
        Ok(obj)
    }

    async fn create(&self, obj: &K) -> Result<K, ApiError> {
        let mut st = self.lock();
        st.calls.create += 1;
        if let Some(e) = st.fail_create.clone() { return Err(e); }
        let name = object_name(obj);
        if name.is_empty() {
            return Err(ApiError::Api { code: 422, reason: "Invalid".into(), message: "metadata.name: Required value".into() });
        }
        if st.position(&name).is_some() {
            return Err(ApiError::Api { code: 409, reason: "AlreadyExists".into(), message: format!("\"{}\" already exists", name) });
        }
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(st.bump());
        st.objects.push(stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &K) -> Result<K, ApiError> {
        let mut st = self.lock();
        st.calls.update += 1;
        if let Some(e) = st.fail_update.clone() { return Err(e); }
        let name = object_name(obj);
        let pos = st.position(&name).ok_or_else(|| State::<K>::not_found(&name))?;
        if st.pending_conflicts > 0 {
            st.pending_conflicts -= 1;
            let rv = st.bump();
            st.objects[pos].meta_mut().resource_version = Some(rv);
            return Err(ApiError::Conflict(format!("the object \"{}\" has been modified", name)));
        }
        if st.objects[pos].meta().resource_version != obj.meta().resource_version {
            return Err(ApiError::Conflict(format!("stale resourceVersion for \"{}\"", name)));
        }
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(st.bump());
        st.objects[pos] = stored.clone();
        Ok(stored)
    }

    async fn delete(&self, name: &str, propagation: Propagation) -> Result<(), ApiError> {
        let mut st = self.lock();
        st.calls.delete += 1;
        if let Some(e) = st.fail_delete.clone() { return Err(e); }
        let pos = st.position(name).ok_or_else(|| State::<K>::not_found(name))?;
        st.objects.remove(pos);
        st.deletions.push((name.to_string(), propagation));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<K>, ApiError> {
        let mut st = self.lock();
        st.calls.list += 1;
        if let Some(e) = st.fail_list.clone() { return Err(e); }
        Ok(st.objects.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn cm(name: &str) -> ConfigMap {
        ConfigMap { metadata: ObjectMeta { name: Some(name.into()), ..Default::default() }, ..Default::default() }
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let fake = FakeCluster::new().with_objects([cm("a")]);
        let read = fake.get("a").await.unwrap();
        let written = fake.update(&read).await.unwrap();
        assert_ne!(written.metadata.resource_version, read.metadata.resource_version);
        assert!(fake.update(&read).await.unwrap_err().is_conflict());
        assert!(fake.update(&written).await.is_ok());
    }

    #[tokio::test]
    async fn injected_conflicts_bump_the_stored_version() {
        let fake = FakeCluster::new().with_objects([cm("a")]);
        fake.conflict_next_updates(1);
        let read = fake.get("a").await.unwrap();
        assert!(fake.update(&read).await.unwrap_err().is_conflict());
        assert!(fake.update(&read).await.unwrap_err().is_conflict());
        let fresh = fake.get("a").await.unwrap();
        assert!(fake.update(&fresh).await.is_ok());
        assert_eq!(fake.calls().update, 3);
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let fake: FakeCluster<ConfigMap> = FakeCluster::new();
        assert!(fake.get("nope").await.unwrap_err().is_not_found());
        assert!(fake.delete("nope", Propagation::Foreground).await.unwrap_err().is_not_found());
        assert!(fake.update(&cm("nope")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_preserves_insertion_order() {
        let fake = FakeCluster::new().with_objects([cm("b"), cm("a")]);
        fake.create(&cm("c")).await.unwrap();
        let names: Vec<_> = fake.list().await.unwrap().into_iter().filter_map(|o| o.metadata.name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }
}

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{Entity, Key};

type IdGetter<K, V> = Box<dyn Fn(&V) -> Option<K> + Send + Sync>;

/// In-memory dictionary store. Never fetches on miss: callers detect short
/// results and backfill themselves.
pub trait DictionaryCache<K, V>: Send + Sync {
    fn get(&self, id: &K) -> Option<V>;

    /// Cached subset of `ids`, possibly shorter than the input.
    fn get_in_list(&self, ids: &[K]) -> Vec<V>;

    fn get_all(&self) -> Vec<V>;

    fn put(&self, id: K, value: V);

    fn put_all(&self, values: Vec<V>);

    fn invalidate(&self, id: &K) -> Option<V>;

    fn invalidate_set(&self, ids: &[K]);

    fn invalidate_all(&self);

    /// Replaces the whole content. Without `force` a non-empty cache is left untouched.
    fn reload(&self, values: Vec<V>, force: bool);

    fn count(&self) -> usize;

    /// Children of `parent_id`; `None` when the cache keeps no hierarchy.
    fn get_list_by_parent_id(&self, _parent_id: Option<&K>) -> Option<Vec<V>> {
        None
    }
}

pub struct MapDictionaryCache<K, V> {
    data: Mutex<BTreeMap<K, V>>,
    id_getter: IdGetter<K, V>,
}

impl<K, V> MapDictionaryCache<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + Send,
{
    pub fn new(id_getter: impl Fn(&V) -> Option<K> + Send + Sync + 'static) -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            id_getter: Box::new(id_getter),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<K, V>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V: Entity> MapDictionaryCache<Key, V> {
    /// Cache keyed by the entity's id field.
    pub fn for_entity() -> Self {
        Self::new(|value: &V| value.id())
    }
}

impl<K, V> DictionaryCache<K, V> for MapDictionaryCache<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, id: &K) -> Option<V> {
        self.lock().get(id).cloned()
    }

    fn get_in_list(&self, ids: &[K]) -> Vec<V> {
        let data = self.lock();
        ids.iter().filter_map(|id| data.get(id).cloned()).collect()
    }

    fn get_all(&self) -> Vec<V> {
        self.lock().values().cloned().collect()
    }

    fn put(&self, id: K, value: V) {
        self.lock().insert(id, value);
    }

    fn put_all(&self, values: Vec<V>) {
        let mut data = self.lock();
        for value in values {
            if let Some(id) = (self.id_getter)(&value) {
                data.insert(id, value);
            }
        }
    }

    fn invalidate(&self, id: &K) -> Option<V> {
        self.lock().remove(id)
    }

    fn invalidate_set(&self, ids: &[K]) {
        let mut data = self.lock();
        for id in ids {
            data.remove(id);
        }
    }

    fn invalidate_all(&self) {
        self.lock().clear();
    }

    fn reload(&self, values: Vec<V>, force: bool) {
        let mut data = self.lock();
        if !force && !data.is_empty() {
            return;
        }
        data.clear();
        for value in values {
            if let Some(id) = (self.id_getter)(&value) {
                data.insert(id, value);
            }
        }
    }

    fn count(&self) -> usize {
        self.lock().len()
    }
}

struct TreeState<K, V> {
    data: BTreeMap<K, V>,
    // 父节点 -> 子节点 id，与 data 同锁维护
    children: BTreeMap<Option<K>, Vec<K>>,
}

impl<K: Ord + Clone, V> TreeState<K, V> {
    fn insert(&mut self, id: K, value: V, parent_id: Option<K>) -> Option<V> {
        let previous = self.data.insert(id.clone(), value);
        if previous.is_some() {
            self.unlink(&id);
        }
        self.children.entry(parent_id).or_default().push(id);
        previous
    }

    fn remove(&mut self, id: &K) -> Option<V> {
        let removed = self.data.remove(id)?;
        self.unlink(id);
        Some(removed)
    }

    fn unlink(&mut self, id: &K) {
        let mut emptied = None;
        for (parent, ids) in self.children.iter_mut() {
            if let Some(pos) = ids.iter().position(|child| child == id) {
                ids.remove(pos);
                if ids.is_empty() {
                    emptied = Some(parent.clone());
                }
                break;
            }
        }
        if let Some(parent) = emptied {
            self.children.remove(&parent);
        }
    }

    fn clear(&mut self) {
        self.data.clear();
        self.children.clear();
    }
}

/// Dictionary cache for tree shaped dictionaries, indexed by parent id as well.
pub struct MapTreeDictionaryCache<K, V> {
    state: Mutex<TreeState<K, V>>,
    id_getter: IdGetter<K, V>,
    parent_id_getter: IdGetter<K, V>,
}

impl<K, V> MapTreeDictionaryCache<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + Send,
{
    pub fn new(
        id_getter: impl Fn(&V) -> Option<K> + Send + Sync + 'static,
        parent_id_getter: impl Fn(&V) -> Option<K> + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(TreeState {
                data: BTreeMap::new(),
                children: BTreeMap::new(),
            }),
            id_getter: Box::new(id_getter),
            parent_id_getter: Box::new(parent_id_getter),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TreeState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the cached children of `parent_id`; `None` selects the roots.
    pub fn children_of(&self, parent_id: Option<&K>) -> Vec<V> {
        let state = self.lock();
        let key = parent_id.cloned();
        state
            .children
            .get(&key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.data.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl<V: Entity> MapTreeDictionaryCache<Key, V> {
    /// Cache keyed by the entity's id field, nested by `parent_field`.
    pub fn for_entity(parent_field: &'static str) -> Self {
        Self::new(
            |value: &V| value.id(),
            move |value: &V| value.key(parent_field),
        )
    }
}

impl<K, V> DictionaryCache<K, V> for MapTreeDictionaryCache<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, id: &K) -> Option<V> {
        self.lock().data.get(id).cloned()
    }

    fn get_in_list(&self, ids: &[K]) -> Vec<V> {
        let state = self.lock();
        ids.iter()
            .filter_map(|id| state.data.get(id).cloned())
            .collect()
    }

    fn get_all(&self) -> Vec<V> {
        self.lock().data.values().cloned().collect()
    }

    fn put(&self, id: K, value: V) {
        let parent_id = (self.parent_id_getter)(&value);
        self.lock().insert(id, value, parent_id);
    }

    fn put_all(&self, values: Vec<V>) {
        let mut state = self.lock();
        for value in values {
            if let Some(id) = (self.id_getter)(&value) {
                let parent_id = (self.parent_id_getter)(&value);
                state.insert(id, value, parent_id);
            }
        }
    }

    fn invalidate(&self, id: &K) -> Option<V> {
        self.lock().remove(id)
    }

    fn invalidate_set(&self, ids: &[K]) {
        let mut state = self.lock();
        for id in ids {
            state.remove(id);
        }
    }

    fn invalidate_all(&self) {
        self.lock().clear();
    }

    fn reload(&self, values: Vec<V>, force: bool) {
        let mut state = self.lock();
        if !force && !state.data.is_empty() {
            return;
        }
        state.clear();
        for value in values {
            if let Some(id) = (self.id_getter)(&value) {
                let parent_id = (self.parent_id_getter)(&value);
                state.insert(id, value, parent_id);
            }
        }
    }

    fn count(&self) -> usize {
        self.lock().data.len()
    }

    fn get_list_by_parent_id(&self, parent_id: Option<&K>) -> Option<Vec<V>> {
        Some(self.children_of(parent_id))
    }
}

//! Secondary indexes over user records.
//!
//! An [`Index`] owns its record store and a B+ tree keyed by an extracted
//! attribute; tree hits (record ids) are resolved back into records. A
//! [`CompositeIndex`] is the multi-attribute variant, keyed by a
//! [`CompositeKey`] assembled from one extractor per component.
//!
//! Lock order is fixed: the record-store lock is the outer lock, the tree's
//! latch nests inside it. Every method acquires them in that order, and
//! mutators hold the record store exclusively across all of their tree
//! calls, so readers never observe a half-applied update.

use parking_lot::RwLock;

use crate::composite::CompositeKey;
use crate::error::{Error, Result};
use crate::{Comparator, GenericBPlusTree, NaturalOrder, DEFAULT_ORDER};

/// Stable record identifier: the record's insertion position in its index.
pub type RecordId = u64;

/// A record stored in an [`Index`]. The id a record reports must be the one
/// its index assigned on insertion (the insertion position).
pub trait Record: Clone {
    fn id(&self) -> RecordId;
}

type Extractor<R, K> = Box<dyn Fn(&R) -> K + Send + Sync>;

/// A single-attribute secondary index: a dense record store plus a
/// [`GenericBPlusTree`] mapping extracted keys to record ids.
///
/// Removed keys leave their record slot in place, so live ids stay valid
/// forever. Records are returned by clone.
pub struct Index<R, K, const ORDER: usize = DEFAULT_ORDER, C = NaturalOrder> {
    tree: GenericBPlusTree<K, RecordId, ORDER, C>,
    records: RwLock<Vec<R>>,
    extract: Extractor<R, K>,
}

impl<R, K, const ORDER: usize, C> Index<R, K, ORDER, C>
where
    R: Record,
    K: Clone,
    C: Comparator<K>,
{
    /// Creates an index keyed by `extract`.
    pub fn new(extract: impl Fn(&R) -> K + Send + Sync + 'static) -> Self
    where
        C: Default,
        R: 'static,
        K: 'static,
    {
        Index {
            tree: GenericBPlusTree::new(),
            records: RwLock::new(Vec::new()),
            extract: Box::new(extract),
        }
    }

    /// Appends `record` and indexes it under its extracted key, returning
    /// the assigned id (the insertion position, which the record itself
    /// must report). Fails with [`Error::DuplicateKey`] without touching
    /// the record store.
    pub fn insert(&self, record: R) -> Result<RecordId> {
        let mut records = self.records.write();
        let id = records.len() as RecordId;
        debug_assert_eq!(record.id(), id, "record must report its insertion position");
        self.tree.insert((self.extract)(&record), id)?;
        records.push(record);
        Ok(id)
    }

    /// Unindexes `key`. The record slot is kept so other ids stay stable;
    /// returns the unlinked id if the key was present.
    pub fn remove(&self, key: &K) -> Option<RecordId> {
        let _records = self.records.write();
        self.tree.remove(key).map(|(_, id)| id)
    }

    /// Replaces `old` (matched by id and extracted key) with `new`, moving
    /// the tree entry to the new key. Returns `Ok(false)` when no such
    /// record exists; fails with [`Error::DuplicateKey`] — with nothing
    /// changed — when the new key is already taken by another record.
    pub fn update(&self, old: &R, new: R) -> Result<bool> {
        let mut records = self.records.write();
        let old_key = (self.extract)(old);
        let new_key = (self.extract)(&new);
        let cmp = self.tree.comparator();

        let pos = records
            .iter()
            .position(|r| r.id() == old.id() && cmp.eq(&(self.extract)(r), &old_key));
        let Some(pos) = pos else {
            return Ok(false);
        };

        if !cmp.eq(&old_key, &new_key) && self.tree.contains(&new_key) {
            return Err(Error::DuplicateKey);
        }
        self.tree.remove(&old_key);
        self.tree.insert(new_key, new.id())?;
        records[pos] = new;
        Ok(true)
    }

    pub fn contains(&self, key: &K) -> bool {
        let _records = self.records.read();
        self.tree.contains(key)
    }

    /// Records indexed under `key` (at most one under the unique-key rule).
    pub fn find(&self, key: &K) -> Vec<R> {
        let records = self.records.read();
        Self::resolve(&records, self.tree.find(key))
    }

    /// Records whose key falls in the closed interval `[lo, hi]`, in
    /// ascending key order.
    pub fn range_search(&self, lo: &K, hi: &K) -> Vec<R> {
        let records = self.records.read();
        Self::resolve(&records, self.tree.range_search(lo, hi))
    }

    /// Records whose key satisfies `pred`, in ascending key order.
    pub fn find_if(&self, pred: impl Fn(&K) -> bool) -> Vec<R> {
        let records = self.records.read();
        Self::resolve(&records, self.tree.find_if(pred))
    }

    /// Records satisfying a predicate over the record itself. Linear scan
    /// of the record store, in insertion order; not index-accelerated.
    pub fn filter_records(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        let records = self.records.read();
        records.iter().filter(|r| pred(r)).cloned().collect()
    }

    pub fn get_record(&self, id: RecordId) -> Option<R> {
        let records = self.records.read();
        records.get(id as usize).cloned()
    }

    /// Number of records ever inserted (removed keys keep their slot).
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fill_factor(&self) -> f64 {
        let _records = self.records.read();
        self.tree.fill_factor()
    }

    fn resolve(records: &[R], ids: Vec<RecordId>) -> Vec<R> {
        ids.into_iter()
            .map(|id| records[id as usize].clone())
            .collect()
    }
}

/// One key extractor per component of a composite key; implemented for
/// tuples of one to four closures.
pub trait KeyExtractors<R>: Clone + Send + Sync {
    type Key: Clone + Ord + Send + Sync + 'static;

    fn extract(&self, record: &R) -> CompositeKey<Self::Key>;
}

/// Extraction of the single component `I`, used by
/// [`CompositeIndex::find_by_component`].
pub trait ComponentAt<R, const I: usize> {
    type Out;

    fn component_at(&self, record: &R) -> Self::Out;
}

macro_rules! impl_key_extractors {
    ($( ( $(($t:ident, $f:ident, $i:tt)),+ ) )+) => {
        $(
            impl<R, $($t,)+ $($f,)+> KeyExtractors<R> for ($($f,)+)
            where
                $($t: Clone + Ord + Send + Sync + 'static,)+
                $($f: Fn(&R) -> $t + Clone + Send + Sync,)+
            {
                type Key = ($($t,)+);

                fn extract(&self, record: &R) -> CompositeKey<Self::Key> {
                    CompositeKey::new(($((self.$i)(record),)+))
                }
            }
        )+
    };
}

impl_key_extractors! {
    ((A, FA, 0))
    ((A, FA, 0), (B, FB, 1))
    ((A, FA, 0), (B, FB, 1), (C, FC, 2))
    ((A, FA, 0), (B, FB, 1), (C, FC, 2), (D, FD, 3))
}

macro_rules! impl_component_at {
    ($( ( $(($t:ident, $f:ident)),+ ; $i:tt => $out:ident ) )+) => {
        $(
            impl<R, $($t,)+ $($f,)+> ComponentAt<R, $i> for ($($f,)+)
            where
                $($f: Fn(&R) -> $t,)+
            {
                type Out = $out;

                fn component_at(&self, record: &R) -> $out {
                    (self.$i)(record)
                }
            }
        )+
    };
}

impl_component_at! {
    ((A, FA) ; 0 => A)
    ((A, FA), (B, FB) ; 0 => A)
    ((A, FA), (B, FB) ; 1 => B)
    ((A, FA), (B, FB), (C, FC) ; 0 => A)
    ((A, FA), (B, FB), (C, FC) ; 1 => B)
    ((A, FA), (B, FB), (C, FC) ; 2 => C)
    ((A, FA), (B, FB), (C, FC), (D, FD) ; 0 => A)
    ((A, FA), (B, FB), (C, FC), (D, FD) ; 1 => B)
    ((A, FA), (B, FB), (C, FC), (D, FD) ; 2 => C)
    ((A, FA), (B, FB), (C, FC), (D, FD) ; 3 => D)
}

/// A multi-attribute secondary index over [`CompositeKey`]s, built from one
/// extractor per component.
pub struct CompositeIndex<R, E, const ORDER: usize = DEFAULT_ORDER>
where
    E: KeyExtractors<R>,
{
    index: Index<R, CompositeKey<E::Key>, ORDER>,
    extractors: E,
}

impl<R, E, const ORDER: usize> CompositeIndex<R, E, ORDER>
where
    R: Record + 'static,
    E: KeyExtractors<R> + 'static,
{
    pub fn new(extractors: E) -> Self {
        let ex = extractors.clone();
        CompositeIndex {
            index: Index::new(move |record: &R| ex.extract(record)),
            extractors,
        }
    }

    /// The composite key `record` is indexed under.
    pub fn key_of(&self, record: &R) -> CompositeKey<E::Key> {
        self.extractors.extract(record)
    }

    pub fn insert(&self, record: R) -> Result<RecordId> {
        self.index.insert(record)
    }

    pub fn find(&self, key: &CompositeKey<E::Key>) -> Vec<R> {
        self.index.find(key)
    }

    pub fn contains(&self, key: &CompositeKey<E::Key>) -> bool {
        self.index.contains(key)
    }

    pub fn range_search(
        &self,
        lo: &CompositeKey<E::Key>,
        hi: &CompositeKey<E::Key>,
    ) -> Vec<R> {
        self.index.range_search(lo, hi)
    }

    pub fn update(&self, old: &R, new: R) -> Result<bool> {
        self.index.update(old, new)
    }

    /// Records whose component `I` equals `value`. Linear scan over the
    /// record store; not index-accelerated.
    pub fn find_by_component<const I: usize>(
        &self,
        value: &<E as ComponentAt<R, I>>::Out,
    ) -> Vec<R>
    where
        E: ComponentAt<R, I>,
        <E as ComponentAt<R, I>>::Out: PartialEq,
    {
        self.index
            .filter_records(|r| <E as ComponentAt<R, I>>::component_at(&self.extractors, r) == *value)
    }

    pub fn get_record(&self, id: RecordId) -> Option<R> {
        self.index.get_record(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn fill_factor(&self) -> f64 {
        self.index.fill_factor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Employee {
        id: RecordId,
        name: String,
        age: i32,
    }

    impl Record for Employee {
        fn id(&self) -> RecordId {
            self.id
        }
    }

    fn emp(id: RecordId, name: &str, age: i32) -> Employee {
        Employee {
            id,
            name: name.to_string(),
            age,
        }
    }

    fn name_index() -> Index<Employee, String> {
        Index::new(|e: &Employee| e.name.clone())
    }

    #[test]
    fn insert_and_find() {
        let index = name_index();
        index.insert(emp(0, "alice", 30)).unwrap();
        index.insert(emp(1, "bob", 25)).unwrap();

        let hits = index.find(&"alice".to_string());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].age, 30);
        assert!(index.find(&"carol".to_string()).is_empty());
        assert!(index.contains(&"bob".to_string()));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn duplicate_key_leaves_store_unchanged() {
        let index = name_index();
        index.insert(emp(0, "alice", 30)).unwrap();
        assert_eq!(
            index.insert(emp(1, "alice", 40)),
            Err(Error::DuplicateKey)
        );
        assert_eq!(index.len(), 1);
        assert_eq!(index.find(&"alice".to_string())[0].age, 30);
    }

    #[test]
    fn remove_keeps_other_ids_valid() {
        let index = name_index();
        index.insert(emp(0, "alice", 30)).unwrap();
        index.insert(emp(1, "bob", 25)).unwrap();
        index.insert(emp(2, "carol", 41)).unwrap();

        assert_eq!(index.remove(&"bob".to_string()), Some(1));
        assert!(!index.contains(&"bob".to_string()));
        assert_eq!(index.remove(&"bob".to_string()), None);

        // Live hits still resolve through their stable ids.
        assert_eq!(index.find(&"carol".to_string())[0].id, 2);
        // The slot itself is intentionally kept.
        assert_eq!(index.get_record(1).unwrap().name, "bob");
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn update_moves_the_tree_entry() {
        let index = name_index();
        index.insert(emp(0, "alice", 30)).unwrap();
        index.insert(emp(1, "bob", 25)).unwrap();

        let old = emp(1, "bob", 25);
        assert_eq!(index.update(&old, emp(1, "bobby", 26)), Ok(true));

        assert!(!index.contains(&"bob".to_string()));
        let hits = index.find(&"bobby".to_string());
        assert_eq!(hits[0].id, 1);
        assert_eq!(hits[0].age, 26);
    }

    #[test]
    fn update_unknown_record_is_a_noop() {
        let index = name_index();
        index.insert(emp(0, "alice", 30)).unwrap();
        assert_eq!(index.update(&emp(5, "zed", 1), emp(5, "zed2", 2)), Ok(false));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn update_onto_taken_key_changes_nothing() {
        let index = name_index();
        index.insert(emp(0, "alice", 30)).unwrap();
        index.insert(emp(1, "bob", 25)).unwrap();

        let old = emp(1, "bob", 25);
        assert_eq!(
            index.update(&old, emp(1, "alice", 99)),
            Err(Error::DuplicateKey)
        );
        assert!(index.contains(&"bob".to_string()));
        assert_eq!(index.find(&"alice".to_string())[0].age, 30);
    }

    #[test]
    fn update_same_key_rewrites_in_place() {
        let index = name_index();
        index.insert(emp(0, "alice", 30)).unwrap();
        assert_eq!(index.update(&emp(0, "alice", 30), emp(0, "alice", 31)), Ok(true));
        assert_eq!(index.find(&"alice".to_string())[0].age, 31);
    }

    #[test]
    fn range_and_predicate_queries_resolve_records() {
        let ages: Index<Employee, i32> = Index::new(|e: &Employee| e.age);
        ages.insert(emp(0, "alice", 30)).unwrap();
        ages.insert(emp(1, "bob", 25)).unwrap();
        ages.insert(emp(2, "carol", 41)).unwrap();
        ages.insert(emp(3, "dave", 35)).unwrap();

        let between = ages.range_search(&26, &40);
        assert_eq!(
            between.iter().map(|e| e.age).collect::<Vec<_>>(),
            vec![30, 35]
        );

        let over30 = ages.find_if(|age| *age > 30);
        assert_eq!(
            over30.iter().map(|e| &e.name).collect::<Vec<_>>(),
            vec!["dave", "carol"]
        );

        let with_a = ages.filter_records(|e| e.name.contains('a'));
        assert_eq!(with_a.len(), 3);
    }

    #[test]
    fn get_record_out_of_range() {
        let index = name_index();
        assert!(index.get_record(0).is_none());
        index.insert(emp(0, "alice", 30)).unwrap();
        assert!(index.get_record(0).is_some());
        assert!(index.get_record(1).is_none());
    }

    fn group_name_index() -> CompositeIndex<
        Employee,
        (
            fn(&Employee) -> i32,
            fn(&Employee) -> String,
        ),
    > {
        CompositeIndex::new((
            (|e: &Employee| e.age) as fn(&Employee) -> i32,
            (|e: &Employee| e.name.clone()) as fn(&Employee) -> String,
        ))
    }

    #[test]
    fn composite_lookup_and_range() {
        let index = group_name_index();
        index.insert(emp(0, "a", 1)).unwrap();
        index.insert(emp(1, "b", 1)).unwrap();
        index.insert(emp(2, "a", 2)).unwrap();

        let key = |age: i32, name: &str| CompositeKey::new((age, name.to_string()));

        let hits = index.find(&key(1, "a"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 0);

        let span = index.range_search(&key(1, "a"), &key(2, "a"));
        assert_eq!(
            span.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(index.contains(&key(2, "a")));
        assert!(!index.contains(&key(2, "b")));
    }

    #[test]
    fn composite_find_by_component() {
        let index = group_name_index();
        index.insert(emp(0, "a", 1)).unwrap();
        index.insert(emp(1, "b", 1)).unwrap();
        index.insert(emp(2, "a", 2)).unwrap();

        let age1 = index.find_by_component::<0>(&1);
        assert_eq!(age1.iter().map(|e| e.id).collect::<Vec<_>>(), vec![0, 1]);

        let named_a = index.find_by_component::<1>(&"a".to_string());
        assert_eq!(named_a.iter().map(|e| e.id).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn composite_update() {
        let index = group_name_index();
        index.insert(emp(0, "a", 1)).unwrap();
        index.insert(emp(1, "b", 1)).unwrap();

        let old = emp(1, "b", 1);
        assert_eq!(index.update(&old, emp(1, "b", 7)), Ok(true));

        let key = index.key_of(&emp(1, "b", 7));
        assert_eq!(index.find(&key)[0].age, 7);
        assert!(!index.contains(&index.key_of(&old)));
    }
}

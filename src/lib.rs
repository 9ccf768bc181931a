#![warn(missing_docs)]
#![doc(test(no_crate_inject))]
#![doc(test(attr(deny(unused, future_incompatible))))]

//! This crate mines frequent itemsets and association rules from transactional data using a
//! vertical, tidlist-based variant of the Apriori algorithm.
//!
//! Mining happens in two phases:
//!
//! 1. A single pass over the [`TransactionStore`] builds a [`TidlistIndex`], which maps every item
//!    to the sorted list of transaction ids that contain it.
//! 2. A level-wise [`Miner`] generates candidate itemsets with [`generate_candidates`] and computes
//!    the support of each one purely by intersecting tidlists. The transactions themselves are
//!    never scanned again.
//!
//! Support can be plain (the fraction of transactions containing an itemset) or weighted (the
//! fraction of total transaction weight), selected by [`WeightingMode`].
//!
//! ```
//! use itemsets::{mine, Itemset, MiningConfig, TransactionStore};
//!
//! let mut store = TransactionStore::new();
//! store.add(&['a', 'b']).unwrap();
//! store.add(&['a', 'b', 'c']).unwrap();
//! store.add(&['a']).unwrap();
//! store.add(&['b', 'c']).unwrap();
//!
//! let config = MiningConfig {
//!     min_support: 0.5,
//!     ..MiningConfig::default()
//! };
//! let result = mine(&store, &config).unwrap();
//!
//! assert_eq!(result.len(), 5);
//! assert_eq!(result.get(&Itemset::new(&['a', 'b'])).unwrap().fraction, 0.5);
//! assert!(result.get(&Itemset::new(&['a', 'c'])).is_none());
//! ```

pub use sorted_iter;

use lasso::{LargeSpur, MicroSpur, MiniSpur, Spur};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use sorted_iter::assume::{AssumeSortedByItemExt, AssumeSortedByKeyExt};
use sorted_iter::sorted_iterator::SortedByItem;
use sorted_iter::sorted_pair_iterator::SortedByKey;
use sorted_iter::{SortedIterator, SortedPairIterator};
use statrs::distribution::{ChiSquared, Univariate};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::iter;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Identifies one transaction. Ids are assigned by [`TransactionStore`] in increasing order
/// starting at 0.
pub type TransactionId = usize;

/// Errors produced while storing transactions or mining them.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum MiningError {
    /// A transaction was rejected by [`TransactionStore::add_weighted`]. The `id` is the one it
    /// would have been assigned.
    #[error("invalid transaction {id}: {problem}")]
    InvalidTransaction {
        /// Id the rejected transaction would have received.
        id: TransactionId,
        /// What was wrong with it.
        problem: TransactionProblem,
    },

    /// A threshold or limit was out of range. Nothing is computed when this is returned.
    #[error("invalid configuration: {parameter} = {value}, expected {expected}")]
    InvalidConfiguration {
        /// Name of the offending configuration field.
        parameter: &'static str,
        /// The rejected value.
        value: f64,
        /// Human-readable description of the accepted range.
        expected: &'static str,
    },

    /// An itemset referenced an item which does not appear in any indexed transaction.
    #[error("item {0} does not appear in any transaction")]
    UnknownItem(String),

    /// The caller-supplied deadline passed between two mining levels.
    #[error("deadline passed before mining level {level}")]
    DeadlineExceeded {
        /// The level (itemset size) which was about to be evaluated.
        level: usize,
    },
}

/// Reasons a transaction can be rejected.
#[derive(Clone, Copy, Debug, Error, PartialEq)]
pub enum TransactionProblem {
    /// The transaction has no items.
    #[error("transaction has no items")]
    Empty,
    /// The weight is below zero.
    #[error("weight {0} is negative")]
    NegativeWeight(f64),
    /// The weight is NaN or infinite.
    #[error("weight {0} is not finite")]
    NonFiniteWeight(f64),
}

/// Result type for mining operations.
pub type Result<T> = std::result::Result<T, MiningError>;

/// Anything that can name an item in a transaction: interned strings from `lasso`, integers, or
/// `char`.
pub trait ItemId: Sized + Copy + std::hash::Hash + Ord + std::fmt::Debug + Send + Sync {
    /// Inline storage for an [`Itemset`]. Most frequent itemsets are short, so sizing this array to
    /// fill the bytes a spilled `SmallVec` already spends on its heap pointer and length keeps
    /// them off the heap at no extra cost. [`item_id!`] picks that length for you.
    type SmallArray: smallvec::Array<Item = Self> + Clone + std::fmt::Debug + std::hash::Hash + Ord;
}

/// Implements [`ItemId`] for each listed type, with the inline array as long as will fit in two
/// `usize`s.
///
/// `$testname` names a generated test asserting that an `Itemset` of each type is no bigger than
/// an empty `SmallVec`.
///
/// ```ignore
/// item_id![interned_item_size, Spur];
/// ```
#[macro_export]
macro_rules! item_id {
    ($testname:ident, $($t:ty),*) => {
        $(
            impl $crate::ItemId for $t {
                type SmallArray = [
                    Self;
                    2 * ::std::mem::size_of::<usize>() / ::std::mem::size_of::<Self>()
                ];
            }
        )*

        #[cfg(test)]
        #[test]
        fn $testname() {
            use $crate::Itemset;
            use smallvec::SmallVec;
            use std::mem::size_of;
            $(
                assert_eq!(
                    size_of::<Itemset<$t>>(),
                    size_of::<SmallVec<[(); 0]>>()
                );
            )*
        }
    };
}

item_id![interned_item_size, LargeSpur, Spur, MiniSpur, MicroSpur];
item_id![unsigned_item_size, u8, u16, u32, u64, usize];
item_id![signed_item_size, i8, i16, i32, i64, isize];
item_id![char_item_size, char];

/// A canonically sorted, duplicate-free set of items.
///
/// This implementation avoids heap allocations for itemsets containing a number of items smaller
/// than the length of [`ItemId::SmallArray`].
///
/// Itemsets are ordered canonically: smaller itemsets first, then lexicographically by item.
///
/// ```
/// use itemsets::Itemset;
///
/// let mut sets = vec![
///     Itemset::new(&[2, 3]),
///     Itemset::new(&[4]),
///     Itemset::new(&[1, 3]),
/// ];
/// sets.sort();
/// assert_eq!(sets, vec![
///     Itemset::new(&[4]),
///     Itemset::new(&[1, 3]),
///     Itemset::new(&[2, 3]),
/// ]);
/// ```
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Itemset<I: ItemId>(SmallVec<I::SmallArray>);

impl<I: ItemId> Itemset<I> {
    /// Creates an itemset containing the specified items.
    ///
    /// It's okay if the provided slice contains duplicates.
    pub fn new(ids: &[I]) -> Self {
        let mut v = SmallVec::from_slice(ids);
        v.sort_unstable();
        v.dedup();
        Itemset(v)
    }

    /// The number of items in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set contains no items.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The items in ascending order.
    pub fn as_slice(&self) -> &[I] {
        &self.0
    }

    /// Returns an iterator over the items which appear in this set.
    ///
    /// ```
    /// use itemsets::Itemset;
    ///
    /// let abc = Itemset::new(&[2, 3, 1, 3]);
    /// let mut it = abc.iter();
    /// assert_eq!(it.next(), Some(1));
    /// assert_eq!(it.next(), Some(2));
    /// assert_eq!(it.next(), Some(3));
    /// assert_eq!(it.next(), None);
    /// ```
    pub fn iter(&self) -> impl Iterator<Item = I> + SortedByItem + Clone + '_ {
        self.0.iter().copied().assume_sorted_by_item()
    }

    /// Returns `true` if `other` contains every item that `self` does.
    ///
    /// ```
    /// use itemsets::Itemset;
    /// let nil = Itemset::<u8>::new(&[]);
    /// let one = Itemset::new(&[1]);
    ///
    /// assert!(nil.is_subset(&one));
    /// assert!(one.is_subset(&one));
    /// assert!(!one.is_subset(&nil));
    /// ```
    pub fn is_subset(&self, other: &Self) -> bool {
        self.len() <= other.len() && self.iter().intersection(other.iter()).eq(self.iter())
    }

    /// Returns `true` if `self` contains every item that `other` does.
    pub fn is_superset(&self, other: &Self) -> bool {
        other.is_subset(self)
    }

    /// Returns an iterator over every subset of this itemset that has one less item in it.
    fn remove_one_item(
        &self,
    ) -> impl DoubleEndedIterator<Item = Self> + ExactSizeIterator + iter::FusedIterator + '_ {
        // Working from the end backward produces the subsets in lexicographic order.
        (0..self.len()).rev().map(move |remove_idx| {
            let mut selected = Itemset(SmallVec::with_capacity(self.len() - 1));
            selected.0.extend_from_slice(&self.0[..remove_idx]);
            selected.0.extend_from_slice(&self.0[remove_idx + 1..]);
            selected
        })
    }

    /// Every item except the last.
    fn prefix(&self) -> &[I] {
        &self.0[..self.len().saturating_sub(1)]
    }
}

impl<I: ItemId> Ord for Itemset<I> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.len()
            .cmp(&other.len())
            .then_with(|| self.as_slice().cmp(other.as_slice()))
    }
}

impl<I: ItemId> PartialOrd for Itemset<I> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<I: ItemId> std::fmt::Debug for Itemset<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl<I: ItemId> iter::FromIterator<I> for Itemset<I> {
    /// Creates an itemset containing the specified items.
    ///
    /// It's okay if the provided iterator contains duplicates.
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        let mut v: SmallVec<I::SmallArray> = iter.into_iter().collect();
        v.sort_unstable();
        v.dedup();
        Itemset(v)
    }
}

/// One stored transaction: a non-empty itemset and its weight.
#[derive(Clone, Debug, PartialEq)]
pub struct Transaction<I: ItemId> {
    items: Itemset<I>,
    weight: f64,
}

impl<I: ItemId> Transaction<I> {
    /// The items in this transaction.
    pub fn items(&self) -> &Itemset<I> {
        &self.items
    }

    /// The weight of this transaction; 1.0 unless it was added with
    /// [`TransactionStore::add_weighted`].
    pub fn weight(&self) -> f64 {
        self.weight
    }
}

/// An append-only database of transactions.
///
/// ```
/// use itemsets::{MiningError, TransactionProblem, TransactionStore};
///
/// let mut store = TransactionStore::new();
/// assert_eq!(store.add(&[3u32, 1]), Ok(0));
/// assert_eq!(store.add_weighted(&[2], 2.5), Ok(1));
/// assert_eq!(
///     store.add(&[]),
///     Err(MiningError::InvalidTransaction { id: 2, problem: TransactionProblem::Empty })
/// );
///
/// assert_eq!(store.len(), 2);
/// assert_eq!(store.total_weight(), 3.5);
/// assert_eq!(store.get(0).unwrap().items().as_slice(), &[1, 3]);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionStore<I: ItemId> {
    transactions: Vec<Transaction<I>>,
    total_weight: f64,
}

impl<I: ItemId> Default for TransactionStore<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ItemId> TransactionStore<I> {
    /// Creates an empty store.
    pub fn new() -> Self {
        TransactionStore {
            transactions: Vec::new(),
            total_weight: 0.0,
        }
    }

    /// Creates an empty store with room for `capacity` transactions.
    pub fn with_capacity(capacity: usize) -> Self {
        TransactionStore {
            transactions: Vec::with_capacity(capacity),
            total_weight: 0.0,
        }
    }

    /// Adds a transaction with weight 1.0. See [`TransactionStore::add_weighted`].
    pub fn add(&mut self, items: &[I]) -> Result<TransactionId> {
        self.add_weighted(items, 1.0)
    }

    /// Adds a transaction and returns its id.
    ///
    /// Duplicate items are collapsed. The transaction is rejected, and the store left unchanged,
    /// if there are no items or the weight is negative or not finite.
    pub fn add_weighted(&mut self, items: &[I], weight: f64) -> Result<TransactionId> {
        let id = self.transactions.len();
        let problem = if items.is_empty() {
            Some(TransactionProblem::Empty)
        } else if !weight.is_finite() {
            Some(TransactionProblem::NonFiniteWeight(weight))
        } else if weight < 0.0 {
            Some(TransactionProblem::NegativeWeight(weight))
        } else {
            None
        };
        if let Some(problem) = problem {
            return Err(MiningError::InvalidTransaction { id, problem });
        }

        self.transactions.push(Transaction {
            items: Itemset::new(items),
            weight,
        });
        self.total_weight += weight;
        Ok(id)
    }

    /// Looks up a transaction by id.
    pub fn get(&self, id: TransactionId) -> Option<&Transaction<I>> {
        self.transactions.get(id)
    }

    /// The number of transactions stored.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Returns `true` if no transactions have been added.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// The sum of all transaction weights.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Iterates over transactions in ascending id order.
    pub fn iter(
        &self,
    ) -> impl DoubleEndedIterator<Item = (TransactionId, &Transaction<I>)> + ExactSizeIterator + '_
    {
        self.transactions.iter().enumerate()
    }
}

/// Selects how support is measured, and with it which mining engine runs.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightingMode {
    /// Support is the fraction of transactions containing an itemset.
    Plain,
    /// Support is the fraction of total transaction weight carried by the transactions
    /// containing an itemset.
    Weighted,
}

impl Default for WeightingMode {
    fn default() -> Self {
        WeightingMode::Plain
    }
}

impl WeightingMode {
    /// Display name of the algorithm this mode runs.
    pub fn name(self) -> &'static str {
        match self {
            WeightingMode::Plain => "Improved Apriori",
            WeightingMode::Weighted => "Weighted Apriori",
        }
    }
}

/// Thresholds and options for a mining run.
///
/// Missing fields take their default values when deserializing:
///
/// ```
/// use itemsets::{MiningConfig, WeightingMode};
///
/// let config: MiningConfig =
///     serde_json::from_str(r#"{"min_support": 0.2, "weighting_mode": "weighted"}"#).unwrap();
/// assert_eq!(config.min_support, 0.2);
/// assert_eq!(config.weighting_mode, WeightingMode::Weighted);
/// assert_eq!(config.max_itemset_size, None);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MiningConfig {
    /// Minimum support fraction, in (0, 1].
    pub min_support: f64,
    /// Plain or weighted support.
    pub weighting_mode: WeightingMode,
    /// Largest itemset size to mine; unlimited if `None`. Must not be 0.
    pub max_itemset_size: Option<usize>,
    /// Minimum rule confidence for [`extract_rules`], in [0, 1].
    pub min_confidence: f64,
    /// Evaluate the candidates of each level on the rayon thread pool.
    pub parallel: bool,
}

impl Default for MiningConfig {
    fn default() -> Self {
        MiningConfig {
            min_support: 0.1,
            weighting_mode: WeightingMode::Plain,
            max_itemset_size: None,
            min_confidence: 0.5,
            parallel: true,
        }
    }
}

impl MiningConfig {
    /// Checks every threshold and limit.
    ///
    /// ```
    /// use itemsets::{MiningConfig, MiningError};
    ///
    /// let config = MiningConfig { min_support: 0.0, ..MiningConfig::default() };
    /// assert!(matches!(
    ///     config.validate(),
    ///     Err(MiningError::InvalidConfiguration { parameter: "min_support", .. })
    /// ));
    /// ```
    pub fn validate(&self) -> Result<()> {
        if !(self.min_support > 0.0 && self.min_support <= 1.0) {
            return Err(MiningError::InvalidConfiguration {
                parameter: "min_support",
                value: self.min_support,
                expected: "a fraction in (0, 1]",
            });
        }
        if self.max_itemset_size == Some(0) {
            return Err(MiningError::InvalidConfiguration {
                parameter: "max_itemset_size",
                value: 0.0,
                expected: "at least 1",
            });
        }
        check_confidence(self.min_confidence)
    }
}

fn check_confidence(min_confidence: f64) -> Result<()> {
    if (0.0..=1.0).contains(&min_confidence) {
        Ok(())
    } else {
        Err(MiningError::InvalidConfiguration {
            parameter: "min_confidence",
            value: min_confidence,
            expected: "a fraction in [0, 1]",
        })
    }
}

/// The sorted ids of the transactions containing one item, with each transaction's weight.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tidlist {
    tids: Vec<TransactionId>,
    weights: Vec<f64>,
    total_weight: f64,
}

impl Tidlist {
    /// The number of transactions containing the item.
    pub fn len(&self) -> usize {
        self.tids.len()
    }

    /// Returns `true` if no transaction contains the item. Never the case for tidlists owned by a
    /// [`TidlistIndex`].
    pub fn is_empty(&self) -> bool {
        self.tids.is_empty()
    }

    /// Transaction ids in ascending order.
    pub fn tids(&self) -> &[TransactionId] {
        &self.tids
    }

    /// Iterates over the transaction ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = TransactionId> + SortedByItem + Clone + '_ {
        self.tids.iter().copied().assume_sorted_by_item()
    }

    /// Iterates over `(transaction id, weight)` pairs in ascending id order.
    pub fn weighted(&self) -> impl Iterator<Item = (TransactionId, f64)> + SortedByKey + '_ {
        self.tids
            .iter()
            .copied()
            .zip(self.weights.iter().copied())
            .assume_sorted_by_key()
    }

    /// The sum of the weights of every transaction containing the item.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    fn push(&mut self, tid: TransactionId, weight: f64) {
        debug_assert!(self.tids.last().map_or(true, |&last| last < tid));
        self.tids.push(tid);
        self.weights.push(weight);
        self.total_weight += weight;
    }

    fn shrink_to_fit(&mut self) {
        self.tids.shrink_to_fit();
        self.weights.shrink_to_fit();
    }
}

/// Intersects the ids of `tidlists`, which must be non-empty and ordered shortest first. Stops as
/// soon as the running intersection is empty.
fn intersect_tids(tidlists: &[&Tidlist]) -> Vec<TransactionId> {
    let (first, rest) = match tidlists.split_first() {
        Some(split) => split,
        None => return Vec::new(),
    };
    let mut running = first.tids.clone();
    for next in rest {
        running = running
            .iter()
            .copied()
            .assume_sorted_by_item()
            .intersection(next.iter())
            .collect();
        if running.is_empty() {
            break;
        }
    }
    running
}

/// Like [`intersect_tids`], but keeps each surviving transaction's weight.
fn intersect_weighted(tidlists: &[&Tidlist]) -> Vec<(TransactionId, f64)> {
    let (first, rest) = match tidlists.split_first() {
        Some(split) => split,
        None => return Vec::new(),
    };
    let mut running: Vec<_> = first.weighted().collect();
    for next in rest {
        running = running
            .iter()
            .copied()
            .assume_sorted_by_key()
            .join(next.iter().pairs())
            .map(|(tid, (weight, ()))| (tid, weight))
            .collect();
        if running.is_empty() {
            break;
        }
    }
    running
}

/// Absolute and relative support of one itemset.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub struct Support {
    /// The number of transactions containing the itemset.
    pub count: usize,
    /// The total weight of the transactions containing the itemset. Equal to `count` in plain
    /// mode.
    pub weight: f64,
    /// `count` over the number of transactions in plain mode, or `weight` over the total weight
    /// in weighted mode. Zero if the denominator is zero.
    pub fraction: f64,
}

/// The vertical index: for every item, the [`Tidlist`] of transactions containing it.
///
/// Built once, in a single pass, from a [`TransactionStore`], and never modified afterward. One
/// index can be shared by any number of concurrent [`Miner`] runs.
#[derive(Clone, Debug, PartialEq)]
pub struct TidlistIndex<I: ItemId> {
    tidlists: HashMap<I, Tidlist>,
    items: Vec<I>,
    transaction_count: usize,
    total_weight: f64,
}

impl<I: ItemId> TidlistIndex<I> {
    /// Builds the index in one pass over every transaction in `store`.
    ///
    /// ```
    /// use itemsets::{TidlistIndex, TransactionStore};
    ///
    /// let mut store = TransactionStore::new();
    /// store.add(&['a', 'b']).unwrap();
    /// store.add(&['b']).unwrap();
    ///
    /// let index = TidlistIndex::build(&store);
    /// assert_eq!(index.items(), &['a', 'b']);
    /// assert_eq!(index.tidlist(&'b').unwrap().tids(), &[0, 1]);
    /// assert!(index.tidlist(&'z').is_err());
    /// ```
    pub fn build(store: &TransactionStore<I>) -> Self {
        let mut tidlists: HashMap<I, Tidlist> = HashMap::new();
        for (tid, transaction) in store.iter() {
            for item in transaction.items().iter() {
                tidlists
                    .entry(item)
                    .or_insert_with(Tidlist::default)
                    .push(tid, transaction.weight());
            }
        }

        for tidlist in tidlists.values_mut() {
            tidlist.shrink_to_fit();
        }
        tidlists.shrink_to_fit();

        let mut items: Vec<I> = tidlists.keys().copied().collect();
        items.sort_unstable();

        debug!(
            transactions = store.len(),
            items = items.len(),
            total_weight = store.total_weight(),
            "built tidlist index"
        );

        TidlistIndex {
            tidlists,
            items,
            transaction_count: store.len(),
            total_weight: store.total_weight(),
        }
    }

    /// The tidlist for `item`.
    pub fn tidlist(&self, item: &I) -> Result<&Tidlist> {
        self.tidlists
            .get(item)
            .ok_or_else(|| MiningError::UnknownItem(format!("{:?}", item)))
    }

    /// Every distinct item, in ascending order.
    pub fn items(&self) -> &[I] {
        &self.items
    }

    /// The number of distinct items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the index was built from an empty store.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The number of transactions in the store this index was built from.
    pub fn transaction_count(&self) -> usize {
        self.transaction_count
    }

    /// The total weight of the store this index was built from.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Computes the support of `itemset` by intersecting the tidlists of its items.
    ///
    /// Tidlists are intersected shortest first, and evaluation stops as soon as the intersection
    /// becomes empty. The empty itemset is contained in every transaction.
    ///
    /// ```
    /// use itemsets::{Itemset, TidlistIndex, TransactionStore, WeightingMode};
    ///
    /// let mut store = TransactionStore::new();
    /// store.add_weighted(&['a', 'b'], 2.0).unwrap();
    /// store.add_weighted(&['a'], 1.0).unwrap();
    /// let index = TidlistIndex::build(&store);
    ///
    /// let ab = Itemset::new(&['a', 'b']);
    /// assert_eq!(index.support(&ab, WeightingMode::Plain).unwrap().fraction, 0.5);
    /// assert_eq!(index.support(&ab, WeightingMode::Weighted).unwrap().fraction, 2.0 / 3.0);
    /// ```
    pub fn support(&self, itemset: &Itemset<I>, mode: WeightingMode) -> Result<Support> {
        let mut tidlists = itemset
            .iter()
            .map(|item| self.tidlist(&item))
            .collect::<Result<SmallVec<[&Tidlist; 8]>>>()?;
        tidlists.sort_by_key(|tidlist| tidlist.len());

        let (count, weight) = match (tidlists.as_slice(), mode) {
            ([], _) => (self.transaction_count, self.total_weight),
            ([single], WeightingMode::Plain) => (single.len(), single.len() as f64),
            ([single], WeightingMode::Weighted) => (single.len(), single.total_weight()),
            (_, WeightingMode::Plain) => {
                let count = intersect_tids(&tidlists).len();
                (count, count as f64)
            }
            (_, WeightingMode::Weighted) => {
                let entries = intersect_weighted(&tidlists);
                (entries.len(), entries.iter().map(|&(_, weight)| weight).sum())
            }
        };

        let denominator = match mode {
            WeightingMode::Plain => self.transaction_count as f64,
            WeightingMode::Weighted => self.total_weight,
        };
        let numerator = match mode {
            WeightingMode::Plain => count as f64,
            WeightingMode::Weighted => weight,
        };
        let fraction = if denominator > 0.0 {
            numerator / denominator
        } else {
            0.0
        };

        Ok(Support {
            count,
            weight,
            fraction,
        })
    }
}

/// The size-1 candidates: every item in `index`, in ascending order.
pub fn singleton_candidates<I: ItemId>(index: &TidlistIndex<I>) -> Vec<Itemset<I>> {
    index
        .items()
        .iter()
        .map(|item| Itemset::new(std::slice::from_ref(item)))
        .collect()
}

/// Generates the size-k+1 candidates from the frequent size-k itemsets.
///
/// Two itemsets which agree on everything but their last item are joined into a candidate, and
/// the candidate is kept only if every one of its size-k subsets is in `frequent`. The result is
/// sorted canonically and free of duplicates, whatever the order of `frequent`.
///
/// ```
/// use itemsets::{generate_candidates, Itemset};
///
/// let frequent = vec![
///     Itemset::new(&[1, 2]),
///     Itemset::new(&[2, 3]),
///     Itemset::new(&[1, 3]),
///     Itemset::new(&[1, 4]),
/// ];
/// // {1,3,4} and {1,2,4} are joined but pruned, because {3,4} and {2,4} are not frequent.
/// assert_eq!(generate_candidates(&frequent), vec![Itemset::new(&[1, 2, 3])]);
/// ```
pub fn generate_candidates<I: ItemId>(frequent: &[Itemset<I>]) -> Vec<Itemset<I>> {
    let mut sorted: Vec<&Itemset<I>> = frequent.iter().filter(|s| !s.is_empty()).collect();
    sorted.sort_unstable();
    sorted.dedup();
    debug_assert!(sorted.windows(2).all(|w| w[0].len() == w[1].len()));

    let known: HashSet<&Itemset<I>> = sorted.iter().copied().collect();
    let mut candidates = Vec::new();

    // Itemsets sharing a prefix are adjacent in canonical order, so each group is one run.
    let mut start = 0;
    while start < sorted.len() {
        let prefix = sorted[start].prefix();
        let end = start
            + sorted[start..]
                .iter()
                .take_while(|s| s.prefix() == prefix)
                .count();
        let group = &sorted[start..end];

        for (i, a) in group.iter().enumerate() {
            for b in &group[i + 1..] {
                let mut candidate = (*a).clone();
                candidate.0.extend_from_slice(&b.0[b.len() - 1..]);
                if candidate
                    .remove_one_item()
                    .all(|subset| known.contains(&subset))
                {
                    candidates.push(candidate);
                }
            }
        }

        start = end;
    }

    candidates
}

/// A frequent itemset together with its support.
#[derive(Clone, Debug, PartialEq)]
pub struct FrequentItemset<I: ItemId> {
    itemset: Itemset<I>,
    support: Support,
}

impl<I: ItemId> FrequentItemset<I> {
    /// The itemset.
    pub fn itemset(&self) -> &Itemset<I> {
        &self.itemset
    }

    /// Its support.
    pub fn support(&self) -> Support {
        self.support
    }
}

/// Every frequent itemset found by one mining run, in canonical order: by size, then
/// lexicographically.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemsetResult<I: ItemId> {
    itemsets: Vec<FrequentItemset<I>>,
    transaction_count: usize,
    total_weight: f64,
    mode: WeightingMode,
}

impl<I: ItemId> ItemsetResult<I> {
    /// Iterates over the frequent itemsets in canonical order.
    pub fn iter(
        &self,
    ) -> impl DoubleEndedIterator<Item = &FrequentItemset<I>> + ExactSizeIterator + '_ {
        self.itemsets.iter()
    }

    /// The number of frequent itemsets.
    pub fn len(&self) -> usize {
        self.itemsets.len()
    }

    /// Returns `true` if nothing was frequent.
    pub fn is_empty(&self) -> bool {
        self.itemsets.is_empty()
    }

    /// Looks up the support of `itemset`, or `None` if it is not frequent.
    pub fn get(&self, itemset: &Itemset<I>) -> Option<Support> {
        self.itemsets
            .binary_search_by(|probe| probe.itemset.cmp(itemset))
            .ok()
            .map(|idx| self.itemsets[idx].support)
    }

    /// The number of frequent itemsets of each size.
    ///
    /// ```
    /// use itemsets::{mine, MiningConfig, TransactionStore};
    ///
    /// let mut store = TransactionStore::new();
    /// store.add(&[1, 2]).unwrap();
    /// store.add(&[1, 2, 3]).unwrap();
    ///
    /// let result = mine(&store, &MiningConfig { min_support: 1.0, ..MiningConfig::default() })
    ///     .unwrap();
    /// let sizes: Vec<_> = result.size_distribution().into_iter().collect();
    /// assert_eq!(sizes, vec![(1, 2), (2, 1)]);
    /// ```
    pub fn size_distribution(&self) -> BTreeMap<usize, usize> {
        let mut sizes = BTreeMap::new();
        for frequent in self.itemsets.iter() {
            *sizes.entry(frequent.itemset.len()).or_insert(0) += 1;
        }
        sizes
    }

    /// The size of the largest frequent itemset, or 0 if there are none.
    pub fn max_itemset_size(&self) -> usize {
        self.itemsets.last().map_or(0, |f| f.itemset.len())
    }

    /// The number of transactions mined.
    pub fn transaction_count(&self) -> usize {
        self.transaction_count
    }

    /// The total weight of the transactions mined.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// How support was measured.
    pub fn mode(&self) -> WeightingMode {
        self.mode
    }

    /// The number of observations behind a support fraction: the transaction count in plain mode
    /// or the total weight in weighted mode.
    fn sample_size(&self) -> f64 {
        match self.mode {
            WeightingMode::Plain => self.transaction_count as f64,
            WeightingMode::Weighted => self.total_weight,
        }
    }
}

enum MiningState<I: ItemId> {
    Init,
    Level {
        k: usize,
        candidates: Vec<Itemset<I>>,
    },
    Done,
}

/// Runs the level-wise search over a shared [`TidlistIndex`].
///
/// The index is borrowed, not owned, so one index can serve several runs with different
/// thresholds:
///
/// ```
/// use itemsets::{Miner, MiningConfig, TidlistIndex, TransactionStore};
///
/// let mut store = TransactionStore::new();
/// store.add(&[1, 2]).unwrap();
/// store.add(&[1, 3]).unwrap();
/// let index = TidlistIndex::build(&store);
///
/// let loose = MiningConfig { min_support: 0.5, ..MiningConfig::default() };
/// let strict = MiningConfig { min_support: 1.0, ..MiningConfig::default() };
/// assert_eq!(Miner::new(&index, loose).unwrap().run().unwrap().len(), 5);
/// assert_eq!(Miner::new(&index, strict).unwrap().run().unwrap().len(), 1);
/// ```
pub struct Miner<'a, I: ItemId> {
    index: &'a TidlistIndex<I>,
    config: MiningConfig,
    deadline: Option<Instant>,
}

impl<'a, I: ItemId> Miner<'a, I> {
    /// Creates a miner, rejecting an invalid configuration before any work is done.
    pub fn new(index: &'a TidlistIndex<I>, config: MiningConfig) -> Result<Self> {
        config.validate()?;
        Ok(Miner {
            index,
            config,
            deadline: None,
        })
    }

    /// Gives up with [`MiningError::DeadlineExceeded`] if `deadline` has passed when a level is
    /// about to start. A level in progress always runs to completion.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Mines every frequent itemset.
    pub fn run(&self) -> Result<ItemsetResult<I>> {
        let started = Instant::now();
        let mode = self.config.weighting_mode;
        let mut itemsets = Vec::new();
        let mut levels = 0;
        let mut state = MiningState::Init;

        loop {
            state = match state {
                MiningState::Init => MiningState::Level {
                    k: 1,
                    candidates: singleton_candidates(self.index),
                },
                MiningState::Level { k, candidates } => {
                    if let Some(deadline) = self.deadline {
                        if Instant::now() >= deadline {
                            return Err(MiningError::DeadlineExceeded { level: k });
                        }
                    }

                    let retained = self.evaluate_level(&candidates)?;
                    levels = k;
                    debug!(
                        level = k,
                        candidates = candidates.len(),
                        retained = retained.len(),
                        "evaluated level"
                    );

                    let at_limit = self.config.max_itemset_size.map_or(false, |max| k >= max);
                    let next = if retained.is_empty() || at_limit {
                        Vec::new()
                    } else {
                        let frequent: Vec<_> =
                            retained.iter().map(|f| f.itemset.clone()).collect();
                        generate_candidates(&frequent)
                    };
                    itemsets.extend(retained);

                    if next.is_empty() {
                        MiningState::Done
                    } else {
                        MiningState::Level {
                            k: k + 1,
                            candidates: next,
                        }
                    }
                }
                MiningState::Done => break,
            };
        }

        // Each level's candidates are generated in canonical order and levels are visited by
        // increasing size, so the result is already canonical.
        debug_assert!(itemsets.windows(2).all(|w| w[0].itemset < w[1].itemset));

        info!(
            engine = mode.name(),
            itemsets = itemsets.len(),
            levels,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "mining finished"
        );

        Ok(ItemsetResult {
            itemsets,
            transaction_count: self.index.transaction_count(),
            total_weight: self.index.total_weight(),
            mode,
        })
    }

    /// Evaluates one level's candidates and keeps the frequent ones, in candidate order.
    fn evaluate_level(&self, candidates: &[Itemset<I>]) -> Result<Vec<FrequentItemset<I>>> {
        let evaluate = |itemset: &Itemset<I>| -> Result<Option<FrequentItemset<I>>> {
            let support = self.index.support(itemset, self.config.weighting_mode)?;
            Ok(if support.fraction >= self.config.min_support {
                Some(FrequentItemset {
                    itemset: itemset.clone(),
                    support,
                })
            } else {
                None
            })
        };

        let evaluated: Vec<Result<Option<FrequentItemset<I>>>> = if self.config.parallel {
            candidates.par_iter().map(&evaluate).collect()
        } else {
            candidates.iter().map(&evaluate).collect()
        };

        evaluated.into_iter().filter_map(Result::transpose).collect()
    }
}

/// Validates `config`, indexes `store`, and mines it.
pub fn mine<I: ItemId>(
    store: &TransactionStore<I>,
    config: &MiningConfig,
) -> Result<ItemsetResult<I>> {
    config.validate()?;
    let index = TidlistIndex::build(store);
    Miner::new(&index, config.clone())?.run()
}

/// An association rule `antecedent => consequent`.
#[derive(Clone, Debug, PartialEq)]
pub struct Rule<I: ItemId> {
    antecedent: Itemset<I>,
    consequent: Itemset<I>,
    support: f64,
    confidence: f64,
    lift: f64,
    independence_alpha: f64,
}

impl<I: ItemId> Rule<I> {
    /// The left-hand side.
    pub fn antecedent(&self) -> &Itemset<I> {
        &self.antecedent
    }

    /// The right-hand side, disjoint from the antecedent.
    pub fn consequent(&self) -> &Itemset<I> {
        &self.consequent
    }

    /// Support of the union of antecedent and consequent.
    pub fn support(&self) -> f64 {
        self.support
    }

    /// support(antecedent ∪ consequent) / support(antecedent).
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// confidence / support(consequent). Values above 1 mean the two sides occur together more
    /// often than if they were independent.
    pub fn lift(&self) -> f64 {
        self.lift
    }

    /// Returns the probability that you'd be making a mistake if you claimed that the antecedent
    /// and consequent are not independent, from a chi-squared test on their 2×2 contingency
    /// table. Only meaningful when supports come from true counts rather than arbitrary weights.
    pub fn independence_alpha(&self) -> f64 {
        self.independence_alpha
    }
}

/// The rules derived from one [`ItemsetResult`], ordered by their union itemset and then by
/// antecedent, both canonically.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleResult<I: ItemId> {
    rules: Vec<Rule<I>>,
}

impl<I: ItemId> RuleResult<I> {
    /// Iterates over the rules in order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Rule<I>> + ExactSizeIterator + '_ {
        self.rules.iter()
    }

    /// The number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if no rule met the confidence threshold.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Derives every rule with confidence at least `min_confidence` from the frequent itemsets in
/// `result`. No transactions or tidlists are consulted.
///
/// ```
/// use itemsets::{extract_rules, mine, Itemset, MiningConfig, TransactionStore};
///
/// let mut store = TransactionStore::new();
/// for t in [&['a', 'b'][..], &['a', 'b', 'c'], &['a'], &['b', 'c']].iter() {
///     store.add(t).unwrap();
/// }
/// let result = mine(&store, &MiningConfig { min_support: 0.5, ..MiningConfig::default() })
///     .unwrap();
///
/// let rules = extract_rules(&result, 1.0).unwrap();
/// assert_eq!(rules.len(), 1);
/// let rule = rules.iter().next().unwrap();
/// assert_eq!(rule.antecedent(), &Itemset::new(&['c']));
/// assert_eq!(rule.consequent(), &Itemset::new(&['b']));
/// assert_eq!(rule.lift(), 1.0 / 0.75);
/// ```
pub fn extract_rules<I: ItemId>(
    result: &ItemsetResult<I>,
    min_confidence: f64,
) -> Result<RuleResult<I>> {
    check_confidence(min_confidence)?;
    let sample_size = result.sample_size();
    let mut rules = Vec::new();

    for frequent in result.iter().filter(|f| f.itemset.len() >= 2) {
        let items = frequent.itemset.as_slice();
        let union = frequent.support.fraction;
        // A frequent itemset of 64 items would have more frequent subsets than could ever be
        // enumerated, so a 64-bit mask is enough.
        debug_assert!(items.len() < 64);
        let full = (1u64 << items.len()) - 1;

        let mut derived = Vec::new();
        for mask in 1..full {
            let (antecedent, consequent): (Vec<(usize, I)>, Vec<(usize, I)>) = items
                .iter()
                .copied()
                .enumerate()
                .partition(|&(idx, _)| mask & (1 << idx) != 0);
            let antecedent: Itemset<I> = antecedent.into_iter().map(|(_, item)| item).collect();
            let consequent: Itemset<I> = consequent.into_iter().map(|(_, item)| item).collect();

            // Every subset of a frequent itemset is frequent, so both lookups succeed.
            let (a, c) = match (result.get(&antecedent), result.get(&consequent)) {
                (Some(a), Some(c)) => (a.fraction, c.fraction),
                _ => {
                    debug_assert!(false, "subset of a frequent itemset missing from result");
                    continue;
                }
            };

            let confidence = union / a;
            if confidence < min_confidence {
                continue;
            }
            derived.push(Rule {
                antecedent,
                consequent,
                support: union,
                confidence,
                lift: confidence / c,
                independence_alpha: independence_alpha(sample_size, union, a, c),
            });
        }

        derived.sort_by(|x, y| x.antecedent.cmp(&y.antecedent));
        rules.extend(derived);
    }

    debug!(rules = rules.len(), min_confidence, "extracted rules");
    Ok(RuleResult { rules })
}

/// Chi-squared test with one degree of freedom on the 2×2 table of antecedent against consequent,
/// given the joint and marginal support fractions and the number of observations.
fn independence_alpha(sample_size: f64, joint: f64, antecedent: f64, consequent: f64) -> f64 {
    let variance = antecedent * (1.0 - antecedent) * consequent * (1.0 - consequent);
    if !(variance > 0.0 && sample_size > 0.0) {
        return 1.0;
    }
    let deviation = joint - antecedent * consequent;
    let chi2 = sample_size * deviation * deviation / variance;
    match ChiSquared::new(1.0) {
        Ok(distribution) => 1.0 - distribution.cdf(chi2),
        Err(_) => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tidlist(entries: &[(TransactionId, f64)]) -> Tidlist {
        let mut tidlist = Tidlist::default();
        for &(tid, weight) in entries {
            tidlist.push(tid, weight);
        }
        tidlist
    }

    #[test]
    fn subsets_come_out_in_lexicographic_order() {
        let abc = Itemset::new(&[1u8, 2, 3]);
        let subsets: Vec<_> = abc.remove_one_item().collect();
        assert_eq!(
            subsets,
            vec![
                Itemset::new(&[1, 2]),
                Itemset::new(&[1, 3]),
                Itemset::new(&[2, 3]),
            ]
        );
    }

    #[test]
    fn prefix_drops_the_last_item() {
        assert_eq!(Itemset::new(&[4u8, 2, 9]).prefix(), &[2, 4]);
        assert!(Itemset::new(&[4u8]).prefix().is_empty());
    }

    #[test]
    fn intersection_keeps_common_tids() {
        let a = tidlist(&[(0, 1.0), (2, 1.0), (5, 1.0), (7, 1.0)]);
        let b = tidlist(&[(2, 1.0), (3, 1.0), (7, 1.0)]);
        assert_eq!(intersect_tids(&[&b, &a]), vec![2, 7]);
    }

    #[test]
    fn intersection_stops_once_empty() {
        let a = tidlist(&[(0, 1.0)]);
        let b = tidlist(&[(1, 1.0)]);
        let c = tidlist(&[(0, 1.0), (1, 1.0)]);
        assert!(intersect_tids(&[&a, &b, &c]).is_empty());
        assert!(intersect_weighted(&[&a, &b, &c]).is_empty());
    }

    #[test]
    fn weighted_intersection_carries_weights() {
        let a = tidlist(&[(1, 2.0), (4, 0.5)]);
        let b = tidlist(&[(0, 3.0), (1, 2.0), (3, 1.0), (4, 0.5)]);
        assert_eq!(intersect_weighted(&[&a, &b]), vec![(1, 2.0), (4, 0.5)]);
    }

    #[test]
    fn degenerate_tables_are_never_significant() {
        assert_eq!(independence_alpha(10.0, 1.0, 1.0, 1.0), 1.0);
        assert_eq!(independence_alpha(0.0, 0.25, 0.5, 0.5), 1.0);
    }

    #[test]
    fn independent_sides_are_not_significant() {
        let alpha = independence_alpha(100.0, 0.25, 0.5, 0.5);
        assert!((alpha - 1.0).abs() < 1e-12);
    }

    #[test]
    fn strongly_dependent_sides_are_significant() {
        assert!(independence_alpha(1000.0, 0.5, 0.5, 0.5) < 1e-6);
    }
}

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::{debug_delay, MapGuard};

/// One slot in a node's key array. `Top` is the distinguished greatest
/// element. It appears exactly once per level, always in the final slot of
/// the rightmost node, so that every level has a well-defined insertion
/// point for every possible key.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Item<K> {
    Key(K),
    Top,
}

impl<K> Item<K> {
    pub(crate) fn is_top(&self) -> bool {
        matches!(self, Item::Top)
    }

    pub(crate) fn key(&self) -> &K {
        match self {
            Item::Key(key) => key,
            Item::Top => unreachable!("the top sentinel is never read as a key"),
        }
    }
}

/// An immutable snapshot of one node. A snapshot is fully initialized before
/// it is published with a release store, and never mutated afterwards, so a
/// reader that acquires it sees consistent arrays.
///
/// Leaves carry `values`, routers carry `children`. `children` is parallel
/// to the whole of `keys` (the slot under the sentinel routes to the
/// rightmost subtree), while `values` is parallel to the real keys only and
/// is therefore one shorter than `keys` in the rightmost leaf. A map
/// configured with a value proxy stores no `values` at all.
#[derive(Debug, Clone)]
pub(crate) struct Contents<K, V> {
    pub(crate) keys: Box<[Item<K>]>,
    pub(crate) values: Option<Box<[V]>>,
    pub(crate) children: Option<Box<[NodeRef<K, V>]>>,
    pub(crate) link: Option<NodeRef<K, V>>,
}

impl<K, V> Contents<K, V> {
    pub(crate) fn new(
        keys: Box<[Item<K>]>,
        values: Option<Box<[V]>>,
        children: Option<Box<[NodeRef<K, V>]>>,
        link: Option<NodeRef<K, V>>,
    ) -> Contents<K, V> {
        Contents {
            keys,
            values,
            children,
            link,
        }
    }

    pub(crate) fn is_router(&self) -> bool {
        self.children.is_some()
    }

    pub(crate) fn children(&self) -> &[NodeRef<K, V>] {
        if let Some(children) = &self.children {
            children
        } else {
            unreachable!()
        }
    }
}

/// A node is nothing but one atomic slot holding the current snapshot.
/// Whether a node is a leaf or a router is fixed for its whole lifetime,
/// because every replacement snapshot preserves the shape of the one it
/// replaces.
#[derive(Debug)]
pub(crate) struct Node<K, V> {
    contents: AtomicPtr<Contents<K, V>>,
}

/// The current top of the tree: the root node of the highest level, tagged
/// with that level's height. Growing the tree replaces the whole record
/// through one CAS on the map's root slot.
#[derive(Debug)]
pub(crate) struct HeadNode<K, V> {
    pub(crate) node: NodeRef<K, V>,
    pub(crate) height: usize,
}

/// Garbage handed to the epoch-based reclamation system: snapshots and head
/// records that were replaced while concurrent readers may still hold them.
/// Node shells themselves are not reclaimed this way, see `registry.rs`.
pub(crate) enum Deferred<K: 'static, V: 'static> {
    Contents(Box<Contents<K, V>>),
    Head(Box<HeadNode<K, V>>),
}

/// A shared, non-owning reference to a node. Nodes are multiply referenced
/// by parents, links, and in-flight operations, with no single owner; the
/// registry keeps every shell alive until the map itself goes away.
pub(crate) struct NodeRef<K, V>(*const Node<K, V>);

impl<K, V> Clone for NodeRef<K, V> {
    fn clone(&self) -> NodeRef<K, V> {
        *self
    }
}

impl<K, V> Copy for NodeRef<K, V> {}

impl<K, V> PartialEq for NodeRef<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<K, V> Eq for NodeRef<K, V> {}

impl<K, V> std::fmt::Debug for NodeRef<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeRef({:?})", self.0)
    }
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for NodeRef<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for NodeRef<K, V> {}

impl<K, V> NodeRef<K, V>
where
    K: 'static + Clone + Send + Sync,
    V: 'static + Clone + Send + Sync,
{
    /// Heap-allocates a fresh node around an initial snapshot. The caller is
    /// responsible for handing the returned reference to the registry.
    pub(crate) fn alloc(contents: Contents<K, V>) -> NodeRef<K, V> {
        let node = Node {
            contents: AtomicPtr::new(Box::into_raw(Box::new(contents))),
        };
        NodeRef(Box::into_raw(Box::new(node)))
    }

    pub(crate) fn as_ptr(self) -> *mut Node<K, V> {
        self.0 as *mut Node<K, V>
    }

    pub(crate) fn from_ptr(ptr: *mut Node<K, V>) -> NodeRef<K, V> {
        NodeRef(ptr)
    }

    /// Acquires the current snapshot. The returned reference stays valid for
    /// as long as the calling operation keeps its reclamation guard pinned,
    /// which every operation does for its full duration.
    pub(crate) fn contents<'a>(self) -> &'a Contents<K, V> {
        unsafe { &*(*self.0).contents.load(Ordering::Acquire) }
    }

    pub(crate) fn raw_contents(self) -> *mut Contents<K, V> {
        unsafe { (*self.0).contents.load(Ordering::Acquire) }
    }

    /// The only mutation a node supports: swap the whole snapshot. The
    /// replaced snapshot is deferred to the reclamation system because
    /// concurrent readers may still be traversing it. On failure the
    /// proposed snapshot is dropped and the caller re-anchors.
    pub(crate) fn cas_contents<'a>(
        self,
        expected: &Contents<K, V>,
        update: Contents<K, V>,
        guard: &mut MapGuard<'_, K, V>,
    ) -> Result<&'a Contents<K, V>, ()> {
        if debug_delay() {
            return Err(());
        }

        let update_ptr = Box::into_raw(Box::new(update));
        let expected_ptr = expected as *const Contents<K, V> as *mut Contents<K, V>;

        let slot = unsafe { &(*self.0).contents };
        let res =
            slot.compare_exchange(expected_ptr, update_ptr, Ordering::AcqRel, Ordering::Acquire);

        match res {
            Ok(previous) => {
                let replaced: Box<Contents<K, V>> = unsafe { Box::from_raw(previous) };
                guard.defer_drop(Deferred::Contents(replaced));
                Ok(unsafe { &*update_ptr })
            }
            Err(_) => {
                let failed_value: Box<Contents<K, V>> = unsafe { Box::from_raw(update_ptr) };
                drop(failed_value);
                Err(())
            }
        }
    }
}

/// The location of a key (or of its insertion point) within one node, as
/// seen through one particular snapshot.
pub(crate) struct SearchResults<K, V> {
    pub(crate) node: NodeRef<K, V>,
    contents: *const Contents<K, V>,
    pub(crate) index: Result<usize, usize>,
}

impl<K, V> Clone for SearchResults<K, V> {
    fn clone(&self) -> SearchResults<K, V> {
        *self
    }
}

impl<K, V> Copy for SearchResults<K, V> {}

impl<K, V> SearchResults<K, V> {
    pub(crate) fn new(
        node: NodeRef<K, V>,
        contents: &Contents<K, V>,
        index: Result<usize, usize>,
    ) -> SearchResults<K, V> {
        SearchResults {
            node,
            contents,
            index,
        }
    }

    pub(crate) fn contents(&self) -> &Contents<K, V> {
        unsafe { &*self.contents }
    }

    /// The in-node position of a key that was found. Callers only reach for
    /// this after establishing that the search succeeded.
    pub(crate) fn position(&self) -> usize {
        match self.index {
            Ok(index) => index,
            Err(_) => unreachable!("position() on a missed search"),
        }
    }
}

/// Copy of `items` with `item` spliced in at `index`.
pub(crate) fn insert_at<T: Clone>(items: &[T], index: usize, item: T) -> Box<[T]> {
    let mut out = Vec::with_capacity(items.len() + 1);
    out.extend_from_slice(&items[..index]);
    out.push(item);
    out.extend_from_slice(&items[index..]);
    out.into_boxed_slice()
}

/// Copy of `items` minus the element at `index`.
pub(crate) fn remove_at<T: Clone>(items: &[T], index: usize) -> Box<[T]> {
    let mut out = Vec::with_capacity(items.len() - 1);
    out.extend_from_slice(&items[..index]);
    out.extend_from_slice(&items[index + 1..]);
    out.into_boxed_slice()
}

/// The left half of a split at `index`, pivot included.
pub(crate) fn left_of<T: Clone>(items: &[T], index: usize) -> Box<[T]> {
    items[..=index].into()
}

/// The right half of a split at `index`, pivot excluded.
pub(crate) fn right_of<T: Clone>(items: &[T], index: usize) -> Box<[T]> {
    items[index + 1..].into()
}

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::node::NodeRef;

#[derive(Debug)]
struct Entry<K, V> {
    next: *mut Entry<K, V>,
    node: NodeRef<K, V>,
}

/// A lock-free intrusive stack recording every node shell the map has ever
/// allocated.
///
/// Snapshots are reclaimed through epochs as soon as they are replaced, but
/// a node shell that was emptied and bypassed can still be referenced by a
/// stale router entry for an unbounded time, so shells are only freed once
/// the whole map goes away. Detached shells hold nothing but one pointer
/// word by then, their last snapshot having shrunk to an empty key array.
#[derive(Debug)]
pub(crate) struct NodeRegistry<K, V> {
    head: AtomicPtr<Entry<K, V>>,
}

impl<K, V> Default for NodeRegistry<K, V> {
    fn default() -> NodeRegistry<K, V> {
        NodeRegistry {
            head: AtomicPtr::default(),
        }
    }
}

impl<K, V> Drop for NodeRegistry<K, V> {
    fn drop(&mut self) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            let entry: Box<Entry<K, V>> = unsafe { Box::from_raw(cursor) };
            cursor = entry.next;
        }
    }
}

impl<K, V> NodeRegistry<K, V> {
    pub(crate) fn push(&self, node: NodeRef<K, V>) {
        let mut head = self.head.load(Ordering::Acquire);

        let entry = Box::new(Entry { next: head, node });

        let entry_ptr = Box::into_raw(entry);

        loop {
            let install_res = self.head.compare_exchange(
                head,
                entry_ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            );

            match install_res {
                Ok(_) => return,
                Err(actual_head) => {
                    head = actual_head;

                    unsafe {
                        (*entry_ptr).next = head;
                    }
                }
            }
        }
    }

    /// Detaches and returns every recorded shell. Only called while the map
    /// is being torn down, with no concurrent pushes possible.
    pub(crate) fn drain(&mut self) -> Drain<K, V> {
        Drain {
            cursor: self.head.swap(std::ptr::null_mut(), Ordering::AcqRel),
        }
    }
}

pub(crate) struct Drain<K, V> {
    cursor: *mut Entry<K, V>,
}

impl<K, V> Iterator for Drain<K, V> {
    type Item = NodeRef<K, V>;

    fn next(&mut self) -> Option<NodeRef<K, V>> {
        if self.cursor.is_null() {
            return None;
        }
        let entry: Box<Entry<K, V>> = unsafe { Box::from_raw(self.cursor) };
        self.cursor = entry.next;
        Some(entry.node)
    }
}

#[test]
fn basic_registry() {
    const N: usize = 128;

    let mut registry = NodeRegistry::<usize, usize>::default();
    let mut nodes = vec![];
    for _ in 0..N {
        let node = NodeRef::alloc(crate::node::Contents::new(
            vec![crate::node::Item::Top].into_boxed_slice(),
            Some(Vec::new().into_boxed_slice()),
            None,
            None,
        ));
        registry.push(node);
        nodes.push(node);
    }

    let drained: Vec<_> = registry.drain().collect();
    assert_eq!(drained.len(), N);
    for node in drained {
        assert!(nodes.contains(&node));
        drop(unsafe { Box::from_raw(node.raw_contents()) });
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }
}

use std::{marker::PhantomData, ptr::NonNull};

use crate::Pointer;

/// Linked list node. `data` goes first and the struct is `repr(C)`, so a node
/// written at the start of a page has `data` at the start of the page too.
/// Region headers rely on that to keep their tag at offset zero, see
/// [`crate::header`].
#[repr(C)]
pub(crate) struct Node<T> {
    pub data: T,
    pub next: Pointer<Self>,
    pub prev: Pointer<Self>,
}

/// Intrusive doubly linked list. Nodes are written into memory that the
/// caller provides (the first bytes of a region) because we can't allocate
/// list nodes ourselves, we are the allocator. Insertion at the head and
/// removal of a known node are both O(1).
pub(crate) struct LinkedList<T> {
    head: Pointer<Node<T>>,
    len: usize,
    marker: PhantomData<T>,
}

impl<T> LinkedList<T> {
    /// Creates an empty linked list.
    pub const fn new() -> Self {
        Self {
            head: None,
            len: 0,
            marker: PhantomData,
        }
    }

    /// Number of nodes currently linked.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Writes a new node holding `data` at `address` and links it as the new
    /// head of the list.
    ///
    /// # Safety
    ///
    /// `address` must be valid for writes of `Node<T>`, suitably aligned, and
    /// stay valid until the node is removed.
    pub unsafe fn push_front(&mut self, data: T, address: NonNull<u8>) -> NonNull<Node<T>> {
        let node = address.cast::<Node<T>>();

        node.as_ptr().write(Node {
            data,
            next: self.head,
            prev: None,
        });

        if let Some(mut head) = self.head {
            head.as_mut().prev = Some(node);
        }

        self.head = Some(node);
        self.len += 1;

        node
    }

    /// Unlinks `node`. Its memory is left untouched.
    ///
    /// # Safety
    ///
    /// `node` must be a node currently linked in this list.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        let (prev, next) = {
            let node = node.as_ref();
            (node.prev, node.next)
        };

        match prev {
            Some(mut prev) => prev.as_mut().next = next,
            None => self.head = next,
        }

        if let Some(mut next) = next {
            next.as_mut().prev = prev;
        }

        self.len -= 1;
    }

    /// Iterates over node pointers from head to tail. The iterator reads the
    /// `next` link before yielding a node, so the yielded node can be removed
    /// (and even unmapped) without breaking the iteration.
    pub fn iter(&self) -> Iter<T> {
        Iter {
            current: self.head,
            marker: PhantomData,
        }
    }
}

/// See [`LinkedList::iter`].
pub(crate) struct Iter<T> {
    current: Pointer<Node<T>>,
    marker: PhantomData<T>,
}

impl<T> Iterator for Iter<T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;
        // SAFETY: nodes stay valid while linked and the list owns the links.
        self.current = unsafe { node.as_ref().next };
        Some(node)
    }
}

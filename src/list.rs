use std::{marker::PhantomData, ptr::NonNull};

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// Every header the allocator writes into mapped memory is a `Node`. The
/// links are never null once the node is part of a list: a node that is
/// alone in its list points to itself in both directions.
pub(crate) struct Node<T> {
    /// Pointer to the next node of the list
    pub next: NonNull<Self>,
    /// Pointer to the previous node of the list
    pub prev: NonNull<Self>,
    /// Element of the node
    pub data: T,
}

/// Circular doubly-linked list.
///
/// ```text
///        +-------------------------------------------+
///        |                                           |
///        v                                           |
///   +--------+    +--------+    +--------+    +--------+
///   |  head  | -> |  Node  | -> |  Node  | -> |  Node  |
///   +--------+    +--------+    +--------+    +--------+
///        |                                           ^
///        +-------------------------------------------+
///                          (prev)
/// ```
///
/// The list never allocates. Nodes are written at addresses handed in by the
/// caller, which for us is always somewhere inside a mapped arena.
pub(crate) struct List<T> {
    head: Link<Node<T>>,
    len: usize,
    marker: PhantomData<T>,
}

pub(crate) struct Iter<'a, T> {
    current: Link<Node<T>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

impl<T> Node<T> {
    /// Whether `node` is the only element of its list.
    ///
    /// **SAFETY**: `node` must point to a linked node.
    #[inline]
    pub unsafe fn is_alone(node: NonNull<Self>) -> bool {
        unsafe { node.as_ref().next == node && node.as_ref().prev == node }
    }
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Node<T>> {
        self.head
    }

    /// Writes `data` as a new node at `addr` and makes it the head of the list.
    ///
    /// **SAFETY**: Caller must guarantee that `addr` is valid for writes of a
    /// `Node<T>`, suitably aligned, and not overlapping any live node.
    pub unsafe fn push_front(&mut self, data: T, addr: NonNull<u8>) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            match self.head {
                None => {
                    node.as_ptr().write(Node { next: node, prev: node, data });
                }
                Some(head) => {
                    Self::link_between(node, data, head.as_ref().prev, head);
                }
            }
        }

        self.head = Some(node);
        self.len += 1;

        node
    }

    /// Writes `data` as a new node at `addr` right after `anchor`.
    ///
    /// **SAFETY**: Same as [`List::push_front`], and `anchor` must be a node
    /// of this list.
    pub unsafe fn insert_after(
        &mut self,
        anchor: NonNull<Node<T>>,
        data: T,
        addr: NonNull<u8>,
    ) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            Self::link_between(node, data, anchor, anchor.as_ref().next);
        }

        self.len += 1;

        node
    }

    unsafe fn link_between(
        node: NonNull<Node<T>>,
        data: T,
        mut prev: NonNull<Node<T>>,
        mut next: NonNull<Node<T>>,
    ) {
        unsafe {
            node.as_ptr().write(Node { next, prev, data });
            prev.as_mut().next = node;
            next.as_mut().prev = node;
        }
    }

    /// Unlinks `node`. Its memory is left untouched, so the caller may still
    /// read the node's data afterwards.
    ///
    /// **SAFETY**: `node` must be a node of this list.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        unsafe {
            if self.len == 1 {
                self.head = None;
            } else {
                let mut next = node.as_ref().next;
                let mut prev = node.as_ref().prev;
                prev.as_mut().next = next;
                next.as_mut().prev = prev;

                if self.head == Some(node) {
                    self.head = Some(next);
                }
            }
        }

        self.len -= 1;
    }

    /// Iterates the nodes starting at the head, visiting each one once.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let node = self.current?;

        unsafe {
            self.current = Some(node.as_ref().next);
        }
        self.remaining -= 1;

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = NonNull<Node<T>>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

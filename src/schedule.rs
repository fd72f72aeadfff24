//! Linked-list scheduling shared by the controller drivers
//!
//! Controllers walk singly linked lists of queue heads (EHCI) or endpoint
//! descriptors (OHCI) through physical addresses. Every head also records its
//! successor as a [`Node`], so the driver can walk the same list without
//! translating addresses back into references. The two links always change
//! together: hardware link first, then software link.
//!
//! Insertion splices after a head, in a single link write that the
//! controller either observes or doesn't. Removal patches the predecessor;
//! what happens to the removed node's memory afterwards is up to the caller.

use core::sync::atomic::{AtomicU16, Ordering};

/// A position in a controller's list memory
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Node {
    /// Periodic bucket head, by log2 of the interval in milliseconds
    Period(u8),
    /// Dummy head of the OHCI bulk list
    BulkHead,
    /// The control pipe of a device
    Control(u8),
    /// A non-control pipe of a device
    Pipe { dev_addr: u8, index: u8 },
}

const NONE: u16 = 0xFFFF;

impl Node {
    /// Heads that never carry transfers
    pub fn is_dummy(self) -> bool {
        matches!(self, Node::Period(_) | Node::BulkHead)
    }

    fn encode(node: Option<Node>) -> u16 {
        match node {
            None => NONE,
            Some(Node::Period(log2)) => 0x1000 | log2 as u16,
            Some(Node::BulkHead) => 0x2000,
            Some(Node::Control(dev_addr)) => 0x3000 | dev_addr as u16,
            Some(Node::Pipe { dev_addr, index }) => 0x4000 | (dev_addr as u16) << 4 | index as u16,
        }
    }

    fn decode(raw: u16) -> Option<Node> {
        let low = (raw & 0xFF) as u8;
        match raw & 0xF000 {
            0x1000 => Some(Node::Period(low)),
            0x2000 => Some(Node::BulkHead),
            0x3000 => Some(Node::Control(low)),
            0x4000 => Some(Node::Pipe {
                dev_addr: (raw >> 4 & 0xFF) as u8,
                index: (raw & 0xF) as u8,
            }),
            _ => None,
        }
    }
}

/// Software link to the next node
pub struct SwLink(AtomicU16);

impl SwLink {
    pub const fn new() -> Self {
        SwLink(AtomicU16::new(NONE))
    }
    pub fn get(&self) -> Option<Node> {
        Node::decode(self.0.load(Ordering::Acquire))
    }
    pub fn set(&self, node: Option<Node>) {
        self.0.store(Node::encode(node), Ordering::Release);
    }
}

/// A list element with a hardware and a software link
pub trait Link {
    /// The raw hardware link word
    fn hw_next(&self) -> u32;
    fn set_hw_next(&self, word: u32);
    fn sw_next(&self) -> &SwLink;
}

/// Memory that holds list elements
pub trait Schedule {
    type Element: Link;

    /// Upper bound on the length of any list, for walk limits
    const MAX_NODES: usize;

    fn element(&self, node: Node) -> &Self::Element;

    /// Hardware link word that points at `node`
    fn link_word(&self, node: Node) -> u32;

    /// Hardware link word that ends a list
    fn terminate_word(&self) -> u32;
}

/// Point `node` at `next`, or end the list at `node`.
pub fn link<S: Schedule>(schedule: &S, node: Node, next: Option<Node>) {
    let elem = schedule.element(node);
    match next {
        Some(next) => elem.set_hw_next(schedule.link_word(next)),
        None => elem.set_hw_next(schedule.terminate_word()),
    }
    elem.sw_next().set(next);
}

/// Splice `node` in right after `head`.
///
/// `node` must be fully initialized; the controller may fetch it as soon as
/// this returns.
pub fn insert<S: Schedule>(schedule: &S, head: Node, node: Node) {
    let head_elem = schedule.element(head);
    let elem = schedule.element(node);
    elem.set_hw_next(head_elem.hw_next());
    elem.sw_next().set(head_elem.sw_next().get());
    head_elem.set_hw_next(schedule.link_word(node));
    head_elem.sw_next().set(Some(node));
}

/// Unlink `node` from the list that starts at `head`.
///
/// The removed node is pointed back at `head`, so a controller that's still
/// holding it lands on a reachable node. Returns `false` if `node` isn't in
/// the list.
///
/// # Panics
///
/// Panics if the walk doesn't end within [`Schedule::MAX_NODES`] steps. The
/// list is corrupt.
pub fn remove<S: Schedule>(schedule: &S, head: Node, node: Node) -> bool {
    let mut prev = head;
    for _ in 0..S::MAX_NODES {
        let prev_elem = schedule.element(prev);
        match prev_elem.sw_next().get() {
            Some(next) if next == node => {
                let elem = schedule.element(node);
                prev_elem.set_hw_next(elem.hw_next());
                prev_elem.sw_next().set(elem.sw_next().get());
                elem.set_hw_next(schedule.link_word(head));
                elem.sw_next().set(Some(head));
                return true;
            }
            Some(next) if next == head => return false,
            Some(next) => prev = next,
            None => return false,
        }
    }
    panic!("list walk from {:?} overran", head);
}

/// Walks the nodes of one list, or one periodic bucket
///
/// Yields `head` first unless it's a dummy, then every node up to the end of
/// the list, the return to `head`, or the next periodic bucket head.
pub struct Walk<'a, S> {
    schedule: &'a S,
    head: Node,
    next: Option<Node>,
    remaining: usize,
}

pub fn walk<S: Schedule>(schedule: &S, head: Node) -> Walk<'_, S> {
    let next = if head.is_dummy() {
        schedule.element(head).sw_next().get()
    } else {
        Some(head)
    };
    Walk {
        schedule,
        head,
        next,
        remaining: S::MAX_NODES,
    }
}

impl<S: Schedule> Iterator for Walk<'_, S> {
    type Item = Node;
    fn next(&mut self) -> Option<Node> {
        let node = self.next?;
        if matches!(node, Node::Period(_)) {
            self.next = None;
            return None;
        }
        assert!(self.remaining > 0, "list walk from {:?} overran", self.head);
        self.remaining -= 1;
        let next = self.schedule.element(node).sw_next().get();
        self.next = next.filter(|next| *next != self.head);
        Some(node)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::vcell::VCell;

    pub struct Elem {
        hw: VCell<u32>,
        sw: SwLink,
    }

    impl Link for Elem {
        fn hw_next(&self) -> u32 {
            self.hw.read()
        }
        fn set_hw_next(&self, word: u32) {
            self.hw.write(word)
        }
        fn sw_next(&self) -> &SwLink {
            &self.sw
        }
    }

    /// Two periodic heads, a control sentinel, and four pipes
    pub struct Arena {
        period: [Elem; 2],
        control: Elem,
        pipes: [Elem; 4],
    }

    const fn elem() -> Elem {
        Elem {
            hw: VCell::new(1),
            sw: SwLink::new(),
        }
    }

    impl Arena {
        pub fn new() -> Self {
            Arena {
                period: [elem(), elem()],
                control: elem(),
                pipes: [elem(), elem(), elem(), elem()],
            }
        }
    }

    impl Schedule for Arena {
        type Element = Elem;
        const MAX_NODES: usize = 7;
        fn element(&self, node: Node) -> &Elem {
            match node {
                Node::Period(idx) => &self.period[idx as usize],
                Node::Control(_) | Node::BulkHead => &self.control,
                Node::Pipe { index, .. } => &self.pipes[index as usize],
            }
        }
        fn link_word(&self, node: Node) -> u32 {
            match node {
                Node::Period(idx) => 0x100 + idx as u32,
                Node::Control(_) | Node::BulkHead => 0x200,
                Node::Pipe { index, .. } => 0x300 + index as u32,
            }
        }
        fn terminate_word(&self) -> u32 {
            1
        }
    }

    fn pipe(index: u8) -> Node {
        Node::Pipe { dev_addr: 1, index }
    }

    fn collect<S: Schedule>(schedule: &S, head: Node) -> heapless::Vec<Node, 8> {
        walk(schedule, head).collect()
    }

    #[test]
    fn node_encoding() {
        for node in [
            Node::Period(3),
            Node::BulkHead,
            Node::Control(5),
            Node::Pipe { dev_addr: 5, index: 3 },
        ] {
            assert_eq!(Node::decode(Node::encode(Some(node))), Some(node));
        }
        assert_eq!(Node::decode(Node::encode(None)), None);
    }

    #[test]
    fn circular_insert_remove() {
        let arena = Arena::new();
        let head = Node::Control(0);
        link(&arena, head, Some(head));
        assert_eq!(collect(&arena, head).as_slice(), &[head]);

        insert(&arena, head, pipe(0));
        insert(&arena, head, pipe(1));
        assert_eq!(collect(&arena, head).as_slice(), &[head, pipe(1), pipe(0)]);
        assert_eq!(arena.control.hw_next(), 0x301);
        assert_eq!(arena.pipes[0].hw_next(), 0x200);

        assert!(remove(&arena, head, pipe(1)));
        assert_eq!(collect(&arena, head).as_slice(), &[head, pipe(0)]);
        assert_eq!(arena.control.hw_next(), 0x300);
        // Removed node points back at the head
        assert_eq!(arena.pipes[1].hw_next(), 0x200);
        assert_eq!(arena.pipes[1].sw_next().get(), Some(head));

        assert!(!remove(&arena, head, pipe(1)));
    }

    #[test]
    fn periodic_buckets() {
        let arena = Arena::new();
        // 2ms head -> 1ms head -> terminate
        link(&arena, Node::Period(0), None);
        link(&arena, Node::Period(1), Some(Node::Period(0)));

        insert(&arena, Node::Period(1), pipe(2));
        insert(&arena, Node::Period(0), pipe(3));

        assert_eq!(collect(&arena, Node::Period(1)).as_slice(), &[pipe(2)]);
        assert_eq!(collect(&arena, Node::Period(0)).as_slice(), &[pipe(3)]);

        assert!(remove(&arena, Node::Period(1), pipe(2)));
        assert!(collect(&arena, Node::Period(1)).is_empty());
        assert_eq!(arena.pipes[2].hw_next(), 0x101);
        assert_eq!(collect(&arena, Node::Period(0)).as_slice(), &[pipe(3)]);
    }

    #[test]
    #[should_panic]
    fn corrupt_list_is_fatal() {
        let arena = Arena::new();
        link(&arena, Node::Control(0), Some(pipe(0)));
        link(&arena, pipe(0), Some(pipe(1)));
        link(&arena, pipe(1), Some(pipe(0)));
        remove(&arena, Node::Control(0), pipe(3));
    }
}

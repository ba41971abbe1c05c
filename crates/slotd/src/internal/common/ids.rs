use crate::define_id_type;

define_id_type!(SlotId, u32);
define_id_type!(SlotTypeId, u32);

/// Index of a dynamic child within its parent, reused from the parent's
/// dispenser when a child is destroyed.
define_id_type!(ChildIndex, u32);

/// Handle correlating a spawned job executor with the claim that owns it.
define_id_type!(ExecutorHandle, u64);

/// Monotonically increasing id source with free-list reuse.
#[derive(Debug, Default)]
pub struct IdDispenser {
    next: u32,
    free: Vec<u32>,
}

impl IdDispenser {
    pub fn new(first: u32) -> Self {
        IdDispenser {
            next: first,
            free: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> u32 {
        if let Some(id) = self.free.pop() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn release(&mut self, id: u32) {
        self.free.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::IdDispenser;

    #[test]
    fn test_dispenser_reuses_released_ids() {
        let mut d = IdDispenser::new(1);
        assert_eq!(d.allocate(), 1);
        assert_eq!(d.allocate(), 2);
        d.release(1);
        assert_eq!(d.allocate(), 1);
        assert_eq!(d.allocate(), 3);
    }
}

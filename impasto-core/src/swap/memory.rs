use parking_lot::Mutex;

use super::{SwapBackend, SwapError, SwapSlot, CHECKSUM};

/// Swap that keeps compressed payloads in memory. Useful when compression alone is
/// enough of a saving, and for tests.
#[derive(Default)]
pub struct MemorySwap {
    slots: Mutex<MemorySlots>,
}
#[derive(Default)]
struct MemorySlots {
    buffers: Vec<Option<Box<[u8]>>>,
    free: Vec<usize>,
    in_use: u64,
}
impl SwapBackend for MemorySwap {
    fn store(&self, bytes: &[u8]) -> Result<SwapSlot, SwapError> {
        let len = u32::try_from(bytes.len()).map_err(|_| SwapError::TooLarge(bytes.len()))?;
        let mut slots = self.slots.lock();
        let buffer = Some(Box::<[u8]>::from(bytes));
        let index = if let Some(index) = slots.free.pop() {
            slots.buffers[index] = buffer;
            index
        } else {
            slots.buffers.push(buffer);
            slots.buffers.len() - 1
        };
        slots.in_use += u64::from(len);
        Ok(SwapSlot {
            offset: index as u64,
            len,
            capacity: len,
            checksum: CHECKSUM.checksum(bytes),
        })
    }
    fn load(&self, slot: &SwapSlot, out: &mut Vec<u8>) -> Result<(), SwapError> {
        {
            let slots = self.slots.lock();
            let buffer = slots
                .buffers
                .get(slot.offset as usize)
                .and_then(Option::as_ref)
                .ok_or(SwapError::Malformed("slot was released"))?;
            out.clear();
            out.extend_from_slice(buffer);
        }
        let read = CHECKSUM.checksum(out);
        if read != slot.checksum {
            return Err(SwapError::Checksum {
                stored: slot.checksum,
                read,
            });
        }
        Ok(())
    }
    fn release(&self, slot: &SwapSlot) {
        let mut slots = self.slots.lock();
        let index = slot.offset as usize;
        if let Some(buffer) = slots.buffers.get_mut(index) {
            if buffer.take().is_some() {
                slots.free.push(index);
                slots.in_use = slots.in_use.saturating_sub(u64::from(slot.len));
            }
        }
    }
    fn bytes_in_use(&self) -> u64 {
        self.slots.lock().in_use
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn reuses_released_slots() {
        let swap = MemorySwap::default();
        let a = swap.store(b"hello").unwrap();
        let b = swap.store(b"world").unwrap();
        swap.release(&a);
        let c = swap.store(b"again").unwrap();
        assert_eq!(c.offset, a.offset);
        let mut out = Vec::new();
        swap.load(&b, &mut out).unwrap();
        assert_eq!(out, b"world");
        assert_eq!(swap.bytes_in_use(), 10);
    }
    #[test]
    fn released_slot_errors() {
        let swap = MemorySwap::default();
        let a = swap.store(b"gone").unwrap();
        swap.release(&a);
        assert!(swap.load(&a, &mut Vec::new()).is_err());
    }
}

use crate::heap::heap::Heap;
use crate::heap::mm::Mm;
#[cfg(feature = "heaptrace")]
use crate::heap::{Caps, Flags, Zone};
use crate::shared::Coherent;
use crate::trace::trace_mem;
#[cfg(feature = "heaptrace")]
use crate::trace::trace_mem_error;

fn trace_heap(heap: &Heap) {
    trace_mem!(
        "heap: {:#x} size {} blocks {} caps {:#x}",
        heap.base(),
        heap.size(),
        heap.maps().len(),
        heap.caps().bits()
    );
    trace_mem!(" used {} free {}", heap.info().used, heap.info().free);
    for (index, map) in heap.maps().iter().enumerate() {
        trace_mem!(
            " block {} base {:#x} size {} count {} free {} first at {}",
            index,
            map.base(),
            map.block_size(),
            map.count(),
            map.free_count(),
            map.first_free()
        );
        map.commit();
    }
    heap.commit();
}

impl Mm {
    /// Logs the status of every buffer and runtime heap: region, caps,
    /// usage counters, and per-map occupancy.
    pub fn heap_trace(&self) {
        let mm = self.lock();
        trace_mem!("heap: buffer status");
        for heap in mm.buffer() {
            trace_heap(heap);
        }
        trace_mem!("heap: runtime status");
        for heap in mm.runtime() {
            trace_heap(heap);
        }
    }

    /// Like [`heap_trace`](Self::heap_trace), but only when the map has
    /// changed since the last dump, or when `force` is set.
    pub fn heap_trace_all(&self, force: bool) {
        let dump = {
            let mut mm = self.lock();
            let dirty = mm.trace_dirty();
            mm.set_trace_dirty(false);
            mm.commit();
            dirty || force
        };
        if dump {
            self.heap_trace();
        }
    }

    /// Reports a failed allocation and dumps every candidate heap that
    /// covers its capabilities.
    #[cfg(feature = "heaptrace")]
    pub(crate) fn trace_alloc_failure(&self, zone: Zone, flags: Flags, caps: Caps, bytes: usize) {
        trace_mem_error!(
            "failed to alloc {:#x} bytes zone {:?} caps {:#x} flags {:#x}",
            bytes,
            zone,
            caps.bits(),
            flags.bits()
        );
        let mm = self.lock();
        let heaps = match zone {
            Zone::Runtime => mm.runtime(),
            Zone::Buffer => mm.buffer(),
            _ => {
                trace_mem_error!("alloc trace: unsupported mem zone");
                return;
            }
        };
        let mut count = 0;
        for heap in heaps.iter().filter(|heap| heap.has_caps(caps)) {
            trace_heap(heap);
            count += 1;
        }
        if count == 0 {
            trace_mem_error!(
                "heap: none found for zone {:?} caps {:#x} bytes {:#x}",
                zone,
                caps.bits(),
                bytes
            );
        }
    }
}

//! A bitmap-based memory allocator over anonymous page mappings.
//!
//! The heap is carved into 16-byte blocks tracked by a dense bitmap, one
//! independent arena per logical CPU. `allocate` reserves a run of blocks in
//! the calling thread's arena (oversized requests go to the least loaded
//! one); `deallocate` finds the owning arena by address range and clears the
//! run. Memory is never returned to the operating system.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::{Cell, UnsafeCell},
  hint,
  mem::{align_of, size_of},
  ptr::{self, NonNull, null_mut},
  slice,
  sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

// =============================================================================
// Constants
// =============================================================================

/// Initial heap bytes per arena.
const HEAP_SIZE: usize = 1024 * 1024; // 1 MiB

/// Allocation granularity. Every allocation occupies a whole run of blocks.
const BLOCK_SIZE: usize = 16;

/// In-band word preceding each user pointer, holding the requested size.
const HEADER_SIZE: usize = size_of::<usize>();

/// Blocks tracked by one bitmap word.
const BLOCKS_PER_WORD: usize = u64::BITS as usize;

/// Runs at or below this many bytes scan with ctz on the complemented word.
const SMALL_ALLOCATION_THRESHOLD: usize = 4 * BLOCK_SIZE; // 64 bytes

/// Requests above this many bytes bypass the thread's arena and go to the
/// least loaded one. Runs at or past it also use the ctz scan tactic.
const LARGE_ALLOCATION_THRESHOLD: usize = 256 * BLOCK_SIZE; // 4096 bytes

/// Thread-local sentinel: no arena assigned yet.
const ARENA_UNASSIGNED: usize = usize::MAX;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(BLOCK_SIZE.is_power_of_two());
const _: () = assert!(HEAP_SIZE % BLOCK_SIZE == 0);
const _: () = assert!(HEAP_SIZE / BLOCK_SIZE / BLOCKS_PER_WORD > 0);
// Block boundaries must be valid header slots, or aligning the header would
// push the run past its reserved blocks.
const _: () = assert!(BLOCK_SIZE % HEADER_SIZE == 0);
const _: () = assert!(HEADER_SIZE >= align_of::<usize>());
const _: () = assert!(SMALL_ALLOCATION_THRESHOLD < LARGE_ALLOCATION_THRESHOLD);

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

fn page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size < 1 { 4096 } else { size as usize }
}

fn cpu_count() -> usize {
  let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
  if count < 1 { 1 } else { count as usize }
}

// =============================================================================
// Bitmap Allocator
// =============================================================================

/// One contiguous heap region and the bitmap tracking its blocks.
///
/// Bit 1 means the block belongs to a live allocation, bit 0 means free,
/// packed LSB-first into 64-bit words. Callers serialize access externally;
/// the owning arena's lock covers every method here, growth included.
struct BitmapAllocator {
  heap: *mut u8,
  bitmap: *mut u64,
  heap_size: usize,
  bitmap_words: usize,
}

impl BitmapAllocator {
  /// Map a fresh heap of `heap_size` bytes and its zeroed bitmap.
  fn new(heap_size: usize) -> Option<BitmapAllocator> {
    let heap = unsafe { os_mmap(heap_size) };
    if heap.is_null() {
      return None;
    }

    let bitmap_words = (heap_size / BLOCK_SIZE).div_ceil(BLOCKS_PER_WORD);
    let bitmap = unsafe { os_mmap(bitmap_words * size_of::<u64>()) } as *mut u64;
    if bitmap.is_null() {
      unsafe { os_munmap(heap, heap_size) };
      return None;
    }

    // Anonymous mappings start zeroed: every block begins free.
    Some(BitmapAllocator {
      heap,
      bitmap,
      heap_size,
      bitmap_words,
    })
  }

  #[inline]
  fn heap_blocks(&self) -> usize {
    self.heap_size / BLOCK_SIZE
  }

  #[inline]
  fn is_bit_set(&self, block: usize) -> bool {
    let word = unsafe { *self.bitmap.add(block / BLOCKS_PER_WORD) };
    word & (1u64 << (block % BLOCKS_PER_WORD)) != 0
  }

  #[inline]
  fn set_bit(&mut self, block: usize) {
    unsafe { *self.bitmap.add(block / BLOCKS_PER_WORD) |= 1u64 << (block % BLOCKS_PER_WORD) };
  }

  #[inline]
  fn clear_bit(&mut self, block: usize) {
    unsafe { *self.bitmap.add(block / BLOCKS_PER_WORD) &= !(1u64 << (block % BLOCKS_PER_WORD)) };
  }

  /// First block index at which `blocks_needed` consecutive free blocks
  /// start, or None.
  ///
  /// One candidate per bitmap word: the lowest zero bit. If the run starting
  /// there does not fit, the scan advances a whole word, so runs beginning
  /// later inside the same word are not considered. Runs may straddle word
  /// boundaries.
  fn find_free_run(&self, blocks_needed: usize) -> Option<usize> {
    let heap_blocks = self.heap_blocks();

    for word_index in 0..self.bitmap_words {
      let word = unsafe { *self.bitmap.add(word_index) };
      if word == u64::MAX {
        continue;
      }

      let start = word_index * BLOCKS_PER_WORD + first_free_bit(word, blocks_needed);
      let end = match start.checked_add(blocks_needed) {
        Some(end) => end,
        None => return None,
      };
      if end > heap_blocks {
        continue;
      }

      if (start..end).all(|block| !self.is_bit_set(block)) {
        return Some(start);
      }
    }

    None
  }

  /// Set every bit in the run. Precondition: the run is free.
  fn mark_used(&mut self, start_block: usize, blocks: usize) {
    for block in start_block..start_block + blocks {
      debug_assert!(!self.is_bit_set(block), "allocating an in-use block");
      self.set_bit(block);
    }
  }

  /// Clear every bit in the run. Precondition: the run is live.
  fn mark_free(&mut self, start_block: usize, blocks: usize) {
    for block in start_block..start_block + blocks {
      debug_assert!(self.is_bit_set(block), "freeing a free block");
      self.clear_bit(block);
    }
  }

  /// Grow the heap by at least `min_bytes`, rounded up to the page size.
  ///
  /// Full relocation: fresh heap and bitmap mappings, byte copies, old
  /// mappings unmapped. Block indices are preserved; old heap addresses are
  /// not. Returns the first byte of the new tail, or None if the OS refused
  /// a mapping (the allocator is left untouched in that case).
  fn extend(&mut self, min_bytes: usize) -> Option<NonNull<u8>> {
    let extension = min_bytes.checked_next_multiple_of(page_size())?;
    let new_heap_size = self.heap_size.checked_add(extension)?;
    let new_bitmap_words = (new_heap_size / BLOCK_SIZE).div_ceil(BLOCKS_PER_WORD);

    let new_heap = unsafe { os_mmap(new_heap_size) };
    if new_heap.is_null() {
      return None;
    }
    let new_bitmap = unsafe { os_mmap(new_bitmap_words * size_of::<u64>()) } as *mut u64;
    if new_bitmap.is_null() {
      unsafe { os_munmap(new_heap, new_heap_size) };
      return None;
    }

    unsafe {
      ptr::copy_nonoverlapping(self.heap, new_heap, self.heap_size);
      ptr::copy_nonoverlapping(self.bitmap, new_bitmap, self.bitmap_words);
      // The tail of the fresh bitmap mapping is already zero: new blocks
      // come up free.
      os_munmap(self.heap, self.heap_size);
      os_munmap(self.bitmap as *mut u8, self.bitmap_words * size_of::<u64>());
    }

    let old_heap_size = self.heap_size;
    self.heap = new_heap;
    self.bitmap = new_bitmap;
    self.heap_size = new_heap_size;
    self.bitmap_words = new_bitmap_words;

    NonNull::new(unsafe { new_heap.add(old_heap_size) })
  }
}

impl Drop for BitmapAllocator {
  fn drop(&mut self) {
    unsafe {
      os_munmap(self.heap, self.heap_size);
      os_munmap(self.bitmap as *mut u8, self.bitmap_words * size_of::<u64>());
    }
  }
}

/// Lowest zero bit of a not-all-ones bitmap word.
///
/// Short and page-plus runs take ctz of the complement; medium runs count
/// the word's trailing ones. Same candidate either way.
#[inline(always)]
fn first_free_bit(word: u64, blocks_needed: usize) -> usize {
  debug_assert!(word != u64::MAX);
  if blocks_needed <= SMALL_ALLOCATION_THRESHOLD / BLOCK_SIZE
    || blocks_needed >= LARGE_ALLOCATION_THRESHOLD / BLOCK_SIZE
  {
    (!word).trailing_zeros() as usize
  } else {
    word.trailing_ones() as usize
  }
}

// =============================================================================
// Spin Lock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// Arena
// =============================================================================

/// One independent allocator: a bitmap heap behind a lock, plus the advisory
/// block counter that steers oversized requests.
struct Arena {
  lock: SpinLock,
  allocator: UnsafeCell<BitmapAllocator>,
  /// Heap bounds, republished after growth so owner lookup and the load
  /// scan can read them without the lock.
  heap_base: AtomicPtr<u8>,
  heap_bytes: AtomicUsize,
  /// Blocks currently allocated. Advisory: placement only, never an
  /// invariant of the bitmap.
  allocated_blocks: AtomicUsize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  fn new() -> Option<Arena> {
    let allocator = BitmapAllocator::new(HEAP_SIZE)?;
    let heap_base = AtomicPtr::new(allocator.heap);
    let heap_bytes = AtomicUsize::new(allocator.heap_size);
    Some(Arena {
      lock: SpinLock::new(),
      allocator: UnsafeCell::new(allocator),
      heap_base,
      heap_bytes,
      allocated_blocks: AtomicUsize::new(0),
    })
  }

  /// Whether `addr` falls inside this arena's heap region.
  #[inline]
  fn contains(&self, addr: usize) -> bool {
    let base = self.heap_base.load(Ordering::Acquire) as usize;
    let len = self.heap_bytes.load(Ordering::Acquire);
    addr >= base && addr < base + len
  }

  #[inline]
  fn usage_bytes(&self) -> usize {
    self.allocated_blocks.load(Ordering::Relaxed) * BLOCK_SIZE
  }

  /// Reserve a run for `size` bytes plus the header, growing the heap once
  /// if no run fits. Returns the user pointer, just past the header word.
  fn try_allocate(&self, size: usize) -> *mut u8 {
    let total = match size.checked_add(HEADER_SIZE) {
      Some(total) => total,
      None => return null_mut(),
    };
    let blocks_needed = total.div_ceil(BLOCK_SIZE);

    self.lock.lock();
    let allocator = unsafe { &mut *self.allocator.get() };

    let mut start = allocator.find_free_run(blocks_needed);
    if start.is_none() {
      let want = match blocks_needed.checked_mul(BLOCK_SIZE) {
        Some(bytes) => bytes.max(allocator.heap_size / 4),
        None => {
          self.lock.unlock();
          return null_mut();
        }
      };
      if allocator.extend(want).is_some() {
        self.heap_base.store(allocator.heap, Ordering::Release);
        self.heap_bytes.store(allocator.heap_size, Ordering::Release);
        start = allocator.find_free_run(blocks_needed);
      }
    }

    let Some(start_block) = start else {
      self.lock.unlock();
      return null_mut();
    };

    allocator.mark_used(start_block, blocks_needed);
    let run_start = unsafe { allocator.heap.add(start_block * BLOCK_SIZE) };
    // Align the header slot to the word boundary. A no-op while BLOCK_SIZE
    // is a multiple of the word size, but user pointers must stay
    // word-aligned.
    let header = align_up(run_start as usize, align_of::<usize>()) as *mut usize;
    unsafe { header.write(size) };
    self.allocated_blocks.fetch_add(blocks_needed, Ordering::Relaxed);
    self.lock.unlock();

    unsafe { (header as *mut u8).add(HEADER_SIZE) }
  }

  /// Release the allocation behind `user_ptr` if it belongs to this arena.
  /// Out-of-range pointers and runs past the heap end are ignored.
  fn deallocate_pointer(&self, user_ptr: *mut u8) {
    self.lock.lock();
    let allocator = unsafe { &mut *self.allocator.get() };

    let header_addr = (user_ptr as usize).wrapping_sub(HEADER_SIZE);
    let base = allocator.heap as usize;
    if header_addr < base || header_addr >= base + allocator.heap_size {
      self.lock.unlock();
      return;
    }

    let size = unsafe { *(header_addr as *const usize) };
    let blocks = match size.checked_add(HEADER_SIZE) {
      Some(total) => total.div_ceil(BLOCK_SIZE),
      None => {
        self.lock.unlock();
        return;
      }
    };
    let start_block = (header_addr - base) / BLOCK_SIZE;
    let past_end = match start_block.checked_add(blocks) {
      Some(end) => end > allocator.heap_blocks(),
      None => true,
    };
    if past_end {
      self.lock.unlock();
      return;
    }

    allocator.mark_free(start_block, blocks);
    let live = self.allocated_blocks.load(Ordering::Relaxed);
    self
      .allocated_blocks
      .store(live.saturating_sub(blocks), Ordering::Relaxed);
    self.lock.unlock();
  }
}

// =============================================================================
// Global Arena Table
// =============================================================================

/// Arena table pointer. Written once under `BOOTSTRAP_LOCK`, read lock-free
/// ever after.
static ARENAS: AtomicPtr<Arena> = AtomicPtr::new(null_mut());

/// Arena count. Published before `ARENAS`.
static ARENA_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Guards initialization and the round-robin cursor. Never held while an
/// arena lock is taken.
static BOOTSTRAP_LOCK: SpinLock = SpinLock::new();

/// Round-robin cursor for first-time thread assignment. Mutated only under
/// `BOOTSTRAP_LOCK`.
static NEXT_ARENA_INDEX: AtomicUsize = AtomicUsize::new(0);

thread_local! {
  /// Index of the arena this thread allocates from.
  static THREAD_ARENA_INDEX: Cell<usize> = const { Cell::new(ARENA_UNASSIGNED) };
}

/// The process-wide arena table, one arena per online CPU, created on first
/// use. None if the OS refused a mapping; a later call starts over.
fn arena_table() -> Option<&'static [Arena]> {
  let table = ARENAS.load(Ordering::Acquire);
  if !table.is_null() {
    let len = ARENA_COUNT.load(Ordering::Relaxed);
    return Some(unsafe { slice::from_raw_parts(table, len) });
  }

  BOOTSTRAP_LOCK.lock();
  let table = ARENAS.load(Ordering::Acquire);
  if !table.is_null() {
    let len = ARENA_COUNT.load(Ordering::Relaxed);
    BOOTSTRAP_LOCK.unlock();
    return Some(unsafe { slice::from_raw_parts(table, len) });
  }

  // The table itself is mapped, not heap-allocated: initialization must not
  // recurse into the allocator being initialized.
  let len = cpu_count();
  let table = unsafe { os_mmap(len * size_of::<Arena>()) } as *mut Arena;
  if table.is_null() {
    BOOTSTRAP_LOCK.unlock();
    return None;
  }

  for index in 0..len {
    match Arena::new() {
      Some(arena) => unsafe { table.add(index).write(arena) },
      None => {
        // Tear down whatever was mapped before reporting failure.
        for built in 0..index {
          unsafe { ptr::drop_in_place(table.add(built)) };
        }
        unsafe { os_munmap(table as *mut u8, len * size_of::<Arena>()) };
        BOOTSTRAP_LOCK.unlock();
        return None;
      }
    }
  }

  ARENA_COUNT.store(len, Ordering::Relaxed);
  ARENAS.store(table, Ordering::Release);
  BOOTSTRAP_LOCK.unlock();
  Some(unsafe { slice::from_raw_parts(table, len) })
}

/// This thread's arena index, assigned round-robin on first use.
fn thread_arena_index(arena_count: usize) -> usize {
  THREAD_ARENA_INDEX.with(|slot| {
    let index = slot.get();
    if index != ARENA_UNASSIGNED {
      return index;
    }

    BOOTSTRAP_LOCK.lock();
    let index = NEXT_ARENA_INDEX.load(Ordering::Relaxed);
    NEXT_ARENA_INDEX.store((index + 1) % arena_count, Ordering::Relaxed);
    BOOTSTRAP_LOCK.unlock();

    slot.set(index);
    index
  })
}

/// Least-loaded arena that still has room for `size`; arena 0 when none
/// does. Ties keep the highest index.
fn least_loaded_arena(arenas: &[Arena], size: usize) -> usize {
  let mut best = 0;
  let mut best_usage = usize::MAX;

  for (index, arena) in arenas.iter().enumerate() {
    let usage = arena.usage_bytes();
    let capacity = arena.heap_bytes.load(Ordering::Acquire);
    if capacity.saturating_sub(usage) < size {
      continue;
    }
    if usage <= best_usage {
      best = index;
      best_usage = usage;
    }
  }

  best
}

// =============================================================================
// Public API
// =============================================================================

/// Allocate `size` writable bytes.
///
/// Returns a word-aligned pointer, or null when `size` is zero or the
/// operating system refuses to supply memory. The bytes are not zeroed.
pub fn allocate(size: usize) -> *mut u8 {
  if size == 0 {
    return null_mut();
  }
  let Some(arenas) = arena_table() else {
    return null_mut();
  };

  let assigned = thread_arena_index(arenas.len());
  let index = if size > LARGE_ALLOCATION_THRESHOLD {
    least_loaded_arena(arenas, size)
  } else {
    assigned
  };

  arenas[index].try_allocate(size)
}

/// Release an allocation previously returned by [`allocate`].
///
/// Null pointers and pointers owned by no arena are silent no-ops.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by [`allocate`] that has not
/// already been deallocated, and the memory it covers must no longer be
/// read or written after this call.
pub unsafe fn deallocate(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }

  let table = ARENAS.load(Ordering::Acquire);
  if table.is_null() {
    return; // nothing was ever allocated
  }
  let arenas = unsafe { slice::from_raw_parts(table, ARENA_COUNT.load(Ordering::Relaxed)) };

  for arena in arenas {
    if arena.contains(ptr as usize) {
      arena.deallocate_pointer(ptr);
      return;
    }
  }

  // Foreign pointer, ignored.
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Adapter for `#[global_allocator]` use.
///
/// Alignment is capped at the native word; stricter requests fail with null.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > align_of::<usize>() {
      return null_mut();
    }
    allocate(layout.size())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { deallocate(ptr) }
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
impl BitmapAllocator {
  fn live_blocks(&self) -> usize {
    (0..self.bitmap_words)
      .map(|word| unsafe { *self.bitmap.add(word) }.count_ones() as usize)
      .sum()
  }
}

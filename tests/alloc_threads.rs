use std::thread;

use bitmalloc::{allocate, deallocate};

const THREADS: usize = 16;
const ITERATIONS: usize = 10_000;

#[test]
fn concurrent_alloc_free_pairs() {
  let handles: Vec<_> = (0..THREADS)
    .map(|tid| {
      thread::spawn(move || {
        let size = (tid * 100) % 1000 + 1;
        for _ in 0..ITERATIONS {
          let ptr = allocate(size);
          assert!(!ptr.is_null());
          unsafe {
            ptr.write_bytes(tid as u8, size);
            assert_eq!(*ptr, tid as u8);
            assert_eq!(*ptr.add(size - 1), tid as u8);
            deallocate(ptr);
          }
        }
      })
    })
    .collect();

  for handle in handles {
    handle.join().unwrap();
  }
}

#[test]
fn concurrent_batches_do_not_corrupt_each_other() {
  let handles: Vec<_> = (0..8)
    .map(|tid: usize| {
      thread::spawn(move || {
        let fill = tid as u8 ^ 0xA5;
        for round in 0..50 {
          let mut held: Vec<(*mut u8, usize)> = Vec::new();
          for slot in 0..64 {
            let size = (tid * 37 + slot * 11 + round) % 777 + 1;
            let ptr = allocate(size);
            assert!(!ptr.is_null());
            unsafe { ptr.write_bytes(fill, size) };
            held.push((ptr, size));
          }
          for &(ptr, size) in &held {
            unsafe {
              assert_eq!(*ptr, fill);
              assert_eq!(*ptr.add(size - 1), fill);
              deallocate(ptr);
            }
          }
        }
      })
    })
    .collect();

  for handle in handles {
    handle.join().unwrap();
  }
}

//! Pointer-identity scenarios. Kept as a single test in its own binary so
//! nothing else churns this thread's arena between the free and the refill.

use bitmalloc::{allocate, deallocate};

#[test]
fn freed_memory_is_reused_first_fit() {
  // Immediate reuse hands back the same pointer.
  let first = allocate(100);
  assert!(!first.is_null());
  unsafe { deallocate(first) };
  let again = allocate(100);
  assert_eq!(first, again);
  unsafe { deallocate(again) };

  // A smaller request lands on the same run.
  let smaller = allocate(40);
  assert_eq!(first, smaller);
  unsafe { deallocate(smaller) };

  // An interior hole is found again.
  let head = allocate(100);
  let middle = allocate(200);
  let tail = allocate(300);
  assert!(!head.is_null() && !middle.is_null() && !tail.is_null());
  unsafe { deallocate(middle) };
  let refill = allocate(150);
  assert_eq!(middle, refill);

  unsafe {
    deallocate(head);
    deallocate(tail);
    deallocate(refill);
  }
}

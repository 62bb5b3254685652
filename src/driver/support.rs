use alloc::boxed::Box;

/// Allocates a zero-filled `T` straight on the heap, so page-sized tables
/// never pass through the stack.
///
/// `T` must be valid when all-zero.
pub(crate) fn zeroed_box<T>() -> Box<T> {
    // Safety: callers only use this for tables of plain integers.
    unsafe { Box::<T>::new_zeroed().assume_init() }
}

//! Lock word bit layout and pure state transitions.
//!
//! Each segment header carries one 64-bit lock word shared by every thread
//! and process mapping the file:
//!
//! ```text
//! bits  0..30   reader count
//! bit   30      update flag
//! bit   31      write flag
//! bits 32..64   registered waiter count
//! ```
//!
//! Read locks are compatible with each other and with one update lock.
//! The update lock is exclusive against other update locks and the write
//! lock. The write lock is exclusive against everything.
//!
//! All transitions here are pure functions from a word value to the next
//! word value; the CAS loops that apply them against shared memory live in
//! [`crate::shared`]. Fallible transitions return `None` when their
//! precondition does not hold in the observed word.

/// Mask of the reader count field.
pub const READER_MASK: u64 = (1 << 30) - 1;

/// Update lock flag.
pub const UPDATE_BIT: u64 = 1 << 30;

/// Write lock flag.
pub const WRITE_BIT: u64 = 1 << 31;

/// One registered waiter.
pub const WAIT_ONE: u64 = 1 << 32;

/// Number of read locks held.
pub const fn readers(word: u64) -> u64 {
    word & READER_MASK
}

/// True if the update lock is held.
pub const fn is_update_locked(word: u64) -> bool {
    word & UPDATE_BIT != 0
}

/// True if the write lock is held.
pub const fn is_write_locked(word: u64) -> bool {
    word & WRITE_BIT != 0
}

/// Number of registered waiters.
pub const fn waiters(word: u64) -> u64 {
    word >> 32
}

/// True if no lock is held at any level.
pub const fn is_unlocked(word: u64) -> bool {
    word & (READER_MASK | UPDATE_BIT | WRITE_BIT) == 0
}

/// Acquires a read lock: blocked only by a write holder.
pub fn try_read(word: u64) -> Option<u64> {
    if is_write_locked(word) || readers(word) == READER_MASK {
        return None;
    }
    Some(word + 1)
}

/// Acquires the update lock: blocked by a write or another update holder.
/// Compatible with readers.
pub fn try_update(word: u64) -> Option<u64> {
    if is_write_locked(word) || is_update_locked(word) {
        return None;
    }
    Some(word | UPDATE_BIT)
}

/// Acquires the write lock: requires no readers, no update, no write.
pub fn try_write(word: u64) -> Option<u64> {
    if readers(word) != 0 || is_update_locked(word) || is_write_locked(word) {
        return None;
    }
    Some(word | WRITE_BIT)
}

/// Upgrades a held update lock to write once the readers have drained.
pub fn try_upgrade_update_to_write(word: u64) -> Option<u64> {
    debug_assert!(is_update_locked(word));
    if readers(word) != 0 || is_write_locked(word) {
        return None;
    }
    Some((word & !UPDATE_BIT) | WRITE_BIT)
}

/// Downgrades a held write lock to update.
pub fn downgrade_write_to_update(word: u64) -> u64 {
    debug_assert!(is_write_locked(word));
    (word & !WRITE_BIT) | UPDATE_BIT
}

/// Downgrades a held update lock to a read lock.
pub fn downgrade_update_to_read(word: u64) -> u64 {
    debug_assert!(is_update_locked(word));
    (word & !UPDATE_BIT) + 1
}

/// Downgrades a held write lock to a read lock.
pub fn downgrade_write_to_read(word: u64) -> u64 {
    debug_assert!(is_write_locked(word));
    (word & !WRITE_BIT) + 1
}

/// Releases one read lock.
pub fn read_unlock(word: u64) -> u64 {
    debug_assert!(readers(word) > 0);
    word - 1
}

/// Releases the update lock.
pub fn update_unlock(word: u64) -> u64 {
    debug_assert!(is_update_locked(word));
    word & !UPDATE_BIT
}

/// Releases the write lock.
pub fn write_unlock(word: u64) -> u64 {
    debug_assert!(is_write_locked(word));
    word & !WRITE_BIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlocked_word() {
        assert!(is_unlocked(0));
        assert_eq!(readers(0), 0);
        assert!(!is_update_locked(0));
        assert!(!is_write_locked(0));
        assert_eq!(waiters(0), 0);
    }

    #[test]
    fn test_read_lock_counts() {
        let w1 = try_read(0).unwrap();
        assert_eq!(readers(w1), 1);
        let w2 = try_read(w1).unwrap();
        assert_eq!(readers(w2), 2);
        assert!(!is_unlocked(w2));
        assert_eq!(readers(read_unlock(w2)), 1);
        assert!(is_unlocked(read_unlock(w1)));
    }

    #[test]
    fn test_read_compatible_with_update() {
        let w = try_update(0).unwrap();
        let w = try_read(w).unwrap();
        assert_eq!(readers(w), 1);
        assert!(is_update_locked(w));
    }

    #[test]
    fn test_read_blocked_by_write() {
        let w = try_write(0).unwrap();
        assert!(try_read(w).is_none());
    }

    #[test]
    fn test_update_exclusive_with_update_and_write() {
        let w = try_update(0).unwrap();
        assert!(try_update(w).is_none());
        let w = try_write(0).unwrap();
        assert!(try_update(w).is_none());
    }

    #[test]
    fn test_write_excludes_everything() {
        assert!(try_write(try_read(0).unwrap()).is_none());
        assert!(try_write(try_update(0).unwrap()).is_none());
        assert!(try_write(try_write(0).unwrap()).is_none());
        assert!(is_write_locked(try_write(0).unwrap()));
    }

    #[test]
    fn test_upgrade_waits_for_readers() {
        let w = try_update(0).unwrap();
        let w_readers = try_read(w).unwrap();
        assert!(try_upgrade_update_to_write(w_readers).is_none());

        let upgraded = try_upgrade_update_to_write(w).unwrap();
        assert!(is_write_locked(upgraded));
        assert!(!is_update_locked(upgraded));
    }

    #[test]
    fn test_downgrades() {
        let w = try_write(0).unwrap();
        let w = downgrade_write_to_update(w);
        assert!(is_update_locked(w) && !is_write_locked(w));
        let w = downgrade_update_to_read(w);
        assert!(!is_update_locked(w));
        assert_eq!(readers(w), 1);

        let w = downgrade_write_to_read(try_write(0).unwrap());
        assert_eq!(readers(w), 1);
        assert!(is_unlocked(read_unlock(w)));
    }

    #[test]
    fn test_unlock_roundtrip() {
        assert!(is_unlocked(update_unlock(try_update(0).unwrap())));
        assert!(is_unlocked(write_unlock(try_write(0).unwrap())));
    }

    #[test]
    fn test_reader_overflow_refused() {
        let w = READER_MASK;
        assert!(try_read(w).is_none());
    }

    #[test]
    fn test_waiters_do_not_disturb_lock_state() {
        let w = try_update(0).unwrap() + WAIT_ONE + WAIT_ONE;
        assert_eq!(waiters(w), 2);
        assert!(is_update_locked(w));
        assert_eq!(readers(w), 0);
        let w = try_read(w).unwrap();
        assert_eq!(waiters(w), 2);
        assert_eq!(readers(w), 1);
    }
}

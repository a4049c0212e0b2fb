//! Tag allocation.
//!
//! The pool caps the number of requests in flight on one connection: once
//! every tag is checked out, [`TagPool::acquire`] waits until one is released
//! and [`TagPool::try_acquire`] fails with [`Error::PoolExhausted`].

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::error;
use tokio::sync::Semaphore;

use crate::{error::Error, fcall::NOTAG, utils::Result};

#[derive(Debug)]
struct Tags {
    free: VecDeque<u16>,
    checked_out: HashSet<u16>,
}

#[derive(Debug)]
pub struct TagPool {
    available: Semaphore,
    tags: Mutex<Tags>,
}

impl TagPool {
    /// Pool handing out tags `0..capacity`.
    ///
    /// `capacity` is clamped so that `NOTAG` is never handed out.
    pub fn new(capacity: u16) -> TagPool {
        let capacity = capacity.min(NOTAG);
        TagPool {
            available: Semaphore::new(capacity as usize),
            tags: Mutex::new(Tags {
                free: (0..capacity).collect(),
                checked_out: HashSet::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        let tags = self.lock();
        tags.free.len() + tags.checked_out.len()
    }

    /// Number of tags currently checked out
    pub fn in_use(&self) -> usize {
        self.lock().checked_out.len()
    }

    /// Wait for a free tag
    pub async fn acquire(self: &Arc<Self>) -> Result<TagGuard> {
        let permit = self.available.acquire().await.map_err(|_| Error::Closed)?;
        permit.forget();
        self.checkout()
    }

    /// Take a free tag without waiting
    pub fn try_acquire(self: &Arc<Self>) -> Result<TagGuard> {
        let permit = self
            .available
            .try_acquire()
            .map_err(|_| Error::PoolExhausted)?;
        permit.forget();
        self.checkout()
    }

    /// Return `tag` to the free set
    pub fn release(&self, tag: u16) -> Result<()> {
        let mut tags = self.lock();
        if !tags.checked_out.remove(&tag) {
            error!("release of tag {} which is not checked out", tag);
            return Err(Error::TagNotOutstanding(tag));
        }
        tags.free.push_back(tag);
        drop(tags);

        self.available.add_permits(1);
        Ok(())
    }

    // Caller must hold a forgotten permit
    fn checkout(self: &Arc<Self>) -> Result<TagGuard> {
        let mut tags = self.lock();
        let Some(tag) = tags.free.pop_front() else {
            error!("tag permit granted with an empty free set");
            return Err(Error::PoolExhausted);
        };
        tags.checked_out.insert(tag);
        Ok(TagGuard {
            pool: self.clone(),
            tag,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tags> {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A checked out tag, released back to its pool when dropped
#[derive(Debug)]
pub struct TagGuard {
    pool: Arc<TagPool>,
    tag: u16,
}

impl TagGuard {
    pub fn get(&self) -> u16 {
        self.tag
    }
}

impl Drop for TagGuard {
    fn drop(&mut self) {
        // Cannot fail: the guard is the only owner of its tag
        let _ = self.pool.release(self.tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tags_are_unique_while_checked_out() {
        let pool = Arc::new(TagPool::new(8));
        let guards: Vec<_> = (0..8).map(|_| pool.try_acquire().unwrap()).collect();
        let tags: HashSet<u16> = guards.iter().map(TagGuard::get).collect();

        assert_eq!(tags.len(), 8);
        assert_eq!(pool.in_use(), 8);
        assert!(matches!(pool.try_acquire(), Err(Error::PoolExhausted)));
    }

    #[test]
    fn released_tags_are_reused() {
        let pool = Arc::new(TagPool::new(2));
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        let tag = a.get();
        drop(a);

        let c = pool.try_acquire().unwrap();
        assert_eq!(c.get(), tag);
        assert_ne!(c.get(), b.get());
    }

    #[test]
    fn release_of_free_tag_is_rejected() {
        let pool = Arc::new(TagPool::new(4));
        assert!(matches!(pool.release(3), Err(Error::TagNotOutstanding(3))));

        let guard = pool.try_acquire().unwrap();
        let tag = guard.get();
        drop(guard);
        assert!(matches!(pool.release(tag), Err(Error::TagNotOutstanding(_))));
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn notag_is_never_issued() {
        let pool = Arc::new(TagPool::new(u16::MAX));
        assert_eq!(pool.capacity(), NOTAG as usize);

        let guards: Vec<_> = (0..pool.capacity())
            .map(|_| pool.try_acquire().unwrap())
            .collect();
        assert!(guards.iter().all(|g| g.get() != NOTAG));
        assert!(pool.try_acquire().is_err());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let pool = Arc::new(TagPool::new(1));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|g| g.get()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let tag = held.get();
        drop(held);
        let reacquired = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reacquired, tag);
    }
}

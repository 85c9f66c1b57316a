use anyhow::{Result, Context};
use std::{
    collections::VecDeque,
    os::unix::io::RawFd,
};
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait,
    EpollCreateFlags, EpollEvent, EpollOp,
};
use slab::Slab;

pub use nix::sys::epoll::EpollFlags;

/// A small epoll wrapper that owns the objects being polled.  Each added
/// object gets a slab key; poll() hands back one ready object at a time.
pub struct Poller<T> {
    epoll_fd: RawFd,
    slots: Slab<(RawFd, T)>,
    ready: VecDeque<usize>,
}

impl<T> Poller<T> {
    pub fn new() -> Result<Self> {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .context("Failed to create an epoll instance")?;

        Ok(Self {
            epoll_fd,
            slots: Slab::new(),
            ready: VecDeque::new(),
        })
    }

    pub fn add(&mut self, fd: RawFd, obj: T, flags: EpollFlags) -> Result<usize> {
        let key = self.slots.insert((fd, obj));

        let mut event = EpollEvent::new(flags, key as u64);
        epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, fd, &mut event)
            .context("Failed to add fd to epoll")?;

        Ok(key)
    }

    pub fn remove(&mut self, key: usize) -> Result<T> {
        let (fd, obj) = self.slots.remove(key);

        epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, fd,
                  Option::<&mut EpollEvent>::None)
            .context("Failed to remove fd from epoll")?;

        Ok(obj)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        self.slots.get_mut(key).map(|(_, obj)| obj)
    }

    /// Returns one ready object, waiting up to `timeout_ms` (-1 blocks).
    /// None means the timeout expired with nothing ready.
    pub fn poll(&mut self, capacity: usize, timeout_ms: isize)
        -> Result<Option<(usize, &mut T)>>
    {
        let key = loop {
            if let Some(key) = self.ready.pop_front() {
                if self.slots.contains(key) {
                    break key;
                }
                // The slot was removed while queued; skip it.
                continue;
            }

            let mut events = vec![EpollEvent::empty(); capacity];

            let n = match epoll_wait(self.epoll_fd, &mut events, timeout_ms) {
                Ok(n) => n,
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(e) => return Err(e).context("epoll_wait failed"),
            };

            if n == 0 {
                return Ok(None);
            }

            for event in &events[..n] {
                self.ready.push_back(event.data() as usize);
            }
        };

        let (_, obj) = self.slots.get_mut(key).unwrap();
        Ok(Some((key, obj)))
    }
}

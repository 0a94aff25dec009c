//! Report file descriptor readiness with `poll(2)`.

use crate::{Action, Error, Event, EventCallback, Metrics, Pending};
use std::{
    collections::HashMap,
    io,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, error, trace};

/// The readiness a registration waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PollType {
    Readable,
    Writable,
}

struct Registration {
    id: u64,
    pending: Pending<Event>,
}

struct State {
    registrations: HashMap<(RawFd, PollType), Registration>,
    stopping: bool,
}

struct Inner {
    name: String,
    metrics: Metrics,
    state: Mutex<State>,
    next_id: AtomicU64,
    wake_read: RawFd,
    wake_write: RawFd,
}

impl Inner {
    /// Interrupt a blocked `poll(2)` so that it picks up new registrations.
    fn wake(&self) {
        let byte = [0u8; 1];
        // A full pipe already guarantees a wakeup
        // SAFETY: `byte` is valid for one byte and the fd stays open until `Inner` drops.
        let _ = unsafe { libc::write(self.wake_write, byte.as_ptr().cast(), 1) };
    }

    fn drain_wake(&self) {
        let mut scratch = [0u8; 64];
        loop {
            // SAFETY: `scratch` is writable for its full length and the fd is open.
            let n =
                unsafe { libc::read(self.wake_read, scratch.as_mut_ptr().cast(), scratch.len()) };
            if n <= 0 {
                return;
            }
        }
    }

    fn run(&self) {
        debug!(name = self.name, "poll thread started");
        loop {
            let mut fds = vec![libc::pollfd {
                fd: self.wake_read,
                events: libc::POLLIN,
                revents: 0,
            }];
            let mut keys = Vec::new();
            {
                let state = self.state.lock().unwrap();
                if state.stopping {
                    break;
                }
                for (fd, kind) in state.registrations.keys() {
                    let events = match kind {
                        PollType::Readable => libc::POLLIN,
                        PollType::Writable => libc::POLLOUT,
                    };
                    fds.push(libc::pollfd {
                        fd: *fd,
                        events,
                        revents: 0,
                    });
                    keys.push((*fd, *kind));
                }
            }

            // SAFETY: `fds` is a live, exclusively borrowed array of `fds.len()` entries.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    error!(?err, "poll failed");
                }
                continue;
            }
            if fds[0].revents != 0 {
                self.drain_wake();
            }

            let mut fired = Vec::new();
            {
                let mut state = self.state.lock().unwrap();
                for (pollfd, key) in fds[1..].iter().zip(keys) {
                    if pollfd.revents == 0 {
                        continue;
                    }
                    let Some(registration) = state.registrations.remove(&key) else {
                        continue;
                    };
                    fired.push((registration, readiness(key.1, pollfd.revents)));
                }
            }
            for (registration, event) in fired {
                trace!(id = registration.id, ?event, "readiness");
                let _ = registration.pending.fire(event);
            }
        }
        debug!(name = self.name, "poll thread exited");
    }
}

/// Translate `revents` into the outcome of a registration of type `kind`.
fn readiness(kind: PollType, revents: libc::c_short) -> Event {
    if revents & libc::POLLNVAL != 0 {
        return Event::error(Error::Os(libc::EBADF));
    }
    match kind {
        PollType::Readable => {
            if revents & libc::POLLIN != 0 {
                Event::done()
            } else {
                Event::eos()
            }
        }
        PollType::Writable => {
            if revents & libc::POLLERR != 0 {
                Event::error(Error::Os(libc::EIO))
            } else if revents & libc::POLLHUP != 0 {
                Event::error(Error::Closed)
            } else {
                Event::done()
            }
        }
    }
}

/// Set `O_NONBLOCK` and `FD_CLOEXEC` on `fd`.
fn configure(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl only reads and sets flags on a descriptor owned by the caller.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// A thread that reports file descriptor readiness.
///
/// Registrations are one-shot and keyed by `(fd, PollType)`: once readiness is reported the
/// registration is gone, and the owner registers again when it wants to hear more. A reader
/// whose peer hung up (or whose descriptor is in error) without pending data is told
/// [Event::Eos]. A writer in the same situation is told [Event::Error].
///
/// The thread blocks in `poll(2)` without a timeout and is woken through a self-pipe
/// whenever registrations change or the thread is stopped.
pub struct EventPoll {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventPoll {
    pub fn new(name: impl Into<String>, metrics: Metrics) -> Result<Self, Error> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: `fds` has room for the two descriptors pipe writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: only called on the descriptors just created, before anything else owns them.
        let close = |fds: &[RawFd; 2]| unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        };
        if let Err(err) = configure(fds[0]).and_then(|_| configure(fds[1])) {
            close(&fds);
            return Err(err.into());
        }
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                metrics,
                state: Mutex::new(State {
                    registrations: HashMap::new(),
                    stopping: false,
                }),
                next_id: AtomicU64::new(0),
                wake_read: fds[0],
                wake_write: fds[1],
            }),
            handle: Mutex::new(None),
        })
    }

    /// Fire `callback` once `fd` is ready for `kind`.
    ///
    /// Cancelling the returned [Action] removes the registration (or, if readiness was
    /// already reported, cancels the scheduled callback).
    ///
    /// # Panics
    ///
    /// Panics if `(fd, kind)` is already registered.
    pub fn poll(&self, kind: PollType, fd: RawFd, callback: EventCallback) -> Action {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (pending, requester) = Pending::new(callback);
        let duplicate = {
            let mut state = self.inner.state.lock().unwrap();
            let duplicate = state.registrations.contains_key(&(fd, kind));
            if !duplicate {
                state
                    .registrations
                    .insert((fd, kind), Registration { id, pending });
            }
            duplicate
        };
        assert!(
            !duplicate,
            "duplicate poll registration: fd={} kind={:?}",
            fd,
            kind
        );
        self.inner.metrics.polls.inc();
        self.inner.wake();

        let inner = Arc::downgrade(&self.inner);
        Action::new(move || {
            requester.cancel();
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let removed = {
                let mut state = inner.state.lock().unwrap();
                match state.registrations.get(&(fd, kind)) {
                    Some(registration) if registration.id == id => {
                        state.registrations.remove(&(fd, kind))
                    }
                    _ => None,
                }
            };
            if removed.is_some() {
                inner.wake();
            }
        })
    }

    /// Returns the number of registrations waiting for readiness.
    pub fn registrations(&self) -> usize {
        self.inner.state.lock().unwrap().registrations.len()
    }

    /// Spawn the thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread was already started.
    pub fn start(&self) -> Result<(), Error> {
        let mut handle = self.handle.lock().unwrap();
        assert!(handle.is_none(), "poll thread already started");
        let inner = self.inner.clone();
        *handle = Some(
            thread::Builder::new()
                .name(self.inner.name.clone())
                .spawn(move || inner.run())?,
        );
        Ok(())
    }

    /// Ask the thread to exit. Registrations still waiting are dropped.
    pub fn stop(&self) {
        let registrations = {
            let mut state = self.inner.state.lock().unwrap();
            state.stopping = true;
            std::mem::take(&mut state.registrations)
        };
        drop(registrations);
        self.inner.wake();
    }

    pub fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // SAFETY: `Inner` owns both ends of the wake pipe and nothing uses them after this.
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

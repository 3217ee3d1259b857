//! Main-thread task dispatch.
//!
//! Several ABI calls must run on a designated main thread distinct from the
//! audio thread (connection-point crosslinking, component activation, state
//! loads). `run_task_on_main_thread` is the single synchronous barrier: it
//! blocks the caller until the task completed on the pumping thread. It must
//! never be called from the audio thread.
//!
//! When no main thread has been installed (unit tests, offline tools) tasks
//! run inline on the caller's thread, which keeps everything synchronous.

use std::sync::OnceLock;
use std::thread::ThreadId;

use crossbeam_channel::{unbounded, Receiver, Sender};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct MainThreadQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    main_thread: ThreadId,
}

static QUEUE: OnceLock<MainThreadQueue> = OnceLock::new();

/// Register the calling thread as the host main thread. Call once at
/// startup, before any plugin is instantiated. Subsequent calls are ignored.
pub fn install_main_thread() {
    let (tx, rx) = unbounded();
    let _ = QUEUE.set(MainThreadQueue {
        tx,
        rx,
        main_thread: std::thread::current().id(),
    });
}

/// Whether the calling thread is the installed main thread. True when no
/// main thread was installed, so single-threaded embeddings stay inline.
pub fn is_main_thread() -> bool {
    match QUEUE.get() {
        Some(queue) => queue.main_thread == std::thread::current().id(),
        None => true,
    }
}

/// Run `task` on the main thread, blocking until it completed. Runs inline
/// when already on the main thread (or when none is installed). Because the
/// caller blocks for the task's full duration, the closure may borrow from
/// the caller's stack.
pub fn run_task_on_main_thread<F: FnOnce() + Send>(task: F) {
    let queue = match QUEUE.get() {
        Some(queue) if queue.main_thread != std::thread::current().id() => queue,
        _ => {
            task();
            return;
        }
    };

    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
    let signalling: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
        task();
        let _ = done_tx.send(());
    });
    // Safety: the queue requires 'static tasks, but we block on done_rx until
    // the closure has finished running, so everything it borrows outlives it.
    let boxed: Task = unsafe { std::mem::transmute(signalling) };
    if queue.tx.send(boxed).is_ok() {
        let _ = done_rx.recv();
    }
}

/// Queue `task` for the main thread without waiting for it. Used by plugin
/// callbacks that must not block (e.g. a CLAP `request_callback`). Runs
/// inline when no main thread is installed.
pub fn post_task_on_main_thread(task: impl FnOnce() + Send + 'static) {
    match QUEUE.get() {
        Some(queue) => {
            let _ = queue.tx.send(Box::new(task));
        }
        None => task(),
    }
}

/// Drain and run all queued main-thread tasks. The embedding calls this from
/// its main loop.
pub fn pump_main_thread_tasks() {
    if let Some(queue) = QUEUE.get() {
        while let Ok(task) = queue.rx.try_recv() {
            task();
        }
    }
}

/// Wrapper asserting that the wrapped value is only touched per the host's
/// threading contract (constructed, used and dropped under main-thread or
/// engine-lock discipline). Used for ABI object pointers that the bindings
/// do not mark thread-transferable themselves.
pub struct MainThreadSafe<T>(pub T);

unsafe impl<T> Send for MainThreadSafe<T> {}
unsafe impl<T> Sync for MainThreadSafe<T> {}

impl<T> std::ops::Deref for MainThreadSafe<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> std::ops::DerefMut for MainThreadSafe<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_execution_without_installed_thread() {
        let mut ran = false;
        run_task_on_main_thread(|| ran = true);
        assert!(ran);
        assert!(is_main_thread());
    }

    #[test]
    fn test_tasks_can_return_data_through_borrows() {
        let mut result = 0u32;
        run_task_on_main_thread(|| result = 42);
        assert_eq!(result, 42);
    }
}

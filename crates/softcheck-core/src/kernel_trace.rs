// Kernel trace — observe fused kernel launches on the current thread
//
// Backends call `record` at the top of each fused kernel entry point. While a
// `trace_kernel_calls` scope is open on the thread, every launch is counted
// in that scope (and in any enclosing scope). Outside a scope `record` only
// logs.
//
//   let (y, calls) = trace_kernel_calls(|| x.softmax(0));
//   assert_eq!(calls.softmax_forward, 1);

use std::cell::RefCell;

/// The fused kernel entry points that can be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    SoftmaxForward,
    SoftmaxBackward,
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::SoftmaxForward => "softmax_forward",
            Kernel::SoftmaxBackward => "softmax_backward",
        }
    }
}

/// Number of launches per kernel entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelCalls {
    pub softmax_forward: usize,
    pub softmax_backward: usize,
}

impl KernelCalls {
    pub fn get(&self, kernel: Kernel) -> usize {
        match kernel {
            Kernel::SoftmaxForward => self.softmax_forward,
            Kernel::SoftmaxBackward => self.softmax_backward,
        }
    }

    pub fn called(&self, kernel: Kernel) -> bool {
        self.get(kernel) > 0
    }

    pub fn total(&self) -> usize {
        self.softmax_forward + self.softmax_backward
    }

    fn bump(&mut self, kernel: Kernel) {
        match kernel {
            Kernel::SoftmaxForward => self.softmax_forward += 1,
            Kernel::SoftmaxBackward => self.softmax_backward += 1,
        }
    }
}

thread_local! {
    static FRAMES: RefCell<Vec<KernelCalls>> = const { RefCell::new(Vec::new()) };
}

/// Record one launch of `kernel` on this thread.
pub fn record(kernel: Kernel) {
    log::trace!("kernel launch: {}", kernel.name());
    FRAMES.with(|frames| {
        for frame in frames.borrow_mut().iter_mut() {
            frame.bump(kernel);
        }
    });
}

struct Frame {
    depth: usize,
}

impl Drop for Frame {
    fn drop(&mut self) {
        FRAMES.with(|frames| frames.borrow_mut().truncate(self.depth));
    }
}

/// Run `f` and return its result together with the fused kernel launches it
/// made on this thread.
pub fn trace_kernel_calls<F, T>(f: F) -> (T, KernelCalls)
where
    F: FnOnce() -> T,
{
    let depth = FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        frames.push(KernelCalls::default());
        frames.len() - 1
    });
    let frame = Frame { depth };
    let out = f();
    let calls = FRAMES.with(|frames| frames.borrow()[frame.depth]);
    drop(frame);
    (out, calls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_inside_scope_only() {
        record(Kernel::SoftmaxForward);
        let ((), calls) = trace_kernel_calls(|| {
            record(Kernel::SoftmaxForward);
            record(Kernel::SoftmaxBackward);
            record(Kernel::SoftmaxBackward);
        });
        assert_eq!(calls.softmax_forward, 1);
        assert_eq!(calls.softmax_backward, 2);
        assert_eq!(calls.total(), 3);
    }

    #[test]
    fn test_nested_scopes() {
        let (inner, outer) = trace_kernel_calls(|| {
            record(Kernel::SoftmaxForward);
            let ((), inner) = trace_kernel_calls(|| record(Kernel::SoftmaxBackward));
            inner
        });
        assert!(!inner.called(Kernel::SoftmaxForward));
        assert!(inner.called(Kernel::SoftmaxBackward));
        assert_eq!(outer.get(Kernel::SoftmaxForward), 1);
        assert_eq!(outer.get(Kernel::SoftmaxBackward), 1);
    }

    #[test]
    fn test_other_threads_not_counted() {
        let ((), calls) = trace_kernel_calls(|| {
            std::thread::spawn(|| record(Kernel::SoftmaxForward))
                .join()
                .unwrap();
        });
        assert_eq!(calls, KernelCalls::default());
    }
}

//! Pass timing.
//!
//! Each stage of the output pipeline holds a [`PassToken`] while it runs. Time is charged to
//! the innermost running pass, so a pass nested in another is not counted twice. The current
//! thread keeps a running [`PassTimes`] table: [`crate::Context::compile`] reports the share
//! of one function in [`crate::OutputStats::times`], and [`take_current`] hands out the table
//! and resets it.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::mem;
use std::time::{Duration, Instant};

// Each pass is declared with a snake_case name and a description. The macro defines the
// `Pass` enum and one starter function per pass.
macro_rules! define_passes {
    ($($pass:ident: $desc:expr,)+) => {
        /// A stage of the output pipeline.
        #[allow(non_camel_case_types, reason = "pass names match their starter functions")]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Pass {
            $(#[doc=$desc] $pass,)+
        }

        /// The number of timed passes.
        pub const NUM_PASSES: usize = [$(stringify!($pass)),+].len();

        impl Pass {
            /// Every pass, in declaration order.
            pub const ALL: [Pass; NUM_PASSES] = [$(Pass::$pass),+];

            /// Description of the pass.
            pub fn description(self) -> &'static str {
                match self {
                    $(Pass::$pass => $desc,)+
                }
            }
        }

        $(
            #[doc=$desc]
            pub fn $pass() -> PassToken {
                PassToken::start(Pass::$pass)
            }
        )+
    }
}

define_passes! {
    output: "Machine code output",
    constants: "Constant table layout",
    shorten_branches: "Branch shortening",
    reserve_buffer: "Code buffer reservation",
    schedule: "List scheduling",
    anti_dependences: "Register anti-dependences",
    verify_schedule: "Schedule verification",
    emit: "Code emission",
    exception_tables: "Exception and null check tables",
    finish: "Code buffer finalization",
}

impl Pass {
    fn idx(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Time spent in each pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassTimes {
    total: [Duration; NUM_PASSES],
    nested: [Duration; NUM_PASSES],
}

impl PassTimes {
    /// Time spent in `pass`, nested passes included.
    pub fn total(&self, pass: Pass) -> Duration {
        self.total[pass.idx()]
    }

    /// Time spent in `pass` itself.
    pub fn self_time(&self, pass: Pass) -> Duration {
        self.total[pass.idx()].saturating_sub(self.nested[pass.idx()])
    }

    /// Time spent in all passes.
    pub fn sum(&self) -> Duration {
        Pass::ALL.iter().map(|&p| self.self_time(p)).sum()
    }

    /// Add the times of `other`.
    pub fn add(&mut self, other: &Self) {
        for i in 0..NUM_PASSES {
            self.total[i] += other.total[i];
            self.nested[i] += other.nested[i];
        }
    }

    /// The times accumulated since `earlier` was taken.
    pub fn since(&self, earlier: &Self) -> Self {
        let mut delta = *self;
        for i in 0..NUM_PASSES {
            delta.total[i] = delta.total[i].saturating_sub(earlier.total[i]);
            delta.nested[i] = delta.nested[i].saturating_sub(earlier.nested[i]);
        }
        delta
    }

    /// The passes that ran, with their total time.
    pub fn iter(&self) -> impl Iterator<Item = (Pass, Duration)> + '_ {
        Pass::ALL
            .iter()
            .map(|&p| (p, self.total(p)))
            .filter(|&(_, d)| d > Duration::ZERO)
    }
}

impl fmt::Display for PassTimes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{:<34} {:>12} {:>12}", "pass", "total", "self")?;
        for (pass, total) in self.iter() {
            let own = self.self_time(pass);
            writeln!(f, "{:<34} {total:>12.3?} {own:>12.3?}", pass.description())?;
        }
        writeln!(f, "{:<34} {:>12.3?}", "all passes", self.sum())
    }
}

thread_local! {
    static CURRENT_PASS: Cell<Option<Pass>> = const { Cell::new(None) };
    static PASS_TIMES: RefCell<PassTimes> = RefCell::new(PassTimes::default());
}

/// A running pass. The pass ends when the token is dropped.
///
/// Tokens must be dropped in the reverse order of their creation.
#[must_use]
pub struct PassToken {
    pass: Pass,
    outer: Option<Pass>,
    start: Instant,
}

impl PassToken {
    fn start(pass: Pass) -> Self {
        let outer = CURRENT_PASS.with(|p| p.replace(Some(pass)));
        trace!("timing: starting {pass}");
        Self {
            pass,
            outer,
            start: Instant::now(),
        }
    }
}

impl Drop for PassToken {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        trace!("timing: {} took {elapsed:?}", self.pass);
        let current = CURRENT_PASS.with(|p| p.replace(self.outer));
        debug_assert_eq!(current, Some(self.pass), "pass tokens dropped out of order");
        PASS_TIMES.with(|t| {
            let mut times = t.borrow_mut();
            times.total[self.pass.idx()] += elapsed;
            if let Some(outer) = self.outer {
                times.nested[outer.idx()] += elapsed;
            }
        });
    }
}

/// The pass times accumulated by the current thread.
pub fn current() -> PassTimes {
    PASS_TIMES.with(|t| *t.borrow())
}

/// Take the pass times accumulated by the current thread and reset them.
pub fn take_current() -> PassTimes {
    PASS_TIMES.with(|t| mem::take(&mut *t.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions() {
        assert_eq!(Pass::shorten_branches.to_string(), "Branch shortening");
        assert_eq!(Pass::ALL.len(), NUM_PASSES);
        assert_eq!(Pass::ALL[Pass::emit.idx()], Pass::emit);
    }

    #[test]
    fn nested_passes_are_not_counted_twice() {
        let _ = take_current();
        {
            let _outer = output();
            std::thread::sleep(Duration::from_millis(1));
            let _inner = schedule();
            std::thread::sleep(Duration::from_millis(2));
        }
        let times = take_current();
        assert!(times.total(Pass::output) >= times.total(Pass::schedule));
        assert!(times.self_time(Pass::schedule) >= Duration::from_millis(2));
        assert_eq!(
            times.self_time(Pass::output) + times.self_time(Pass::schedule),
            times.sum()
        );
        assert_eq!(times.iter().count(), 2);
        assert!(times.to_string().contains("List scheduling"));
        assert_eq!(take_current(), PassTimes::default());
    }

    #[test]
    fn times_since_a_snapshot() {
        let _ = take_current();
        drop(emit());
        let before = current();
        {
            let _tt = finish();
            std::thread::sleep(Duration::from_millis(1));
        }
        let delta = current().since(&before);
        assert_eq!(delta.total(Pass::emit), Duration::ZERO);
        assert!(delta.total(Pass::finish) >= Duration::from_millis(1));

        let mut sum = before;
        sum.add(&delta);
        assert_eq!(sum, take_current());
    }
}

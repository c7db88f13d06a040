//! Step and wall-clock budget for one run.
//!
//! The budget is a C-level trace function installed on the running thread.
//! It counts call and line events and raises [`BudgetExhausted`] once the
//! step cap or the deadline is passed. Unlike a `sys.settrace` hook it stays
//! installed after raising, so every further line raises again and handlers
//! in user code cannot resume the loop.

use std::cell::Cell;
use std::os::raw::c_int;
use std::ptr;
use std::time::{Duration, Instant};

use pyo3::exceptions::PyBaseException;
use pyo3::ffi;
use pyo3::prelude::*;

pyo3::create_exception!(
    taskmill_sandbox,
    BudgetExhausted,
    PyBaseException,
    "Raised inside sandboxed code when its step or time budget runs out."
);

const TRACE_CALL: c_int = 0;
const TRACE_LINE: c_int = 2;

/// Line events between two reads of the clock. Call events always read it.
const CLOCK_EVERY: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trip {
    Steps,
    Deadline,
}

#[derive(Clone, Copy)]
struct State {
    steps: u64,
    max_steps: u64,
    deadline: Option<Instant>,
    tripped: Option<Trip>,
}

thread_local! {
    static STATE: Cell<Option<State>> = const { Cell::new(None) };
}

/// What a finished run consumed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Usage {
    pub steps: u64,
    pub tripped: Option<Trip>,
}

/// An installed budget. Dropping it uninstalls the trace function.
pub(crate) struct Budget<'py> {
    _py: Python<'py>,
    active: bool,
}

impl<'py> Budget<'py> {
    pub fn start(py: Python<'py>, max_steps: u64, timeout: Duration) -> Self {
        STATE.with(|cell| {
            cell.set(Some(State {
                steps: 0,
                max_steps,
                deadline: Instant::now().checked_add(timeout),
                tripped: None,
            }))
        });
        // SAFETY: the GIL is held for 'py and the trace function only
        // touches this thread's state.
        unsafe { ffi::PyEval_SetTrace(Some(on_trace), ptr::null_mut()) };
        Self {
            _py: py,
            active: true,
        }
    }

    pub fn stop(mut self) -> Usage {
        self.uninstall()
    }

    fn uninstall(&mut self) -> Usage {
        if self.active {
            // SAFETY: the GIL is held for 'py.
            unsafe { ffi::PyEval_SetTrace(None, ptr::null_mut()) };
            self.active = false;
        }
        let state = STATE.with(Cell::take);
        Usage {
            steps: state.map_or(0, |s| s.steps),
            tripped: state.and_then(|s| s.tripped),
        }
    }
}

impl Drop for Budget<'_> {
    fn drop(&mut self) {
        self.uninstall();
    }
}

impl Trip {
    fn message(self) -> &'static str {
        match self {
            Trip::Steps => "step budget exhausted",
            Trip::Deadline => "time limit exceeded",
        }
    }
}

unsafe extern "C" fn on_trace(
    _obj: *mut ffi::PyObject,
    _frame: *mut ffi::PyFrameObject,
    what: c_int,
    _arg: *mut ffi::PyObject,
) -> c_int {
    if what != TRACE_CALL && what != TRACE_LINE {
        return 0;
    }
    let tripped = STATE.with(|cell| {
        let mut state = cell.get()?;
        state.steps = state.steps.saturating_add(1);
        if state.tripped.is_none() {
            if state.steps > state.max_steps {
                state.tripped = Some(Trip::Steps);
            } else if (what == TRACE_CALL || state.steps % CLOCK_EVERY == 0)
                && state.deadline.is_some_and(|d| Instant::now() >= d)
            {
                state.tripped = Some(Trip::Deadline);
            }
        }
        cell.set(Some(state));
        state.tripped
    });
    match tripped {
        None => 0,
        Some(trip) => {
            // SAFETY: trace functions are only invoked with the GIL held.
            let py = unsafe { Python::assume_gil_acquired() };
            BudgetExhausted::new_err(trip.message()).restore(py);
            -1
        }
    }
}

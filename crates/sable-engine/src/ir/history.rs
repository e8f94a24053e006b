//! The recorded trace
//!
//! An append-only operation list plus the input arguments. Every box used
//! as an argument is either an input or the result of an earlier
//! operation; the meta-interpreter maintains this by construction and the
//! debug build checks it at record time.

#[cfg(debug_assertions)]
use rustc_hash::FxHashSet;

use super::boxes::{Operand, TraceBox};
use super::descr::DescrRef;
use super::ops::{OpNum, Operation};

pub struct History {
    pub inputargs: Vec<TraceBox>,
    pub operations: Vec<Operation>,
    #[cfg(debug_assertions)]
    known_boxes: FxHashSet<TraceBox>,
}

impl History {
    pub fn new(inputargs: Vec<TraceBox>) -> History {
        #[cfg(debug_assertions)]
        let known_boxes: FxHashSet<TraceBox> = inputargs.iter().cloned().collect();
        History {
            inputargs,
            operations: vec![],
            #[cfg(debug_assertions)]
            known_boxes,
        }
    }

    /// Append one operation; returns its index in the trace.
    pub fn record(
        &mut self,
        opnum: OpNum,
        args: Vec<Operand>,
        result: Option<TraceBox>,
        descr: Option<DescrRef>,
    ) -> usize {
        #[cfg(debug_assertions)]
        {
            for arg in &args {
                if let Operand::Box(b) = arg {
                    debug_assert!(
                        self.known_boxes.contains(b),
                        "{opnum} argument box neither input nor earlier result"
                    );
                }
            }
            if let Some(res) = &result {
                self.known_boxes.insert(res.clone());
            }
        }
        self.operations
            .push(Operation::new(opnum, args, result, descr));
        self.operations.len() - 1
    }

    /// Make a later-recorded box known without an operation (used when a
    /// frame is rebuilt from resume data at the start of a bridge).
    #[cfg(debug_assertions)]
    pub fn add_known_box(&mut self, b: TraceBox) {
        self.known_boxes.insert(b);
    }

    #[cfg(not(debug_assertions))]
    pub fn add_known_box(&mut self, _b: TraceBox) {}

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Remove and return the most recent operation (used to retract a
    /// speculative `jump` when loop compilation is cancelled).
    pub fn pop_last(&mut self) -> Option<Operation> {
        self.operations.pop()
    }

    pub fn last(&self) -> Option<&Operation> {
        self.operations.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::boxes::ConstVal;

    #[test]
    fn test_record_and_pop() {
        let a = TraceBox::new_int(1);
        let b = TraceBox::new_int(2);
        let mut history = History::new(vec![a.clone(), b.clone()]);

        let r = TraceBox::new_int(3);
        history.record(
            OpNum::IntAdd,
            vec![a.into(), b.into()],
            Some(r.clone()),
            None,
        );
        // the result can feed later operations
        history.record(
            OpNum::IntMul,
            vec![r.into(), Operand::Const(ConstVal::Int(2))],
            Some(TraceBox::new_int(6)),
            None,
        );
        assert_eq!(history.len(), 2);

        let popped = history.pop_last().unwrap();
        assert_eq!(popped.opnum, OpNum::IntMul);
        assert_eq!(history.len(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "neither input nor earlier result")]
    fn test_unknown_box_argument_panics() {
        let a = TraceBox::new_int(1);
        let mut history = History::new(vec![a]);
        let stray = TraceBox::new_int(2);
        history.record(OpNum::IntNeg, vec![stray.into()], None, None);
    }
}

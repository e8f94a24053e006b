//! Trace rendering for logs and tests
//!
//! One line per operation, boxes named by kind letter and first-use
//! order: `i2 = int_add(i0, i1)`.

use rustc_hash::FxHashMap;

use super::boxes::{ConstVal, Operand, TraceBox};
use super::descr::DescrRef;
use super::ops::Operation;

struct Namer {
    names: FxHashMap<TraceBox, String>,
}

impl Namer {
    fn new() -> Namer {
        Namer {
            names: FxHashMap::default(),
        }
    }

    fn name(&mut self, b: &TraceBox) -> String {
        if let Some(n) = self.names.get(b) {
            return n.clone();
        }
        let n = format!("{}{}", b.kind().letter(), self.names.len());
        self.names.insert(b.clone(), n.clone());
        n
    }

    fn operand(&mut self, op: &Operand) -> String {
        match op {
            Operand::Box(b) => self.name(b),
            Operand::Const(ConstVal::Int(v)) => format!("${v}"),
            Operand::Const(ConstVal::Ref(r)) if r.is_null() => "$null".to_string(),
            Operand::Const(ConstVal::Ref(r)) => format!("$obj@{:x}", r.address()),
            Operand::Const(ConstVal::Float(f)) => format!("${:?}", f.0),
        }
    }
}

fn descr_suffix(descr: &Option<DescrRef>) -> String {
    match descr {
        None => String::new(),
        Some(DescrRef::Field(d)) => format!(" [{}]", d.name),
        Some(DescrRef::Array(d)) => format!(" [array {}]", d.kind.letter()),
        Some(DescrRef::Call(d)) => format!(" [call/{}]", d.arg_kinds.len()),
        Some(DescrRef::Size(d)) => format!(" [size {}]", d.field_kinds.len()),
        Some(DescrRef::SwitchDict(d)) => format!(" [switch/{}]", d.cases.len()),
        Some(DescrRef::ResumeGuard(_)) | Some(DescrRef::ResumeGuardForced(_)) => String::new(),
    }
}

/// Render a trace as one line per operation.
pub fn format_trace(inputargs: &[TraceBox], operations: &[Operation]) -> String {
    let mut namer = Namer::new();
    let mut out = String::new();

    let inputs: Vec<String> = inputargs.iter().map(|b| namer.name(b)).collect();
    out.push_str(&format!("[{}]\n", inputs.join(", ")));

    for op in operations {
        let args: Vec<String> = op.args.iter().map(|a| namer.operand(a)).collect();
        let line = match &op.result {
            Some(res) => format!(
                "{} = {}({}){}",
                namer.name(res),
                op.opnum,
                args.join(", "),
                descr_suffix(&op.descr)
            ),
            None => format!("{}({}){}", op.opnum, args.join(", "), descr_suffix(&op.descr)),
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ops::OpNum;

    #[test]
    fn test_format_names_boxes_in_order() {
        let a = TraceBox::new_int(1);
        let b = TraceBox::new_int(2);
        let r = TraceBox::new_int(3);
        let ops = vec![Operation::new(
            OpNum::IntAdd,
            vec![a.clone().into(), b.clone().into()],
            Some(r),
            None,
        )];
        let text = format_trace(&[a, b], &ops);
        assert_eq!(text, "[i0, i1]\ni2 = int_add(i0, i1)\n");
    }

    #[test]
    fn test_format_consts_inline() {
        let a = TraceBox::new_int(1);
        let r = TraceBox::new_int(6);
        let ops = vec![Operation::new(
            OpNum::IntMul,
            vec![a.clone().into(), Operand::Const(ConstVal::Int(6))],
            Some(r),
            None,
        )];
        let text = format_trace(&[a], &ops);
        assert!(text.contains("int_mul(i0, $6)"));
    }
}

use std::fmt;

use crate::step::{ActionKind, Step};

/// A structural problem in a macro, reported against a zero-based step index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub step: usize,
    pub message: String,
}

impl Issue {
    fn new(step: usize, message: impl Into<String>) -> Self {
        Self { step, message: message.into() }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}: {}", self.step + 1, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Open {
    If { at: usize, has_else: bool },
    Loop { at: usize },
}

/// Check IF/ELSE/END_IF and LOOP_START/END_LOOP structure. Problems are
/// advisory; the interpreter runs malformed macros anyway.
pub fn validate(steps: &[Step]) -> Vec<Issue> {
    let mut issues = Vec::new();
    let mut stack: Vec<Open> = Vec::new();

    for (i, step) in steps.iter().enumerate() {
        let Some(kind) = step.kind() else {
            issues.push(Issue::new(i, format!("unknown action '{}'", step.action)));
            continue;
        };
        match kind {
            k if k.is_if() => stack.push(Open::If { at: i, has_else: false }),
            ActionKind::LoopStart => stack.push(Open::Loop { at: i }),
            ActionKind::Else => match stack.last_mut() {
                Some(Open::If { has_else, .. }) if *has_else => {
                    issues.push(Issue::new(i, "duplicate ELSE in IF block"));
                }
                Some(Open::If { has_else, .. }) => *has_else = true,
                Some(Open::Loop { at }) => {
                    issues.push(Issue::new(i, format!("ELSE inside loop opened at step {}", *at + 1)));
                }
                None => issues.push(Issue::new(i, "ELSE outside an IF block")),
            },
            ActionKind::EndIf => close(&mut stack, &mut issues, i, true),
            ActionKind::EndLoop => close(&mut stack, &mut issues, i, false),
            _ => {}
        }
    }

    for open in stack {
        let (at, what) = match open {
            Open::If { at, .. } => (at, "IF block is never closed"),
            Open::Loop { at } => (at, "loop is never closed"),
        };
        issues.push(Issue::new(at, what));
    }
    issues.sort_by_key(|i| i.step);
    issues
}

fn close(stack: &mut Vec<Open>, issues: &mut Vec<Issue>, i: usize, is_if: bool) {
    let (tag, opener) = if is_if { ("END_IF", "IF") } else { ("END_LOOP", "LOOP_START") };
    match stack.last().copied() {
        None => issues.push(Issue::new(i, format!("{} without matching {}", tag, opener))),
        Some(Open::If { .. }) if is_if => {
            stack.pop();
        }
        Some(Open::Loop { .. }) if !is_if => {
            stack.pop();
        }
        Some(Open::If { at, .. }) | Some(Open::Loop { at }) => {
            // Crossed nesting: close the innermost matching block if any.
            issues.push(Issue::new(i, format!("{} crosses block opened at step {}", tag, at + 1)));
            let pos = stack.iter().rposition(|o| matches!(o, Open::If { .. }) == is_if);
            if let Some(pos) = pos {
                stack.remove(pos);
            }
        }
    }
}

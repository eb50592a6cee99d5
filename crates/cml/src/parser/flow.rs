//! The compiler's flow-control stack.
//!
//! Each open construct pushes one item recording where its back-patch
//! targets live. Ends pop and patch. Try/catch follows a three-state
//! protocol: `Catch` pops the `Try` item and pushes itself, and `EndTry`
//! pops the catch. Break targets accumulate on the nearest loop or switch
//! item and are patched when it closes.

use smallvec::SmallVec;

use crate::{parser::expr::SlotRef, types::ClassId};

/// Kind of an open flow construct, with its patch state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowKind {
    /// `If`/`ElseIf`/`Else` chain: the pending false-branch jump and the
    /// accumulated jumps to the end of the chain.
    If {
        cond_jump: Option<u32>,
        exit_jumps: SmallVec<[u32; 4]>,
        has_else: bool,
    },
    While {
        loop_top: u32,
        cond_jump: u32,
    },
    DoLoop {
        loop_top: u32,
    },
    /// `ForEach` over an enum variable; the loop re-pushes the variable at
    /// the bottom of each pass, so the item records where it lives.
    ForEach {
        loop_top: u32,
        var: SlotRef,
    },
    Switch {
        /// Jump table reserved in the method body.
        table: u16,
        switch_class: ClassId,
        /// True while a `Case`/`Default` block is open.
        in_case: bool,
        saw_default: bool,
    },
    Try {
        /// Offset of the `Try` opcode whose catch target gets patched.
        op_ip: u32,
    },
    Catch {
        /// The jump emitted at `Catch` that skips the catch block on the
        /// normal path.
        skip_jump: u32,
    },
}

/// One open construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowItem {
    pub kind: FlowKind,
    /// Source line the construct opened at, for diagnostics.
    pub line: u32,
    /// Unpatched `Jump` offsets emitted by `Break` inside this construct.
    pub breaks: SmallVec<[u32; 4]>,
}

impl FlowItem {
    #[must_use]
    pub fn new(kind: FlowKind, line: u32) -> Self {
        Self {
            kind,
            line,
            breaks: SmallVec::new(),
        }
    }

    /// Whether `Break` may target this construct.
    #[must_use]
    pub fn takes_breaks(&self) -> bool {
        matches!(
            self.kind,
            FlowKind::While { .. } | FlowKind::DoLoop { .. } | FlowKind::ForEach { .. } | FlowKind::Switch { .. }
        )
    }

    /// Display name for diagnostics.
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match self.kind {
            FlowKind::If { .. } => "If",
            FlowKind::While { .. } => "While",
            FlowKind::DoLoop { .. } => "DoLoop",
            FlowKind::ForEach { .. } => "ForEach",
            FlowKind::Switch { .. } => "Switch",
            FlowKind::Try { .. } => "Try",
            FlowKind::Catch { .. } => "Catch",
        }
    }
}

/// LIFO of the constructs open at the current parse point.
#[derive(Debug, Default)]
pub struct FlowStack {
    items: Vec<FlowItem>,
}

impl FlowStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: FlowItem) {
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Option<FlowItem> {
        self.items.pop()
    }

    #[must_use]
    pub fn top(&self) -> Option<&FlowItem> {
        self.items.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut FlowItem> {
        self.items.last_mut()
    }

    /// Records a break jump on the nearest loop or switch. False when no
    /// enclosing construct takes breaks, or when reaching one would jump
    /// out of a try or catch block and leave its marker behind.
    pub fn add_break(&mut self, jump_ip: u32) -> bool {
        for item in self.items.iter_mut().rev() {
            if matches!(item.kind, FlowKind::Try { .. } | FlowKind::Catch { .. }) {
                return false;
            }
            if item.takes_breaks() {
                item.breaks.push(jump_ip);
                return true;
            }
        }
        false
    }

    /// Whether the parse point is inside a catch block, which gates the
    /// `$Exception` reference and `Rethrow`.
    #[must_use]
    pub fn in_catch(&self) -> bool {
        self.items.iter().any(|i| matches!(i.kind, FlowKind::Catch { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaks_land_on_nearest_loop_or_switch() {
        let mut stack = FlowStack::new();
        stack.push(FlowItem::new(
            FlowKind::While {
                loop_top: 0,
                cond_jump: 1,
            },
            1,
        ));
        stack.push(FlowItem::new(
            FlowKind::If {
                cond_jump: None,
                exit_jumps: SmallVec::new(),
                has_else: false,
            },
            2,
        ));
        assert!(stack.add_break(9));
        stack.pop();
        let while_item = stack.pop().unwrap();
        assert_eq!(while_item.breaks.as_slice(), &[9]);
        assert!(!stack.add_break(10));
    }

    #[test]
    fn catch_detection() {
        let mut stack = FlowStack::new();
        stack.push(FlowItem::new(FlowKind::Try { op_ip: 0 }, 1));
        assert!(!stack.in_catch());
        stack.pop();
        stack.push(FlowItem::new(FlowKind::Catch { skip_jump: 4 }, 2));
        assert!(stack.in_catch());
    }
}

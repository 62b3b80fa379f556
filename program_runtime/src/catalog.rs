//! Block catalog: which authored block ids the compiler understands.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Start,
    Move,
    MoveTo,
    Turn,
    Wait,
    Scan,
    Gather,
    UseItem,
    Deposit,
    StoreStorage,
    WithdrawStorage,
    ToggleStatus,
    SetStatus,
    Repeat,
    Forever,
    Parallel,
    If,
}

#[derive(Debug, Clone)]
pub struct BlockSpec {
    pub id: &'static str,
    pub kind: BlockKind,
    pub label: &'static str,
    /// Child slot names in the order they are compiled.
    pub slots: &'static [&'static str],
}

const BLOCK_SPECS: &[BlockSpec] = &[
    BlockSpec { id: "start", kind: BlockKind::Start, label: "When started", slots: &["do"] },
    BlockSpec { id: "move", kind: BlockKind::Move, label: "Move forward", slots: &[] },
    BlockSpec { id: "move-to", kind: BlockKind::MoveTo, label: "Move to", slots: &[] },
    BlockSpec { id: "turn", kind: BlockKind::Turn, label: "Turn", slots: &[] },
    BlockSpec { id: "wait", kind: BlockKind::Wait, label: "Wait", slots: &[] },
    BlockSpec { id: "scan-resources", kind: BlockKind::Scan, label: "Scan for resources", slots: &[] },
    BlockSpec { id: "gather-resource", kind: BlockKind::Gather, label: "Gather resource", slots: &[] },
    BlockSpec { id: "use-item-slot", kind: BlockKind::UseItem, label: "Use item", slots: &[] },
    BlockSpec { id: "deposit-cargo", kind: BlockKind::Deposit, label: "Deposit cargo", slots: &[] },
    BlockSpec { id: "store-storage", kind: BlockKind::StoreStorage, label: "Store in box", slots: &[] },
    BlockSpec { id: "withdraw-storage", kind: BlockKind::WithdrawStorage, label: "Withdraw from box", slots: &[] },
    BlockSpec { id: "toggle-status", kind: BlockKind::ToggleStatus, label: "Toggle status", slots: &[] },
    BlockSpec { id: "set-status", kind: BlockKind::SetStatus, label: "Set status", slots: &[] },
    BlockSpec { id: "repeat", kind: BlockKind::Repeat, label: "Repeat", slots: &["do"] },
    BlockSpec { id: "forever", kind: BlockKind::Forever, label: "Forever", slots: &["do"] },
    BlockSpec { id: "parallel", kind: BlockKind::Parallel, label: "Do both", slots: &["branch-a", "branch-b"] },
    BlockSpec { id: "if", kind: BlockKind::If, label: "If", slots: &["then", "else"] },
];

/// Lookup table from block id to spec.
#[derive(Debug, Clone)]
pub struct BlockCatalog {
    by_id: HashMap<&'static str, &'static BlockSpec>,
}

impl Default for BlockCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl BlockCatalog {
    pub fn standard() -> Self {
        Self {
            by_id: BLOCK_SPECS.iter().map(|spec| (spec.id, spec)).collect(),
        }
    }

    pub fn get(&self, block_id: &str) -> Option<&'static BlockSpec> {
        self.by_id.get(block_id).copied()
    }

    pub fn specs(&self) -> &'static [BlockSpec] {
        BLOCK_SPECS
    }
}

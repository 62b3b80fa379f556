//! Module registry describing the actions and telemetry signals an agent exposes.
//!
//! The registry is an explicit object: the compiler and the execution engine
//! each receive one at construction instead of consulting process-wide state.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use program_schema::{SignalRef, ValueKind};

/// Movement module: velocities plus pose telemetry.
pub const MOVEMENT_MODULE: &str = "core.movement";
pub const SCANNER_MODULE: &str = "sensor.scanner";
pub const MANIPULATOR_MODULE: &str = "arm.manipulator";
pub const INVENTORY_MODULE: &str = "inventory.core";
pub const STORAGE_MODULE: &str = "storage.link";
pub const STATUS_MODULE: &str = "status.control";

/// Signal ids published by the standard movement module.
pub const POSITION_SIGNAL: &str = "position";
pub const ORIENTATION_SIGNAL: &str = "orientation";

/// Side effects the interpreter can request from the action bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    SetLinearVelocity,
    SetAngularVelocity,
    Scan,
    Gather,
    UseItem,
    StoreDefault,
    StoreStorage,
    WithdrawStorage,
    ToggleStatus,
    SetStatus,
}

impl ActionKind {
    pub const ALL: [ActionKind; 10] = [
        ActionKind::SetLinearVelocity,
        ActionKind::SetAngularVelocity,
        ActionKind::Scan,
        ActionKind::Gather,
        ActionKind::UseItem,
        ActionKind::StoreDefault,
        ActionKind::StoreStorage,
        ActionKind::WithdrawStorage,
        ActionKind::ToggleStatus,
        ActionKind::SetStatus,
    ];

    /// Action name as invoked on the bus.
    pub fn action_name(&self) -> &'static str {
        match self {
            ActionKind::SetLinearVelocity => "setLinearVelocity",
            ActionKind::SetAngularVelocity => "setAngularVelocity",
            ActionKind::Scan => "scan",
            ActionKind::Gather => "gather",
            ActionKind::UseItem => "useItem",
            ActionKind::StoreDefault => "storeDefault",
            ActionKind::StoreStorage => "store",
            ActionKind::WithdrawStorage => "withdraw",
            ActionKind::ToggleStatus => "toggleStatus",
            ActionKind::SetStatus => "setStatus",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action_name())
    }
}

/// Telemetry signal published by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSpec {
    pub id: String,
    /// `None` for signals that carry neither numbers nor booleans (vectors, text).
    pub kind: Option<ValueKind>,
}

/// Describes one agent module: the actions it accepts and signals it publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub id: String,
    pub description: String,
    pub actions: Vec<String>,
    pub signals: Vec<SignalSpec>,
}

impl ModuleSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            actions: Vec::new(),
            signals: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }

    pub fn with_signal(mut self, id: impl Into<String>, kind: Option<ValueKind>) -> Self {
        self.signals.push(SignalSpec {
            id: id.into(),
            kind,
        });
        self
    }

    pub fn allows_action(&self, action: &str) -> bool {
        self.actions.iter().any(|candidate| candidate == action)
    }

    pub fn signal(&self, id: &str) -> Option<&SignalSpec> {
        self.signals.iter().find(|signal| signal.id == id)
    }
}

/// Why a signal reference does not resolve against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalIssue {
    UnknownModule(String),
    UnknownSignal { module: String, signal: String },
    KindMismatch {
        signal: String,
        expected: ValueKind,
        published: Option<ValueKind>,
    },
}

impl fmt::Display for SignalIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalIssue::UnknownModule(module) => write!(f, "unknown module '{module}'"),
            SignalIssue::UnknownSignal { module, signal } => {
                write!(f, "module '{module}' does not publish signal '{signal}'")
            }
            SignalIssue::KindMismatch {
                signal,
                expected,
                published,
            } => match published {
                Some(kind) => write!(f, "signal '{signal}' is a {kind}, expected {expected}"),
                None => write!(f, "signal '{signal}' is not a {expected}"),
            },
        }
    }
}

/// Registry of agent modules, scoped to one agent.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: Vec<ModuleSpec>,
}

impl ModuleRegistry {
    /// Builds a registry, dropping later duplicates of an already registered id.
    pub fn new(modules: Vec<ModuleSpec>) -> Self {
        let mut seen = HashSet::new();
        let modules = modules
            .into_iter()
            .filter(|module| seen.insert(module.id.clone()))
            .collect();
        Self { modules }
    }

    /// Registry with the standard rover module set.
    pub fn standard() -> Self {
        Self::new(standard_modules())
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn modules(&self) -> &[ModuleSpec] {
        &self.modules
    }

    pub fn get(&self, id: &str) -> Option<&ModuleSpec> {
        self.modules.iter().find(|module| module.id == id)
    }

    /// First registered module accepting the action.
    pub fn provider(&self, action: ActionKind) -> Option<&ModuleSpec> {
        let name = action.action_name();
        self.modules.iter().find(|module| module.allows_action(name))
    }

    pub fn validate_signal(&self, signal: &SignalRef) -> Result<(), SignalIssue> {
        let module = self
            .get(&signal.module_id)
            .ok_or_else(|| SignalIssue::UnknownModule(signal.module_id.clone()))?;
        let spec = module
            .signal(&signal.signal_id)
            .ok_or_else(|| SignalIssue::UnknownSignal {
                module: signal.module_id.clone(),
                signal: signal.signal_id.clone(),
            })?;
        if spec.kind != Some(signal.expected) {
            return Err(SignalIssue::KindMismatch {
                signal: signal.to_string(),
                expected: signal.expected,
                published: spec.kind,
            });
        }
        Ok(())
    }
}

fn standard_modules() -> Vec<ModuleSpec> {
    vec![
        ModuleSpec::new(MOVEMENT_MODULE, "Drive train: linear and angular velocity control.")
            .with_action(ActionKind::SetLinearVelocity.action_name())
            .with_action(ActionKind::SetAngularVelocity.action_name())
            .with_signal(POSITION_SIGNAL, None)
            .with_signal(ORIENTATION_SIGNAL, Some(ValueKind::Number))
            .with_signal("speed", Some(ValueKind::Number))
            .with_signal("positionX", Some(ValueKind::Number))
            .with_signal("positionY", Some(ValueKind::Number)),
        ModuleSpec::new(SCANNER_MODULE, "Forward cone scanner for resource nodes.")
            .with_action(ActionKind::Scan.action_name())
            .with_signal("hits", Some(ValueKind::Number))
            .with_signal("lastFilter", None),
        ModuleSpec::new(MANIPULATOR_MODULE, "Gripper arm that gathers from resource nodes.")
            .with_action(ActionKind::Gather.action_name())
            .with_signal("lastHarvest", Some(ValueKind::Number)),
        ModuleSpec::new(INVENTORY_MODULE, "Cargo hold and tool slots.")
            .with_action(ActionKind::UseItem.action_name())
            .with_action(ActionKind::StoreDefault.action_name())
            .with_signal("cargo.total", Some(ValueKind::Number))
            .with_signal("cargo.full", Some(ValueKind::Boolean)),
        ModuleSpec::new(STORAGE_MODULE, "Link to nearby storage boxes.")
            .with_action(ActionKind::StoreStorage.action_name())
            .with_action(ActionKind::WithdrawStorage.action_name())
            .with_signal("stored.total", Some(ValueKind::Number)),
        ModuleSpec::new(STATUS_MODULE, "Status beacon toggled by programs.")
            .with_action(ActionKind::ToggleStatus.action_name())
            .with_action(ActionKind::SetStatus.action_name())
            .with_signal("active", Some(ValueKind::Boolean)),
    ]
}

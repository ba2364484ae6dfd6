use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The class of subject a caller acts as. The identity provider resolves each
/// authenticated subject to exactly one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    AirportOperator,
    AirlineStaff,
    GateAgent,
    Maintenance,
    Security,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Admin,
        Role::AirportOperator,
        Role::AirlineStaff,
        Role::GateAgent,
        Role::Maintenance,
        Role::Security,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::AirportOperator => "airport_operator",
            Role::AirlineStaff => "airline_staff",
            Role::GateAgent => "gate_agent",
            Role::Maintenance => "maintenance",
            Role::Security => "security",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" | "administrator" => Ok(Role::Admin),
            "airport_operator" | "operator" => Ok(Role::AirportOperator),
            "airline_staff" => Ok(Role::AirlineStaff),
            "gate_agent" => Ok(Role::GateAgent),
            "maintenance" => Ok(Role::Maintenance),
            "security" => Ok(Role::Security),
            _ => Err(UnknownToken::new("role", s)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of resource classes the policy knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Flight,
    Gate,
    Runway,
    Airport,
    Staff,
    Maintenance,
    Incident,
    Audit,
    Passenger,
    Baggage,
    Crew,
    Vehicle,
    Certification,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 13] = [
        ResourceClass::Flight,
        ResourceClass::Gate,
        ResourceClass::Runway,
        ResourceClass::Airport,
        ResourceClass::Staff,
        ResourceClass::Maintenance,
        ResourceClass::Incident,
        ResourceClass::Audit,
        ResourceClass::Passenger,
        ResourceClass::Baggage,
        ResourceClass::Crew,
        ResourceClass::Vehicle,
        ResourceClass::Certification,
    ];

    /// Only gates and runways are held in exclusive time windows.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, ResourceClass::Gate | ResourceClass::Runway)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Flight => "flight",
            ResourceClass::Gate => "gate",
            ResourceClass::Runway => "runway",
            ResourceClass::Airport => "airport",
            ResourceClass::Staff => "staff",
            ResourceClass::Maintenance => "maintenance",
            ResourceClass::Incident => "incident",
            ResourceClass::Audit => "audit",
            ResourceClass::Passenger => "passenger",
            ResourceClass::Baggage => "baggage",
            ResourceClass::Crew => "crew",
            ResourceClass::Vehicle => "vehicle",
            ResourceClass::Certification => "certification",
        }
    }
}

impl FromStr for ResourceClass {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        ResourceClass::ALL
            .into_iter()
            .find(|c| c.as_str() == lower)
            .ok_or_else(|| UnknownToken::new("resource class", s))
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    View,
    Create,
    Update,
    Delete,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::View, Action::Create, Action::Update, Action::Delete];

    const fn bit(self) -> u8 {
        match self {
            Action::View => 1,
            Action::Create => 1 << 1,
            Action::Update => 1 << 2,
            Action::Delete => 1 << 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl FromStr for Action {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == lower)
            .ok_or_else(|| UnknownToken::new("action", s))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Small bit set over [`Action`], usable in `const` tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionSet(u8);

impl ActionSet {
    pub const NONE: ActionSet = ActionSet(0);
    pub const VIEW: ActionSet = ActionSet::of(&[Action::View]);
    pub const EDIT: ActionSet = ActionSet::of(&[Action::View, Action::Create, Action::Update]);
    pub const ALL: ActionSet =
        ActionSet::of(&[Action::View, Action::Create, Action::Update, Action::Delete]);

    pub const fn of(actions: &[Action]) -> ActionSet {
        let mut bits = 0u8;
        let mut i = 0;
        while i < actions.len() {
            bits |= actions[i].bit();
            i += 1;
        }
        ActionSet(bits)
    }

    pub const fn contains(self, action: Action) -> bool {
        self.0 & action.bit() != 0
    }

    pub const fn union(self, other: ActionSet) -> ActionSet {
        ActionSet(self.0 | other.0)
    }
}

/// One row of the capability table: `role` may perform `actions` on `class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub role: Role,
    pub class: ResourceClass,
    pub actions: ActionSet,
}

const fn grant(role: Role, class: ResourceClass, actions: ActionSet) -> Grant {
    Grant { role, class, actions }
}

use Action::{Update as U, View as V};
use ResourceClass as C;
use Role as R;

const VIEW_UPDATE: ActionSet = ActionSet::of(&[V, U]);

/// Default capability table. Anything not listed here is denied.
pub const DEFAULT_GRANTS: &[Grant] = &[
    // admin
    grant(R::Admin, C::Flight, ActionSet::ALL),
    grant(R::Admin, C::Gate, ActionSet::ALL),
    grant(R::Admin, C::Runway, ActionSet::ALL),
    grant(R::Admin, C::Airport, ActionSet::ALL),
    grant(R::Admin, C::Staff, ActionSet::ALL),
    grant(R::Admin, C::Maintenance, ActionSet::ALL),
    grant(R::Admin, C::Incident, ActionSet::ALL),
    grant(R::Admin, C::Audit, ActionSet::VIEW),
    grant(R::Admin, C::Passenger, ActionSet::ALL),
    grant(R::Admin, C::Baggage, ActionSet::ALL),
    grant(R::Admin, C::Crew, ActionSet::ALL),
    grant(R::Admin, C::Vehicle, ActionSet::ALL),
    grant(R::Admin, C::Certification, ActionSet::ALL),
    // airport_operator
    grant(R::AirportOperator, C::Flight, ActionSet::ALL),
    grant(R::AirportOperator, C::Gate, ActionSet::ALL),
    grant(R::AirportOperator, C::Runway, ActionSet::ALL),
    grant(R::AirportOperator, C::Airport, ActionSet::ALL),
    grant(R::AirportOperator, C::Staff, ActionSet::VIEW),
    grant(R::AirportOperator, C::Maintenance, ActionSet::EDIT),
    grant(R::AirportOperator, C::Incident, ActionSet::EDIT),
    grant(R::AirportOperator, C::Passenger, ActionSet::VIEW),
    grant(R::AirportOperator, C::Baggage, ActionSet::VIEW),
    grant(R::AirportOperator, C::Crew, ActionSet::VIEW),
    grant(R::AirportOperator, C::Vehicle, ActionSet::ALL),
    grant(R::AirportOperator, C::Certification, ActionSet::VIEW),
    // airline_staff
    grant(R::AirlineStaff, C::Flight, ActionSet::EDIT),
    grant(R::AirlineStaff, C::Gate, ActionSet::VIEW),
    grant(R::AirlineStaff, C::Airport, ActionSet::VIEW),
    grant(R::AirlineStaff, C::Staff, ActionSet::ALL),
    grant(R::AirlineStaff, C::Passenger, ActionSet::ALL),
    grant(R::AirlineStaff, C::Baggage, ActionSet::ALL),
    grant(R::AirlineStaff, C::Crew, ActionSet::ALL),
    grant(R::AirlineStaff, C::Certification, ActionSet::ALL),
    // gate_agent
    grant(R::GateAgent, C::Flight, VIEW_UPDATE),
    grant(R::GateAgent, C::Gate, ActionSet::ALL),
    grant(R::GateAgent, C::Runway, ActionSet::VIEW),
    grant(R::GateAgent, C::Airport, ActionSet::VIEW),
    grant(R::GateAgent, C::Passenger, VIEW_UPDATE),
    grant(R::GateAgent, C::Baggage, VIEW_UPDATE),
    grant(R::GateAgent, C::Crew, ActionSet::VIEW),
    // maintenance
    grant(R::Maintenance, C::Gate, ActionSet::VIEW),
    grant(R::Maintenance, C::Runway, ActionSet::VIEW),
    grant(R::Maintenance, C::Maintenance, ActionSet::ALL),
    grant(R::Maintenance, C::Vehicle, VIEW_UPDATE),
    grant(R::Maintenance, C::Certification, ActionSet::VIEW),
    // security
    grant(R::Security, C::Flight, ActionSet::VIEW),
    grant(R::Security, C::Gate, ActionSet::VIEW),
    grant(R::Security, C::Runway, ActionSet::VIEW),
    grant(R::Security, C::Incident, ActionSet::ALL),
    grant(R::Security, C::Passenger, ActionSet::VIEW),
    grant(R::Security, C::Baggage, ActionSet::VIEW),
    grant(R::Security, C::Vehicle, ActionSet::VIEW),
];

/// Capability lookup over a static grant table. Pure, lock-free, never fails.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    grants: &'static [Grant],
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(DEFAULT_GRANTS)
    }
}

impl Policy {
    pub const fn new(grants: &'static [Grant]) -> Self {
        Self { grants }
    }

    pub fn grants(&self) -> &'static [Grant] {
        self.grants
    }

    /// Actions `role` holds on `class`. Repeated rows are unioned.
    pub fn actions(&self, role: Role, class: ResourceClass) -> ActionSet {
        self.grants
            .iter()
            .filter(|g| g.role == role && g.class == class)
            .fold(ActionSet::NONE, |acc, g| acc.union(g.actions))
    }

    pub fn authorize(&self, role: Role, class: ResourceClass, action: Action) -> bool {
        self.actions(role, class).contains(action)
    }

    /// Same as [`Policy::authorize`] over wire names. Unknown tokens deny.
    pub fn authorize_str(&self, role: &str, class: &str, action: &str) -> bool {
        match (role.parse::<Role>(), class.parse::<ResourceClass>(), action.parse::<Action>()) {
            (Ok(role), Ok(class), Ok(action)) => self.authorize(role, class, action),
            _ => false,
        }
    }
}

/// Check against the default table.
pub fn authorize(role: Role, class: ResourceClass, action: Action) -> bool {
    Policy::default().authorize(role, class, action)
}

/// String form of [`authorize`]; unknown role, class or action is `false`.
pub fn authorize_str(role: &str, class: &str, action: &str) -> bool {
    Policy::default().authorize_str(role, class, action)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownToken {
    pub what: &'static str,
    pub value: String,
}

impl UnknownToken {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for UnknownToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.what, self.value)
    }
}

impl std::error::Error for UnknownToken {}
